//! End-to-end runs that cross several subsystems at once: code
//! installation, inline caches, the write barrier, weak handles and
//! isolate-to-isolate messaging.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use heap::Space;
use object::{ClassId, Value};
use parking_lot::Mutex;

use crate::api::HandleScope;
use crate::assembler::CodeBuilder;
use crate::class_table::Class;
use crate::code::PcDescriptorKind;
use crate::function::{Function, FunctionFlags, FunctionId, FunctionKind};
use crate::ic::ICDataId;
use crate::isolate::Isolate;
use crate::message::MessageHandler;
use crate::patcher;
use crate::runtime::{Runtime, RuntimeConfig};
use crate::stubs::StubKind;

fn with_isolate<R>(f: impl FnOnce(&mut Isolate) -> R) -> R {
    let _ = env_logger::builder().is_test(true).try_init();
    let runtime = Runtime::initialize(RuntimeConfig::default()).unwrap();
    let handle = runtime.create_isolate("scenario", 0).unwrap();
    let result = handle.with(f).unwrap();
    handle.shutdown().unwrap();
    result
}

fn static_function(isolate: &mut Isolate, name: &str, params: usize) -> FunctionId {
    let owner = isolate.register_class(Class::new(format!("{name}Lib"), None));
    let function = Function::new(name, owner, FunctionKind::Regular, params).with_flags(FunctionFlags::STATIC);
    isolate.add_function(function).unwrap()
}

/// A finalized class whose `name` method returns `result`.
fn class_answering(isolate: &mut Isolate, class: &str, name: &str, result: i64) -> ClassId {
    let owner = isolate.register_class(Class::new(class, None));
    isolate.finalize_class(owner).unwrap();
    let function = isolate
        .add_function(Function::new(name, owner, FunctionKind::Regular, 1))
        .unwrap();
    let mut b = CodeBuilder::new(name, 1, 0);
    b.push_smi(result);
    b.ret();
    let code = b.finalize(isolate, Some(function)).unwrap();
    isolate.set_function_code(function, code);
    owner
}

/// A static `caller(x) = x.name()`.
fn dynamic_caller(isolate: &mut Isolate, name: &str) -> FunctionId {
    let caller = static_function(isolate, "caller", 1);
    let mut b = CodeBuilder::new("caller", 1, 0);
    b.push_arg(0);
    b.instance_call(name, 1, 1);
    b.ret();
    let code = b.finalize(isolate, Some(caller)).unwrap();
    isolate.set_function_code(caller, code);
    caller
}

fn ic_of(isolate: &Isolate, owner: FunctionId) -> ICDataId {
    isolate
        .roots
        .ic_data
        .iter()
        .find(|ic| ic.owner == Some(owner))
        .map(|ic| ic.id)
        .unwrap()
}

// ── Calls ──────────────────────────────────────────────────────────

#[test]
fn adding_smis_allocates_nothing() {
    with_isolate(|isolate| {
        let add = static_function(isolate, "add", 2);
        let mut b = CodeBuilder::new("add", 2, 0);
        b.push_arg(0);
        b.push_arg(1);
        b.add();
        b.ret();
        let code = b.finalize(isolate, Some(add)).unwrap();
        isolate.set_function_code(add, code);

        let used = isolate.heap().used(Space::New);
        let scavenges = isolate.heap().scavenge_count();
        let result = isolate.invoke_function(add, &[Value::from_i64(3), Value::from_i64(4)]).unwrap();
        assert_eq!(result, Value::from_i64(7));
        assert_eq!(isolate.heap().used(Space::New), used);
        assert_eq!(isolate.heap().scavenge_count(), scavenges);
    });
}

#[test]
fn monomorphic_site_records_one_check() {
    with_isolate(|isolate| {
        let c = class_answering(isolate, "C", "m", 42);
        let caller = dynamic_caller(isolate, "m");
        let receiver = isolate.new_instance(c).unwrap();

        assert_eq!(isolate.invoke_function(caller, &[receiver]).unwrap(), Value::from_i64(42));
        let ic = ic_of(isolate, caller);
        assert_eq!(isolate.ic_data(ic).num_checks(), 1);
        let entry = isolate.ic_data(ic).entry(0);
        assert_eq!(entry.class_ids, vec![c]);
        assert_eq!(entry.count, 1);

        let receiver = isolate.new_instance(c).unwrap();
        assert_eq!(isolate.invoke_function(caller, &[receiver]).unwrap(), Value::from_i64(42));
        assert_eq!(isolate.ic_data(ic).num_checks(), 1);
        assert_eq!(isolate.ic_data(ic).entry(0).count, 2);
        assert!(isolate.ic_data(ic).megamorphic.is_none());
    });
}

#[test]
fn polymorphic_site_turns_megamorphic() {
    with_isolate(|isolate| {
        let classes: Vec<ClassId> = (0..10)
            .map(|i| class_answering(isolate, &format!("K{i}"), "toString", i))
            .collect();
        let caller = dynamic_caller(isolate, "toString");

        for round in 0..2 {
            for (i, &class) in classes.iter().enumerate() {
                let receiver = isolate.new_instance(class).unwrap();
                let result = isolate.invoke_function(caller, &[receiver]).unwrap();
                assert_eq!(result, Value::from_i64(i as i64), "round {round}, class {i}");
            }
        }

        let ic = ic_of(isolate, caller);
        let threshold = isolate.runtime.flags().megamorphic_threshold;
        assert_eq!(isolate.ic_data(ic).num_checks(), threshold + 1);
        let cache = isolate.ic_data(ic).megamorphic.unwrap();
        assert_eq!(isolate.megamorphic_cache(cache).len(), classes.len());
        // Rows stop counting once the site dispatches through the cache.
        assert_eq!(isolate.ic_data(ic).entry(0).count, 1);

        let code = isolate.function(caller).code.unwrap();
        let code = isolate.code(code);
        let site = code
            .pc_descriptors
            .iter()
            .find(|d| d.kind == PcDescriptorKind::IcCall)
            .unwrap();
        let ret = code.entry_point() + site.pc_offset as usize;
        assert_eq!(patcher::call_target_at(ret), isolate.stub_entry(StubKind::MegamorphicLookup));
    });
}

// ── Memory ─────────────────────────────────────────────────────────

#[test]
fn old_to_young_store_is_remembered_once() {
    with_isolate(|isolate| {
        let old = isolate.new_array_in(1, Space::Old).unwrap();
        let young = isolate.new_array(1).unwrap();
        assert!(young.is_new_object());
        assert!(!unsafe { old.header() }.is_remembered());
        assert_eq!(isolate.heap().store_buffer().count(old), 0);

        isolate.array_set(old, 0, young);
        assert!(unsafe { old.header() }.is_remembered());
        assert_eq!(isolate.heap().store_buffer().count(old), 1);

        isolate.array_set(old, 0, young);
        assert_eq!(isolate.heap().store_buffer().count(old), 1);

        isolate.roots.scratch.push(old);
        isolate.collect_garbage(Space::New);
        let old = isolate.roots.scratch.pop().unwrap();
        let moved = isolate.array_at(old, 0);
        assert_ne!(moved.addr(), young.addr());
        assert!(isolate.heap().contains(moved.addr()));
        assert_eq!(isolate.class_id_of(moved), object::cid::ARRAY);
        assert!(moved.is_new_object());
        assert_eq!(isolate.heap().store_buffer().count(old), 1);

        // Promotion leaves no old-to-young edge, so the owner is forgotten.
        isolate.roots.scratch.push(old);
        isolate.collect_garbage(Space::New);
        let old = isolate.roots.scratch.pop().unwrap();
        let promoted = isolate.array_at(old, 0);
        assert!(promoted.is_old_object());
        assert!(!unsafe { old.header() }.is_remembered());
        assert_eq!(isolate.heap().store_buffer().count(old), 0);
    });
}

#[test]
fn weak_handle_finalizer_runs_once() {
    with_isolate(|isolate| {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let weak = {
            let mut scope = HandleScope::new(isolate);
            let list = scope.new_list(4).unwrap();
            let (c, s) = (Arc::clone(&calls), Arc::clone(&seen));
            scope
                .new_weak_persistent_handle(
                    list,
                    0xfeed,
                    Some(Box::new(move |peer| {
                        c.fetch_add(1, Ordering::SeqCst);
                        s.store(peer, Ordering::SeqCst);
                    })),
                )
                .unwrap()
        };

        isolate.collect_all_garbage();
        isolate.collect_all_garbage();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0xfeed);
        assert_eq!(isolate.roots.api.get(weak).unwrap(), isolate.null());
    });
}

// ── Messaging ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Received {
    smi: Option<i64>,
    text: Option<String>,
    double: Option<f64>,
    addr: usize,
    in_own_heap: bool,
}

#[test]
fn message_is_copied_between_isolates() {
    let _ = env_logger::builder().is_test(true).try_init();
    let runtime = Runtime::initialize(RuntimeConfig::default()).unwrap();
    let a = runtime.create_isolate("sender", 0).unwrap();
    a.exit().unwrap();
    let b = runtime.create_isolate("receiver", 0).unwrap();
    b.exit().unwrap();

    a.enter().unwrap();
    let sent = a
        .with(|isolate| {
            let list = isolate.new_array(3).unwrap();
            isolate.roots.scratch.push(list);
            let hi = isolate.new_string("hi").unwrap();
            let list = isolate.roots.scratch[isolate.roots.scratch.len() - 1];
            isolate.array_set(list, 0, Value::from_i64(1));
            isolate.array_set(list, 1, hi);
            let d = isolate.new_double(2.5).unwrap();
            let list = isolate.roots.scratch.pop().unwrap();
            isolate.array_set(list, 2, d);
            isolate.post(b.main_port(), list).unwrap();
            list.addr()
        })
        .unwrap();
    a.exit().unwrap();

    b.enter().unwrap();
    let received = Arc::new(Mutex::new(Received::default()));
    let sink = Arc::clone(&received);
    let handled = b
        .with(|isolate| {
            isolate.set_message_handler(MessageHandler::native(move |isolate, _dest, _reply, value| {
                let mut r = sink.lock();
                r.smi = isolate.integer_value(isolate.array_at(value, 0));
                r.text = isolate.string_value(isolate.array_at(value, 1));
                r.double = isolate.double_value(isolate.array_at(value, 2));
                r.addr = value.addr();
                r.in_own_heap = isolate.heap().contains(value.addr());
                Ok(())
            }));
            isolate.handle_message().unwrap()
        })
        .unwrap();
    assert!(handled);
    b.exit().unwrap();

    let received = received.lock();
    assert_eq!(received.smi, Some(1));
    assert_eq!(received.text.as_deref(), Some("hi"));
    assert_eq!(received.double, Some(2.5));
    assert!(received.in_own_heap);
    assert_ne!(received.addr, sent);

    a.enter().unwrap();
    let in_sender = a.with(|isolate| isolate.heap().contains(received.addr)).unwrap();
    assert!(!in_sender);
    a.shutdown().unwrap();

    b.enter().unwrap();
    b.shutdown().unwrap();
}
