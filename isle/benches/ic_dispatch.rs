use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use isle::assembler::CodeBuilder;
use isle::class_table::Class;
use isle::code::CodeId;
use isle::compiler::CompilerHook;
use isle::function::{Function, FunctionFlags, FunctionId, FunctionKind};
use isle::{HandleScope, Isolate, Runtime, RuntimeConfig, RuntimeResult};
use object::ClassId;

const CALLS_PER_SAMPLE: usize = 1_000;

/// `dispatch(x) = x.answer()`; every `answer` returns its class's ordinal.
struct BenchCompiler;

impl CompilerHook for BenchCompiler {
    fn compile(&self, isolate: &mut Isolate, function: FunctionId) -> RuntimeResult<CodeId> {
        let f = isolate.function(function);
        let mut b = CodeBuilder::new(f.name.clone(), f.num_parameters(), 0);
        if f.name == "dispatch" {
            b.push_arg(0);
            b.instance_call("answer", 1, 1);
        } else {
            b.push_smi(i64::from(f.owner));
        }
        b.ret();
        b.finalize(isolate, Some(function))
    }
}

fn receiver_classes(isolate: &mut Isolate, count: usize) -> Vec<ClassId> {
    (0..count)
        .map(|i| {
            let class = isolate.register_class(Class::new(format!("Receiver{i}"), None));
            isolate.finalize_class(class).expect("finalize");
            isolate
                .add_function(Function::new("answer", class, FunctionKind::Regular, 1))
                .expect("answer");
            class
        })
        .collect()
}

fn dispatcher(isolate: &mut Isolate) -> FunctionId {
    let lib = isolate.register_class(Class::new("Bench", None));
    let function = Function::new("dispatch", lib, FunctionKind::Regular, 1).with_flags(FunctionFlags::STATIC);
    isolate.add_function(function).expect("dispatch")
}

fn run_case(c: &mut Criterion, name: &str, num_classes: usize) {
    let config = RuntimeConfig {
        compiler: Some(Arc::new(BenchCompiler)),
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::initialize(config).expect("runtime");
    let handle = runtime.create_isolate(name, 0).expect("isolate");
    handle
        .with(|isolate| {
            let classes = receiver_classes(isolate, num_classes);
            let dispatch = dispatcher(isolate);
            let mut scope = HandleScope::new(isolate);
            let receivers: Vec<_> = classes
                .iter()
                .map(|&class| scope.new_instance(class).expect("instance"))
                .collect();

            // Warm the call site so the samples measure steady-state dispatch.
            for &receiver in &receivers {
                let value = scope.value(receiver).expect("receiver");
                black_box(scope.isolate().invoke_function(dispatch, &[value]).expect("warmup"));
            }

            c.bench_function(name, |b| {
                b.iter(|| {
                    for i in 0..CALLS_PER_SAMPLE {
                        let value = scope.value(receivers[i % receivers.len()]).expect("receiver");
                        let result = scope.isolate().invoke_function(dispatch, &[value]).expect("invoke");
                        black_box(result);
                    }
                })
            });
        })
        .expect("with");
    handle.shutdown().expect("shutdown");
}

fn bench_monomorphic(c: &mut Criterion) {
    run_case(c, "ic_monomorphic", 1);
}

fn bench_polymorphic(c: &mut Criterion) {
    run_case(c, "ic_polymorphic", 3);
}

fn bench_megamorphic(c: &mut Criterion) {
    run_case(c, "ic_megamorphic", 16);
}

criterion_group!(benches, bench_monomorphic, bench_polymorphic, bench_megamorphic);
criterion_main!(benches);
