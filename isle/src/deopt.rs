//! Deoptimization: rebuilding an unoptimized frame from an optimized one.
//!
//! Eager deoptimization happens when a speculative check fails inside
//! optimized code. Lazy deoptimization happens when optimized code is
//! invalidated while frames running it are suspended in a call; those frames
//! are rebuilt when the call returns (see
//! [`Isolate::set_function_code`](crate::isolate::Isolate)).

use object::Value;

use crate::code::{CodeId, DeoptInstr, DeoptReason, NO_DEOPT_ID, PcDescriptorKind};
use crate::error::{ErrorKind, RuntimeResult};
use crate::isolate::Isolate;
use crate::stack_frame::{ExitFrame, FIRST_SLOT};

impl Isolate {
    /// Replaces the optimized frame at `fp` with the unoptimized frame
    /// described by `instrs`.
    fn rebuild_frame(
        &mut self,
        fp: usize,
        optimized: CodeId,
        unoptimized: CodeId,
        instrs: &[DeoptInstr],
    ) -> RuntimeResult<()> {
        let start = self.roots.frames.deopt_scratch.len();
        let materialized = self.materialize(fp, optimized, instrs);
        if let Err(unwind) = materialized {
            self.roots.frames.deopt_scratch.truncate(start);
            return Err(unwind);
        }

        let entry = self.code(unoptimized).entry_point();
        let frames = &mut self.roots.frames;
        frames.truncate(fp + FIRST_SLOT);
        frames.stack[fp + 1] = entry as u64;
        let values: Vec<Value> = frames.deopt_scratch.drain(start..).collect();
        for value in values {
            frames.push(value);
        }
        Ok(())
    }

    /// Produces the unoptimized slots into the deopt scratch area, where
    /// they survive allocation.
    fn materialize(&mut self, fp: usize, optimized: CodeId, instrs: &[DeoptInstr]) -> RuntimeResult<()> {
        let slot = |n: u16| fp + FIRST_SLOT + n as usize;
        for &instr in instrs {
            let value = match instr {
                DeoptInstr::StackSlot(n) => self.roots.frames.at(slot(n)),
                DeoptInstr::Constant(n) => self.code(optimized).object_pool[n as usize],
                DeoptInstr::BoxDouble(n) => {
                    let raw = self.roots.frames.stack[slot(n)];
                    self.new_double(f64::from_bits(raw))?
                }
                DeoptInstr::BoxInt64(n) => {
                    let raw = self.roots.frames.stack[slot(n)];
                    self.new_integer(raw as i64)?
                }
            };
            self.roots.frames.deopt_scratch.push(value);
        }
        Ok(())
    }

    fn missing_deopt_info(&mut self, code: CodeId, deopt_id: u32) -> crate::error::Unwind {
        let message = format!("no deoptimization info for id {} in '{}'", deopt_id, self.code(code).name);
        self.raise_error(ErrorKind::Api, &message)
    }

    /// Eager deoptimization of the current frame at `deopt_id`. Returns the
    /// pc to continue at in unoptimized code.
    pub(crate) fn deoptimize_at(&mut self, deopt_id: u32, reason: DeoptReason) -> RuntimeResult<usize> {
        let fp = self.roots.frames.fp;
        let optimized = self.roots.frames.code_at(fp);
        let Some(function) = self.code(optimized).function else {
            return Err(self.missing_deopt_info(optimized, deopt_id));
        };
        let Some((_, instrs)) = self.code(optimized).deopt_table.find(deopt_id) else {
            return Err(self.missing_deopt_info(optimized, deopt_id));
        };
        let unoptimized = self.unoptimized_code_for(function)?;
        let Some(continuation) = self
            .code(unoptimized)
            .pc_descriptors
            .find_by_deopt_id(deopt_id, PcDescriptorKind::Deopt)
            .map(|d| d.pc_offset)
        else {
            return Err(self.missing_deopt_info(unoptimized, deopt_id));
        };

        self.rebuild_frame(fp, optimized, unoptimized, &instrs)?;

        let threshold = self.runtime.flags().deoptimization_counter_threshold;
        let f = self.function_mut(function);
        f.deoptimization_counter += 1;
        if f.deoptimization_counter > threshold {
            f.set_optimizable(false);
        }
        log::debug!(
            "deoptimized '{}' at id {} ({:?}), {} times so far",
            self.function(function).name,
            deopt_id,
            reason,
            self.function(function).deoptimization_counter
        );
        self.set_function_code(function, unoptimized);
        Ok(self.code(unoptimized).entry_point() + continuation as usize)
    }

    /// Runs when a callee returns into a frame whose code was invalidated
    /// while the callee ran. The return value is on top of the stack.
    pub(crate) fn lazy_deoptimize(&mut self) -> RuntimeResult<usize> {
        let fp = self.roots.frames.fp;
        let Some(ret) = self.roots.frames.lazy_deopt.remove(&fp) else {
            return Err(self.raise_error(ErrorKind::Api, "lazy deoptimization without a pending frame"));
        };
        let optimized = self.roots.frames.code_at(fp);
        self.roots.frames.exit = ExitFrame { pc: ret, fp };

        let offset = self.code(optimized).pc_offset(ret);
        let call = self
            .code(optimized)
            .pc_descriptors
            .at_pc(offset)
            .find(|d| {
                matches!(d.kind, PcDescriptorKind::IcCall | PcDescriptorKind::FuncCall) && d.deopt_id != NO_DEOPT_ID
            })
            .map(|d| (d.deopt_id, d.kind));
        let target = match (call, self.code(optimized).function) {
            (Some((deopt_id, kind)), Some(function)) => {
                let info = self.code(optimized).deopt_table.find(deopt_id);
                info.map(|(_, instrs)| (deopt_id, kind, function, instrs))
            }
            _ => None,
        };
        let Some((deopt_id, kind, function, instrs)) = target else {
            log::warn!(
                "'{}' has no deoptimization info at offset {}, resuming optimized code",
                self.code(optimized).name,
                offset
            );
            return Ok(ret);
        };

        let unoptimized = self.unoptimized_code_for(function)?;
        let Some(continuation) = self
            .code(unoptimized)
            .pc_descriptors
            .find_by_deopt_id(deopt_id, kind)
            .map(|d| d.pc_offset)
        else {
            return Err(self.missing_deopt_info(unoptimized, deopt_id));
        };

        // The callee's result stays rooted below the materialized slots.
        let null = self.null();
        let result = self.roots.frames.pop();
        self.roots.frames.deopt_scratch.push(result);
        let rebuilt = self.rebuild_frame(fp, optimized, unoptimized, &instrs);
        let result = self.roots.frames.deopt_scratch.pop().unwrap_or(null);
        rebuilt?;
        self.roots.frames.push(result);
        log::debug!(
            "lazily deoptimized '{}' after call {}",
            self.function(function).name,
            deopt_id
        );
        Ok(self.code(unoptimized).entry_point() + continuation as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::CodeBuilder;
    use crate::class_table::Class;
    use crate::function::{FieldFlags, Function, FunctionFlags, FunctionId, FunctionKind};
    use crate::runtime::{Runtime, RuntimeConfig};

    fn with_isolate<R>(f: impl FnOnce(&mut Isolate) -> R) -> R {
        let _ = env_logger::builder().is_test(true).try_init();
        let runtime = Runtime::initialize(RuntimeConfig::default()).unwrap();
        let handle = runtime.create_isolate("deopt", 0).unwrap();
        let result = handle.with(f).unwrap();
        handle.shutdown().unwrap();
        result
    }

    fn static_function(isolate: &mut Isolate, name: &str, params: usize) -> FunctionId {
        let owner = isolate.register_class(Class::new(format!("{name}Lib"), None));
        let function = Function::new(name, owner, FunctionKind::Regular, params).with_flags(FunctionFlags::STATIC);
        isolate.add_function(function).unwrap()
    }

    /// `f(x) = x + 1`, optimized under the assumption that `x` is a smi.
    fn speculative_increment(isolate: &mut Isolate) -> (FunctionId, CodeId, CodeId) {
        let f = static_function(isolate, "inc", 1);
        let mut b = CodeBuilder::new("inc", 1, 0);
        let id = b.deopt_point();
        b.push_arg(0);
        b.push_smi(1);
        b.add();
        b.ret();
        let unoptimized = b.finalize(isolate, Some(f)).unwrap();

        let mut b = CodeBuilder::new("inc", 1, 0).optimized();
        b.push_arg(0);
        b.check_smi(id);
        b.push_smi(1);
        b.add();
        b.ret();
        b.add_deopt_info(id, DeoptReason::CheckSmi, vec![]);
        let optimized = b.finalize(isolate, Some(f)).unwrap();

        isolate.set_function_code(f, unoptimized);
        isolate.set_function_code(f, optimized);
        (f, unoptimized, optimized)
    }

    #[test]
    fn failed_check_continues_in_unoptimized_code() {
        with_isolate(|isolate| {
            let (f, unoptimized, optimized) = speculative_increment(isolate);
            assert_eq!(isolate.invoke_function(f, &[Value::from_i64(2)]).unwrap(), Value::from_i64(3));
            assert_eq!(isolate.function(f).code, Some(optimized));

            let d = isolate.new_double(1.5).unwrap();
            let r = isolate.invoke_function(f, &[d]).unwrap();
            assert_eq!(isolate.double_value(r), Some(2.5));
            assert_eq!(isolate.function(f).code, Some(unoptimized));
            assert_eq!(isolate.function(f).deoptimization_counter, 1);
            assert!(!isolate.code(optimized).is_alive);
            assert!(isolate.roots.frames.deopt_scratch.is_empty());
        });
    }

    #[test]
    fn repeated_deopts_disable_optimization() {
        with_isolate(|isolate| {
            let (f, _, _) = speculative_increment(isolate);
            let threshold = isolate.runtime.flags().deoptimization_counter_threshold;
            isolate.function_mut(f).deoptimization_counter = threshold;
            let d = isolate.new_double(0.5).unwrap();
            isolate.invoke_function(f, &[d]).unwrap();
            assert!(!isolate.function(f).is_optimizable());
        });
    }

    #[test]
    fn boxed_slots_are_materialized() {
        with_isolate(|isolate| {
            let f = static_function(isolate, "sum", 2);
            let mut b = CodeBuilder::new("sum", 2, 1);
            b.push_arg(0);
            b.push_arg(1);
            b.add();
            let id = b.deopt_point();
            b.ret();
            let unoptimized = b.finalize(isolate, Some(f)).unwrap();

            // The raw sum sits in slot 1 when the smi check on `a` fails.
            let mut b = CodeBuilder::new("sum", 2, 1).optimized();
            b.push_arg(0);
            b.unbox_double(id);
            b.push_arg(1);
            b.unbox_double(id);
            b.dadd();
            b.push_arg(0);
            b.check_smi(id);
            b.pop();
            b.box_double();
            b.ret();
            b.add_deopt_info(
                id,
                DeoptReason::CheckSmi,
                vec![DeoptInstr::StackSlot(0), DeoptInstr::BoxDouble(1)],
            );
            let optimized = b.finalize(isolate, Some(f)).unwrap();
            isolate.set_function_code(f, unoptimized);
            isolate.set_function_code(f, optimized);

            let a = isolate.new_double(1.25).unwrap();
            let h = isolate.roots.api.new_persistent(a);
            let b = isolate.new_double(2.0).unwrap();
            let a = isolate.roots.api.get(h).unwrap();
            let r = isolate.invoke_function(f, &[a, b]).unwrap();
            assert_eq!(isolate.double_value(r), Some(3.25));
            assert_eq!(isolate.function(f).code, Some(unoptimized));
        });
    }

    #[test]
    fn invalidated_caller_resumes_unoptimized_after_the_call() {
        with_isolate(|isolate| {
            let a = isolate.register_class(Class::new("A", None));
            let field = isolate.add_field(a, "x", FieldFlags::empty()).unwrap();
            isolate.finalize_class(a).unwrap();
            let offset = isolate.field(field).offset;
            isolate.field_mut(field).record_store(object::cid::SMI);

            // h(obj): obj.x = 2.5; return 0;
            let h = static_function(isolate, "h", 1);
            let d = isolate.new_double(2.5).unwrap();
            let mut b = CodeBuilder::new("h", 1, 0);
            b.push_arg(0);
            b.push_constant(d);
            b.store_field(offset, field);
            b.push_smi(0);
            b.ret();
            let code = b.finalize(isolate, Some(h)).unwrap();
            isolate.set_function_code(h, code);

            // g(obj) = h(obj) + 1, optimized as h(obj) + 100.
            let g = static_function(isolate, "g", 1);
            let mut b = CodeBuilder::new("g", 1, 0);
            b.push_arg(0);
            b.static_call(h, 1);
            b.push_smi(1);
            b.add();
            b.ret();
            let unoptimized = b.finalize(isolate, Some(g)).unwrap();

            let mut b = CodeBuilder::new("g", 1, 0).optimized();
            b.push_arg(0);
            let id = b.static_call(h, 1);
            b.add_deopt_info(id, DeoptReason::FieldGuard, vec![]);
            b.push_smi(100);
            b.add();
            b.ret();
            let optimized = b.finalize(isolate, Some(g)).unwrap();
            isolate.set_function_code(g, unoptimized);
            isolate.set_function_code(g, optimized);
            isolate.add_field_dependent_code(field, optimized);

            let obj = isolate.new_instance(a).unwrap();
            let r = isolate.invoke_function(g, &[obj]).unwrap();
            assert_eq!(r, Value::from_i64(1));
            assert_eq!(isolate.function(g).code, Some(unoptimized));
            assert!(isolate.roots.frames.lazy_deopt.is_empty());
            assert!(isolate.field(field).dependent_code.is_empty());
        });
    }
}
