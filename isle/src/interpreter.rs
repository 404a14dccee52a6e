//! The execution engine.
//!
//! Code objects hold real byte sequences: x64 call and patch sequences for
//! everything the runtime rewrites, and a compact stack-machine encoding for
//! the rest (see [`crate::assembler`]). This module executes them against
//! the isolate's [`FrameState`](crate::stack_frame::FrameState).
//!
//! Before an instruction that may collect or throw, the exit frame is set to
//! the instruction's end, where the assembler recorded the stack map that
//! describes the instruction's inputs.

use std::cmp::Ordering;

use object::{
    Array, Bigint, ClassId, Closure, Context, ExternalTypedData, GrowableObjectArray, TypedData,
    UnhandledException, Value, cid, class_id,
};

use crate::assembler::{ENTRY_PATCH_SIZE, op};
use crate::bigint::{self, Signed};
use crate::code::{DeoptReason, NO_TRY_INDEX};
use crate::error::{ErrorKind, RuntimeResult, Unwind};
use crate::function::{FieldId, FunctionId, GuardUpdate};
use crate::isolate::Isolate;
use crate::stack_frame::{EntryFrame, ExitFrame, FIRST_SLOT, code_id_for_entry};
use crate::stubs::{StubKind, StubOutcome};

/// Registers the call sequences load before jumping.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Registers {
    /// IC data, cache or entry id of the next call.
    pub rbx: u64,
    /// Argument count of the next call.
    pub r10: u64,
    /// Call target.
    pub r11: u64,
    /// `r11` as of the last call, read by stubs reached through a
    /// patched entry.
    pub call_target: usize,
}

enum Step {
    Next(usize),
    Done(Value),
}

#[inline(always)]
unsafe fn read<T: Copy>(addr: usize) -> T {
    unsafe { (addr as *const T).read_unaligned() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
        }
    }

    fn smi(self, a: i64, b: i64) -> Option<i64> {
        match self {
            ArithOp::Add => a.checked_add(b),
            ArithOp::Sub => a.checked_sub(b),
            ArithOp::Mul => a.checked_mul(b),
        }
    }

    fn wide(self, a: i128, b: i128) -> Option<i128> {
        match self {
            ArithOp::Add => a.checked_add(b),
            ArithOp::Sub => a.checked_sub(b),
            ArithOp::Mul => a.checked_mul(b),
        }
    }

    fn double(self, a: f64, b: f64) -> f64 {
        match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
        }
    }
}

/// Operand stack length of each stack-machine instruction.
fn instruction_length(opcode: u8) -> Option<usize> {
    Some(match opcode {
        op::POP
        | op::DUP
        | op::ADD
        | op::SUB
        | op::MUL
        | op::LESS
        | op::IDENTICAL
        | op::CHECK_SAFEPOINT
        | op::LOAD_INDEXED
        | op::STORE_INDEXED
        | op::LOAD_CLOSURE_CONTEXT
        | op::THROW
        | op::RETHROW
        | op::PUSH_EXCEPTION
        | op::PUSH_STACKTRACE
        | op::BOX_DOUBLE
        | op::BOX_INT64
        | op::DADD
        | op::DSUB
        | op::DMUL => 1,
        op::PUSH_POOL
        | op::PUSH_ARG
        | op::PUSH_LOCAL
        | op::STORE_LOCAL
        | op::LOAD_FIELD
        | op::LOAD_CONTEXT_VAR
        | op::STORE_CONTEXT_VAR
        | op::STOP => 3,
        op::JUMP
        | op::JUMP_IF_FALSE
        | op::JUMP_IF_TRUE
        | op::CHECK_SMI
        | op::UNBOX_DOUBLE
        | op::UNBOX_INT64
        | op::LOAD_STATIC
        | op::STORE_STATIC => 5,
        op::STORE_FIELD | op::CHECK_CLASS => 7,
        op::PUSH_IMM => 9,
        _ => return None,
    })
}

impl Isolate {
    // ── Entry ──────────────────────────────────────────────────────

    /// Calls `function` with `args` from native code. Nested calls from
    /// native functions get their own entry frame.
    pub fn invoke_function(&mut self, function: FunctionId, args: &[Value]) -> RuntimeResult<Value> {
        if !self.function(function).accepts_argument_count(args.len()) {
            let message = format!(
                "'{}' cannot be called with {} arguments",
                self.function(function).name,
                args.len()
            );
            return Err(self.raise_error(ErrorKind::Api, &message));
        }
        let frames = &mut self.roots.frames;
        let saved_exit = frames.exit;
        let saved_fp = frames.fp;
        let base = frames.depth();
        for &arg in args {
            frames.push(arg);
        }
        frames.entries.push(EntryFrame {
            saved_exit,
            saved_fp,
            base,
            argc: args.len(),
        });

        let result = match self.ensure_code(function) {
            Ok(code) => {
                self.regs.r10 = args.len() as u64;
                self.regs.r11 = self.code(code).entry_point() as u64;
                self.run(self.stub_entry(StubKind::InvokeDart))
            }
            Err(unwind) => Err(unwind),
        };

        let frames = &mut self.roots.frames;
        frames.forget_lazy_deopt_above(base);
        frames.truncate(base);
        frames.entries.pop();
        frames.exit = saved_exit;
        frames.fp = saved_fp;
        result
    }

    /// Calls `closure` with `args`; the closure itself is passed first.
    pub fn invoke_closure(&mut self, closure: Value, args: &[Value]) -> RuntimeResult<Value> {
        if self.class_id_of(closure) != cid::CLOSURE {
            return Err(self.raise_error(ErrorKind::Api, "not a closure"));
        }
        let function = self.closure_function(closure);
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(closure);
        all.extend_from_slice(args);
        self.invoke_function(function, &all)
    }

    /// Dynamic call of `name` on `receiver`.
    pub fn invoke_method(&mut self, receiver: Value, name: &str, args: &[Value]) -> RuntimeResult<Value> {
        let class_id = self.class_id_of(receiver);
        let Some(function) = self.resolve_dynamic(class_id, name, args.len() + 1) else {
            let message = format!(
                "NoSuchMethodError: Class '{}' has no instance method '{}'",
                self.class_name_of(class_id),
                name
            );
            return Err(self.raise_error(ErrorKind::Api, &message));
        };
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(receiver);
        all.extend_from_slice(args);
        self.invoke_function(function, &all)
    }

    fn run(&mut self, mut pc: usize) -> RuntimeResult<Value> {
        loop {
            match self.step(pc) {
                Ok(Step::Next(next)) => pc = next,
                Ok(Step::Done(value)) => return Ok(value),
                Err(unwind) => pc = self.handle_error(unwind)?,
            }
        }
    }

    // ── Exceptions ─────────────────────────────────────────────────

    /// Finds a handler for the pending exception in the frames of the
    /// current entry level. Other error kinds bypass handlers.
    fn handle_error(&mut self, unwind: Unwind) -> RuntimeResult<usize> {
        if self.roots.unwinder.kind() != Some(ErrorKind::UnhandledException) {
            return Err(unwind);
        }
        let pending = self.roots.unwinder.pending();
        let (exception, stacktrace) = {
            let ue = unsafe { pending.as_ref::<UnhandledException>() };
            (ue.exception, ue.stacktrace)
        };
        let exception_cid = self.class_id_of(exception);

        let frames: Vec<_> = self.roots.frames.current_level().collect();
        for (pc, fp, code_id) in frames {
            let code = self.code(code_id);
            let mut try_index = code.pc_descriptors.try_index_at(code.pc_offset(pc));
            while try_index != NO_TRY_INDEX {
                let Some(handler) = code.exception_handlers.get(try_index) else {
                    break;
                };
                let catches = handler.handled_types.is_empty()
                    || handler
                        .handled_types
                        .iter()
                        .any(|&t| t == cid::DYNAMIC || self.class_table.is_subtype_of(exception_cid, t));
                if catches {
                    let target = code.entry_point() + handler.handler_pc as usize;
                    let depth = fp + FIRST_SLOT + handler.stack_depth as usize;
                    log::trace!("exception caught in '{}' at offset {}", code.name, handler.handler_pc);
                    let frames = &mut self.roots.frames;
                    frames.active_exception = exception;
                    frames.active_stacktrace = stacktrace;
                    frames.forget_lazy_deopt_above(fp);
                    self.roots.unwinder.take();
                    self.regs.rbx = fp as u64;
                    self.regs.r10 = depth as u64;
                    self.regs.call_target = target;
                    return Ok(self.stub_entry(StubKind::JumpToExceptionHandler));
                }
                try_index = handler.outer_try_index;
            }
        }
        Err(unwind)
    }

    // ── Frames ─────────────────────────────────────────────────────

    fn num_params_of_frame(&self, fp: usize) -> usize {
        self.code(self.roots.frames.code_at(fp)).num_params
    }

    fn arg_slot(&self, fp: usize, index: usize) -> usize {
        fp - 1 - self.num_params_of_frame(fp) + index
    }

    fn enter_frame(&mut self, pc: usize) -> RuntimeResult<Step> {
        let entry = pc - ENTRY_PATCH_SIZE;
        let code_id = code_id_for_entry(entry);
        let (num_params, num_locals) = {
            let code = self.code(code_id);
            (code.num_params, code.num_locals)
        };
        let argc = self.regs.r10 as usize;
        if argc > num_params {
            let message = format!("'{}' called with {} arguments", self.code(code_id).name, argc);
            return Err(self.raise_error(ErrorKind::Api, &message));
        }
        let null = self.null();
        let frames = &mut self.roots.frames;
        if argc < num_params {
            let ret = frames.pop_raw();
            for _ in argc..num_params {
                frames.push(null);
            }
            frames.push_raw(ret);
        }
        let fp = frames.depth();
        let saved_fp = frames.fp;
        frames.push_raw(saved_fp as u64);
        frames.push_raw(entry as u64);
        frames.fp = fp;
        for _ in 0..num_locals {
            frames.push(null);
        }
        let next = pc + 3;
        frames.exit = ExitFrame { pc: next, fp };
        if frames.depth() > frames.max_slots {
            let overflow = self.roots.object_store.stack_overflow;
            return Err(self.throw_exception(overflow));
        }
        self.check_interrupts()?;
        Ok(Step::Next(next))
    }

    /// Pops the frame at `fp`. The return value replaces the arguments.
    fn return_from_frame(&mut self) -> Step {
        let fp = self.roots.frames.fp;
        let num_params = self.num_params_of_frame(fp);
        let frames = &mut self.roots.frames;
        let value = frames.pop();
        let ret = frames.return_address(fp);
        let saved_fp = frames.saved_fp(fp);
        frames.truncate(fp - 1 - num_params);
        frames.push(value);
        frames.fp = saved_fp;
        if ret == 0 { Step::Done(value) } else { Step::Next(ret) }
    }

    // ── Dispatch ───────────────────────────────────────────────────

    fn step(&mut self, pc: usize) -> RuntimeResult<Step> {
        let opcode = unsafe { read::<u8>(pc) };
        let fp = self.roots.frames.fp;
        if let Some(length) = instruction_length(opcode) {
            self.roots.frames.exit = ExitFrame { pc: pc + length, fp };
            return self.execute(opcode, pc, fp, pc + length);
        }
        match opcode {
            op::NOP => Ok(Step::Next(pc + 1)),
            op::ENTER => self.enter_frame(pc),
            op::REX_W => {
                self.regs.rbx = unsafe { read::<u64>(pc + 2) };
                Ok(Step::Next(pc + 10))
            }
            op::REX_WB => {
                let imm = unsafe { read::<u64>(pc + 2) };
                match unsafe { read::<u8>(pc + 1) } {
                    op::MOV_R10 => self.regs.r10 = imm,
                    _ => self.regs.r11 = imm,
                }
                Ok(Step::Next(pc + 10))
            }
            op::REX_B => {
                let target = self.regs.r11 as usize;
                if unsafe { read::<u8>(pc + 2) } == op::CALL_R11 {
                    let ret = pc + 3;
                    self.roots.frames.exit = ExitFrame { pc: ret, fp };
                    self.roots.frames.push_raw(ret as u64);
                    self.regs.call_target = target;
                }
                Ok(Step::Next(target))
            }
            op::RET => Ok(self.return_from_frame()),
            op::RET_BREAKPOINT => {
                self.return_breakpoint_hit(pc)?;
                Ok(self.return_from_frame())
            }
            op::STUB => self.enter_stub(pc, fp),
            op::TRAP => Err(self.raise_error(ErrorKind::Api, "trap instruction reached")),
            _ => {
                let message = format!("illegal instruction {opcode:#04x} at {pc:#x}");
                Err(self.raise_error(ErrorKind::Api, &message))
            }
        }
    }

    fn enter_stub(&mut self, pc: usize, fp: usize) -> RuntimeResult<Step> {
        let raw_kind = unsafe { read::<u8>(pc + 1) };
        let arg = unsafe { read::<u32>(pc + 2) };
        let Some(kind) = StubKind::from_u8(raw_kind) else {
            return Err(self.raise_error(ErrorKind::Api, "unknown stub"));
        };
        match kind {
            StubKind::InvokeDart => {
                self.roots.frames.push_raw(0);
                self.regs.call_target = self.regs.r11 as usize;
                Ok(Step::Next(self.regs.r11 as usize))
            }
            StubKind::DeoptimizeLazy => self.lazy_deoptimize().map(Step::Next),
            StubKind::JumpToExceptionHandler => {
                let frames = &mut self.roots.frames;
                frames.fp = self.regs.rbx as usize;
                frames.truncate(self.regs.r10 as usize);
                Ok(Step::Next(self.regs.call_target))
            }
            _ => {
                let ret = self.stub_return_address();
                self.roots.frames.exit = ExitFrame { pc: ret, fp };
                let argc = self.regs.r10 as usize;
                match self.run_stub(kind, arg, argc, self.regs.rbx)? {
                    StubOutcome::Return(value) => {
                        let frames = &mut self.roots.frames;
                        frames.pop_raw();
                        let depth = frames.depth();
                        frames.truncate(depth - argc);
                        frames.push(value);
                        Ok(Step::Next(ret))
                    }
                    StubOutcome::Jump(target) => Ok(Step::Next(target)),
                    StubOutcome::Continue(next) => Ok(Step::Next(next)),
                }
            }
        }
    }

    fn execute(&mut self, opcode: u8, pc: usize, fp: usize, next: usize) -> RuntimeResult<Step> {
        let u16_at = |at: usize| unsafe { read::<u16>(at) } as usize;
        let u32_at = |at: usize| unsafe { read::<u32>(at) };
        match opcode {
            op::PUSH_IMM => {
                let raw = unsafe { read::<u64>(pc + 1) };
                self.roots.frames.push_raw(raw);
            }
            op::PUSH_POOL => {
                let code = self.roots.frames.code_at(fp);
                let value = self.code(code).object_pool[u16_at(pc + 1)];
                self.roots.frames.push(value);
            }
            op::PUSH_ARG => {
                let slot = self.arg_slot(fp, u16_at(pc + 1));
                let value = self.roots.frames.at(slot);
                self.roots.frames.push(value);
            }
            op::PUSH_LOCAL => {
                let value = self.roots.frames.at(fp + FIRST_SLOT + u16_at(pc + 1));
                self.roots.frames.push(value);
            }
            op::STORE_LOCAL => {
                let value = self.roots.frames.pop();
                self.roots.frames.set_at(fp + FIRST_SLOT + u16_at(pc + 1), value);
            }
            op::POP => {
                self.roots.frames.pop_raw();
            }
            op::DUP => {
                let raw = self.roots.frames.peek(0).raw();
                self.roots.frames.push_raw(raw);
            }
            op::ADD => self.arithmetic(ArithOp::Add)?,
            op::SUB => self.arithmetic(ArithOp::Sub)?,
            op::MUL => self.arithmetic(ArithOp::Mul)?,
            op::LESS => {
                let (a, b) = (self.roots.frames.peek(1), self.roots.frames.peek(0));
                let less = match self.compare_numbers(a, b) {
                    Some(ordering) => ordering == Ordering::Less,
                    None => return Err(self.throw_message("ArgumentError: '<' on non-numbers")),
                };
                self.replace_top(2, self.bool_value(less));
            }
            op::IDENTICAL => {
                let (a, b) = (self.roots.frames.peek(1), self.roots.frames.peek(0));
                let same = self.identical_with_number_check(a, b);
                self.replace_top(2, self.bool_value(same));
            }
            op::DADD | op::DSUB | op::DMUL => {
                let b = f64::from_bits(self.roots.frames.pop_raw());
                let a = f64::from_bits(self.roots.frames.pop_raw());
                let result = match opcode {
                    op::DADD => a + b,
                    op::DSUB => a - b,
                    _ => a * b,
                };
                self.roots.frames.push_raw(result.to_bits());
            }
            op::JUMP | op::JUMP_IF_FALSE | op::JUMP_IF_TRUE => {
                let rel = unsafe { read::<i32>(pc + 1) } as isize;
                let target = next.wrapping_add_signed(rel);
                let taken = match opcode {
                    op::JUMP => true,
                    op::JUMP_IF_FALSE => self.roots.frames.pop() == self.bool_value(false),
                    _ => self.roots.frames.pop() == self.bool_value(true),
                };
                return Ok(Step::Next(if taken { target } else { next }));
            }
            op::CHECK_SAFEPOINT => self.check_interrupts()?,
            op::LOAD_FIELD => {
                let object = self.roots.frames.peek(0);
                self.check_instance(object, "getter")?;
                let value = self.instance_field(object, u16_at(pc + 1));
                self.roots.frames.set_peek(0, value);
            }
            op::STORE_FIELD => {
                let offset = u16_at(pc + 1);
                let field = FieldId(u32_at(pc + 3));
                let object = self.roots.frames.peek(1);
                let value = self.roots.frames.peek(0);
                self.check_instance(object, "setter")?;
                self.guard_field_store(field, value);
                self.set_instance_field(object, offset, value);
                self.roots.frames.pop_raw();
                self.roots.frames.pop_raw();
            }
            op::LOAD_INDEXED => {
                let value = self.load_indexed()?;
                self.replace_top(2, value);
            }
            op::STORE_INDEXED => {
                self.store_indexed()?;
                let depth = self.roots.frames.depth();
                self.roots.frames.truncate(depth - 3);
            }
            op::LOAD_CONTEXT_VAR => {
                let context = self.roots.frames.peek(0);
                let value = unsafe { context.as_ref::<Context>() }.at(u16_at(pc + 1));
                self.roots.frames.set_peek(0, value);
            }
            op::STORE_CONTEXT_VAR => {
                let context = self.roots.frames.peek(1);
                let value = self.roots.frames.peek(0);
                let slot = unsafe { context.as_ref::<Context>() }.variable_addr(u16_at(pc + 1));
                self.store_slot(context, slot, value);
                self.roots.frames.pop_raw();
                self.roots.frames.pop_raw();
            }
            op::LOAD_CLOSURE_CONTEXT => {
                let closure = self.roots.frames.at(self.arg_slot(fp, 0));
                let context = unsafe { closure.as_ref::<Closure>() }.context;
                self.roots.frames.push(context);
            }
            op::LOAD_STATIC => {
                let value = self.static_value(FieldId(u32_at(pc + 1)));
                self.roots.frames.push(value);
            }
            op::STORE_STATIC => {
                let value = self.roots.frames.pop();
                self.set_static_value(FieldId(u32_at(pc + 1)), value);
            }
            op::THROW => {
                let exception = self.roots.frames.peek(0);
                return Err(self.throw_exception(exception));
            }
            op::RETHROW => {
                let exception = self.roots.frames.peek(1);
                let stacktrace = self.roots.frames.peek(0);
                return Err(self.rethrow_exception(exception, stacktrace));
            }
            op::PUSH_EXCEPTION => {
                let value = self.roots.frames.active_exception;
                self.roots.frames.push(value);
            }
            op::PUSH_STACKTRACE => {
                let value = self.roots.frames.active_stacktrace;
                self.roots.frames.push(value);
            }
            op::CHECK_SMI => {
                if !self.roots.frames.peek(0).is_smi() {
                    return self.deoptimize_at(u32_at(pc + 1), DeoptReason::CheckSmi).map(Step::Next);
                }
            }
            op::CHECK_CLASS => {
                let expected = unsafe { read::<u16>(pc + 1) } as ClassId;
                if self.class_id_of(self.roots.frames.peek(0)) != expected {
                    return self.deoptimize_at(u32_at(pc + 3), DeoptReason::CheckClass).map(Step::Next);
                }
            }
            op::UNBOX_DOUBLE => {
                let value = self.roots.frames.peek(0);
                let Some(d) = self.double_value(value) else {
                    return self.deoptimize_at(u32_at(pc + 1), DeoptReason::UnboxDouble).map(Step::Next);
                };
                self.roots.frames.pop_raw();
                self.roots.frames.push_raw(d.to_bits());
            }
            op::BOX_DOUBLE => {
                let d = f64::from_bits(self.roots.frames.peek(0).raw());
                let boxed = self.new_double(d)?;
                self.roots.frames.set_peek(0, boxed);
            }
            op::UNBOX_INT64 => {
                let value = self.roots.frames.peek(0);
                let Some(n) = self.integer_value(value) else {
                    return self.deoptimize_at(u32_at(pc + 1), DeoptReason::UnboxInt64).map(Step::Next);
                };
                self.roots.frames.pop_raw();
                self.roots.frames.push_raw(n as u64);
            }
            op::BOX_INT64 => {
                let n = self.roots.frames.peek(0).raw() as i64;
                let boxed = self.new_integer(n)?;
                self.roots.frames.set_peek(0, boxed);
            }
            op::STOP => {
                let code = self.roots.frames.code_at(fp);
                let message = self.code(code).object_pool[u16_at(pc + 1)];
                let text = self.string_value(message).unwrap_or_default();
                if self.runtime.flags().print_stop_message {
                    log::error!("stop: {text}");
                }
                return Err(self.raise_error(ErrorKind::Api, &format!("stop: {text}")));
            }
            _ => unreachable!("opcode {opcode:#04x} has a length but no handler"),
        }
        Ok(Step::Next(next))
    }

    /// Pops `n` operands and pushes `value`.
    fn replace_top(&mut self, n: usize, value: Value) {
        let depth = self.roots.frames.depth();
        self.roots.frames.truncate(depth - n);
        self.roots.frames.push(value);
    }

    fn check_instance(&mut self, object: Value, accessor: &str) -> RuntimeResult<()> {
        if object.is_smi() || object == self.null() {
            let message = format!(
                "NoSuchMethodError: The {accessor} was called on {}",
                self.value_to_string(object)
            );
            return Err(self.throw_message(&message));
        }
        Ok(())
    }

    pub(crate) fn guard_field_store(&mut self, field: FieldId, value: Value) {
        let value_cid = self.class_id_of(value);
        if self.field_mut(field).record_store(value_cid) == GuardUpdate::Invalidated {
            let dependents = std::mem::take(&mut self.field_mut(field).dependent_code);
            log::debug!(
                "guard of field '{}' invalidated, {} dependent code objects",
                self.field(field).name,
                dependents.len()
            );
            self.deoptimize_dependent_code(dependents);
        }
    }

    // ── Arithmetic ─────────────────────────────────────────────────

    /// `[a, b]` → `[a op b]`. Smis stay on the fast path; everything else
    /// widens to mint, bigint or double.
    fn arithmetic(&mut self, op: ArithOp) -> RuntimeResult<()> {
        let (a, b) = (self.roots.frames.peek(1), self.roots.frames.peek(0));
        if a.is_smi() && b.is_smi() {
            if let Some(smi) = op.smi(a.to_i64(), b.to_i64()).and_then(Value::try_from_i64) {
                self.replace_top(2, smi);
                return Ok(());
            }
        }
        let result = self.arithmetic_slow(op, a, b)?;
        self.replace_top(2, result);
        Ok(())
    }

    fn arithmetic_slow(&mut self, op: ArithOp, a: Value, b: Value) -> RuntimeResult<Value> {
        let (ca, cb) = (self.class_id_of(a), self.class_id_of(b));
        if !class_id::is_number_cid(ca) || !class_id::is_number_cid(cb) {
            let message = format!("ArgumentError: '{}' on non-numbers", op.symbol());
            return Err(self.throw_message(&message));
        }
        if ca == cid::DOUBLE || cb == cid::DOUBLE {
            let (x, y) = (self.number_as_f64(a), self.number_as_f64(b));
            return self.new_double(op.double(x, y));
        }
        if let (Some(x), Some(y)) = (self.integer_value_i128(a), self.integer_value_i128(b)) {
            if let Some(wide) = op.wide(x, y) {
                return self.new_integer_i128(wide);
            }
        }
        let (x_neg, x) = self.integer_as_signed(a);
        let (y_neg, y) = self.integer_as_signed(b);
        let (negative, digits) = match op {
            ArithOp::Add => bigint::add(x_neg, &x, y_neg, &y),
            ArithOp::Sub => bigint::sub(x_neg, &x, y_neg, &y),
            ArithOp::Mul => bigint::mul(x_neg, &x, y_neg, &y),
        };
        self.new_bigint(negative, &digits)
    }

    fn integer_as_signed(&self, value: Value) -> Signed {
        if self.class_id_of(value) == cid::BIGINT {
            let b = unsafe { value.as_ref::<Bigint>() };
            return (b.is_negative(), b.digits().to_vec());
        }
        bigint::from_i128(self.integer_value(value).map_or(0, i128::from))
    }

    fn number_as_f64(&self, value: Value) -> f64 {
        if let Some(d) = self.double_value(value) {
            return d;
        }
        if let Some(n) = self.integer_value(value) {
            return n as f64;
        }
        let (negative, digits) = self.integer_as_signed(value);
        bigint::to_f64(negative, &digits)
    }

    /// Numeric ordering, `None` if either side is not a number or NaN.
    pub(crate) fn compare_numbers(&self, a: Value, b: Value) -> Option<Ordering> {
        if a.is_smi() && b.is_smi() {
            return Some(a.to_i64().cmp(&b.to_i64()));
        }
        let (ca, cb) = (self.class_id_of(a), self.class_id_of(b));
        if !class_id::is_number_cid(ca) || !class_id::is_number_cid(cb) {
            return None;
        }
        if ca == cid::DOUBLE || cb == cid::DOUBLE {
            return self.number_as_f64(a).partial_cmp(&self.number_as_f64(b));
        }
        let (x_neg, x) = self.integer_as_signed(a);
        let (y_neg, y) = self.integer_as_signed(b);
        Some(bigint::compare(x_neg, &x, y_neg, &y))
    }

    // ── Indexed access ─────────────────────────────────────────────

    fn checked_index(&mut self, index: Value, length: usize) -> RuntimeResult<usize> {
        if index.is_smi() && (0..length as i64).contains(&index.to_i64()) {
            return Ok(index.to_usize());
        }
        let message = format!("RangeError: index {} not in 0..{}", self.value_to_string(index), length);
        Err(self.throw_message(&message))
    }

    /// Element storage of a typed data object: `(data, length)`.
    fn typed_data_storage(&self, object: Value) -> (*mut u8, usize) {
        if class_id::is_external_typed_data_cid(self.class_id_of(object)) {
            let t = unsafe { object.as_ref::<ExternalTypedData>() };
            (t.data, t.len())
        } else {
            let t = unsafe { object.as_ref::<TypedData>() };
            (t.data_ptr(), t.len())
        }
    }

    /// `[object, index]` on the stack.
    fn load_indexed(&mut self) -> RuntimeResult<Value> {
        let object = self.roots.frames.peek(1);
        let index = self.roots.frames.peek(0);
        match self.class_id_of(object) {
            cid::ARRAY | cid::IMMUTABLE_ARRAY => {
                let length = unsafe { object.as_ref::<Array>() }.len();
                let i = self.checked_index(index, length)?;
                Ok(unsafe { object.as_ref::<Array>() }.at(i))
            }
            cid::GROWABLE_OBJECT_ARRAY => {
                let g = unsafe { object.as_ref::<GrowableObjectArray>() };
                let (length, data) = (g.len(), g.data);
                let i = self.checked_index(index, length)?;
                Ok(unsafe { data.as_ref::<Array>() }.at(i))
            }
            c if class_id::is_typed_data_cid(c) => {
                let (data, length) = self.typed_data_storage(object);
                let i = self.checked_index(index, length)?;
                let kind = class_id::internal_typed_data_cid(c);
                let at = unsafe { data.add(i * class_id::element_size(c)) };
                unsafe {
                    match kind {
                        cid::TYPED_DATA_FLOAT32 => self.new_double(f64::from(read::<f32>(at as usize))),
                        cid::TYPED_DATA_FLOAT64 => self.new_double(read::<f64>(at as usize)),
                        cid::TYPED_DATA_INT8 => Ok(Value::from_i64(i64::from(read::<i8>(at as usize)))),
                        cid::TYPED_DATA_UINT8 | cid::TYPED_DATA_UINT8_CLAMPED => {
                            Ok(Value::from_i64(i64::from(read::<u8>(at as usize))))
                        }
                        cid::TYPED_DATA_INT16 => Ok(Value::from_i64(i64::from(read::<i16>(at as usize)))),
                        cid::TYPED_DATA_UINT16 => Ok(Value::from_i64(i64::from(read::<u16>(at as usize)))),
                        cid::TYPED_DATA_INT32 => Ok(Value::from_i64(i64::from(read::<i32>(at as usize)))),
                        cid::TYPED_DATA_UINT32 => Ok(Value::from_i64(i64::from(read::<u32>(at as usize)))),
                        cid::TYPED_DATA_INT64 => self.new_integer(read::<i64>(at as usize)),
                        _ => self.new_integer_i128(i128::from(read::<u64>(at as usize))),
                    }
                }
            }
            _ => Err(self.throw_message("NoSuchMethodError: '[]' on a non-indexable object")),
        }
    }

    /// `[object, index, value]` on the stack.
    fn store_indexed(&mut self) -> RuntimeResult<()> {
        let object = self.roots.frames.peek(2);
        let index = self.roots.frames.peek(1);
        let value = self.roots.frames.peek(0);
        match self.class_id_of(object) {
            cid::ARRAY => {
                let length = unsafe { object.as_ref::<Array>() }.len();
                let i = self.checked_index(index, length)?;
                let slot = unsafe { object.as_ref::<Array>() }.slot_addr(i);
                self.store_slot(object, slot, value);
                Ok(())
            }
            cid::IMMUTABLE_ARRAY => Err(self.throw_message("UnsupportedError: cannot modify an immutable array")),
            cid::GROWABLE_OBJECT_ARRAY => {
                let (length, data) = {
                    let g = unsafe { object.as_ref::<GrowableObjectArray>() };
                    (g.len(), g.data)
                };
                let i = self.checked_index(index, length)?;
                let slot = unsafe { data.as_ref::<Array>() }.slot_addr(i);
                self.store_slot(data, slot, value);
                Ok(())
            }
            c if class_id::is_typed_data_cid(c) => {
                let (data, length) = self.typed_data_storage(object);
                let i = self.checked_index(index, length)?;
                let kind = class_id::internal_typed_data_cid(c);
                let at = unsafe { data.add(i * class_id::element_size(c)) };
                if matches!(kind, cid::TYPED_DATA_FLOAT32 | cid::TYPED_DATA_FLOAT64) {
                    let Some(d) = self.double_value(value).or_else(|| self.integer_value(value).map(|n| n as f64))
                    else {
                        return Err(self.throw_message("ArgumentError: expected a number"));
                    };
                    unsafe {
                        match kind {
                            cid::TYPED_DATA_FLOAT32 => (at as *mut f32).write_unaligned(d as f32),
                            _ => (at as *mut f64).write_unaligned(d),
                        }
                    }
                    return Ok(());
                }
                let Some(n) = self.integer_value_i128(value) else {
                    return Err(self.throw_message("ArgumentError: expected an integer"));
                };
                unsafe {
                    match kind {
                        cid::TYPED_DATA_INT8 | cid::TYPED_DATA_UINT8 => at.write(n as u8),
                        cid::TYPED_DATA_UINT8_CLAMPED => at.write(n.clamp(0, 255) as u8),
                        cid::TYPED_DATA_INT16 | cid::TYPED_DATA_UINT16 => {
                            (at as *mut u16).write_unaligned(n as u16)
                        }
                        cid::TYPED_DATA_INT32 | cid::TYPED_DATA_UINT32 => {
                            (at as *mut u32).write_unaligned(n as u32)
                        }
                        _ => (at as *mut u64).write_unaligned(n as u64),
                    }
                }
                Ok(())
            }
            _ => Err(self.throw_message("NoSuchMethodError: '[]=' on a non-indexable object")),
        }
    }
}
