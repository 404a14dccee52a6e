//! Code patching: call targets, inline cache sites and code entries.
//!
//! Every code object starts with a patchable region. A live entry is all
//! `NOP`s; a disabled one jumps to the fix-callers-target stub:
//!
//! ```text
//! 49 BB <fix callers target>  41 FF E3
//! ```

use crate::assembler::{ENTRY_PATCH_SIZE, IC_DATA_FROM_RETURN, TARGET_FROM_RETURN, op};
use crate::code::CodeId;
use crate::function::FunctionId;
use crate::isolate::Isolate;
use crate::stubs::StubKind;

/// # Safety
///
/// `addr..addr + 8` must lie inside an instructions object.
pub(crate) unsafe fn read_imm(addr: usize) -> u64 {
    unsafe { (addr as *const u64).read_unaligned() }
}

/// # Safety
///
/// `addr..addr + 8` must lie inside a writable instructions object.
pub(crate) unsafe fn write_imm(addr: usize, value: u64) {
    unsafe { (addr as *mut u64).write_unaligned(value) }
}

/// The call target of the call returning to `ret`.
pub(crate) fn call_target_at(ret: usize) -> usize {
    unsafe { read_imm(ret - TARGET_FROM_RETURN) as usize }
}

pub(crate) fn set_call_target_at(ret: usize, target: usize) {
    unsafe { write_imm(ret - TARGET_FROM_RETURN, target as u64) }
}

/// The `rbx` immediate of the instance call returning to `ret`.
pub(crate) fn instance_call_data_at(ret: usize) -> u64 {
    unsafe { read_imm(ret - IC_DATA_FROM_RETURN) }
}

pub(crate) fn set_instance_call_at(ret: usize, data: u64, target: usize) {
    unsafe {
        write_imm(ret - IC_DATA_FROM_RETURN, data);
        write_imm(ret - TARGET_FROM_RETURN, target as u64);
    }
}

impl Isolate {
    /// Redirects the static call returning to `ret` in `caller` to `code`.
    pub(crate) fn patch_static_call(&mut self, caller: CodeId, ret: usize, function: FunctionId, code: CodeId) {
        let entry = self.code(code).entry_point();
        if !self.debugger.update_original_target(ret, entry) {
            set_call_target_at(ret, entry);
        }
        let offset = self.code(caller).pc_offset(ret);
        if let Some(row) = self.code_mut(caller).static_call_at_mut(offset) {
            debug_assert_eq!(row.function, function);
            row.code = Some(code);
        }
    }

    /// Makes every call into `code` go through the fix-callers-target stub.
    pub(crate) fn disable_code(&mut self, code: CodeId) {
        let target = self.stub_entry(StubKind::FixCallersTarget);
        let entry = self.code(code).entry_point();
        let mut bytes = [0u8; ENTRY_PATCH_SIZE];
        bytes[0] = op::REX_WB;
        bytes[1] = op::MOV_R11;
        bytes[2..10].copy_from_slice(&(target as u64).to_le_bytes());
        bytes[10..].copy_from_slice(&[op::REX_B, op::GROUP5, op::JMP_R11]);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), entry as *mut u8, ENTRY_PATCH_SIZE) };
        self.code_mut(code).is_alive = false;
        log::trace!("disabled code {} '{}'", code.0, self.code(code).name);
    }

    pub(crate) fn restore_code_entry(&mut self, code: CodeId) {
        let entry = self.code(code).entry_point();
        unsafe { std::ptr::write_bytes(entry as *mut u8, op::NOP, ENTRY_PATCH_SIZE) };
        self.code_mut(code).is_alive = true;
    }

    /// Installs `code` as the current code of `function`.
    ///
    /// The previous code is disabled. If it was optimized, frames of the
    /// current entry level still running it resume in the lazy
    /// deoptimization stub when their callee returns.
    pub(crate) fn set_function_code(&mut self, function: FunctionId, code: CodeId) {
        let old = self.function(function).code;
        if old == Some(code) {
            return;
        }
        if let Some(old) = old {
            if self.code(old).is_alive {
                self.disable_code(old);
            }
            if self.code(old).is_optimized {
                self.schedule_lazy_deopt(old);
            }
        }
        if !self.code(code).is_alive {
            self.restore_code_entry(code);
        }
        let is_optimized = self.code(code).is_optimized;
        let f = self.function_mut(function);
        f.code = Some(code);
        if !is_optimized {
            f.unoptimized_code = Some(code);
        }
        log::debug!(
            "'{}' now runs {} code {}",
            self.function(function).name,
            if is_optimized { "optimized" } else { "unoptimized" },
            code.0
        );
    }

    /// Redirects the return of every callee of a frame running `code`.
    /// The innermost frame has no callee and finishes in `code`.
    fn schedule_lazy_deopt(&mut self, code: CodeId) {
        let frames: Vec<(usize, usize, CodeId)> = self.roots.frames.current_level().collect();
        let lazy_entry = self.roots.frames.lazy_deopt_entry;
        for i in 1..frames.len() {
            let (_, fp, frame_code) = frames[i];
            if frame_code != code {
                continue;
            }
            let callee_fp = frames[i - 1].1;
            let slot = callee_fp - 1;
            let ret = self.roots.frames.stack[slot] as usize;
            if ret == lazy_entry {
                continue;
            }
            self.roots.frames.lazy_deopt.insert(fp, ret);
            self.roots.frames.stack[slot] = lazy_entry as u64;
            log::trace!("frame at {} of code {} deoptimizes on return", fp, code.0);
        }
    }

    /// Disables optimized code that relied on a field guard that no longer
    /// holds and falls back to unoptimized code.
    pub(crate) fn deoptimize_dependent_code(&mut self, codes: Vec<CodeId>) {
        for code in codes {
            if !self.code(code).is_alive {
                continue;
            }
            let Some(function) = self.code(code).function else {
                continue;
            };
            if self.function(function).code != Some(code) {
                self.disable_code(code);
                continue;
            }
            match self.function(function).unoptimized_code {
                Some(unoptimized) => self.set_function_code(function, unoptimized),
                None => {
                    self.disable_code(code);
                    self.schedule_lazy_deopt(code);
                    self.function_mut(function).code = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{CodeBuilder, INSTANCE_CALL_SIZE};
    use crate::class_table::Class;
    use crate::function::{Function, FunctionFlags, FunctionKind};
    use crate::runtime::{Runtime, RuntimeConfig};

    fn with_isolate<R>(f: impl FnOnce(&mut Isolate) -> R) -> R {
        let _ = env_logger::builder().is_test(true).try_init();
        let runtime = Runtime::initialize(RuntimeConfig::default()).unwrap();
        let handle = runtime.create_isolate("patcher", 0).unwrap();
        let result = handle.with(f).unwrap();
        handle.shutdown().unwrap();
        result
    }

    fn static_function(isolate: &mut Isolate, name: &str) -> FunctionId {
        let owner = isolate.register_class(Class::new("Lib", None));
        let function = Function::new(name, owner, FunctionKind::Regular, 0).with_flags(FunctionFlags::STATIC);
        isolate.add_function(function).unwrap()
    }

    fn constant_code(isolate: &mut Isolate, function: FunctionId, n: i64) -> CodeId {
        let mut b = CodeBuilder::new("k", 0, 0);
        b.push_smi(n);
        b.ret();
        b.finalize(isolate, Some(function)).unwrap()
    }

    #[test]
    fn disable_and_restore_entry() {
        with_isolate(|isolate| {
            let f = static_function(isolate, "k");
            let code = constant_code(isolate, f, 1);
            let entry = isolate.code(code).entry_point();
            isolate.disable_code(code);
            assert!(!isolate.code(code).is_alive);
            let bytes = unsafe { std::slice::from_raw_parts(entry as *const u8, ENTRY_PATCH_SIZE) };
            assert_eq!(&bytes[..2], &[op::REX_WB, op::MOV_R11]);
            assert_eq!(unsafe { read_imm(entry + 2) } as usize, isolate.stub_entry(StubKind::FixCallersTarget));
            isolate.restore_code_entry(code);
            let bytes = unsafe { std::slice::from_raw_parts(entry as *const u8, ENTRY_PATCH_SIZE) };
            assert!(bytes.iter().all(|&b| b == op::NOP));
        });
    }

    #[test]
    fn switching_code_disables_the_old_one() {
        with_isolate(|isolate| {
            let f = static_function(isolate, "k");
            let first = constant_code(isolate, f, 1);
            isolate.set_function_code(f, first);
            let second = constant_code(isolate, f, 2);
            isolate.set_function_code(f, second);
            assert!(!isolate.code(first).is_alive);
            assert!(isolate.code(second).is_alive);
            assert_eq!(isolate.function(f).code, Some(second));
            assert_eq!(isolate.function(f).unoptimized_code, Some(second));
            isolate.set_function_code(f, first);
            assert!(isolate.code(first).is_alive);
        });
    }

    #[test]
    fn instance_call_site_patching() {
        with_isolate(|isolate| {
            let f = static_function(isolate, "caller");
            let mut b = CodeBuilder::new("caller", 1, 0);
            b.push_arg(0);
            let start = b.offset();
            b.instance_call("m", 1, 1);
            b.ret();
            let code = b.finalize(isolate, Some(f)).unwrap();
            let ret = isolate.code(code).entry_point() + start + INSTANCE_CALL_SIZE;
            assert_eq!(call_target_at(ret), isolate.stub_entry(StubKind::OneArgCheckInlineCache));
            let lookup = isolate.stub_entry(StubKind::MegamorphicLookup);
            set_instance_call_at(ret, 9, lookup);
            assert_eq!(instance_call_data_at(ret), 9);
            assert_eq!(call_target_at(ret), lookup);
        });
    }
}
