//! Shared stubs.
//!
//! A stub is a tiny `Instructions` object whose body is `F1 <kind> <arg>`.
//! The shared stubs live in the VM heap's code space and are generated once
//! per runtime; per-class allocation stubs live in each isolate's code
//! space. When the interpreter reaches a stub body it dispatches to
//! [`Isolate::run_stub`], which implements the stub in Rust.

use heap::{Heap, HeapError, Space};
use object::{
    Array, ClassId, GrowableObjectArray, Header, Instance, Instructions, Value, cid, class_id,
};

use crate::assembler::{STUB_SIZE, stub_bytes};
use crate::error::{ErrorKind, RuntimeResult};
use crate::function::{FunctionId, NativeId};
use crate::isolate::Isolate;
use crate::runtime_entries::RuntimeEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StubKind {
    InvokeDart,
    CallToRuntime,
    CallNativeCFunction,
    UpdateStoreBuffer,
    AllocateObject,
    AllocateArray,
    AllocateContext,
    AllocateGrowableArray,
    AllocateTypedData,
    AllocateClosure,
    AllocateClosureWithContext,
    OneArgCheckInlineCache,
    TwoArgsCheckInlineCache,
    ThreeArgsCheckInlineCache,
    OneArgOptimizedCheckInlineCache,
    TwoArgsOptimizedCheckInlineCache,
    ThreeArgsOptimizedCheckInlineCache,
    ClosureCall,
    MegamorphicLookup,
    InstanceFunctionLookup,
    Deoptimize,
    DeoptimizeLazy,
    FixCallersTarget,
    LazyCompile,
    OptimizeFunction,
    BreakpointStatic,
    BreakpointDynamic,
    BreakpointClosure,
    SubtypeTestCache1,
    SubtypeTestCache2,
    SubtypeTestCache3,
    EqualityWithNullCheck,
    IdenticalWithNumberCheck,
    JumpToExceptionHandler,
}

impl StubKind {
    pub const ALL: [StubKind; 34] = [
        StubKind::InvokeDart,
        StubKind::CallToRuntime,
        StubKind::CallNativeCFunction,
        StubKind::UpdateStoreBuffer,
        StubKind::AllocateObject,
        StubKind::AllocateArray,
        StubKind::AllocateContext,
        StubKind::AllocateGrowableArray,
        StubKind::AllocateTypedData,
        StubKind::AllocateClosure,
        StubKind::AllocateClosureWithContext,
        StubKind::OneArgCheckInlineCache,
        StubKind::TwoArgsCheckInlineCache,
        StubKind::ThreeArgsCheckInlineCache,
        StubKind::OneArgOptimizedCheckInlineCache,
        StubKind::TwoArgsOptimizedCheckInlineCache,
        StubKind::ThreeArgsOptimizedCheckInlineCache,
        StubKind::ClosureCall,
        StubKind::MegamorphicLookup,
        StubKind::InstanceFunctionLookup,
        StubKind::Deoptimize,
        StubKind::DeoptimizeLazy,
        StubKind::FixCallersTarget,
        StubKind::LazyCompile,
        StubKind::OptimizeFunction,
        StubKind::BreakpointStatic,
        StubKind::BreakpointDynamic,
        StubKind::BreakpointClosure,
        StubKind::SubtypeTestCache1,
        StubKind::SubtypeTestCache2,
        StubKind::SubtypeTestCache3,
        StubKind::EqualityWithNullCheck,
        StubKind::IdenticalWithNumberCheck,
        StubKind::JumpToExceptionHandler,
    ];

    pub fn from_u8(byte: u8) -> Option<StubKind> {
        Self::ALL.get(byte as usize).copied()
    }

    /// The inline cache stub checking `num_args` arguments.
    pub fn inline_cache(num_args: usize, optimized: bool) -> StubKind {
        match (num_args, optimized) {
            (1, false) => StubKind::OneArgCheckInlineCache,
            (2, false) => StubKind::TwoArgsCheckInlineCache,
            (_, false) => StubKind::ThreeArgsCheckInlineCache,
            (1, true) => StubKind::OneArgOptimizedCheckInlineCache,
            (2, true) => StubKind::TwoArgsOptimizedCheckInlineCache,
            (_, true) => StubKind::ThreeArgsOptimizedCheckInlineCache,
        }
    }

    pub fn is_inline_cache(self) -> bool {
        self.inline_cache_args().is_some()
    }

    /// `(arguments checked, optimized)` of an inline cache stub.
    pub fn inline_cache_args(self) -> Option<(usize, bool)> {
        match self {
            StubKind::OneArgCheckInlineCache => Some((1, false)),
            StubKind::TwoArgsCheckInlineCache => Some((2, false)),
            StubKind::ThreeArgsCheckInlineCache => Some((3, false)),
            StubKind::OneArgOptimizedCheckInlineCache => Some((1, true)),
            StubKind::TwoArgsOptimizedCheckInlineCache => Some((2, true)),
            StubKind::ThreeArgsOptimizedCheckInlineCache => Some((3, true)),
            _ => None,
        }
    }

    /// Stubs entered by a call have a return address on top of the stack.
    /// The others are jumped to.
    pub fn is_called(self) -> bool {
        !matches!(
            self,
            StubKind::InvokeDart | StubKind::DeoptimizeLazy | StubKind::JumpToExceptionHandler
        )
    }

    pub fn name(self) -> String {
        format!("[Stub] {:?}", self)
    }
}

/// What the interpreter does after a stub ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StubOutcome {
    /// Return `value` to the caller, dropping the arguments.
    Return(Value),
    /// Continue at `addr` with the stack untouched: a tail call.
    Jump(usize),
    /// Continue at `pc` in the current frame.
    Continue(usize),
}

// ── Stub table ─────────────────────────────────────────────────────

/// Entry points of the shared stubs, in the VM heap.
#[derive(Debug)]
pub struct StubCode {
    entries: Vec<usize>,
}

impl StubCode {
    /// Writes every shared stub into `vm_heap`'s code space.
    pub(crate) fn generate(vm_heap: &mut Heap) -> Result<StubCode, HeapError> {
        let size = Instructions::allocation_size(STUB_SIZE);
        let mut entries = Vec::with_capacity(StubKind::ALL.len());
        for kind in StubKind::ALL {
            let ptr = vm_heap
                .try_allocate(size, Space::Code)
                .ok_or(HeapError::OutOfMemory { space: Space::Code, requested: size })?;
            let addr = ptr.as_ptr() as usize;
            unsafe { Header::initialize(addr, cid::INSTRUCTIONS, size) };
            let instructions = unsafe { Value::from_addr(addr).as_mut::<Instructions>() };
            instructions.size = Value::from_usize(STUB_SIZE);
            instructions.code_id = Value::from_i64(-1);
            let bytes = stub_bytes(kind, 0);
            let entry = instructions.entry_point();
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), entry as *mut u8, STUB_SIZE) };
            entries.push(entry);
        }
        Ok(StubCode { entries })
    }

    #[inline]
    pub fn entry(&self, kind: StubKind) -> usize {
        self.entries[kind as usize]
    }

    /// The shared stub starting at `entry`, if any.
    pub fn kind_at(&self, entry: usize) -> Option<StubKind> {
        self.entries.iter().position(|&e| e == entry).and_then(|i| StubKind::from_u8(i as u8))
    }

    pub fn iter(&self) -> impl Iterator<Item = (StubKind, usize)> + '_ {
        StubKind::ALL.iter().copied().zip(self.entries.iter().copied())
    }
}

// ── Stub implementations ───────────────────────────────────────────

impl Isolate {
    /// Argument `index` of a called stub. The return address is on top.
    #[inline]
    pub(crate) fn stub_arg(&self, argc: usize, index: usize) -> Value {
        self.roots.frames.peek(argc - index)
    }

    /// The return address of a called stub.
    #[inline]
    pub(crate) fn stub_return_address(&self) -> usize {
        self.roots.frames.peek(0).raw() as usize
    }

    pub(crate) fn run_stub(&mut self, kind: StubKind, arg: u32, argc: usize, rbx: u64) -> RuntimeResult<StubOutcome> {
        match kind {
            StubKind::CallToRuntime => {
                let Some(entry) = RuntimeEntry::from_id(rbx) else {
                    return Err(self.raise_error(ErrorKind::Api, "unknown runtime entry"));
                };
                self.call_runtime_entry(entry, argc).map(StubOutcome::Return)
            }
            StubKind::CallNativeCFunction => {
                self.call_native_function(NativeId(rbx as u32), argc).map(StubOutcome::Return)
            }
            StubKind::UpdateStoreBuffer => {
                let owner = self.stub_arg(argc, 0);
                let value = self.stub_arg(argc, 1);
                self.heap.write_barrier(owner, value);
                Ok(StubOutcome::Return(self.null()))
            }
            StubKind::AllocateObject => self.allocate_object_stub(arg as ClassId, argc),
            StubKind::AllocateArray => self.allocate_array_stub(argc),
            StubKind::AllocateContext => {
                let parent = self.stub_arg(argc, 0);
                self.new_context(rbx as usize, parent).map(StubOutcome::Return)
            }
            StubKind::AllocateGrowableArray => self.allocate_growable_array_stub(rbx as usize, argc),
            StubKind::AllocateTypedData => {
                let length = self.stub_arg(argc, 0);
                if !length.is_smi() || length.to_i64() < 0 {
                    return Err(self.throw_message("RangeError: invalid typed data length"));
                }
                self.new_typed_data(rbx as ClassId, length.to_usize()).map(StubOutcome::Return)
            }
            StubKind::AllocateClosure => {
                let null = self.null();
                self.new_closure(FunctionId(rbx as u32), null).map(StubOutcome::Return)
            }
            StubKind::AllocateClosureWithContext => {
                let context = self.stub_arg(argc, 0);
                self.new_closure(FunctionId(rbx as u32), context).map(StubOutcome::Return)
            }
            StubKind::OneArgCheckInlineCache
            | StubKind::TwoArgsCheckInlineCache
            | StubKind::ThreeArgsCheckInlineCache
            | StubKind::OneArgOptimizedCheckInlineCache
            | StubKind::TwoArgsOptimizedCheckInlineCache
            | StubKind::ThreeArgsOptimizedCheckInlineCache => self.inline_cache_stub(kind, argc, rbx),
            StubKind::MegamorphicLookup => self.megamorphic_lookup_stub(argc, rbx),
            StubKind::ClosureCall => self.closure_call_stub(argc),
            StubKind::InstanceFunctionLookup => {
                let receiver = self.stub_arg(argc, 0);
                let name = self.stub_arg(argc, 1);
                let name = self.string_value(name).unwrap_or_default();
                let class_id = self.class_id_of(receiver);
                let found = self
                    .class_table
                    .superclass_chain(class_id)
                    .filter_map(|c| self.class_table.get(c))
                    .flat_map(|c| c.functions.iter().copied())
                    .find(|&f| self.function(f).name == name && self.function(f).is_dynamic());
                Ok(StubOutcome::Return(found.map_or(self.null(), FunctionId::to_value)))
            }
            StubKind::Deoptimize => {
                self.roots.frames.pop_raw();
                self.deoptimize_at(rbx as u32, crate::code::DeoptReason::CodeDisabled)
                    .map(StubOutcome::Continue)
            }
            StubKind::FixCallersTarget => self.fix_callers_target_stub(),
            StubKind::LazyCompile => self.lazy_compile_stub(),
            StubKind::OptimizeFunction => {
                let fp = self.roots.frames.fp;
                let code = self.roots.frames.code_at(fp);
                if let Some(function) = self.code(code).function {
                    self.optimize_function(function)?;
                }
                Ok(StubOutcome::Return(self.null()))
            }
            StubKind::BreakpointStatic | StubKind::BreakpointDynamic | StubKind::BreakpointClosure => {
                self.breakpoint_stub(kind)
            }
            StubKind::SubtypeTestCache1 | StubKind::SubtypeTestCache2 | StubKind::SubtypeTestCache3 => {
                self.subtype_test_cache_stub(kind, argc, rbx)
            }
            StubKind::EqualityWithNullCheck => self.equality_with_null_check_stub(argc),
            StubKind::IdenticalWithNumberCheck => {
                let a = self.stub_arg(argc, 0);
                let b = self.stub_arg(argc, 1);
                let same = self.identical_with_number_check(a, b);
                Ok(StubOutcome::Return(self.bool_value(same)))
            }
            StubKind::InvokeDart | StubKind::DeoptimizeLazy | StubKind::JumpToExceptionHandler => {
                Err(self.raise_error(ErrorKind::Api, "stub cannot be called"))
            }
        }
    }

    // ── Allocation ─────────────────────────────────────────────────

    fn allocate_object_stub(&mut self, class_id: ClassId, argc: usize) -> RuntimeResult<StubOutcome> {
        let (size, type_arguments_offset) = match self.class_table.get(class_id) {
            Some(class) if class.is_finalized() && class.instance_size > 0 => {
                (class.instance_size, class.type_arguments_field_offset)
            }
            _ => return Err(self.raise_error(ErrorKind::Api, "allocation of an unfinalized class")),
        };
        let inline = if self.runtime.flags().allocate_inline() {
            self.try_allocate_young(class_id, size)
        } else {
            None
        };
        let instance = match inline {
            Some(instance) => instance,
            None => self.allocate_raw(class_id, size, Space::New)?,
        };
        self.fill_slots(instance, Instance::FIELDS_OFFSET, size, self.null());
        if let (Some(offset), 1) = (type_arguments_offset, argc) {
            let type_arguments = self.stub_arg(argc, 0);
            unsafe { instance.as_ref::<Instance>() }.set_field_raw(offset, type_arguments);
        }
        Ok(StubOutcome::Return(instance))
    }

    fn allocate_array_stub(&mut self, argc: usize) -> RuntimeResult<StubOutcome> {
        let length = self.stub_arg(argc, 0);
        if !length.is_smi() || length.to_i64() < 0 {
            return Err(self.throw_message("RangeError: invalid array length"));
        }
        let array = self.new_array(length.to_usize())?;
        let type_arguments = self.stub_arg(argc, 1);
        let slot = &mut unsafe { array.as_mut::<Array>() }.type_arguments as *mut Value;
        self.store_slot(array, slot, type_arguments);
        Ok(StubOutcome::Return(array))
    }

    fn allocate_growable_array_stub(&mut self, capacity: usize, argc: usize) -> RuntimeResult<StubOutcome> {
        let data = self.new_array(capacity.max(1))?;
        let growable = self.with_rooted(&[data], |isolate, mark| {
            let growable =
                isolate.allocate_raw(cid::GROWABLE_OBJECT_ARRAY, size_of::<GrowableObjectArray>(), Space::New)?;
            let g = unsafe { growable.as_mut::<GrowableObjectArray>() };
            g.type_arguments = isolate.null();
            g.length = Value::from_usize(0);
            g.data = isolate.roots.scratch[mark];
            Ok(growable)
        })?;
        if argc == 1 {
            let type_arguments = self.stub_arg(argc, 0);
            unsafe { growable.as_mut::<GrowableObjectArray>() }.type_arguments = type_arguments;
        }
        Ok(StubOutcome::Return(growable))
    }

    // ── Calls ──────────────────────────────────────────────────────

    fn closure_call_stub(&mut self, argc: usize) -> RuntimeResult<StubOutcome> {
        let closure = self.stub_arg(argc, 0);
        if self.class_id_of(closure) != cid::CLOSURE {
            return Err(self.throw_message("NoSuchMethodError: object is not a closure"));
        }
        let function = self.closure_function(closure);
        if !self.function(function).accepts_argument_count(argc) {
            let message = format!("NoSuchMethodError: closure '{}' called with {} arguments", self.function(function).name, argc - 1);
            return Err(self.throw_message(&message));
        }
        let code = self.ensure_code(function)?;
        Ok(StubOutcome::Jump(self.code(code).entry_point()))
    }

    /// Compiles the target of the static call that returns to the top
    /// return address, then redirects the call site to it.
    fn lazy_compile_stub(&mut self) -> RuntimeResult<StubOutcome> {
        let ret = self.stub_return_address();
        let caller = self.roots.frames.code_at(self.roots.frames.fp);
        let offset = self.code(caller).pc_offset(ret);
        let Some(row) = self.code(caller).static_call_at(offset).copied() else {
            return Err(self.raise_error(ErrorKind::Api, "lazy compile reached from a non-static call"));
        };
        let code = self.ensure_code(row.function)?;
        let entry = self.code(code).entry_point();
        self.patch_static_call(caller, ret, row.function, code);
        Ok(StubOutcome::Jump(entry))
    }

    /// Reached through a disabled entry. Redirects the caller's static call
    /// to the function's current code.
    fn fix_callers_target_stub(&mut self) -> RuntimeResult<StubOutcome> {
        let old_entry = self.regs.call_target;
        let old_code = crate::stack_frame::code_id_for_entry(old_entry);
        let Some(function) = self.code(old_code).function else {
            return Err(self.raise_error(ErrorKind::Api, "disabled code without a function"));
        };
        let code = self.ensure_code(function)?;
        let entry = self.code(code).entry_point();
        let ret = self.stub_return_address();
        if ret != 0 {
            let caller = self.roots.frames.code_at(self.roots.frames.fp);
            let offset = self.code(caller).pc_offset(ret);
            if self.code(caller).static_call_at(offset).is_some() {
                self.patch_static_call(caller, ret, function, code);
            }
        }
        log::trace!("fixed caller of '{}' to code {}", self.function(function).name, code.0);
        Ok(StubOutcome::Jump(entry))
    }

    // ── Comparisons ────────────────────────────────────────────────

    /// `==` with `null` handled inline. Anything else dispatches to the
    /// receiver's `==`, falling back to identity.
    fn equality_with_null_check_stub(&mut self, argc: usize) -> RuntimeResult<StubOutcome> {
        let a = self.stub_arg(argc, 0);
        let b = self.stub_arg(argc, 1);
        let null = self.null();
        if a == null || b == null {
            return Ok(StubOutcome::Return(self.bool_value(a == b)));
        }
        match self.resolve_dynamic(self.class_id_of(a), "==", 2) {
            Some(function) => {
                let code = self.ensure_code(function)?;
                self.regs.r10 = 2;
                Ok(StubOutcome::Jump(self.code(code).entry_point()))
            }
            None => {
                let same = self.identical_with_number_check(a, b);
                Ok(StubOutcome::Return(self.bool_value(same)))
            }
        }
    }

    /// Identity, except that boxed numbers compare by value.
    pub(crate) fn identical_with_number_check(&self, a: Value, b: Value) -> bool {
        if a == b {
            return true;
        }
        if a.is_smi() || b.is_smi() {
            return false;
        }
        let (ca, cb) = (self.class_id_of(a), self.class_id_of(b));
        if ca != cb || !class_id::is_number_cid(ca) {
            return false;
        }
        match ca {
            cid::DOUBLE => self.double_value(a).map(f64::to_bits) == self.double_value(b).map(f64::to_bits),
            _ => self.integer_value_i128(a) == self.integer_value_i128(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_bytes() {
        for (i, kind) in StubKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, i);
            assert_eq!(StubKind::from_u8(i as u8), Some(*kind));
        }
        assert_eq!(StubKind::from_u8(StubKind::ALL.len() as u8), None);
    }

    #[test]
    fn inline_cache_selection() {
        assert_eq!(StubKind::inline_cache(1, false), StubKind::OneArgCheckInlineCache);
        assert_eq!(StubKind::inline_cache(2, true), StubKind::TwoArgsOptimizedCheckInlineCache);
        assert_eq!(StubKind::ThreeArgsCheckInlineCache.inline_cache_args(), Some((3, false)));
        assert!(!StubKind::ClosureCall.is_inline_cache());
    }

    #[test]
    fn jumped_to_stubs_are_not_called() {
        assert!(!StubKind::InvokeDart.is_called());
        assert!(!StubKind::DeoptimizeLazy.is_called());
        assert!(StubKind::LazyCompile.is_called());
    }

    #[test]
    fn generated_stubs_decode() {
        let mut heap = Heap::new(heap::HeapSettings::default(), crate::trace_object, crate::size_object).unwrap();
        let stubs = StubCode::generate(&mut heap).unwrap();
        for (kind, entry) in stubs.iter() {
            assert!(heap.code_contains(entry));
            let instructions = unsafe { Instructions::from_entry_point(entry) };
            let payload = instructions.payload();
            assert_eq!(payload[0], crate::assembler::op::STUB);
            assert_eq!(payload[1], kind as u8);
            assert_eq!(stubs.kind_at(entry), Some(kind));
        }
    }
}
