//! Isolates.
//!
//! An isolate owns a heap, a class table, the function, field and code
//! arenas, its handles and a mailbox. Nothing is shared with other
//! isolates except through the runtime's read-only VM heap, so every heap
//! pointer an isolate holds is into its own heap or into the VM heap.
//!
//! Exactly one thread may be inside an isolate at a time. [`IsolateHandle`]
//! is the shareable reference embedders keep; entering it binds the isolate
//! to the calling thread.

use std::cell::{RefCell, UnsafeCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, ThreadId};

use heap::{ApiCallbacks, GcReason, Heap, HeapError, RootProvider, Space, WeakSetVisitor};
use object::{
    Array, Bigint, ClassId, Closure, Context, Double, ExternalTypedData, Header, Instance,
    Instructions, MessageError, Mint, OneByteString, Port, Stacktrace, StringHeader, Tagged, TwoByteString,
    TypedData, UnhandledException, Value, WORD_SIZE, cid, class_id,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::class_table::{Class, ClassState, ClassTable};
use crate::code::{Code, CodeId};
use crate::debugger::Debugger;
use crate::error::{ApiError, ErrorKind, RuntimeResult, Unwind, Unwinder};
use crate::function::{Field, FieldFlags, FieldId, Function, FunctionFlags, FunctionId, FunctionKind};
use crate::handles::ApiState;
use crate::ic::{ICData, MegamorphicCache, SubtypeTestCache};
use crate::interpreter::Registers;
use crate::message::{Mailbox, MessageHandler};
use crate::port::{PortId, PortOwner};
use crate::runtime::Runtime;
use crate::runtime_entries::NativeEntry;
use crate::stack_frame::{FrameState, StackFrame};
use crate::stubs::StubKind;

pub type GcCallback = fn();

/// Set in the interrupt word by [`IsolateHandle::interrupt`].
pub(crate) const INTERRUPT_REQUESTED: u32 = 1;

/// Well-known objects of one isolate. The first four live in the VM heap.
pub(crate) struct ObjectStore {
    pub null: Value,
    pub true_value: Value,
    pub false_value: Value,
    pub empty_array: Value,
    /// Thrown on stack overflow; preallocated so throwing cannot fail.
    pub stack_overflow: Value,
    /// Raised when the heap is exhausted.
    pub out_of_memory: Value,
}

impl ObjectStore {
    fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.stack_overflow);
        visitor(&mut self.out_of_memory);
    }
}

// ── Roots ──────────────────────────────────────────────────────────

/// Everything the collector must see, split from the heap so that the
/// heap can be borrowed mutably next to it.
pub(crate) struct IsolateRoots {
    pub object_store: ObjectStore,
    pub api: ApiState,
    pub unwinder: Unwinder,
    pub statics: Vec<Value>,
    pub codes: Vec<Code>,
    pub ic_data: Vec<ICData>,
    pub megamorphic_caches: Vec<MegamorphicCache>,
    pub subtype_caches: Vec<SubtypeTestCache>,
    pub frames: FrameState,
    /// Temporaries that must survive an allocation.
    pub scratch: Vec<Value>,
    /// Return value slots of active native calls.
    pub native_results: Vec<Value>,
    pub symbols: FxHashMap<String, Value>,
    pub allocation_stubs: Vec<Value>,
    pub gc_prologue_callbacks: Vec<GcCallback>,
    pub gc_epilogue_callbacks: Vec<GcCallback>,
}

impl RootProvider for IsolateRoots {
    fn visit_roots(&mut self, include_prologue_weak: bool, visitor: &mut dyn FnMut(&mut Value)) {
        self.object_store.visit(visitor);
        self.unwinder.visit(visitor);
        self.api.visit_strong(include_prologue_weak, visitor);
        self.frames.visit_roots(&self.codes, visitor);
        for code in &mut self.codes {
            code.visit_pointers(visitor);
        }
        for ic in &mut self.ic_data {
            ic.visit(visitor);
        }
        for cache in &mut self.megamorphic_caches {
            cache.visit(visitor);
        }
        for cache in &mut self.subtype_caches {
            cache.visit(visitor);
        }
        for value in self
            .statics
            .iter_mut()
            .chain(self.scratch.iter_mut())
            .chain(self.native_results.iter_mut())
            .chain(self.symbols.values_mut())
            .chain(self.allocation_stubs.iter_mut())
        {
            visitor(value);
        }
    }

    fn visit_weak_roots(&mut self, include_prologue_weak: bool, visitor: &mut dyn FnMut(&mut Value) -> bool) {
        self.api.visit_weak(include_prologue_weak, visitor);
    }

    fn visit_weak_reference_sets(&mut self, visitor: &mut dyn WeakSetVisitor) -> bool {
        self.api.visit_weak_reference_sets(visitor)
    }

    fn gc_prologue(&mut self) {
        for callback in &self.gc_prologue_callbacks {
            callback();
        }
    }

    fn gc_epilogue(&mut self) {
        for callback in &self.gc_epilogue_callbacks {
            callback();
        }
    }

    fn gc_finished(&mut self) {
        self.api.clear_weak_reference_sets();
        self.api.run_pending_finalizers();
    }
}

// ── Isolate ────────────────────────────────────────────────────────

pub struct Isolate {
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) heap: Heap,
    pub(crate) roots: IsolateRoots,
    pub(crate) class_table: ClassTable,
    pub(crate) functions: Vec<Function>,
    pub(crate) fields: Vec<Field>,
    pub(crate) natives: Vec<NativeEntry>,
    pub(crate) regs: Registers,
    pub(crate) debugger: Debugger,
    pub(crate) interrupt: Arc<AtomicU32>,
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) message_handler: Option<MessageHandler>,
    name: String,
    main_port: PortId,
    embedder_data: usize,
    runnable: bool,
}

impl Isolate {
    pub(crate) fn new(runtime: Arc<Runtime>, name: &str, embedder_data: usize) -> Result<Isolate, ApiError> {
        let vm = runtime.vm_objects();
        let null = vm.null;
        let mut heap = Heap::new(runtime.flags().heap_settings(), crate::trace_object, crate::size_object)
            .map_err(ApiError::Heap)?;
        heap.set_null_value(null);

        let mailbox = Arc::new(Mailbox::new());
        let main_port = runtime.port_map().create_port(PortOwner::Isolate(Arc::clone(&mailbox)));
        let lazy_deopt_entry = runtime.stub_code().entry(StubKind::DeoptimizeLazy);

        let roots = IsolateRoots {
            object_store: ObjectStore {
                null,
                true_value: vm.true_value,
                false_value: vm.false_value,
                empty_array: vm.empty_array,
                stack_overflow: null,
                out_of_memory: null,
            },
            api: ApiState::new(null),
            unwinder: Unwinder::new(null),
            statics: Vec::new(),
            codes: Vec::new(),
            ic_data: Vec::new(),
            megamorphic_caches: Vec::new(),
            subtype_caches: Vec::new(),
            frames: FrameState::new(null, lazy_deopt_entry),
            scratch: Vec::new(),
            native_results: Vec::new(),
            symbols: FxHashMap::default(),
            allocation_stubs: Vec::new(),
            gc_prologue_callbacks: Vec::new(),
            gc_epilogue_callbacks: Vec::new(),
        };

        let mut isolate = Isolate {
            runtime,
            heap,
            roots,
            class_table: ClassTable::new(),
            functions: Vec::new(),
            fields: Vec::new(),
            natives: Vec::new(),
            regs: Registers::default(),
            debugger: Debugger::default(),
            interrupt: Arc::new(AtomicU32::new(0)),
            mailbox,
            message_handler: None,
            name: name.to_owned(),
            main_port,
            embedder_data,
            runnable: false,
        };
        isolate.preallocate_errors().map_err(|_| {
            ApiError::Heap(HeapError::OutOfMemory {
                space: Space::Old,
                requested: 0,
            })
        })?;
        log::debug!("isolate '{}' created, main port {}", isolate.name, main_port);
        Ok(isolate)
    }

    fn preallocate_errors(&mut self) -> RuntimeResult<()> {
        let message = self.new_string_in("Stack Overflow", Space::Old)?;
        self.roots.object_store.stack_overflow = message;
        let message = self.new_string_in("Out of Memory", Space::Old)?;
        let null = self.null();
        let error = self.with_rooted(&[message], |isolate, mark| {
            let error = isolate.allocate_raw(cid::UNHANDLED_EXCEPTION, UnhandledException::SIZE, Space::Old)?;
            let message = isolate.roots.scratch[mark];
            let ue = unsafe { error.as_mut::<UnhandledException>() };
            ue.exception = message;
            ue.stacktrace = null;
            Ok(error)
        })?;
        self.roots.object_store.out_of_memory = error;
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn main_port(&self) -> PortId {
        self.main_port
    }

    pub fn embedder_data(&self) -> usize {
        self.embedder_data
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn make_runnable(&mut self) {
        self.runnable = true;
    }

    pub fn is_runnable(&self) -> bool {
        self.runnable
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn class_table(&self) -> &ClassTable {
        &self.class_table
    }

    #[inline]
    pub fn null(&self) -> Value {
        self.roots.object_store.null
    }

    #[inline]
    pub fn bool_value(&self, b: bool) -> Value {
        if b {
            self.roots.object_store.true_value
        } else {
            self.roots.object_store.false_value
        }
    }

    pub fn is_true(&self, value: Value) -> bool {
        value == self.roots.object_store.true_value
    }

    #[inline]
    pub fn class_id_of(&self, value: Value) -> ClassId {
        unsafe { Tagged::<()>::from(value).class_id() }
    }

    // ── Rooting ────────────────────────────────────────────────────

    /// Runs `f` with `values` rooted at `scratch[mark..]`. Values must be
    /// re-read from the scratch area after any allocation.
    pub(crate) fn with_rooted<R>(
        &mut self,
        values: &[Value],
        f: impl FnOnce(&mut Isolate, usize) -> RuntimeResult<R>,
    ) -> RuntimeResult<R> {
        let mark = self.roots.scratch.len();
        self.roots.scratch.extend_from_slice(values);
        let result = f(self, mark);
        self.roots.scratch.truncate(mark);
        result
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Allocates `size` bytes with an initialized header. The body is
    /// uninitialized; callers fill it before the next allocation.
    pub(crate) fn allocate_raw(&mut self, class_id: ClassId, size: usize, space: Space) -> RuntimeResult<Value> {
        match self.heap.allocate(size, space, &mut self.roots) {
            Ok(ptr) => {
                let addr = ptr.as_ptr() as usize;
                unsafe { Header::initialize(addr, class_id, size) };
                Ok(Value::from_addr(addr))
            }
            Err(err) => Err(self.raise_out_of_memory(err)),
        }
    }

    /// Bump allocation without a collection, for the stubs' fast paths.
    pub(crate) fn try_allocate_young(&mut self, class_id: ClassId, size: usize) -> Option<Value> {
        let ptr = self.heap.try_allocate(size, Space::New)?;
        let addr = ptr.as_ptr() as usize;
        unsafe { Header::initialize(addr, class_id, size) };
        Some(Value::from_addr(addr))
    }

    pub(crate) fn fill_slots(&self, object: Value, from: usize, to: usize, value: Value) {
        let mut offset = from;
        while offset < to {
            unsafe { *((object.addr() + offset) as *mut Value) = value };
            offset += WORD_SIZE;
        }
    }

    /// Store with the generational write barrier.
    #[inline]
    pub(crate) fn store_slot(&mut self, owner: Value, slot: *mut Value, value: Value) {
        unsafe { self.heap.store(owner, slot, value) };
    }

    pub fn new_array(&mut self, length: usize) -> RuntimeResult<Value> {
        self.new_array_in(length, Space::New)
    }

    pub fn new_array_in(&mut self, length: usize, space: Space) -> RuntimeResult<Value> {
        let size = Array::allocation_size(length);
        let array = self.allocate_raw(cid::ARRAY, size, space)?;
        let null = self.null();
        let a = unsafe { array.as_mut::<Array>() };
        a.type_arguments = null;
        a.length = Value::from_usize(length);
        self.fill_slots(array, Array::DATA_OFFSET, Array::DATA_OFFSET + length * WORD_SIZE, null);
        Ok(array)
    }

    pub fn array_at(&self, array: Value, index: usize) -> Value {
        let array = Tagged::<Array>::from(array);
        unsafe { array.as_ref() }.at(index)
    }

    pub fn array_len(&self, array: Value) -> usize {
        let array = Tagged::<Array>::from(array);
        unsafe { array.as_ref() }.len()
    }

    pub fn array_set(&mut self, array: Value, index: usize, value: Value) {
        let tagged = Tagged::<Array>::from(array);
        let slot = unsafe { tagged.as_ref() }.slot_addr(index);
        self.store_slot(array, slot, value);
    }

    /// A fresh instance of `class_id` with every field null.
    pub fn new_instance(&mut self, class_id: ClassId) -> RuntimeResult<Value> {
        let size = match self.class_table.get(class_id) {
            Some(class) if class.is_finalized() && class.instance_size > 0 => class.instance_size,
            _ => return Err(self.raise_error(ErrorKind::Api, "class is not finalized")),
        };
        let instance = self.allocate_raw(class_id, size, Space::New)?;
        self.fill_slots(instance, Instance::FIELDS_OFFSET, size, self.null());
        Ok(instance)
    }

    pub fn instance_field(&self, instance: Value, offset: usize) -> Value {
        unsafe { instance.as_ref::<Instance>() }.field(offset)
    }

    pub fn set_instance_field(&mut self, instance: Value, offset: usize, value: Value) {
        let slot = unsafe { instance.as_ref::<Instance>() }.field_addr(offset);
        self.store_slot(instance, slot, value);
    }

    pub fn new_double(&mut self, value: f64) -> RuntimeResult<Value> {
        let v = self.allocate_raw(cid::DOUBLE, size_of::<Double>(), Space::New)?;
        unsafe { v.as_mut::<Double>() }.value = value;
        Ok(v)
    }

    pub fn new_mint(&mut self, value: i64) -> RuntimeResult<Value> {
        let v = self.allocate_raw(cid::MINT, size_of::<Mint>(), Space::New)?;
        unsafe { v.as_mut::<Mint>() }.value = value;
        Ok(v)
    }

    /// Smi when it fits, a mint otherwise.
    pub fn new_integer(&mut self, value: i64) -> RuntimeResult<Value> {
        match Value::try_from_i64(value) {
            Some(smi) => Ok(smi),
            None => self.new_mint(value),
        }
    }

    pub fn new_integer_i128(&mut self, value: i128) -> RuntimeResult<Value> {
        if let Ok(small) = i64::try_from(value) {
            return self.new_integer(small);
        }
        let digits = crate::bigint::digits_of(value.unsigned_abs());
        self.new_bigint(value < 0, &digits)
    }

    /// A bigint from little-endian 32-bit digits, normalized.
    pub fn new_bigint(&mut self, negative: bool, digits: &[u32]) -> RuntimeResult<Value> {
        let used = digits.iter().rposition(|&d| d != 0).map_or(0, |i| i + 1);
        let digits = &digits[..used];
        if let Some(small) = crate::bigint::to_i64(negative, digits) {
            return self.new_integer(small);
        }
        let v = self.allocate_raw(cid::BIGINT, Bigint::allocation_size(used), Space::New)?;
        let b = unsafe { v.as_mut::<Bigint>() };
        b.used = Value::from_usize(used);
        b.negative = Value::from_i64(negative as i64);
        b.digits_mut().copy_from_slice(digits);
        Ok(v)
    }

    /// Integer value of a smi or mint.
    pub fn integer_value(&self, value: Value) -> Option<i64> {
        if value.is_smi() {
            return Some(value.to_i64());
        }
        match self.class_id_of(value) {
            cid::MINT => Some(unsafe { value.as_ref::<Mint>() }.value),
            _ => None,
        }
    }

    /// Integer value of any integer kind that fits in 128 bits.
    pub fn integer_value_i128(&self, value: Value) -> Option<i128> {
        if let Some(small) = self.integer_value(value) {
            return Some(small as i128);
        }
        if self.class_id_of(value) != cid::BIGINT {
            return None;
        }
        let b = unsafe { value.as_ref::<Bigint>() };
        crate::bigint::to_i128(b.is_negative(), b.digits())
    }

    pub fn double_value(&self, value: Value) -> Option<f64> {
        (self.class_id_of(value) == cid::DOUBLE).then(|| unsafe { value.as_ref::<Double>() }.value)
    }

    // ── Strings ────────────────────────────────────────────────────

    pub fn new_string(&mut self, s: &str) -> RuntimeResult<Value> {
        self.new_string_in(s, Space::New)
    }

    pub(crate) fn new_string_in(&mut self, s: &str, space: Space) -> RuntimeResult<Value> {
        if s.chars().all(|c| (c as u32) <= 0xFF) {
            let latin1: Vec<u8> = s.chars().map(|c| c as u8).collect();
            self.new_one_byte_string(&latin1, space)
        } else {
            let units: Vec<u16> = s.encode_utf16().collect();
            self.new_two_byte_string(&units, space)
        }
    }

    pub fn new_one_byte_string(&mut self, latin1: &[u8], space: Space) -> RuntimeResult<Value> {
        let v = self.allocate_raw(cid::ONE_BYTE_STRING, OneByteString::allocation_size(latin1.len()), space)?;
        let s = unsafe { v.as_mut::<OneByteString>() };
        s.base.length = Value::from_usize(latin1.len());
        s.base.hash = Value::from_i64(0);
        s.bytes_mut().copy_from_slice(latin1);
        Ok(v)
    }

    pub fn new_two_byte_string(&mut self, units: &[u16], space: Space) -> RuntimeResult<Value> {
        let v = self.allocate_raw(cid::TWO_BYTE_STRING, TwoByteString::allocation_size(units.len()), space)?;
        let s = unsafe { v.as_mut::<TwoByteString>() };
        s.base.length = Value::from_usize(units.len());
        s.base.hash = Value::from_i64(0);
        s.units_mut().copy_from_slice(units);
        Ok(v)
    }

    /// Reads any string kind back as UTF-8. Unpaired surrogates become
    /// U+FFFD.
    pub fn string_value(&self, value: Value) -> Option<String> {
        match self.class_id_of(value) {
            cid::ONE_BYTE_STRING => {
                let s = unsafe { value.as_ref::<OneByteString>() };
                Some(s.bytes().iter().map(|&b| b as char).collect())
            }
            cid::TWO_BYTE_STRING => {
                let s = unsafe { value.as_ref::<TwoByteString>() };
                Some(String::from_utf16_lossy(s.units()))
            }
            cid::EXTERNAL_ONE_BYTE_STRING | cid::EXTERNAL_TWO_BYTE_STRING => {
                let s = unsafe { value.as_ref::<object::ExternalString>() };
                let len = s.base.len();
                if self.class_id_of(value) == cid::EXTERNAL_ONE_BYTE_STRING {
                    let bytes = unsafe { std::slice::from_raw_parts(s.data, len) };
                    Some(bytes.iter().map(|&b| b as char).collect())
                } else {
                    let units = unsafe { std::slice::from_raw_parts(s.data as *const u16, len) };
                    Some(String::from_utf16_lossy(units))
                }
            }
            _ => None,
        }
    }

    pub fn string_len(&self, value: Value) -> usize {
        unsafe { value.as_ref::<StringHeader>() }.len()
    }

    /// The canonical string for `name`, in old space.
    pub fn symbol(&mut self, name: &str) -> RuntimeResult<Value> {
        if let Some(&symbol) = self.roots.symbols.get(name) {
            return Ok(symbol);
        }
        let symbol = self.new_string_in(name, Space::Old)?;
        unsafe { symbol.header() }.set_canonical();
        self.roots.symbols.insert(name.to_owned(), symbol);
        Ok(symbol)
    }

    // ── Other built-in kinds ───────────────────────────────────────

    pub fn new_context(&mut self, num_variables: usize, parent: Value) -> RuntimeResult<Value> {
        self.with_rooted(&[parent], |isolate, mark| {
            let size = Context::allocation_size(num_variables);
            let context = isolate.allocate_raw(cid::CONTEXT, size, Space::New)?;
            let null = isolate.null();
            let c = unsafe { context.as_mut::<Context>() };
            c.num_variables = Value::from_usize(num_variables);
            c.parent = null;
            isolate.fill_slots(context, Context::VARIABLES_OFFSET, size, null);
            let parent = isolate.roots.scratch[mark];
            let slot = &mut unsafe { context.as_mut::<Context>() }.parent as *mut Value;
            isolate.store_slot(context, slot, parent);
            Ok(context)
        })
    }

    pub fn new_closure(&mut self, function: FunctionId, context: Value) -> RuntimeResult<Value> {
        self.with_rooted(&[context], |isolate, mark| {
            let closure = isolate.allocate_raw(cid::CLOSURE, size_of::<Closure>(), Space::New)?;
            let context = isolate.roots.scratch[mark];
            let c = unsafe { closure.as_mut::<Closure>() };
            c.type_arguments = isolate.roots.object_store.null;
            c.function = function.to_value();
            c.context = context;
            Ok(closure)
        })
    }

    pub fn closure_function(&self, closure: Value) -> FunctionId {
        FunctionId::from_value(unsafe { closure.as_ref::<Closure>() }.function)
    }

    pub fn new_typed_data(&mut self, class_id: ClassId, length: usize) -> RuntimeResult<Value> {
        if !class_id::is_internal_typed_data_cid(class_id) {
            return Err(self.raise_error(ErrorKind::Api, "not a typed data class"));
        }
        let size = TypedData::allocation_size(class_id, length);
        let data = self.allocate_raw(class_id, size, Space::New)?;
        let t = unsafe { data.as_mut::<TypedData>() };
        t.length = Value::from_usize(length);
        unsafe { std::ptr::write_bytes(t.data_ptr(), 0, size - TypedData::DATA_OFFSET) };
        Ok(data)
    }

    /// External typed data over `data`. The memory stays owned by the
    /// caller.
    pub fn new_external_typed_data(
        &mut self,
        class_id: ClassId,
        data: *mut u8,
        length: usize,
        peer: usize,
    ) -> RuntimeResult<Value> {
        if !class_id::is_external_typed_data_cid(class_id) {
            return Err(self.raise_error(ErrorKind::Api, "not an external typed data class"));
        }
        let size = object::round_up_to_alignment(size_of::<ExternalTypedData>());
        let v = self.allocate_raw(class_id, size, Space::New)?;
        let t = unsafe { v.as_mut::<ExternalTypedData>() };
        t.length = Value::from_usize(length);
        t.data = data;
        t.peer = peer;
        Ok(v)
    }

    pub fn new_port_object(&mut self, class_id: ClassId, id: PortId) -> RuntimeResult<Value> {
        let v = self.allocate_raw(class_id, size_of::<Port>(), Space::New)?;
        unsafe { v.as_mut::<Port>() }.id = id;
        Ok(v)
    }

    pub fn new_stacktrace(&mut self, functions: Value, pc_offsets: Value) -> RuntimeResult<Value> {
        self.with_rooted(&[functions, pc_offsets], |isolate, mark| {
            let v = isolate.allocate_raw(cid::STACKTRACE, Stacktrace::SIZE, Space::New)?;
            let st = unsafe { v.as_mut::<Stacktrace>() };
            st.functions = isolate.roots.scratch[mark];
            st.pc_offsets = isolate.roots.scratch[mark + 1];
            Ok(v)
        })
    }

    pub fn new_unhandled_exception(&mut self, exception: Value, stacktrace: Value) -> RuntimeResult<Value> {
        self.with_rooted(&[exception, stacktrace], |isolate, mark| {
            let v = isolate.allocate_raw(cid::UNHANDLED_EXCEPTION, UnhandledException::SIZE, Space::New)?;
            let ue = unsafe { v.as_mut::<UnhandledException>() };
            ue.exception = isolate.roots.scratch[mark];
            ue.stacktrace = isolate.roots.scratch[mark + 1];
            Ok(v)
        })
    }

    /// An Api, Compilation or Unwind error carrying `message`.
    pub fn new_error(&mut self, kind: ErrorKind, message: &str) -> RuntimeResult<Value> {
        debug_assert!(kind != ErrorKind::UnhandledException);
        let message = self.new_string(message)?;
        self.with_rooted(&[message], |isolate, mark| {
            let size = object::round_up_to_alignment(size_of::<MessageError>());
            let v = isolate.allocate_raw(kind.class_id(), size, Space::New)?;
            unsafe { v.as_mut::<MessageError>() }.message = isolate.roots.scratch[mark];
            Ok(v)
        })
    }

    // ── Errors ─────────────────────────────────────────────────────

    /// Creates an error object of `kind` and parks it in the unwinder.
    pub(crate) fn raise_error(&mut self, kind: ErrorKind, message: &str) -> Unwind {
        match self.new_error(kind, message) {
            Ok(error) => self.roots.unwinder.raise(error),
            Err(unwind) => unwind,
        }
    }

    pub(crate) fn raise_api_error(&mut self, err: ApiError) -> Unwind {
        self.raise_error(ErrorKind::Api, &err.to_string())
    }

    pub(crate) fn raise_out_of_memory(&mut self, err: HeapError) -> Unwind {
        log::error!("isolate '{}': {}", self.name, err);
        let error = self.roots.object_store.out_of_memory;
        self.roots.unwinder.raise(error)
    }

    /// Throws `exception` from the current position: wraps it with a
    /// stack trace of the active frames.
    pub(crate) fn throw_exception(&mut self, exception: Value) -> Unwind {
        let result = self.with_rooted(&[exception], |isolate, mark| {
            let stacktrace = isolate.build_stacktrace()?;
            let exception = isolate.roots.scratch[mark];
            isolate.new_unhandled_exception(exception, stacktrace)
        });
        match result {
            Ok(error) => self.roots.unwinder.raise(error),
            Err(unwind) => unwind,
        }
    }

    pub(crate) fn rethrow_exception(&mut self, exception: Value, stacktrace: Value) -> Unwind {
        match self.new_unhandled_exception(exception, stacktrace) {
            Ok(error) => self.roots.unwinder.raise(error),
            Err(unwind) => unwind,
        }
    }

    /// Throws a string message as the exception.
    pub(crate) fn throw_message(&mut self, message: &str) -> Unwind {
        match self.new_string(message) {
            Ok(exception) => self.throw_exception(exception),
            Err(unwind) => unwind,
        }
    }

    /// Function ids and pc offsets of every active frame, innermost first.
    pub(crate) fn build_stacktrace(&mut self) -> RuntimeResult<Value> {
        let mut rows = Vec::new();
        for frame in self.roots.frames.walker() {
            if let StackFrame::Dart { pc, code, .. } = frame {
                let code = &self.roots.codes[code.0 as usize];
                let function = code.function.map_or(Value::from_i64(-1), FunctionId::to_value);
                rows.push((function, Value::from_usize(code.pc_offset(pc) as usize)));
            }
        }
        let functions = self.new_array(rows.len())?;
        self.with_rooted(&[functions], |isolate, mark| {
            let pcs = isolate.new_array(rows.len())?;
            let functions = isolate.roots.scratch[mark];
            for (i, (function, pc)) in rows.iter().enumerate() {
                unsafe { functions.as_ref::<Array>() }.set_at_raw(i, *function);
                unsafe { pcs.as_ref::<Array>() }.set_at_raw(i, *pc);
            }
            isolate.new_stacktrace(functions, pcs)
        })
    }

    /// Readable rendering of a stack trace object.
    pub fn stacktrace_to_string(&self, stacktrace: Value) -> String {
        if self.class_id_of(stacktrace) != cid::STACKTRACE {
            return String::new();
        }
        let st = unsafe { stacktrace.as_ref::<Stacktrace>() };
        let functions = unsafe { st.functions.as_ref::<Array>() };
        let pcs = unsafe { st.pc_offsets.as_ref::<Array>() };
        let mut out = String::new();
        for i in 0..functions.len() {
            let id = functions.at(i).to_i64();
            let name = usize::try_from(id)
                .ok()
                .and_then(|id| self.functions.get(id))
                .map_or("<stub>", |f| f.name.as_str());
            out.push_str(&format!("#{i}  {name} (pc offset {})\n", pcs.at(i).to_i64()));
        }
        out
    }

    // ── Classes, fields, functions ─────────────────────────────────

    /// Registers a class. Field layout continues after the superclass's.
    pub fn register_class(&mut self, mut class: Class) -> ClassId {
        if let Some(parent) = class.super_class.and_then(|s| self.class_table.get(s)) {
            class.next_field_offset = parent.next_field_offset;
            class.type_arguments_field_offset = parent.type_arguments_field_offset;
            if parent.num_native_fields > 0 {
                class.num_native_fields = parent.num_native_fields;
                class.native_fields_offset = parent.native_fields_offset;
            }
        }
        if class.num_native_fields > 0 && class.native_fields_offset == 0 {
            class.native_fields_offset = class.next_field_offset;
            class.next_field_offset += class.num_native_fields * WORD_SIZE;
        }
        if class.num_type_parameters > 0 && class.type_arguments_field_offset.is_none() {
            class.type_arguments_field_offset = Some(class.next_field_offset);
            class.next_field_offset += WORD_SIZE;
        }
        let id = self.class_table.register(class);
        if self.runtime.flags().print_bootstrap {
            log::info!("registered class {} as {}", self.class_table.at(id).name, id);
        }
        id
    }

    /// Adds a field. Instance fields get the next slot and an implicit
    /// getter and setter; static fields get a slot in the static table.
    pub fn add_field(&mut self, owner: ClassId, name: &str, flags: FieldFlags) -> Result<FieldId, ApiError> {
        let class = self.class_table.get_mut(owner).ok_or(ApiError::NotFound(format!("class {owner}")))?;
        if class.is_finalized() && !flags.contains(FieldFlags::STATIC) {
            return Err(ApiError::InvalidArgument("class is already finalized"));
        }
        let id = FieldId(self.fields.len() as u32);
        let mut field = Field::new(name, owner, flags);
        field.id = id;
        if field.is_static() {
            field.static_index = self.roots.statics.len();
            self.roots.statics.push(self.roots.object_store.null);
        } else {
            field.offset = class.next_field_offset;
            class.next_field_offset += WORD_SIZE;
        }
        class.fields.push(id);
        let is_static = field.is_static();
        let is_final = field.is_final();
        self.fields.push(field);

        if !is_static {
            let mut getter = Function::new(crate::function::getter_name(name), owner, FunctionKind::ImplicitGetter, 1);
            getter.field = Some(id);
            self.add_function(getter)?;
            if !is_final {
                let mut setter =
                    Function::new(crate::function::setter_name(name), owner, FunctionKind::ImplicitSetter, 2);
                setter.field = Some(id);
                self.add_function(setter)?;
            }
        }
        Ok(id)
    }

    pub fn add_function(&mut self, mut function: Function) -> Result<FunctionId, ApiError> {
        let id = FunctionId(self.functions.len() as u32);
        function.id = id;
        let class = self
            .class_table
            .get_mut(function.owner)
            .ok_or(ApiError::NotFound(format!("class {}", function.owner)))?;
        class.functions.push(id);
        self.functions.push(function);
        Ok(id)
    }

    pub fn finalize_class(&mut self, class_id: ClassId) -> Result<(), ApiError> {
        let class = self.class_table.get_mut(class_id).ok_or(ApiError::NotFound(format!("class {class_id}")))?;
        if class.is_finalized() {
            return Ok(());
        }
        class.state = ClassState::BeingFinalized;
        class.set_instance_size_from_fields();
        class.state = ClassState::Finalized;
        Ok(())
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.0 as usize]
    }

    pub fn field_mut(&mut self, id: FieldId) -> &mut Field {
        &mut self.fields[id.0 as usize]
    }

    pub fn lookup_function(&self, class_id: ClassId, name: &str) -> Option<FunctionId> {
        let class = self.class_table.get(class_id)?;
        class.functions.iter().copied().find(|&f| self.function(f).name == name)
    }

    pub fn lookup_field(&self, class_id: ClassId, name: &str) -> Option<FieldId> {
        self.class_table
            .superclass_chain(class_id)
            .filter_map(|c| self.class_table.get(c))
            .flat_map(|c| c.fields.iter().copied())
            .find(|&f| self.field(f).name == name)
    }

    /// Dynamic lookup along the superclass chain.
    pub fn resolve_dynamic(&self, class_id: ClassId, name: &str, argc: usize) -> Option<FunctionId> {
        self.class_table
            .superclass_chain(class_id)
            .filter_map(|c| self.class_table.get(c))
            .flat_map(|c| c.functions.iter().copied())
            .find(|&f| {
                let function = self.function(f);
                function.name == name && function.is_dynamic() && function.accepts_argument_count(argc)
            })
    }

    pub fn static_value(&self, field: FieldId) -> Value {
        self.roots.statics[self.field(field).static_index]
    }

    pub fn set_static_value(&mut self, field: FieldId, value: Value) {
        let index = self.field(field).static_index;
        self.roots.statics[index] = value;
    }

    // ── Code ───────────────────────────────────────────────────────

    pub fn code(&self, id: CodeId) -> &Code {
        &self.roots.codes[id.0 as usize]
    }

    pub(crate) fn code_mut(&mut self, id: CodeId) -> &mut Code {
        &mut self.roots.codes[id.0 as usize]
    }

    pub fn num_codes(&self) -> usize {
        self.roots.codes.len()
    }

    pub(crate) fn register_code(&mut self, mut code: Code) -> CodeId {
        let id = CodeId(self.roots.codes.len() as u32);
        code.id = id;
        unsafe { code.instructions.as_mut::<Instructions>() }.code_id = id.to_value();
        log::trace!("code {} '{}' at {:#x}, {} bytes", id.0, code.name, code.entry_point(), code.size());
        crate::runtime::record_perf_symbol(&self.runtime, code.entry_point(), code.size(), &code.name);
        self.roots.codes.push(code);
        id
    }

    /// Copies `bytes` into a fresh `Instructions` object in code space.
    pub(crate) fn allocate_instructions(&mut self, bytes: &[u8]) -> RuntimeResult<Value> {
        let size = Instructions::allocation_size(bytes.len());
        let v = self.allocate_raw(cid::INSTRUCTIONS, size, Space::Code)?;
        let instructions = unsafe { v.as_mut::<Instructions>() };
        instructions.size = Value::from_usize(bytes.len());
        instructions.code_id = Value::from_i64(-1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), instructions.entry_point() as *mut u8, bytes.len());
        }
        Ok(v)
    }

    pub(crate) fn stub_entry(&self, kind: StubKind) -> usize {
        self.runtime.stub_code().entry(kind)
    }

    /// Where a static call to `function` should go right now.
    pub(crate) fn static_call_target(&self, function: FunctionId) -> usize {
        match self.function(function).code {
            Some(code) => self.code(code).entry_point(),
            None => self.stub_entry(StubKind::LazyCompile),
        }
    }

    /// The per-class allocation stub, generated on first use.
    pub(crate) fn allocation_stub_entry(&mut self, class_id: ClassId) -> RuntimeResult<usize> {
        let Some(class) = self.class_table.get(class_id) else {
            return Err(self.raise_error(ErrorKind::Api, "allocation stub for an unknown class"));
        };
        if let Some(entry) = class.allocation_stub {
            return Ok(entry);
        }
        let bytes = crate::assembler::stub_bytes(StubKind::AllocateObject, class_id as u32);
        let stub = self.allocate_instructions(&bytes)?;
        let entry = unsafe { stub.as_ref::<Instructions>() }.entry_point();
        self.roots.allocation_stubs.push(stub);
        self.class_table.at_mut(class_id).allocation_stub = Some(entry);
        let name = format!("[Stub] Allocate {}", self.class_table.at(class_id).name);
        crate::runtime::record_perf_symbol(&self.runtime, entry, bytes.len(), &name);
        Ok(entry)
    }

    // ── GC ─────────────────────────────────────────────────────────

    pub fn collect_garbage(&mut self, space: Space) {
        self.heap.collect_garbage(space, &mut self.roots);
    }

    /// Scavenge plus mark-sweep, with prologue/epilogue callbacks.
    pub fn collect_all_garbage(&mut self) {
        self.heap.collect_all_garbage(&mut self.roots);
    }

    pub(crate) fn collect_garbage_for_test(&mut self, space: Space) {
        self.heap.collect_garbage_with(space, GcReason::TestCase, ApiCallbacks::Ignore, &mut self.roots);
    }

    pub fn add_gc_prologue_callback(&mut self, callback: GcCallback) {
        self.roots.gc_prologue_callbacks.push(callback);
    }

    pub fn remove_gc_prologue_callback(&mut self, callback: GcCallback) -> bool {
        remove_callback(&mut self.roots.gc_prologue_callbacks, callback)
    }

    pub fn add_gc_epilogue_callback(&mut self, callback: GcCallback) {
        self.roots.gc_epilogue_callbacks.push(callback);
    }

    pub fn remove_gc_epilogue_callback(&mut self, callback: GcCallback) -> bool {
        remove_callback(&mut self.roots.gc_epilogue_callbacks, callback)
    }

    // ── Interrupts ─────────────────────────────────────────────────

    /// Polled at safepoints. A callback returning false unwinds the
    /// isolate.
    pub(crate) fn check_interrupts(&mut self) -> RuntimeResult<()> {
        if self.interrupt.swap(0, Ordering::AcqRel) & INTERRUPT_REQUESTED == 0 {
            return Ok(());
        }
        log::debug!("isolate '{}' interrupted", self.name);
        let Some(callback) = self.runtime.callbacks().isolate_interrupt else {
            return Ok(());
        };
        if callback(self) {
            Ok(())
        } else {
            Err(self.raise_error(ErrorKind::Unwind, "isolate interrupted"))
        }
    }

    // ── Shutdown ───────────────────────────────────────────────────

    pub(crate) fn shutdown(&mut self) {
        log::debug!("isolate '{}' shutting down", self.name);
        if let Some(callback) = self.runtime.callbacks().isolate_shutdown {
            callback(self.embedder_data);
        }
        let dropped = self.mailbox.clear();
        if dropped > 0 {
            log::debug!("dropped {} pending messages", dropped);
        }
        self.runtime.port_map().close_ports_of(&self.mailbox);
        self.roots.api.finalize_all_weak();
    }
}

fn remove_callback(list: &mut Vec<GcCallback>, callback: GcCallback) -> bool {
    match list.iter().position(|&c| std::ptr::fn_addr_eq(c, callback)) {
        Some(index) => {
            list.remove(index);
            true
        }
        None => false,
    }
}

// ── Isolate handles ────────────────────────────────────────────────

struct IsolateShared {
    isolate: UnsafeCell<Option<Isolate>>,
    owner: Mutex<Option<ThreadId>>,
    borrowed: AtomicBool,
    interrupt: Arc<AtomicU32>,
    name: String,
    main_port: PortId,
}

// SAFETY: the isolate is only reached through `IsolateHandle::with`, which
// checks that the calling thread has entered it and that no other borrow
// is active.
unsafe impl Send for IsolateShared {}
unsafe impl Sync for IsolateShared {}

thread_local! {
    static CURRENT: RefCell<Option<IsolateHandle>> = const { RefCell::new(None) };
}

/// Shareable reference to an isolate.
#[derive(Clone)]
pub struct IsolateHandle(Arc<IsolateShared>);

impl std::fmt::Debug for IsolateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateHandle").field("name", &self.0.name).finish()
    }
}

impl PartialEq for IsolateHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

struct BorrowGuard<'a>(&'a AtomicBool);

impl Drop for BorrowGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl IsolateHandle {
    pub(crate) fn new(isolate: Isolate) -> Self {
        IsolateHandle(Arc::new(IsolateShared {
            interrupt: Arc::clone(&isolate.interrupt),
            name: isolate.name.clone(),
            main_port: isolate.main_port,
            isolate: UnsafeCell::new(Some(isolate)),
            owner: Mutex::new(None),
            borrowed: AtomicBool::new(false),
        }))
    }

    pub fn debug_name(&self) -> &str {
        &self.0.name
    }

    pub fn main_port(&self) -> PortId {
        self.0.main_port
    }

    /// Binds the isolate to the calling thread.
    pub fn enter(&self) -> Result<(), ApiError> {
        if CURRENT.with(|c| c.borrow().is_some()) {
            return Err(ApiError::IsolateAlreadyEntered);
        }
        let me = thread::current().id();
        {
            let mut owner = self.0.owner.lock();
            match *owner {
                Some(other) if other != me => return Err(ApiError::IsolateOwnedByOtherThread),
                Some(_) => return Err(ApiError::IsolateAlreadyEntered),
                None => *owner = Some(me),
            }
        }
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        Ok(())
    }

    pub fn exit(&self) -> Result<(), ApiError> {
        let is_current = CURRENT.with(|c| c.borrow().as_ref() == Some(self));
        if !is_current {
            return Err(ApiError::NoCurrentIsolate);
        }
        *self.0.owner.lock() = None;
        CURRENT.with(|c| *c.borrow_mut() = None);
        Ok(())
    }

    pub fn current() -> Option<IsolateHandle> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Requests an interrupt. Callable from any thread.
    pub fn interrupt(&self) {
        self.0.interrupt.fetch_or(INTERRUPT_REQUESTED, Ordering::AcqRel);
    }

    /// Runs `f` on the isolate. The calling thread must have entered it.
    pub fn with<R>(&self, f: impl FnOnce(&mut Isolate) -> R) -> Result<R, ApiError> {
        if *self.0.owner.lock() != Some(thread::current().id()) {
            return Err(ApiError::NoCurrentIsolate);
        }
        if self.0.borrowed.swap(true, Ordering::AcqRel) {
            return Err(ApiError::IsolateBusy);
        }
        let _guard = BorrowGuard(&self.0.borrowed);
        // SAFETY: the owner check pins access to this thread and the borrow
        // flag excludes a second `&mut`.
        let slot = unsafe { &mut *self.0.isolate.get() };
        let isolate = slot.as_mut().ok_or(ApiError::IsolateShutDown)?;
        Ok(f(isolate))
    }

    /// Shuts the isolate down and exits it. Its heap is freed.
    pub fn shutdown(&self) -> Result<(), ApiError> {
        self.with(Isolate::shutdown)?;
        {
            if self.0.borrowed.swap(true, Ordering::AcqRel) {
                return Err(ApiError::IsolateBusy);
            }
            let _guard = BorrowGuard(&self.0.borrowed);
            // SAFETY: as in `with`; the owner check above passed.
            let slot = unsafe { &mut *self.0.isolate.get() };
            slot.take();
        }
        self.exit()
    }

    pub fn is_shut_down(&self) -> bool {
        if self.0.borrowed.load(Ordering::Acquire) {
            return false;
        }
        // SAFETY: read-only peek at the option discriminant.
        unsafe { (*self.0.isolate.get()).is_none() }
    }
}
