//! Embedder API.
//!
//! Embedders reach managed objects only through [`Handle`]s created inside
//! a [`HandleScope`]. A failing call returns an [`ErrorHandle`], a local
//! handle onto the error object, so native functions can hand failures back
//! with `?`. The scope exits when the guard is dropped, which also covers
//! early returns.

use heap::Space;
use object::{
    ClassId, ExternalString, GrowableObjectArray, StringHeader, TypedData, UnhandledException, Value, WORD_SIZE,
    cid, class_id,
};

use crate::bigint;
use crate::cobject::{CObject, TypedDataKind};
use crate::error::{ApiError, ErrorKind, RuntimeResult, Unwind};
use crate::function::FunctionId;
use crate::handles::{ErrorHandle, Handle, WeakHandleFinalizer};
use crate::isolate::Isolate;
use crate::port::PortId;

pub type ApiResult<T> = Result<T, ErrorHandle>;

/// Raw view of typed data acquired with [`HandleScope::typed_data_acquire`].
/// No allocation may happen until it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedDataView {
    pub kind: TypedDataKind,
    pub data: *mut u8,
    pub length: usize,
}

pub struct HandleScope<'a> {
    isolate: &'a mut Isolate,
    depth: usize,
    acquired: Option<heap::NoGcScope>,
}

impl<'a> HandleScope<'a> {
    pub fn new(isolate: &'a mut Isolate) -> Self {
        let depth = isolate.roots.api.scope_depth();
        isolate.roots.api.enter_scope();
        HandleScope {
            isolate,
            depth,
            acquired: None,
        }
    }

    /// An inner scope; its handles die when it is dropped.
    pub fn nested(&mut self) -> HandleScope<'_> {
        HandleScope::new(self.isolate)
    }

    pub fn isolate(&mut self) -> &mut Isolate {
        self.isolate
    }

    /// Zeroed bytes that live as long as this scope.
    pub fn allocate(&mut self, size: usize) -> &mut [u8] {
        self.isolate.roots.api.scope_allocate(size)
    }

    // ── Handles and errors ─────────────────────────────────────────

    pub fn local(&mut self, value: Value) -> Handle {
        self.isolate.roots.api.new_local(value)
    }

    pub fn value(&mut self, handle: Handle) -> ApiResult<Value> {
        match self.isolate.roots.api.get(handle) {
            Ok(value) => Ok(value),
            Err(err) => Err(self.api_error(err)),
        }
    }

    /// Moves the pending error into a local handle.
    pub fn take_error(&mut self, _: Unwind) -> ErrorHandle {
        let error = self.isolate.roots.unwinder.take();
        ErrorHandle(self.local(error))
    }

    /// Reporting an error allocates, so acquired typed data is released
    /// first.
    pub fn api_error(&mut self, err: ApiError) -> ErrorHandle {
        if self.acquired.take().is_some() {
            log::warn!("typed data released by an API error: {err}");
        }
        let unwind = self.isolate.raise_api_error(err);
        self.take_error(unwind)
    }

    fn local_result(&mut self, result: RuntimeResult<Value>) -> ApiResult<Handle> {
        match result {
            Ok(value) => Ok(self.local(value)),
            Err(unwind) => Err(self.take_error(unwind)),
        }
    }

    fn class_of(&mut self, handle: Handle) -> ApiResult<(Value, ClassId)> {
        let value = self.value(handle)?;
        Ok((value, self.isolate.class_id_of(value)))
    }

    pub fn is_error(&mut self, handle: Handle) -> bool {
        match self.isolate.roots.api.get(handle) {
            Ok(value) => self.isolate.error_kind_of(value).is_some(),
            Err(_) => false,
        }
    }

    pub fn error_kind(&mut self, error: ErrorHandle) -> Option<ErrorKind> {
        let value = self.isolate.roots.api.get(error.handle()).ok()?;
        self.isolate.error_kind_of(value)
    }

    /// Text of an error: its message, or the exception and stack trace
    /// of an unhandled exception.
    pub fn error_message(&mut self, error: ErrorHandle) -> String {
        match self.isolate.roots.api.get(error.handle()) {
            Ok(value) => self.isolate.error_to_string(value),
            Err(err) => err.to_string(),
        }
    }

    pub fn error_get_exception(&mut self, error: ErrorHandle) -> ApiResult<Handle> {
        let ue = self.unhandled_exception(error)?;
        let exception = unsafe { ue.as_ref::<UnhandledException>() }.exception;
        Ok(self.local(exception))
    }

    pub fn error_get_stacktrace(&mut self, error: ErrorHandle) -> ApiResult<Handle> {
        let ue = self.unhandled_exception(error)?;
        let stacktrace = unsafe { ue.as_ref::<UnhandledException>() }.stacktrace;
        Ok(self.local(stacktrace))
    }

    fn unhandled_exception(&mut self, error: ErrorHandle) -> ApiResult<Value> {
        let (value, class_id) = self.class_of(error.handle())?;
        if class_id != cid::UNHANDLED_EXCEPTION {
            return Err(self.api_error(ApiError::WrongType {
                expected: "an unhandled exception",
            }));
        }
        Ok(value)
    }

    /// Makes `error` the pending error. The caller returns the `Unwind`
    /// to its managed caller, skipping every scope in between.
    pub fn propagate_error(&mut self, error: ErrorHandle) -> Unwind {
        match self.isolate.roots.api.get(error.handle()) {
            Ok(value) if self.isolate.error_kind_of(value).is_some() => self.isolate.roots.unwinder.raise(value),
            _ => self.isolate.raise_api_error(ApiError::InvalidHandle),
        }
    }

    /// Throws `exception` with a stack trace of the active frames.
    pub fn throw_exception(&mut self, exception: Handle) -> ErrorHandle {
        match self.value(exception) {
            Ok(exception) => {
                let unwind = self.isolate.throw_exception(exception);
                self.take_error(unwind)
            }
            Err(error) => error,
        }
    }

    pub fn rethrow_exception(&mut self, exception: Handle, stacktrace: Handle) -> ErrorHandle {
        let values = self.value(exception).and_then(|e| Ok((e, self.value(stacktrace)?)));
        match values {
            Ok((exception, stacktrace)) => {
                let unwind = self.isolate.rethrow_exception(exception, stacktrace);
                self.take_error(unwind)
            }
            Err(error) => error,
        }
    }

    // ── Persistent and weak handles ────────────────────────────────

    pub fn new_persistent_handle(&mut self, handle: Handle) -> ApiResult<Handle> {
        let value = self.value(handle)?;
        Ok(self.isolate.roots.api.new_persistent(value))
    }

    pub fn delete_persistent_handle(&mut self, handle: Handle) -> ApiResult<()> {
        match self.isolate.roots.api.delete(handle) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.api_error(err)),
        }
    }

    /// A handle that does not keep its referent alive. Once the referent
    /// dies the handle reads as null and `finalizer` runs with `peer`.
    pub fn new_weak_persistent_handle(
        &mut self,
        handle: Handle,
        peer: usize,
        finalizer: Option<WeakHandleFinalizer>,
    ) -> ApiResult<Handle> {
        let value = self.value(handle)?;
        Ok(self.isolate.roots.api.new_weak(value, peer, finalizer, false))
    }

    /// Weak only during collections that run the prologue and epilogue
    /// callbacks; strong otherwise.
    pub fn new_prologue_weak_persistent_handle(
        &mut self,
        handle: Handle,
        peer: usize,
        finalizer: Option<WeakHandleFinalizer>,
    ) -> ApiResult<Handle> {
        let value = self.value(handle)?;
        Ok(self.isolate.roots.api.new_weak(value, peer, finalizer, true))
    }

    pub fn is_weak_persistent_handle(&self, handle: Handle) -> bool {
        self.isolate.roots.api.is_weak(handle)
    }

    pub fn is_prologue_weak_persistent_handle(&self, handle: Handle) -> bool {
        self.isolate.roots.api.is_prologue_weak(handle)
    }

    /// `values` stay reachable while any of `keys` is, for the next
    /// collection only.
    pub fn new_weak_reference_set(&mut self, keys: &[Handle], values: &[Handle]) -> ApiResult<()> {
        let keys = keys.iter().map(|&k| self.value(k)).collect::<ApiResult<Vec<_>>>()?;
        let values = values.iter().map(|&v| self.value(v)).collect::<ApiResult<Vec<_>>>()?;
        self.isolate.roots.api.new_weak_reference_set(keys, values);
        Ok(())
    }

    // ── Singletons and numbers ─────────────────────────────────────

    pub fn null(&mut self) -> Handle {
        let null = self.isolate.null();
        self.local(null)
    }

    pub fn is_null(&mut self, handle: Handle) -> bool {
        self.isolate.roots.api.get(handle).is_ok_and(|v| v == self.isolate.null())
    }

    pub fn new_boolean(&mut self, value: bool) -> Handle {
        let b = self.isolate.bool_value(value);
        self.local(b)
    }

    pub fn boolean_value(&mut self, handle: Handle) -> ApiResult<bool> {
        let (value, class_id) = self.class_of(handle)?;
        if class_id != cid::BOOL {
            return Err(self.api_error(ApiError::WrongType { expected: "a boolean" }));
        }
        Ok(self.isolate.is_true(value))
    }

    pub fn new_integer(&mut self, value: i64) -> ApiResult<Handle> {
        let result = self.isolate.new_integer(value);
        self.local_result(result)
    }

    /// Parses `[-]digits` or `[-]0xhex`; values beyond 64 bits become
    /// bigints.
    pub fn new_integer_from_string(&mut self, text: &str) -> ApiResult<Handle> {
        let Some((negative, digits)) = bigint::parse(text) else {
            return Err(self.api_error(ApiError::InvalidArgument("malformed integer literal")));
        };
        let result = match bigint::to_i64(negative, &digits) {
            Some(n) => self.isolate.new_integer(n),
            None => self.isolate.new_bigint(negative, &digits),
        };
        self.local_result(result)
    }

    pub fn integer_fits_into_i64(&mut self, handle: Handle) -> ApiResult<bool> {
        let value = self.integer(handle)?;
        Ok(self.isolate.integer_value(value).is_some())
    }

    pub fn integer_to_i64(&mut self, handle: Handle) -> ApiResult<i64> {
        let value = self.integer(handle)?;
        match self.isolate.integer_value(value) {
            Some(n) => Ok(n),
            None => Err(self.api_error(ApiError::OutOfRange)),
        }
    }

    /// `0x`-prefixed hex text of any integer.
    pub fn integer_to_hex_string(&mut self, handle: Handle) -> ApiResult<String> {
        let value = self.integer(handle)?;
        if let Some(n) = self.isolate.integer_value(value) {
            let (negative, digits) = bigint::from_i128(i128::from(n));
            return Ok(bigint::to_hex(negative, &digits));
        }
        let b = unsafe { value.as_ref::<object::Bigint>() };
        Ok(bigint::to_hex(b.is_negative(), b.digits()))
    }

    fn integer(&mut self, handle: Handle) -> ApiResult<Value> {
        let (value, class_id) = self.class_of(handle)?;
        if !matches!(class_id, cid::SMI | cid::MINT | cid::BIGINT) {
            return Err(self.api_error(ApiError::WrongType { expected: "an integer" }));
        }
        Ok(value)
    }

    pub fn new_double(&mut self, value: f64) -> ApiResult<Handle> {
        let result = self.isolate.new_double(value);
        self.local_result(result)
    }

    pub fn double_value(&mut self, handle: Handle) -> ApiResult<f64> {
        let value = self.value(handle)?;
        match self.isolate.double_value(value) {
            Some(d) if self.isolate.class_id_of(value) == cid::DOUBLE => Ok(d),
            _ => Err(self.api_error(ApiError::WrongType { expected: "a double" })),
        }
    }

    // ── Strings ────────────────────────────────────────────────────

    pub fn new_string_from_utf8(&mut self, utf8: &[u8]) -> ApiResult<Handle> {
        match std::str::from_utf8(utf8) {
            Ok(s) => {
                let result = self.isolate.new_string(s);
                self.local_result(result)
            }
            Err(_) => Err(self.api_error(ApiError::InvalidArgument("string is not valid UTF-8"))),
        }
    }

    pub fn new_string_from_utf16(&mut self, units: &[u16]) -> ApiResult<Handle> {
        let result = if units.iter().all(|&u| u <= 0xFF) {
            let latin1: Vec<u8> = units.iter().map(|&u| u as u8).collect();
            self.isolate.new_one_byte_string(&latin1, Space::New)
        } else {
            self.isolate.new_two_byte_string(units, Space::New)
        };
        self.local_result(result)
    }

    pub fn new_string_from_utf32(&mut self, code_points: &[u32]) -> ApiResult<Handle> {
        let text: Option<String> = code_points.iter().map(|&c| char::from_u32(c)).collect();
        match text {
            Some(s) => {
                let result = self.isolate.new_string(&s);
                self.local_result(result)
            }
            None => Err(self.api_error(ApiError::InvalidArgument("invalid code point"))),
        }
    }

    pub fn new_string_from_latin1(&mut self, latin1: &[u8]) -> ApiResult<Handle> {
        let result = self.isolate.new_one_byte_string(latin1, Space::New);
        self.local_result(result)
    }

    /// A string over Latin-1 characters owned by the embedder. `peer` is
    /// kept with the string and handed back through [`Self::external_string_peer`].
    pub fn new_external_latin1_string(&mut self, data: *const u8, length: usize, peer: usize) -> ApiResult<Handle> {
        let result = self.isolate.new_external_string(cid::EXTERNAL_ONE_BYTE_STRING, data, length, peer);
        self.local_result(result)
    }

    pub fn new_external_utf16_string(&mut self, data: *const u16, length: usize, peer: usize) -> ApiResult<Handle> {
        let result = self
            .isolate
            .new_external_string(cid::EXTERNAL_TWO_BYTE_STRING, data.cast(), length, peer);
        self.local_result(result)
    }

    pub fn external_string_peer(&mut self, handle: Handle) -> ApiResult<usize> {
        let (value, class_id) = self.class_of(handle)?;
        if !matches!(class_id, cid::EXTERNAL_ONE_BYTE_STRING | cid::EXTERNAL_TWO_BYTE_STRING) {
            return Err(self.api_error(ApiError::WrongType {
                expected: "an external string",
            }));
        }
        Ok(unsafe { value.as_ref::<ExternalString>() }.peer)
    }

    pub fn string_to_utf8(&mut self, handle: Handle) -> ApiResult<String> {
        let value = self.value(handle)?;
        match self.isolate.string_value(value) {
            Some(s) => Ok(s),
            None => Err(self.api_error(ApiError::WrongType { expected: "a string" })),
        }
    }

    pub fn string_length(&mut self, handle: Handle) -> ApiResult<usize> {
        let (value, class_id) = self.class_of(handle)?;
        if !class_id::is_string_cid(class_id) {
            return Err(self.api_error(ApiError::WrongType { expected: "a string" }));
        }
        Ok(unsafe { value.as_ref::<StringHeader>() }.len())
    }

    // ── Lists ──────────────────────────────────────────────────────

    pub fn new_list(&mut self, length: usize) -> ApiResult<Handle> {
        let result = self.isolate.new_array(length);
        self.local_result(result)
    }

    /// Backing array and length of a fixed or growable list.
    fn list(&mut self, handle: Handle) -> ApiResult<(Value, Value, usize)> {
        let (value, class_id) = self.class_of(handle)?;
        match class_id {
            cid::ARRAY | cid::IMMUTABLE_ARRAY => Ok((value, value, self.isolate.array_len(value))),
            cid::GROWABLE_OBJECT_ARRAY => {
                let list = unsafe { value.as_ref::<GrowableObjectArray>() };
                Ok((value, list.data, list.len()))
            }
            _ => Err(self.api_error(ApiError::WrongType { expected: "a list" })),
        }
    }

    pub fn list_length(&mut self, handle: Handle) -> ApiResult<usize> {
        self.list(handle).map(|(_, _, len)| len)
    }

    pub fn list_get_at(&mut self, handle: Handle, index: usize) -> ApiResult<Handle> {
        let (_, data, len) = self.list(handle)?;
        if index >= len {
            return Err(self.api_error(ApiError::OutOfRange));
        }
        let element = self.isolate.array_at(data, index);
        Ok(self.local(element))
    }

    pub fn list_set_at(&mut self, handle: Handle, index: usize, element: Handle) -> ApiResult<()> {
        let (list, data, len) = self.list(handle)?;
        if index >= len {
            return Err(self.api_error(ApiError::OutOfRange));
        }
        if self.isolate.class_id_of(list) == cid::IMMUTABLE_ARRAY {
            return Err(self.api_error(ApiError::InvalidArgument("list is immutable")));
        }
        let element = self.value(element)?;
        self.isolate.array_set(data, index, element);
        Ok(())
    }

    // ── Typed data ─────────────────────────────────────────────────

    pub fn new_typed_data(&mut self, kind: TypedDataKind, length: usize) -> ApiResult<Handle> {
        let result = self.isolate.new_typed_data(kind.internal_class_id(), length);
        self.local_result(result)
    }

    /// Typed data over `length` elements at `data`, which the embedder
    /// keeps alive. Pair it with a weak handle to learn when it dies.
    pub fn new_external_typed_data(
        &mut self,
        kind: TypedDataKind,
        data: *mut u8,
        length: usize,
        peer: usize,
    ) -> ApiResult<Handle> {
        let result = self
            .isolate
            .new_external_typed_data(kind.external_class_id(), data, length, peer);
        self.local_result(result)
    }

    /// Pins the heap until [`Self::typed_data_release`]: collections are
    /// not allowed while the raw pointer is out.
    pub fn typed_data_acquire(&mut self, handle: Handle) -> ApiResult<TypedDataView> {
        if self.acquired.is_some() {
            return Err(self.api_error(ApiError::InvalidArgument("typed data is already acquired")));
        }
        let (value, class_id) = self.class_of(handle)?;
        let Some(kind) = TypedDataKind::from_class_id(class_id) else {
            return Err(self.api_error(ApiError::WrongType { expected: "typed data" }));
        };
        let view = if class_id::is_external_typed_data_cid(class_id) {
            let t = unsafe { value.as_ref::<object::ExternalTypedData>() };
            TypedDataView {
                kind,
                data: t.data,
                length: t.len(),
            }
        } else {
            let t = unsafe { value.as_ref::<TypedData>() };
            TypedDataView {
                kind,
                data: t.data_ptr(),
                length: t.len(),
            }
        };
        self.acquired = Some(self.isolate.heap.no_gc_scope());
        Ok(view)
    }

    pub fn typed_data_release(&mut self) -> ApiResult<()> {
        match self.acquired.take() {
            Some(_) => Ok(()),
            None => Err(self.api_error(ApiError::InvalidArgument("no typed data is acquired"))),
        }
    }

    // ── Classes, fields and calls ──────────────────────────────────

    pub fn lookup_class(&mut self, name: &str) -> ApiResult<ClassId> {
        match self.isolate.class_table().lookup(name) {
            Some(id) => Ok(id),
            None => Err(self.api_error(ApiError::NotFound(name.to_owned()))),
        }
    }

    pub fn lookup_function(&mut self, class_id: ClassId, name: &str) -> ApiResult<FunctionId> {
        match self.isolate.lookup_function(class_id, name) {
            Some(id) => Ok(id),
            None => Err(self.api_error(ApiError::NotFound(name.to_owned()))),
        }
    }

    pub fn new_instance(&mut self, class_id: ClassId) -> ApiResult<Handle> {
        let result = self.isolate.new_instance(class_id);
        self.local_result(result)
    }

    pub fn class_of_instance(&mut self, handle: Handle) -> ApiResult<ClassId> {
        self.class_of(handle).map(|(_, class_id)| class_id)
    }

    pub fn is_instance_of(&mut self, handle: Handle, class_id: ClassId) -> ApiResult<bool> {
        if !self.isolate.class_table().is_valid(class_id) && class_id != cid::DYNAMIC {
            return Err(self.api_error(ApiError::NotFound(format!("class {class_id}"))));
        }
        let value = self.value(handle)?;
        let null = self.isolate.null();
        Ok(self.isolate.is_instance_of_class(value, class_id, null))
    }

    fn args(&mut self, args: &[Handle]) -> ApiResult<Vec<Value>> {
        args.iter().map(|&a| self.value(a)).collect()
    }

    /// Calls a static function.
    pub fn invoke_static(&mut self, function: FunctionId, args: &[Handle]) -> ApiResult<Handle> {
        let args = self.args(args)?;
        let result = self.isolate.invoke_function(function, &args);
        self.local_result(result)
    }

    /// Dynamic call of `name` on `receiver`.
    pub fn invoke(&mut self, receiver: Handle, name: &str, args: &[Handle]) -> ApiResult<Handle> {
        let receiver = self.value(receiver)?;
        let args = self.args(args)?;
        let result = self.isolate.invoke_method(receiver, name, &args);
        self.local_result(result)
    }

    pub fn invoke_closure(&mut self, closure: Handle, args: &[Handle]) -> ApiResult<Handle> {
        let closure = self.value(closure)?;
        let args = self.args(args)?;
        let result = self.isolate.invoke_closure(closure, &args);
        self.local_result(result)
    }

    /// Reads an instance field of `container` by name.
    pub fn get_field(&mut self, container: Handle, name: &str) -> ApiResult<Handle> {
        let (value, class_id) = self.class_of(container)?;
        let Some(field) = self.isolate.lookup_field(class_id, name).filter(|&f| !self.isolate.field(f).is_static()) else {
            return Err(self.api_error(ApiError::NotFound(name.to_owned())));
        };
        let slot = self.isolate.instance_field(value, self.isolate.field(field).offset);
        Ok(self.local(slot))
    }

    /// Writes an instance field, updating the field's guard.
    pub fn set_field(&mut self, container: Handle, name: &str, value: Handle) -> ApiResult<()> {
        let (object, class_id) = self.class_of(container)?;
        let Some(field) = self.isolate.lookup_field(class_id, name).filter(|&f| !self.isolate.field(f).is_static()) else {
            return Err(self.api_error(ApiError::NotFound(name.to_owned())));
        };
        if self.isolate.field(field).is_final() {
            return Err(self.api_error(ApiError::InvalidArgument("field is final")));
        }
        let value = self.value(value)?;
        self.isolate.guard_field_store(field, value);
        let offset = self.isolate.field(field).offset;
        self.isolate.set_instance_field(object, offset, value);
        Ok(())
    }

    pub fn get_static_field(&mut self, class_id: ClassId, name: &str) -> ApiResult<Handle> {
        let Some(field) = self.isolate.lookup_field(class_id, name).filter(|&f| self.isolate.field(f).is_static()) else {
            return Err(self.api_error(ApiError::NotFound(name.to_owned())));
        };
        let value = self.isolate.static_value(field);
        Ok(self.local(value))
    }

    pub fn set_static_field(&mut self, class_id: ClassId, name: &str, value: Handle) -> ApiResult<()> {
        let Some(field) = self.isolate.lookup_field(class_id, name).filter(|&f| self.isolate.field(f).is_static()) else {
            return Err(self.api_error(ApiError::NotFound(name.to_owned())));
        };
        let value = self.value(value)?;
        self.isolate.set_static_value(field, value);
        Ok(())
    }

    // ── Native fields and peers ────────────────────────────────────

    fn native_field_offset(&mut self, handle: Handle, index: usize) -> ApiResult<(Value, usize)> {
        let (value, class_id) = self.class_of(handle)?;
        let slot = self
            .isolate
            .class_table()
            .get(class_id)
            .filter(|c| index < c.num_native_fields)
            .map(|c| c.native_fields_offset + index * WORD_SIZE);
        match slot {
            Some(offset) => Ok((value, offset)),
            None => Err(self.api_error(ApiError::OutOfRange)),
        }
    }

    pub fn get_native_instance_field(&mut self, handle: Handle, index: usize) -> ApiResult<usize> {
        let (object, offset) = self.native_field_offset(handle, index)?;
        let word = self.isolate.instance_field(object, offset);
        Ok(if word.is_smi() { word.to_i64() as usize } else { 0 })
    }

    /// Stores an embedder word. Values must fit in a smi.
    pub fn set_native_instance_field(&mut self, handle: Handle, index: usize, word: usize) -> ApiResult<()> {
        let Some(smi) = i64::try_from(word).ok().and_then(Value::try_from_i64) else {
            return Err(self.api_error(ApiError::OutOfRange));
        };
        let (object, offset) = self.native_field_offset(handle, index)?;
        self.isolate.set_instance_field(object, offset, smi);
        Ok(())
    }

    pub fn get_peer(&mut self, handle: Handle) -> ApiResult<Option<usize>> {
        let value = self.heap_object(handle)?;
        Ok(self.isolate.heap.peer(value))
    }

    /// A zero peer removes the association.
    pub fn set_peer(&mut self, handle: Handle, peer: usize) -> ApiResult<()> {
        let value = self.heap_object(handle)?;
        self.isolate.heap.set_peer(value, peer);
        Ok(())
    }

    fn heap_object(&mut self, handle: Handle) -> ApiResult<Value> {
        let value = self.value(handle)?;
        if value.is_smi() || self.isolate.runtime().is_vm_object(value) {
            return Err(self.api_error(ApiError::InvalidArgument("object cannot carry a peer")));
        }
        Ok(value)
    }

    // ── Ports ──────────────────────────────────────────────────────

    pub fn get_main_port_id(&self) -> PortId {
        self.isolate.main_port()
    }

    pub fn new_send_port(&mut self, port: PortId) -> ApiResult<Handle> {
        let result = self.isolate.new_send_port(port);
        self.local_result(result)
    }

    pub fn get_receive_port(&mut self, port: PortId) -> ApiResult<Handle> {
        let result = self.isolate.get_receive_port(port);
        self.local_result(result)
    }

    /// Serializes `message` and posts it to `port`.
    pub fn post(&mut self, port: PortId, message: Handle) -> ApiResult<()> {
        let value = self.value(message)?;
        match self.isolate.post(port, value) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.api_error(err)),
        }
    }

    pub fn post_c_object(&mut self, port: PortId, message: CObject) -> ApiResult<()> {
        match self.isolate.runtime().post(port, message) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.api_error(err)),
        }
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        self.acquired = None;
        self.isolate.roots.api.unwind_scopes_to(self.depth);
    }
}

impl Isolate {
    pub fn error_kind_of(&self, value: Value) -> Option<ErrorKind> {
        if value.is_smi() {
            return None;
        }
        ErrorKind::from_class_id(self.class_id_of(value))
    }

    pub fn error_to_string(&self, error: Value) -> String {
        match self.error_kind_of(error) {
            Some(ErrorKind::UnhandledException) => {
                let ue = unsafe { error.as_ref::<UnhandledException>() };
                let trace = self.stacktrace_to_string(ue.stacktrace);
                format!("Unhandled exception:\n{}\n{}", self.value_to_string(ue.exception), trace)
            }
            Some(_) => {
                let message = unsafe { error.as_ref::<object::MessageError>() }.message;
                self.string_value(message).unwrap_or_default()
            }
            None => self.value_to_string(error),
        }
    }

    pub(crate) fn new_external_string(
        &mut self,
        class_id: ClassId,
        data: *const u8,
        length: usize,
        peer: usize,
    ) -> RuntimeResult<Value> {
        let v = self.allocate_raw(class_id, ExternalString::SIZE, Space::New)?;
        let s = unsafe { v.as_mut::<ExternalString>() };
        s.base.length = Value::from_usize(length);
        s.base.hash = Value::from_i64(0);
        s.data = data;
        s.peer = peer;
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::assembler::CodeBuilder;
    use crate::class_table::Class;
    use crate::function::{FieldFlags, Function, FunctionFlags, FunctionKind};
    use crate::runtime::{Runtime, RuntimeConfig};

    fn with_isolate<R>(f: impl FnOnce(&mut Isolate) -> R) -> R {
        let _ = env_logger::builder().is_test(true).try_init();
        let runtime = Runtime::initialize(RuntimeConfig::default()).unwrap();
        let handle = runtime.create_isolate("api", 0).unwrap();
        let result = handle.with(f).unwrap();
        handle.shutdown().unwrap();
        result
    }

    fn point_class(isolate: &mut Isolate) -> ClassId {
        let point = isolate.register_class(Class::new("Point", None));
        isolate.add_field(point, "x", FieldFlags::empty()).unwrap();
        isolate.add_field(point, "origin", FieldFlags::STATIC).unwrap();
        isolate.finalize_class(point).unwrap();
        point
    }

    // ── Scopes ─────────────────────────────────────────────────────

    #[test]
    fn dropping_a_scope_invalidates_its_locals() {
        with_isolate(|isolate| {
            let outer_depth = isolate.roots.api.scope_depth();
            let mut scope = HandleScope::new(isolate);
            let kept = scope.new_integer(1).unwrap();
            let inner = {
                let mut inner = scope.nested();
                inner.new_integer(2).unwrap()
            };
            assert!(scope.value(inner).is_err());
            assert_eq!(scope.integer_to_i64(kept).unwrap(), 1);
            drop(scope);
            assert_eq!(isolate.roots.api.scope_depth(), outer_depth);
        });
    }

    #[test]
    fn early_return_exits_the_scope() {
        fn fails(isolate: &mut Isolate) -> ApiResult<i64> {
            let mut scope = HandleScope::new(isolate);
            let s = scope.new_string_from_utf8(b"not a number")?;
            scope.integer_to_i64(s)
        }
        with_isolate(|isolate| {
            let depth = isolate.roots.api.scope_depth();
            assert!(fails(isolate).is_err());
            assert_eq!(isolate.roots.api.scope_depth(), depth);
        });
    }

    // ── Numbers and strings ────────────────────────────────────────

    #[test]
    fn integers_from_text() {
        with_isolate(|isolate| {
            let mut scope = HandleScope::new(isolate);
            let small = scope.new_integer_from_string("-42").unwrap();
            assert_eq!(scope.integer_to_i64(small).unwrap(), -42);
            let hex = scope.new_integer_from_string("0x7fffffffffffffff").unwrap();
            assert_eq!(scope.integer_to_i64(hex).unwrap(), i64::MAX);
            let big = scope.new_integer_from_string("0x10000000000000000").unwrap();
            assert!(!scope.integer_fits_into_i64(big).unwrap());
            assert!(scope.integer_to_i64(big).is_err());
            assert_eq!(scope.integer_to_hex_string(big).unwrap(), "0x10000000000000000");
            assert!(scope.new_integer_from_string("12ab").is_err());
        });
    }

    #[test]
    fn strings_in_every_encoding() {
        with_isolate(|isolate| {
            let mut scope = HandleScope::new(isolate);
            let a = scope.new_string_from_utf8("h\u{e9}llo".as_bytes()).unwrap();
            let b = scope.new_string_from_latin1(&[b'h', 0xE9, b'l', b'l', b'o']).unwrap();
            let c = scope.new_string_from_utf16(&"h\u{e9}llo".encode_utf16().collect::<Vec<_>>()).unwrap();
            let d = scope.new_string_from_utf32(&['\u{263a}' as u32, 'x' as u32]).unwrap();
            for h in [a, b, c] {
                assert_eq!(scope.string_to_utf8(h).unwrap(), "h\u{e9}llo");
            }
            assert_eq!(scope.string_to_utf8(d).unwrap(), "\u{263a}x");
            assert!(scope.new_string_from_utf8(&[0xFF, 0xFE]).is_err());
            assert!(scope.new_string_from_utf32(&[0xD800]).is_err());
        });
    }

    #[test]
    fn external_strings_keep_their_peer() {
        let text = b"external";
        with_isolate(|isolate| {
            let mut scope = HandleScope::new(isolate);
            let s = scope.new_external_latin1_string(text.as_ptr(), text.len(), 77).unwrap();
            assert_eq!(scope.string_to_utf8(s).unwrap(), "external");
            assert_eq!(scope.string_length(s).unwrap(), 8);
            assert_eq!(scope.external_string_peer(s).unwrap(), 77);
        });
    }

    // ── Lists and typed data ───────────────────────────────────────

    #[test]
    fn list_access_is_bounds_checked() {
        with_isolate(|isolate| {
            let mut scope = HandleScope::new(isolate);
            let list = scope.new_list(2).unwrap();
            let one = scope.new_double(1.5).unwrap();
            scope.list_set_at(list, 1, one).unwrap();
            assert_eq!(scope.list_length(list).unwrap(), 2);
            let back = scope.list_get_at(list, 1).unwrap();
            assert_eq!(scope.double_value(back).unwrap(), 1.5);
            let first = scope.list_get_at(list, 0).unwrap();
            assert!(scope.is_null(first));
            let err = scope.list_get_at(list, 2).unwrap_err();
            assert!(scope.error_message(err).contains("out of range"));
        });
    }

    #[test]
    fn acquired_typed_data_is_writable() {
        with_isolate(|isolate| {
            let mut scope = HandleScope::new(isolate);
            let data = scope.new_typed_data(TypedDataKind::Int32, 4).unwrap();
            let view = scope.typed_data_acquire(data).unwrap();
            assert_eq!(view.kind, TypedDataKind::Int32);
            assert_eq!(view.length, 4);
            unsafe { *view.data.cast::<i32>().add(3) = -9 };
            scope.typed_data_release().unwrap();
            assert!(scope.typed_data_release().is_err());

            scope.typed_data_acquire(data).unwrap();
            assert!(scope.typed_data_acquire(data).is_err());
            assert!(scope.typed_data_release().is_err());

            let value = scope.value(data).unwrap();
            let t = unsafe { value.as_ref::<TypedData>() };
            assert_eq!(unsafe { *t.data_ptr().cast::<i32>().add(3) }, -9);
        });
    }

    // ── Fields and calls ───────────────────────────────────────────

    #[test]
    fn fields_by_name() {
        with_isolate(|isolate| {
            let point = point_class(isolate);
            let mut scope = HandleScope::new(isolate);
            let p = scope.new_instance(point).unwrap();
            let seven = scope.new_integer(7).unwrap();
            scope.set_field(p, "x", seven).unwrap();
            let x = scope.get_field(p, "x").unwrap();
            assert_eq!(scope.integer_to_i64(x).unwrap(), 7);
            let guarded = scope.isolate().lookup_field(point, "x").unwrap();
            assert_eq!(scope.isolate().field(guarded).guarded_cid, cid::SMI);

            scope.set_static_field(point, "origin", p).unwrap();
            let origin = scope.get_static_field(point, "origin").unwrap();
            assert_eq!(scope.value(origin).unwrap(), scope.value(p).unwrap());
            assert!(scope.get_field(p, "y").is_err());
            assert!(scope.get_field(p, "origin").is_err());
            assert!(scope.is_instance_of(p, point).unwrap());
            assert!(!scope.is_instance_of(seven, point).unwrap());
        });
    }

    #[test]
    fn invoke_static_and_dynamic() {
        with_isolate(|isolate| {
            let point = point_class(isolate);
            let owner = isolate.register_class(Class::new("Lib", None));
            let add = Function::new("add", owner, FunctionKind::Regular, 2).with_flags(FunctionFlags::STATIC);
            let add = isolate.add_function(add).unwrap();
            let mut b = CodeBuilder::new("add", 2, 0);
            b.push_arg(0);
            b.push_arg(1);
            b.add();
            b.ret();
            let code = b.finalize(isolate, Some(add)).unwrap();
            isolate.set_function_code(add, code);

            let mut scope = HandleScope::new(isolate);
            let three = scope.new_integer(3).unwrap();
            let four = scope.new_integer(4).unwrap();
            let sum = scope.invoke_static(add, &[three, four]).unwrap();
            assert_eq!(scope.integer_to_i64(sum).unwrap(), 7);

            let p = scope.new_instance(point).unwrap();
            scope.set_field(p, "x", three).unwrap();
            let x = scope.invoke(p, "get:x", &[]).unwrap();
            assert_eq!(scope.integer_to_i64(x).unwrap(), 3);

            let err = scope.invoke(p, "missing", &[]).unwrap_err();
            assert!(scope.is_error(err.handle()));
            assert_eq!(scope.error_kind(err), Some(ErrorKind::Api));
            assert!(scope.error_message(err).contains("NoSuchMethodError"));
        });
    }

    #[test]
    fn thrown_exceptions_carry_a_stacktrace() {
        with_isolate(|isolate| {
            let mut scope = HandleScope::new(isolate);
            let message = scope.new_string_from_utf8(b"boom").unwrap();
            let err = scope.throw_exception(message);
            assert_eq!(scope.error_kind(err), Some(ErrorKind::UnhandledException));
            let exception = scope.error_get_exception(err).unwrap();
            assert_eq!(scope.string_to_utf8(exception).unwrap(), "boom");
            let trace = scope.error_get_stacktrace(err).unwrap();
            assert_eq!(scope.class_of_instance(trace).unwrap(), cid::STACKTRACE);

            let unwind = scope.propagate_error(err);
            assert_eq!(unwind, Unwind);
            assert!(scope.isolate().roots.unwinder.is_pending());
            scope.isolate().roots.unwinder.take();
        });
    }

    // ── Native fields, peers and weak handles ──────────────────────

    #[test]
    fn native_fields_follow_inherited_layout() {
        with_isolate(|isolate| {
            let mut wrapper = Class::new("Wrapper", None);
            wrapper.num_native_fields = 2;
            let wrapper = isolate.register_class(wrapper);
            isolate.add_field(wrapper, "tag", FieldFlags::empty()).unwrap();
            isolate.finalize_class(wrapper).unwrap();
            let sub = isolate.register_class(Class::new("SubWrapper", Some(wrapper)));
            isolate.finalize_class(sub).unwrap();
            assert_eq!(isolate.field(isolate.lookup_field(wrapper, "tag").unwrap()).offset, 3 * WORD_SIZE);

            let mut scope = HandleScope::new(isolate);
            let obj = scope.new_instance(sub).unwrap();
            assert_eq!(scope.get_native_instance_field(obj, 1).unwrap(), 0);
            scope.set_native_instance_field(obj, 1, 0xBEEF).unwrap();
            assert_eq!(scope.get_native_instance_field(obj, 1).unwrap(), 0xBEEF);
            assert!(scope.set_native_instance_field(obj, 2, 1).is_err());
        });
    }

    #[test]
    fn peers_follow_objects_across_collections() {
        with_isolate(|isolate| {
            let mut scope = HandleScope::new(isolate);
            let list = scope.new_list(1).unwrap();
            let keep = scope.new_persistent_handle(list).unwrap();
            scope.set_peer(keep, 99).unwrap();
            scope.isolate().collect_all_garbage();
            assert_eq!(scope.get_peer(keep).unwrap(), Some(99));
            scope.set_peer(keep, 0).unwrap();
            assert_eq!(scope.get_peer(keep).unwrap(), None);
            let five = scope.new_integer(5).unwrap();
            assert!(scope.set_peer(five, 1).is_err());
            scope.delete_persistent_handle(keep).unwrap();
            assert!(scope.delete_persistent_handle(keep).is_err());
        });
    }

    #[test]
    fn weak_handle_finalizer_runs_once() {
        with_isolate(|isolate| {
            let finalized = Arc::new(AtomicUsize::new(0));
            let weak = {
                let mut scope = HandleScope::new(isolate);
                let list = scope.new_list(3).unwrap();
                let seen = Arc::clone(&finalized);
                let finalizer: WeakHandleFinalizer = Box::new(move |peer| {
                    seen.fetch_add(peer, Ordering::SeqCst);
                });
                let weak = scope.new_weak_persistent_handle(list, 5, Some(finalizer)).unwrap();
                assert!(scope.is_weak_persistent_handle(weak));
                assert!(!scope.is_prologue_weak_persistent_handle(weak));
                weak
            };
            isolate.collect_all_garbage();
            isolate.collect_all_garbage();
            assert_eq!(finalized.load(Ordering::SeqCst), 5);
            let mut scope = HandleScope::new(isolate);
            assert!(scope.is_null(weak));
        });
    }

    // ── Ports ──────────────────────────────────────────────────────

    #[test]
    fn post_to_own_main_port() {
        with_isolate(|isolate| {
            let mut scope = HandleScope::new(isolate);
            let port = scope.get_main_port_id();
            let text = scope.new_string_from_utf8(b"ping").unwrap();
            scope.post(port, text).unwrap();
            scope.post_c_object(port, CObject::Int32(5)).unwrap();
            assert_eq!(scope.isolate().pending_messages(), 2);
            let err = scope.post_c_object(crate::port::ILLEGAL_PORT, CObject::Null).unwrap_err();
            assert!(scope.error_message(err).contains("closed"));
        });
    }
}
