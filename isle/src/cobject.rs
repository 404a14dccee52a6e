//! Detached message payloads.
//!
//! A [`CObject`] tree owns all of its data, so it can cross from one
//! isolate's heap to another's, or to a native port handler, without
//! either side seeing the other's objects. Arrays shared within one
//! message (including cycles) are encoded once and referred to again with
//! [`CObject::Backref`].

use object::{Array, Bigint, ClassId, Double, ExternalTypedData, GrowableObjectArray, Mint, TypedData, Value, cid, class_id};
use rustc_hash::FxHashMap;

use crate::bigint;
use crate::error::{ErrorKind, RuntimeResult};
use crate::isolate::Isolate;

/// Element type of typed data, in the embedder API's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypedDataKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl TypedDataKind {
    const ALL: [TypedDataKind; 11] = [
        TypedDataKind::Int8,
        TypedDataKind::Uint8,
        TypedDataKind::Uint8Clamped,
        TypedDataKind::Int16,
        TypedDataKind::Uint16,
        TypedDataKind::Int32,
        TypedDataKind::Uint32,
        TypedDataKind::Int64,
        TypedDataKind::Uint64,
        TypedDataKind::Float32,
        TypedDataKind::Float64,
    ];

    /// Kind of an internal or external typed-data class.
    pub fn from_class_id(class_id: ClassId) -> Option<TypedDataKind> {
        if !class_id::is_typed_data_cid(class_id) {
            return None;
        }
        let index = class_id::internal_typed_data_cid(class_id) - cid::TYPED_DATA_INT8;
        Self::ALL.get(index as usize).copied()
    }

    pub fn internal_class_id(self) -> ClassId {
        cid::TYPED_DATA_INT8 + self as ClassId
    }

    pub fn external_class_id(self) -> ClassId {
        class_id::external_typed_data_cid(self.internal_class_id())
    }

    pub fn element_size(self) -> usize {
        class_id::element_size(self.internal_class_id())
    }
}

/// Memory owned by the embedder, handed over with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalData {
    /// Address of the first element.
    pub data: usize,
    /// Number of elements.
    pub length: usize,
    pub peer: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CObject {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    /// Integers outside 64 bits, as decimal text.
    Bigint(String),
    Double(f64),
    String(String),
    Array(Vec<CObject>),
    /// The n-th array of the message, counting in encoding order.
    Backref(u32),
    TypedData { kind: TypedDataKind, bytes: Vec<u8> },
    ExternalTypedData { kind: TypedDataKind, external: ExternalData },
    Unsupported,
}

impl CObject {
    pub fn is_unsupported(&self) -> bool {
        match self {
            CObject::Unsupported => true,
            CObject::Array(items) => items.iter().any(CObject::is_unsupported),
            _ => false,
        }
    }
}

impl From<i64> for CObject {
    fn from(value: i64) -> Self {
        match i32::try_from(value) {
            Ok(small) => CObject::Int32(small),
            Err(_) => CObject::Int64(value),
        }
    }
}

impl From<&str> for CObject {
    fn from(value: &str) -> Self {
        CObject::String(value.to_owned())
    }
}

impl From<f64> for CObject {
    fn from(value: f64) -> Self {
        CObject::Double(value)
    }
}

impl From<bool> for CObject {
    fn from(value: bool) -> Self {
        CObject::Bool(value)
    }
}

// ── Serialization ──────────────────────────────────────────────────

/// Arrays met so far. Marks set here are cleared again on drop so the
/// source graph looks untouched even if encoding stops early.
struct Encoder {
    index: FxHashMap<usize, u32>,
    marked: Vec<Value>,
}

impl Encoder {
    fn new() -> Self {
        Encoder {
            index: FxHashMap::default(),
            marked: Vec::new(),
        }
    }

    /// Backref for `array` if it was seen, else registers it.
    fn visit(&mut self, array: Value) -> Option<u32> {
        let header = unsafe { array.header() };
        if header.is_marked() {
            if let Some(&n) = self.index.get(&array.addr()) {
                return Some(n);
            }
        } else {
            header.set_mark();
            self.marked.push(array);
        }
        let n = self.index.len() as u32;
        self.index.insert(array.addr(), n);
        None
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        for array in self.marked.drain(..) {
            unsafe { array.header() }.clear_mark();
        }
    }
}

impl Isolate {
    /// Encodes `value` as a detached tree. Objects with no message
    /// representation become [`CObject::Unsupported`].
    pub fn serialize_message(&self, value: Value) -> CObject {
        let mut encoder = Encoder::new();
        self.encode(value, &mut encoder)
    }

    fn encode(&self, value: Value, encoder: &mut Encoder) -> CObject {
        if value.is_smi() {
            return CObject::from(value.to_i64());
        }
        let class_id = self.class_id_of(value);
        match class_id {
            cid::NULL => CObject::Null,
            cid::BOOL => CObject::Bool(self.is_true(value)),
            cid::MINT => CObject::from(unsafe { value.as_ref::<Mint>() }.value),
            cid::BIGINT => {
                let b = unsafe { value.as_ref::<Bigint>() };
                CObject::Bigint(bigint::to_decimal(b.is_negative(), b.digits()))
            }
            cid::DOUBLE => CObject::Double(unsafe { value.as_ref::<Double>() }.value),
            c if class_id::is_string_cid(c) => match self.string_value(value) {
                Some(s) => CObject::String(s),
                None => CObject::Unsupported,
            },
            cid::ARRAY | cid::IMMUTABLE_ARRAY => {
                // Empty lists are never shared; the empty array lives in
                // the write-protected VM heap and cannot be marked.
                if self.array_len(value) == 0 {
                    return CObject::Array(Vec::new());
                }
                if let Some(n) = encoder.visit(value) {
                    return CObject::Backref(n);
                }
                let array = unsafe { value.as_ref::<Array>() };
                let items = (0..array.len()).map(|i| self.encode(array.at(i), encoder)).collect();
                CObject::Array(items)
            }
            cid::GROWABLE_OBJECT_ARRAY => {
                let list = unsafe { value.as_ref::<GrowableObjectArray>() };
                if list.len() == 0 {
                    return CObject::Array(Vec::new());
                }
                if let Some(n) = encoder.visit(value) {
                    return CObject::Backref(n);
                }
                let data = unsafe { list.data.as_ref::<Array>() };
                let items = (0..list.len()).map(|i| self.encode(data.at(i), encoder)).collect();
                CObject::Array(items)
            }
            c if class_id::is_internal_typed_data_cid(c) => {
                let Some(kind) = TypedDataKind::from_class_id(c) else {
                    return CObject::Unsupported;
                };
                let t = unsafe { value.as_ref::<TypedData>() };
                let bytes = unsafe { std::slice::from_raw_parts(t.data_ptr(), t.length_in_bytes()) }.to_vec();
                CObject::TypedData { kind, bytes }
            }
            c if class_id::is_external_typed_data_cid(c) => {
                let Some(kind) = TypedDataKind::from_class_id(c) else {
                    return CObject::Unsupported;
                };
                let t = unsafe { value.as_ref::<ExternalTypedData>() };
                CObject::ExternalTypedData {
                    kind,
                    external: ExternalData {
                        data: t.data as usize,
                        length: t.len(),
                        peer: t.peer,
                    },
                }
            }
            _ => CObject::Unsupported,
        }
    }

    // ── Deserialization ────────────────────────────────────────────

    /// Rebuilds `message` in this isolate's heap.
    pub fn deserialize_message(&mut self, message: &CObject) -> RuntimeResult<Value> {
        if message.is_unsupported() {
            return Err(self.raise_error(ErrorKind::Api, "message contains unsupported objects"));
        }
        let base = self.roots.scratch.len();
        let result = self.decode(message, base);
        self.roots.scratch.truncate(base);
        result
    }

    /// Arrays decoded so far are rooted at `scratch[base..]`, in
    /// encoding order, which is also backref order.
    fn decode(&mut self, message: &CObject, base: usize) -> RuntimeResult<Value> {
        match message {
            CObject::Null => Ok(self.null()),
            CObject::Bool(b) => Ok(self.bool_value(*b)),
            CObject::Int32(n) => self.new_integer(i64::from(*n)),
            CObject::Int64(n) => self.new_integer(*n),
            CObject::Bigint(text) => match bigint::parse(text) {
                Some((negative, digits)) => self.new_bigint(negative, &digits),
                None => Err(self.raise_error(ErrorKind::Api, "malformed bigint in message")),
            },
            CObject::Double(d) => self.new_double(*d),
            CObject::String(s) => self.new_string(s),
            CObject::Array(items) if items.is_empty() => self.new_array(0),
            CObject::Array(items) => {
                let array = self.new_array(items.len())?;
                let slot = self.roots.scratch.len();
                self.roots.scratch.push(array);
                for (i, item) in items.iter().enumerate() {
                    let v = self.decode(item, base)?;
                    let array = self.roots.scratch[slot];
                    self.array_set(array, i, v);
                }
                Ok(self.roots.scratch[slot])
            }
            CObject::Backref(n) => match self.roots.scratch.get(base + *n as usize) {
                Some(&array) => Ok(array),
                None => Err(self.raise_error(ErrorKind::Api, "dangling backref in message")),
            },
            CObject::TypedData { kind, bytes } => {
                let size = kind.element_size();
                if bytes.len() % size != 0 {
                    return Err(self.raise_error(ErrorKind::Api, "typed data length is not a multiple of its element"));
                }
                let data = self.new_typed_data(kind.internal_class_id(), bytes.len() / size)?;
                let t = unsafe { data.as_ref::<TypedData>() };
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), t.data_ptr(), bytes.len()) };
                Ok(data)
            }
            CObject::ExternalTypedData { kind, external } => self.new_external_typed_data(
                kind.external_class_id(),
                external.data as *mut u8,
                external.length,
                external.peer,
            ),
            CObject::Unsupported => Err(self.raise_error(ErrorKind::Api, "unsupported message object")),
        }
    }
}
