/// Index into an isolate's class table.
pub type ClassId = u16;

/// Reserved class ids for the built-in object kinds.
///
/// User classes are registered from [`cid::NUM_PREDEFINED`] upward.
pub mod cid {
    use super::ClassId;

    pub const ILLEGAL: ClassId = 0;
    pub const FREE_LIST_ELEMENT: ClassId = 1;
    pub const FORWARDING_CORPSE: ClassId = 2;
    pub const CLASS: ClassId = 3;
    pub const FUNCTION: ClassId = 4;
    pub const FIELD: ClassId = 5;
    pub const CODE: ClassId = 6;
    pub const INSTRUCTIONS: ClassId = 7;
    pub const CONTEXT: ClassId = 8;
    pub const CLOSURE: ClassId = 9;
    pub const API_ERROR: ClassId = 10;
    pub const LANGUAGE_ERROR: ClassId = 11;
    pub const UNHANDLED_EXCEPTION: ClassId = 12;
    pub const UNWIND_ERROR: ClassId = 13;
    pub const STACKTRACE: ClassId = 14;
    pub const NULL: ClassId = 15;
    pub const BOOL: ClassId = 16;
    pub const SMI: ClassId = 17;
    pub const MINT: ClassId = 18;
    pub const BIGINT: ClassId = 19;
    pub const DOUBLE: ClassId = 20;
    pub const ARRAY: ClassId = 21;
    pub const IMMUTABLE_ARRAY: ClassId = 22;
    pub const GROWABLE_OBJECT_ARRAY: ClassId = 23;
    pub const ONE_BYTE_STRING: ClassId = 24;
    pub const TWO_BYTE_STRING: ClassId = 25;
    pub const EXTERNAL_ONE_BYTE_STRING: ClassId = 26;
    pub const EXTERNAL_TWO_BYTE_STRING: ClassId = 27;

    pub const TYPED_DATA_INT8: ClassId = 28;
    pub const TYPED_DATA_UINT8: ClassId = 29;
    pub const TYPED_DATA_UINT8_CLAMPED: ClassId = 30;
    pub const TYPED_DATA_INT16: ClassId = 31;
    pub const TYPED_DATA_UINT16: ClassId = 32;
    pub const TYPED_DATA_INT32: ClassId = 33;
    pub const TYPED_DATA_UINT32: ClassId = 34;
    pub const TYPED_DATA_INT64: ClassId = 35;
    pub const TYPED_DATA_UINT64: ClassId = 36;
    pub const TYPED_DATA_FLOAT32: ClassId = 37;
    pub const TYPED_DATA_FLOAT64: ClassId = 38;

    pub const EXTERNAL_TYPED_DATA_INT8: ClassId = 39;
    pub const EXTERNAL_TYPED_DATA_UINT8: ClassId = 40;
    pub const EXTERNAL_TYPED_DATA_UINT8_CLAMPED: ClassId = 41;
    pub const EXTERNAL_TYPED_DATA_INT16: ClassId = 42;
    pub const EXTERNAL_TYPED_DATA_UINT16: ClassId = 43;
    pub const EXTERNAL_TYPED_DATA_INT32: ClassId = 44;
    pub const EXTERNAL_TYPED_DATA_UINT32: ClassId = 45;
    pub const EXTERNAL_TYPED_DATA_INT64: ClassId = 46;
    pub const EXTERNAL_TYPED_DATA_UINT64: ClassId = 47;
    pub const EXTERNAL_TYPED_DATA_FLOAT32: ClassId = 48;
    pub const EXTERNAL_TYPED_DATA_FLOAT64: ClassId = 49;

    pub const WEAK_PROPERTY: ClassId = 50;
    pub const REGEXP: ClassId = 51;
    pub const SEND_PORT: ClassId = 52;
    pub const RECEIVE_PORT: ClassId = 53;
    pub const LIBRARY: ClassId = 54;
    pub const SCRIPT: ClassId = 55;
    pub const TYPE_ARGUMENTS: ClassId = 56;

    /// First id handed out to user classes.
    pub const NUM_PREDEFINED: ClassId = 57;

    /// Field-guard sentinel: any class may be stored.
    pub const DYNAMIC: ClassId = 0xFFFF;

    pub const NUM_TYPED_DATA_KINDS: ClassId =
        EXTERNAL_TYPED_DATA_INT8 - TYPED_DATA_INT8;
}

pub fn class_name(class_id: ClassId) -> &'static str {
    use cid::*;
    match class_id {
        ILLEGAL => "Illegal",
        FREE_LIST_ELEMENT => "FreeListElement",
        FORWARDING_CORPSE => "ForwardingCorpse",
        CLASS => "Class",
        FUNCTION => "Function",
        FIELD => "Field",
        CODE => "Code",
        INSTRUCTIONS => "Instructions",
        CONTEXT => "Context",
        CLOSURE => "Closure",
        API_ERROR => "ApiError",
        LANGUAGE_ERROR => "LanguageError",
        UNHANDLED_EXCEPTION => "UnhandledException",
        UNWIND_ERROR => "UnwindError",
        STACKTRACE => "Stacktrace",
        NULL => "Null",
        BOOL => "Bool",
        SMI => "Smi",
        MINT => "Mint",
        BIGINT => "Bigint",
        DOUBLE => "Double",
        ARRAY => "Array",
        IMMUTABLE_ARRAY => "ImmutableArray",
        GROWABLE_OBJECT_ARRAY => "GrowableObjectArray",
        ONE_BYTE_STRING => "OneByteString",
        TWO_BYTE_STRING => "TwoByteString",
        EXTERNAL_ONE_BYTE_STRING => "ExternalOneByteString",
        EXTERNAL_TWO_BYTE_STRING => "ExternalTwoByteString",
        TYPED_DATA_INT8 => "Int8List",
        TYPED_DATA_UINT8 => "Uint8List",
        TYPED_DATA_UINT8_CLAMPED => "Uint8ClampedList",
        TYPED_DATA_INT16 => "Int16List",
        TYPED_DATA_UINT16 => "Uint16List",
        TYPED_DATA_INT32 => "Int32List",
        TYPED_DATA_UINT32 => "Uint32List",
        TYPED_DATA_INT64 => "Int64List",
        TYPED_DATA_UINT64 => "Uint64List",
        TYPED_DATA_FLOAT32 => "Float32List",
        TYPED_DATA_FLOAT64 => "Float64List",
        EXTERNAL_TYPED_DATA_INT8 => "ExternalInt8List",
        EXTERNAL_TYPED_DATA_UINT8 => "ExternalUint8List",
        EXTERNAL_TYPED_DATA_UINT8_CLAMPED => "ExternalUint8ClampedList",
        EXTERNAL_TYPED_DATA_INT16 => "ExternalInt16List",
        EXTERNAL_TYPED_DATA_UINT16 => "ExternalUint16List",
        EXTERNAL_TYPED_DATA_INT32 => "ExternalInt32List",
        EXTERNAL_TYPED_DATA_UINT32 => "ExternalUint32List",
        EXTERNAL_TYPED_DATA_INT64 => "ExternalInt64List",
        EXTERNAL_TYPED_DATA_UINT64 => "ExternalUint64List",
        EXTERNAL_TYPED_DATA_FLOAT32 => "ExternalFloat32List",
        EXTERNAL_TYPED_DATA_FLOAT64 => "ExternalFloat64List",
        WEAK_PROPERTY => "WeakProperty",
        REGEXP => "RegExp",
        SEND_PORT => "SendPort",
        RECEIVE_PORT => "ReceivePort",
        LIBRARY => "Library",
        SCRIPT => "Script",
        TYPE_ARGUMENTS => "TypeArguments",
        DYNAMIC => "dynamic",
        _ => "Instance",
    }
}

#[inline]
pub const fn is_string_cid(class_id: ClassId) -> bool {
    class_id >= cid::ONE_BYTE_STRING
        && class_id <= cid::EXTERNAL_TWO_BYTE_STRING
}

#[inline]
pub const fn is_one_byte_string_cid(class_id: ClassId) -> bool {
    class_id == cid::ONE_BYTE_STRING
        || class_id == cid::EXTERNAL_ONE_BYTE_STRING
}

#[inline]
pub const fn is_external_string_cid(class_id: ClassId) -> bool {
    class_id == cid::EXTERNAL_ONE_BYTE_STRING
        || class_id == cid::EXTERNAL_TWO_BYTE_STRING
}

#[inline]
pub const fn is_internal_typed_data_cid(class_id: ClassId) -> bool {
    class_id >= cid::TYPED_DATA_INT8 && class_id <= cid::TYPED_DATA_FLOAT64
}

#[inline]
pub const fn is_external_typed_data_cid(class_id: ClassId) -> bool {
    class_id >= cid::EXTERNAL_TYPED_DATA_INT8
        && class_id <= cid::EXTERNAL_TYPED_DATA_FLOAT64
}

#[inline]
pub const fn is_typed_data_cid(class_id: ClassId) -> bool {
    is_internal_typed_data_cid(class_id) || is_external_typed_data_cid(class_id)
}

#[inline]
pub const fn is_array_cid(class_id: ClassId) -> bool {
    class_id == cid::ARRAY || class_id == cid::IMMUTABLE_ARRAY
}

#[inline]
pub const fn is_integer_cid(class_id: ClassId) -> bool {
    class_id == cid::SMI || class_id == cid::MINT || class_id == cid::BIGINT
}

#[inline]
pub const fn is_number_cid(class_id: ClassId) -> bool {
    is_integer_cid(class_id) || class_id == cid::DOUBLE
}

#[inline]
pub const fn is_error_cid(class_id: ClassId) -> bool {
    class_id >= cid::API_ERROR && class_id <= cid::UNWIND_ERROR
}

#[inline]
pub const fn is_user_cid(class_id: ClassId) -> bool {
    class_id >= cid::NUM_PREDEFINED && class_id != cid::DYNAMIC
}

/// Maps an external typed-data id to its internal twin and back.
#[inline]
pub const fn internal_typed_data_cid(class_id: ClassId) -> ClassId {
    if is_external_typed_data_cid(class_id) {
        class_id - cid::NUM_TYPED_DATA_KINDS
    } else {
        class_id
    }
}

#[inline]
pub const fn external_typed_data_cid(class_id: ClassId) -> ClassId {
    if is_internal_typed_data_cid(class_id) {
        class_id + cid::NUM_TYPED_DATA_KINDS
    } else {
        class_id
    }
}

/// Element size in bytes of a typed-data class.
pub const fn element_size(class_id: ClassId) -> usize {
    use cid::*;
    match internal_typed_data_cid(class_id) {
        TYPED_DATA_INT8 | TYPED_DATA_UINT8 | TYPED_DATA_UINT8_CLAMPED => 1,
        TYPED_DATA_INT16 | TYPED_DATA_UINT16 => 2,
        TYPED_DATA_INT32 | TYPED_DATA_UINT32 | TYPED_DATA_FLOAT32 => 4,
        TYPED_DATA_INT64 | TYPED_DATA_UINT64 | TYPED_DATA_FLOAT64 => 8,
        _ => 0,
    }
}
