//! HPROF 1.0.1 heap dumps.
//!
//! Classes live in the class table rather than the heap, so they get
//! synthetic object ids that can never collide with an object address:
//! heap objects are 8-aligned, smis are odd and synthetic ids are 2 or 4
//! modulo 8. Null is written as id 0 so viewers print it as `null`.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use heap::RootProvider;
use object::{Array, ClassId, ExternalTypedData, TypedData, Value, WORD_SIZE, cid, class_id};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::isolate::Isolate;

const MAGIC: &[u8] = b"JAVA PROFILE 1.0.1\0";
const ID_SIZE: u32 = 8;

mod tag {
    pub const STRING_IN_UTF8: u8 = 0x01;
    pub const LOAD_CLASS: u8 = 0x02;
    pub const STACK_TRACE: u8 = 0x05;
    pub const HEAP_DUMP: u8 = 0x0C;
}

mod sub {
    pub const ROOT_UNKNOWN: u8 = 0xFF;
    pub const CLASS_DUMP: u8 = 0x20;
    pub const INSTANCE_DUMP: u8 = 0x21;
    pub const OBJECT_ARRAY_DUMP: u8 = 0x22;
    pub const PRIMITIVE_ARRAY_DUMP: u8 = 0x23;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum BasicType {
    Object = 2,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl BasicType {
    fn size(self) -> usize {
        match self {
            BasicType::Byte => 1,
            BasicType::Short => 2,
            BasicType::Int | BasicType::Float => 4,
            BasicType::Object | BasicType::Long | BasicType::Double => 8,
        }
    }

    fn of_typed_data(class_id: ClassId) -> Option<BasicType> {
        match class_id::internal_typed_data_cid(class_id) {
            cid::TYPED_DATA_INT8 | cid::TYPED_DATA_UINT8 | cid::TYPED_DATA_UINT8_CLAMPED => Some(BasicType::Byte),
            cid::TYPED_DATA_INT16 | cid::TYPED_DATA_UINT16 => Some(BasicType::Short),
            cid::TYPED_DATA_INT32 | cid::TYPED_DATA_UINT32 => Some(BasicType::Int),
            cid::TYPED_DATA_INT64 | cid::TYPED_DATA_UINT64 => Some(BasicType::Long),
            cid::TYPED_DATA_FLOAT32 => Some(BasicType::Float),
            cid::TYPED_DATA_FLOAT64 => Some(BasicType::Double),
            _ => None,
        }
    }
}

/// Java classes that heap viewers expect to exist.
#[derive(Debug, Clone, Copy)]
enum FakeClass {
    JavaLangClass = 1,
    JavaLangClassLoader,
    JavaLangObject,
    JavaLangString,
    ArrayObject,
    ArrayBoolean,
    ArrayChar,
    ArrayFloat,
    ArrayDouble,
    ArrayByte,
    ArrayShort,
    ArrayInt,
    ArrayLong,
}

impl FakeClass {
    const LOADED: [(FakeClass, &'static str); 13] = [
        (FakeClass::JavaLangClass, "java.lang.Class"),
        (FakeClass::JavaLangClassLoader, "java.lang.ClassLoader"),
        (FakeClass::JavaLangObject, "java.lang.Object"),
        (FakeClass::JavaLangString, "java.lang.String"),
        (FakeClass::ArrayObject, "Object[]"),
        (FakeClass::ArrayBoolean, "bool[]"),
        (FakeClass::ArrayChar, "char[]"),
        (FakeClass::ArrayFloat, "float[]"),
        (FakeClass::ArrayDouble, "double[]"),
        (FakeClass::ArrayByte, "byte[]"),
        (FakeClass::ArrayShort, "short[]"),
        (FakeClass::ArrayInt, "int[]"),
        (FakeClass::ArrayLong, "long[]"),
    ];

    fn id(self) -> u64 {
        ((self as u64) << 3) | 2
    }
}

fn class_object_id(class_id: ClassId) -> u64 {
    ((class_id as u64) << 4) | 4
}

// ── Records ────────────────────────────────────────────────────────

/// A record body; integers are big-endian.
#[derive(Default)]
struct Body(Vec<u8>);

impl Body {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn id(&mut self, id: u64) {
        self.u64(id);
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }
}

struct HeapProfiler<'a> {
    isolate: &'a Isolate,
    records: Vec<u8>,
    dump: Body,
    strings: FxHashSet<u64>,
    names: FxHashMap<String, u64>,
    classes: FxHashSet<ClassId>,
    smis: BTreeSet<u64>,
}

impl<'a> HeapProfiler<'a> {
    fn new(isolate: &'a Isolate) -> Self {
        let mut profiler = HeapProfiler {
            isolate,
            records: Vec::new(),
            dump: Body::default(),
            strings: FxHashSet::default(),
            names: FxHashMap::default(),
            classes: FxHashSet::default(),
            smis: BTreeSet::new(),
        };
        profiler.write_stack_trace();
        for (class, name) in FakeClass::LOADED {
            profiler.write_load_class(class.id(), name);
        }
        profiler.write_fake_class_dump(FakeClass::JavaLangClass, None);
        profiler.write_fake_class_dump(FakeClass::JavaLangClassLoader, Some(FakeClass::JavaLangObject));
        profiler.write_fake_class_dump(FakeClass::JavaLangObject, None);
        profiler.write_fake_class_dump(FakeClass::JavaLangString, Some(FakeClass::JavaLangObject));
        profiler
    }

    fn record(&mut self, tag: u8, body: Body) {
        self.records.push(tag);
        self.records.extend_from_slice(&0u32.to_be_bytes());
        self.records.extend_from_slice(&(body.0.len() as u32).to_be_bytes());
        self.records.extend_from_slice(&body.0);
    }

    // ── Ids ────────────────────────────────────────────────────────

    fn object_id(&mut self, value: Value) -> u64 {
        if value.is_smi() {
            let id = value.raw() | 1;
            self.smis.insert(id);
            return id;
        }
        if value == self.isolate.null() {
            return 0;
        }
        value.addr() as u64
    }

    /// Id of a name that is not a heap string.
    fn name_id(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.names.get(name) {
            return id;
        }
        let id = ((self.names.len() as u64 + 1) << 3) | 4 | (1 << 63);
        self.names.insert(name.to_owned(), id);
        self.write_string(id, name);
        id
    }

    fn string_object_id(&mut self, value: Value) -> u64 {
        let id = value.addr() as u64;
        if self.strings.insert(id) {
            let text = self.isolate.string_value(value).unwrap_or_default();
            self.write_string(id, &text);
        }
        id
    }

    fn class_id(&mut self, class_id: ClassId) -> u64 {
        let id = class_object_id(class_id);
        if self.classes.insert(class_id) {
            let name = match self.isolate.class_table().get(class_id) {
                Some(class) => class.name.clone(),
                None => format!("<an unnamed class with id {class_id}>"),
            };
            self.write_load_class(id, &name);
        }
        id
    }

    // ── Top-level records ──────────────────────────────────────────

    fn write_string(&mut self, id: u64, text: &str) {
        let mut body = Body::default();
        body.id(id);
        body.bytes(text.as_bytes());
        self.record(tag::STRING_IN_UTF8, body);
    }

    fn write_load_class(&mut self, id: u64, name: &str) {
        let name = self.name_id(name);
        let mut body = Body::default();
        body.u32(1);
        body.id(id);
        body.u32(0);
        body.id(name);
        self.record(tag::LOAD_CLASS, body);
    }

    fn write_stack_trace(&mut self) {
        let mut body = Body::default();
        body.u32(0);
        body.u32(0);
        body.u32(0);
        self.record(tag::STACK_TRACE, body);
    }

    // ── Heap dump sub-records ──────────────────────────────────────

    fn write_fake_class_dump(&mut self, class: FakeClass, super_class: Option<FakeClass>) {
        self.dump.u8(sub::CLASS_DUMP);
        self.dump.id(class.id());
        self.dump.u32(0);
        self.dump.id(super_class.map_or(0, FakeClass::id));
        for _ in 0..5 {
            self.dump.id(0);
        }
        self.dump.u32(0);
        self.dump.u16(0);
        self.dump.u16(0);
        self.dump.u16(0);
    }

    fn write_root(&mut self, value: Value) {
        let id = self.object_id(value);
        self.dump.u8(sub::ROOT_UNKNOWN);
        self.dump.id(id);
    }

    fn write_class_dump(&mut self, class_id: ClassId) {
        let isolate = self.isolate;
        let Some(class) = isolate.class_table().get(class_id) else {
            return;
        };
        let id = self.class_id(class_id);
        let super_id = match class.super_class {
            Some(parent) => self.class_id(parent),
            None => 0,
        };
        let (statics, instance): (Vec<_>, Vec<_>) = class
            .fields
            .iter()
            .map(|&f| isolate.field(f))
            .partition(|field| field.is_static());
        let instance_size = isolate
            .class_table()
            .superclass_chain(class_id)
            .filter_map(|c| isolate.class_table().get(c))
            .flat_map(|c| c.fields.iter())
            .filter(|&&f| !isolate.field(f).is_static())
            .count()
            * WORD_SIZE;

        let static_entries: Vec<_> = statics
            .iter()
            .map(|field| (self.name_id(&field.name), isolate.static_value(field.id)))
            .collect();
        let instance_names: Vec<_> = instance.iter().map(|field| self.name_id(&field.name)).collect();
        let static_entries: Vec<_> = static_entries
            .into_iter()
            .map(|(name, value)| (name, self.object_id(value)))
            .collect();

        self.dump.u8(sub::CLASS_DUMP);
        self.dump.id(id);
        self.dump.u32(0);
        self.dump.id(super_id);
        for _ in 0..5 {
            self.dump.id(0);
        }
        self.dump.u32(instance_size as u32);
        self.dump.u16(0);
        self.dump.u16(static_entries.len() as u16);
        for (name, value) in static_entries {
            self.dump.id(name);
            self.dump.u8(BasicType::Object as u8);
            self.dump.id(value);
        }
        self.dump.u16(instance_names.len() as u16);
        for name in instance_names {
            self.dump.id(name);
            self.dump.u8(BasicType::Object as u8);
        }
    }

    fn write_object(&mut self, value: Value) {
        let class_id = self.isolate.class_id_of(value);
        match class_id {
            cid::FREE_LIST_ELEMENT | cid::FORWARDING_CORPSE => {}
            cid::ARRAY | cid::IMMUTABLE_ARRAY => self.write_object_array_dump(value),
            c if class_id::is_string_cid(c) => {
                let id = self.string_object_id(value);
                self.write_instance_dump(value, id);
            }
            c if class_id::is_typed_data_cid(c) => match BasicType::of_typed_data(c) {
                Some(element) => self.write_primitive_array_dump(value, element),
                None => self.write_instance_dump(value, value.addr() as u64),
            },
            _ => self.write_instance_dump(value, value.addr() as u64),
        }
    }

    fn write_instance_dump(&mut self, value: Value, id: u64) {
        let isolate = self.isolate;
        let class_id = isolate.class_id_of(value);
        let class = self.class_id(class_id);
        let offsets: Vec<usize> = isolate
            .class_table()
            .superclass_chain(class_id)
            .filter_map(|c| isolate.class_table().get(c))
            .flat_map(|c| c.fields.iter().map(|&f| isolate.field(f)))
            .filter(|field| !field.is_static())
            .map(|field| field.offset)
            .collect();
        let fields: Vec<u64> = offsets
            .into_iter()
            .map(|offset| {
                let slot = unsafe { *((value.addr() + offset) as *const Value) };
                self.object_id(slot)
            })
            .collect();

        self.dump.u8(sub::INSTANCE_DUMP);
        self.dump.id(id);
        self.dump.u32(0);
        self.dump.id(class);
        self.dump.u32((fields.len() * ID_SIZE as usize) as u32);
        for field in fields {
            self.dump.id(field);
        }
    }

    fn write_smi_instance_dump(&mut self, id: u64) {
        let class = self.class_id(cid::SMI);
        self.dump.u8(sub::INSTANCE_DUMP);
        self.dump.id(id);
        self.dump.u32(0);
        self.dump.id(class);
        self.dump.u32(0);
    }

    fn write_object_array_dump(&mut self, value: Value) {
        let array = unsafe { value.as_ref::<Array>() };
        let elements: Vec<u64> = (0..array.len()).map(|i| self.object_id(array.at(i))).collect();
        self.dump.u8(sub::OBJECT_ARRAY_DUMP);
        self.dump.id(value.addr() as u64);
        self.dump.u32(0);
        self.dump.u32(elements.len() as u32);
        self.dump.id(FakeClass::ArrayObject.id());
        for element in elements {
            self.dump.id(element);
        }
    }

    fn write_primitive_array_dump(&mut self, value: Value, element: BasicType) {
        let class_id = self.isolate.class_id_of(value);
        let (data, length) = if class_id::is_external_typed_data_cid(class_id) {
            let t = unsafe { value.as_ref::<ExternalTypedData>() };
            (t.data as *const u8, t.len())
        } else {
            let t = unsafe { value.as_ref::<TypedData>() };
            (t.data_ptr() as *const u8, t.len())
        };
        self.dump.u8(sub::PRIMITIVE_ARRAY_DUMP);
        self.dump.id(value.addr() as u64);
        self.dump.u32(0);
        self.dump.u32(length as u32);
        self.dump.u8(element as u8);
        let size = element.size();
        for i in 0..length {
            let bytes = unsafe { std::slice::from_raw_parts(data.add(i * size), size) };
            // Stored little-endian; the dump is big-endian.
            for &b in bytes.iter().rev() {
                self.dump.u8(b);
            }
        }
    }

    fn finish(mut self, out: &mut dyn Write) -> io::Result<()> {
        let smis: Vec<u64> = self.smis.iter().copied().collect();
        for id in smis {
            self.write_smi_instance_dump(id);
        }
        let dump = std::mem::take(&mut self.dump);
        self.record(tag::HEAP_DUMP, dump);

        let millis = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64);
        out.write_all(MAGIC)?;
        out.write_all(&ID_SIZE.to_be_bytes())?;
        out.write_all(&((millis >> 32) as u32).to_be_bytes())?;
        out.write_all(&(millis as u32).to_be_bytes())?;
        out.write_all(&self.records)?;
        out.flush()
    }
}

impl Isolate {
    /// Collects all garbage, then writes every root, class and live
    /// object to `out` as an HPROF 1.0.1 dump.
    pub fn heap_profile(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.collect_all_garbage();
        let mut roots = Vec::new();
        self.roots.visit_roots(true, &mut |v| roots.push(*v));
        self.roots.visit_weak_roots(true, &mut |v| {
            roots.push(*v);
            true
        });

        let mut profiler = HeapProfiler::new(self);
        let class_ids: Vec<ClassId> = self.class_table().iter().map(|c| c.id).collect();
        for class_id in class_ids {
            profiler.write_class_dump(class_id);
        }
        for root in roots {
            profiler.write_root(root);
        }
        self.heap().iterate_objects(&mut |obj| profiler.write_object(obj));
        log::debug!(
            "heap profile: {} classes, {} strings, {} bytes of records",
            profiler.classes.len(),
            profiler.strings.len() + profiler.names.len(),
            profiler.records.len() + profiler.dump.0.len()
        );
        profiler.finish(out)
    }
}

#[cfg(test)]
mod tests {
    use heap::Space;

    use super::*;
    use crate::class_table::Class;
    use crate::function::FieldFlags;
    use crate::runtime::{Runtime, RuntimeConfig};

    fn with_isolate<R>(f: impl FnOnce(&mut Isolate) -> R) -> R {
        let _ = env_logger::builder().is_test(true).try_init();
        let runtime = Runtime::initialize(RuntimeConfig::default()).unwrap();
        let handle = runtime.create_isolate("hprof", 0).unwrap();
        let result = handle.with(f).unwrap();
        handle.shutdown().unwrap();
        result
    }

    fn be_u32(bytes: &[u8]) -> u32 {
        u32::from_be_bytes(bytes[..4].try_into().unwrap())
    }

    fn be_u64(bytes: &[u8]) -> u64 {
        u64::from_be_bytes(bytes[..8].try_into().unwrap())
    }

    /// Splits a dump into `(tag, body)` records after checking the header.
    fn records(dump: &[u8]) -> Vec<(u8, &[u8])> {
        assert!(dump.starts_with(MAGIC));
        let mut rest = &dump[MAGIC.len()..];
        assert_eq!(be_u32(rest), 8);
        rest = &rest[12..];
        let mut out = Vec::new();
        while !rest.is_empty() {
            let tag = rest[0];
            let len = be_u32(&rest[5..]) as usize;
            out.push((tag, &rest[9..9 + len]));
            rest = &rest[9 + len..];
        }
        out
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn dump_is_well_formed() {
        let dump = with_isolate(|isolate| {
            let mut out = Vec::new();
            isolate.heap_profile(&mut out).unwrap();
            out
        });
        let records = records(&dump);
        assert_eq!(records.iter().filter(|(tag, _)| *tag == tag::HEAP_DUMP).count(), 1);
        assert!(records.iter().any(|(tag, _)| *tag == tag::STACK_TRACE));
        let names: Vec<&[u8]> = records
            .iter()
            .filter(|(tag, _)| *tag == tag::STRING_IN_UTF8)
            .map(|(_, body)| &body[8..])
            .collect();
        assert!(names.contains(&&b"java.lang.Object"[..]));
        assert!(names.contains(&&b"Object[]"[..]));
    }

    #[test]
    fn arrays_instances_and_typed_data_are_dumped() {
        with_isolate(|isolate| {
            let point = isolate.register_class(Class::new("Point", None));
            isolate.add_field(point, "x", FieldFlags::empty()).unwrap();
            isolate.finalize_class(point).unwrap();

            let array = isolate.new_array_in(2, Space::Old).unwrap();
            let keep = isolate.roots.api.new_persistent(array);
            let instance = isolate.new_instance(point).unwrap();
            let array = isolate.roots.api.get(keep).unwrap();
            isolate.array_set(array, 0, instance);
            let words = isolate.new_typed_data(cid::TYPED_DATA_UINT16, 1).unwrap();
            unsafe { *words.as_ref::<TypedData>().data_ptr().cast::<u16>() = 0x0102 };
            let array = isolate.roots.api.get(keep).unwrap();
            isolate.array_set(array, 1, words);

            let mut out = Vec::new();
            isolate.heap_profile(&mut out).unwrap();
            let array = isolate.roots.api.get(keep).unwrap();
            let instance = isolate.array_at(array, 0);
            let words = isolate.array_at(array, 1);

            let records = records(&out);
            let (_, dump) = records.iter().find(|(tag, _)| *tag == tag::HEAP_DUMP).unwrap();

            let mut array_dump = vec![sub::OBJECT_ARRAY_DUMP];
            array_dump.extend_from_slice(&(array.addr() as u64).to_be_bytes());
            array_dump.extend_from_slice(&0u32.to_be_bytes());
            array_dump.extend_from_slice(&2u32.to_be_bytes());
            array_dump.extend_from_slice(&FakeClass::ArrayObject.id().to_be_bytes());
            array_dump.extend_from_slice(&(instance.addr() as u64).to_be_bytes());
            array_dump.extend_from_slice(&(words.addr() as u64).to_be_bytes());
            assert!(contains(dump, &array_dump));

            let mut instance_dump = vec![sub::INSTANCE_DUMP];
            instance_dump.extend_from_slice(&(instance.addr() as u64).to_be_bytes());
            instance_dump.extend_from_slice(&0u32.to_be_bytes());
            instance_dump.extend_from_slice(&class_object_id(point).to_be_bytes());
            instance_dump.extend_from_slice(&8u32.to_be_bytes());
            instance_dump.extend_from_slice(&0u64.to_be_bytes());
            assert!(contains(dump, &instance_dump));

            let mut words_dump = vec![sub::PRIMITIVE_ARRAY_DUMP];
            words_dump.extend_from_slice(&(words.addr() as u64).to_be_bytes());
            words_dump.extend_from_slice(&0u32.to_be_bytes());
            words_dump.extend_from_slice(&1u32.to_be_bytes());
            words_dump.extend_from_slice(&[BasicType::Short as u8, 0x01, 0x02]);
            assert!(contains(dump, &words_dump));

            let load_class = records
                .iter()
                .filter(|(tag, _)| *tag == tag::LOAD_CLASS)
                .any(|(_, body)| be_u64(&body[4..]) == class_object_id(point));
            assert!(load_class);
        });
    }
}
