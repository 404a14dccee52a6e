mod value;
mod handle;
mod header;
mod layout;
pub mod class_id;

pub use value::{
    NEW_OBJECT_ALIGNMENT_OFFSET, OBJECT_ALIGNMENT, OBJECT_ALIGNMENT_MASK,
    OLD_OBJECT_ALIGNMENT_OFFSET, SMI_MAX, SMI_MIN, Value, WORD_SIZE,
    needs_no_barrier, round_up_to_alignment,
};
pub use handle::Tagged;
pub use header::{Header, HeaderFlags, MAX_SIZE_TAG};
pub use class_id::{ClassId, cid};
pub use layout::{
    Array, Bigint, Bool, Closure, Context, Double, ExternalString,
    ExternalTypedData, FreeListElement, GrowableObjectArray, Instance,
    Instructions, MessageError, Mint, Null, OneByteString, Port, RegExp,
    Stacktrace, StringHeader, TwoByteString, TypeArguments, TypedData,
    UnhandledException, WeakProperty, object_size, visit_pointers,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(16))]
    struct Buffer([u64; 64]);

    impl Buffer {
        fn new() -> Box<Self> {
            Box::new(Buffer([0; 64]))
        }

        fn addr(&self) -> usize {
            self.0.as_ptr() as usize
        }
    }

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn smi_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, SMI_MAX, SMI_MIN] {
            let v = Value::from_i64(n);
            assert!(v.is_smi());
            assert!(!v.is_heap_object());
            assert_eq!(v.to_i64(), n);
        }
    }

    #[test]
    fn smi_zero_is_zero_bits() {
        assert_eq!(Value::from_i64(0).raw(), 0);
    }

    #[test]
    fn smi_range_rejects_overflow() {
        assert!(Value::try_from_i64(SMI_MAX + 1).is_none());
        assert!(Value::try_from_i64(SMI_MIN - 1).is_none());
        assert!(Value::try_from_i64(SMI_MAX).is_some());
    }

    #[test]
    fn heap_object_tagging() {
        let buf = Buffer::new();
        let v = Value::from_addr(buf.addr());
        assert!(v.is_heap_object());
        assert!(!v.is_smi());
        assert_eq!(v.addr(), buf.addr());
    }

    #[test]
    fn generation_from_alignment() {
        let buf = Buffer::new();
        let old = Value::from_addr(buf.addr());
        let young = Value::from_addr(buf.addr() + NEW_OBJECT_ALIGNMENT_OFFSET);
        assert!(old.is_old_object());
        assert!(!old.is_new_object());
        assert!(young.is_new_object());
        assert!(!young.is_old_object());
        assert!(!Value::from_i64(8).is_new_object());
    }

    #[test]
    fn barrier_test_only_fires_for_old_to_young() {
        let buf = Buffer::new();
        let old = Value::from_addr(buf.addr());
        let young = Value::from_addr(buf.addr() + 32 + NEW_OBJECT_ALIGNMENT_OFFSET);
        assert!(!needs_no_barrier(old, young));
        assert!(needs_no_barrier(young, young));
        assert!(needs_no_barrier(old, old));
        assert!(needs_no_barrier(young, old));
    }

    // ── Tagged ─────────────────────────────────────────────────────

    #[test]
    fn tagged_smi_helpers() {
        let t = Tagged::<()>::from_value(Value::from_i64(42));
        assert!(t.is_smi());
        unsafe {
            assert_eq!(t.as_i64(), 42);
            assert_eq!(t.as_usize(), 42);
            assert_eq!(t.class_id(), cid::SMI);
        }
    }

    #[test]
    fn tagged_reports_header_class() {
        let buf = Buffer::new();
        unsafe { Header::initialize(buf.addr(), cid::DOUBLE, 16) };
        let t = Tagged::<Double>::from_value(Value::from_addr(buf.addr()));
        assert_eq!(unsafe { t.class_id() }, cid::DOUBLE);
    }

    // ── Header ─────────────────────────────────────────────────────

    #[test]
    fn header_encodes_class_and_size() {
        let h = Header::new(cid::ARRAY, 48);
        assert_eq!(h.class_id(), cid::ARRAY);
        assert_eq!(h.size_tag(), 48);
        assert!(!h.is_forwarded());
    }

    #[test]
    fn oversized_header_has_zero_size_tag() {
        let h = Header::new(cid::ARRAY, MAX_SIZE_TAG + OBJECT_ALIGNMENT);
        assert_eq!(h.size_tag(), 0);
        assert_eq!(h.class_id(), cid::ARRAY);
    }

    #[test]
    fn oversized_instance_keeps_its_size() {
        let size = MAX_SIZE_TAG + 4 * OBJECT_ALIGNMENT;
        let h = Header::new(cid::NUM_PREDEFINED + 1, size);
        assert_eq!(h.size_tag(), 0);
        assert_eq!(h.instance_size(), size);
        assert_eq!(h.class_id(), cid::NUM_PREDEFINED + 1);
        h.set_mark();
        h.set_remembered();
        assert_eq!(h.instance_size(), size);
        assert_eq!(Header::new(cid::ARRAY, size).instance_size(), 0);
    }

    #[test]
    fn header_flags_are_independent() {
        let h = Header::new(cid::CONTEXT, 32);
        assert!(!h.is_marked());
        h.set_mark();
        h.set_canonical();
        assert!(h.is_marked());
        assert!(h.is_canonical());
        h.clear_mark();
        assert!(!h.is_marked());
        assert!(h.is_canonical());
        assert_eq!(h.class_id(), cid::CONTEXT);
    }

    #[test]
    fn fetch_or_reports_previous_remembered_state() {
        let h = Header::new(cid::ARRAY, 32);
        let prev = h.fetch_or_flags(HeaderFlags::REMEMBERED);
        assert!(!prev.contains(HeaderFlags::REMEMBERED));
        let prev = h.fetch_or_flags(HeaderFlags::REMEMBERED);
        assert!(prev.contains(HeaderFlags::REMEMBERED));
        h.clear_remembered();
        assert!(!h.is_remembered());
    }

    #[test]
    fn forwarding_round_trip() {
        let buf = Buffer::new();
        let h = Header::new(cid::DOUBLE, 16);
        h.forward_to(buf.addr());
        assert!(h.is_forwarded());
        assert_eq!(h.forwarding_address(), buf.addr());
    }

    // ── Layouts ────────────────────────────────────────────────────

    #[test]
    fn array_allocation_sizes() {
        assert_eq!(Array::allocation_size(0), 32);
        assert_eq!(Array::allocation_size(1), 32);
        assert_eq!(Array::allocation_size(2), 48);
    }

    #[test]
    fn array_visit_covers_type_args_and_elements() {
        let buf = Buffer::new();
        let size = Array::allocation_size(3);
        unsafe {
            Header::initialize(buf.addr(), cid::ARRAY, size);
            let array = &mut *(buf.addr() as *mut Array);
            array.type_arguments = Value::from_i64(0);
            array.length = Value::from_usize(3);
            for i in 0..3 {
                array.set_at_raw(i, Value::from_i64(i as i64 + 10));
            }
            assert_eq!(object_size(buf.addr() as *const u8), size);
            let mut seen = Vec::new();
            visit_pointers(buf.addr() as *const u8, &mut |v| seen.push(*v));
            assert_eq!(seen.len(), 4);
            assert_eq!(seen[1..], [
                Value::from_i64(10),
                Value::from_i64(11),
                Value::from_i64(12)
            ]);
        }
    }

    #[test]
    fn oversized_array_size_comes_from_length() {
        let length = 600;
        let size = Array::allocation_size(length);
        let mut backing = vec![0u64; size / 8 + 2];
        let addr = round_up_to_alignment(backing.as_mut_ptr() as usize);
        unsafe {
            Header::initialize(addr, cid::ARRAY, size);
            (*(addr as *mut Array)).length = Value::from_usize(length);
            assert_eq!(Header::from_addr(addr).size_tag(), 0);
            assert_eq!(object_size(addr as *const u8), size);
        }
    }

    #[test]
    fn strings_have_no_pointers() {
        let buf = Buffer::new();
        let size = OneByteString::allocation_size(5);
        unsafe {
            Header::initialize(buf.addr(), cid::ONE_BYTE_STRING, size);
            let s = &*(buf.addr() as *const OneByteString);
            (*(buf.addr() as *mut StringHeader)).length = Value::from_usize(5);
            s.bytes_mut().copy_from_slice(b"hello");
            assert_eq!(s.bytes(), b"hello");
            let mut count = 0;
            visit_pointers(buf.addr() as *const u8, &mut |_| count += 1);
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn instance_visits_every_field() {
        let buf = Buffer::new();
        unsafe {
            Header::initialize(buf.addr(), cid::NUM_PREDEFINED + 3, 48);
            let mut count = 0;
            visit_pointers(buf.addr() as *const u8, &mut |_| count += 1);
            assert_eq!(count, 5);
        }
    }

    #[test]
    fn typed_data_size_scales_with_element() {
        assert_eq!(TypedData::allocation_size(cid::TYPED_DATA_UINT8, 16), 32);
        assert_eq!(TypedData::allocation_size(cid::TYPED_DATA_FLOAT64, 2), 32);
        assert_eq!(TypedData::allocation_size(cid::TYPED_DATA_INT32, 0), 16);
    }

    #[test]
    fn free_list_element_records_large_sizes() {
        let size = MAX_SIZE_TAG * 2;
        let mut backing = vec![0u64; size / 8 + 2];
        let addr = round_up_to_alignment(backing.as_mut_ptr() as usize);
        unsafe {
            let elem = &*FreeListElement::initialize(addr, size);
            assert_eq!(elem.size(), size);
            assert_eq!(object_size(addr as *const u8), size);
        }
    }

    #[test]
    fn instructions_entry_round_trip() {
        let buf = Buffer::new();
        unsafe {
            Header::initialize(buf.addr(), cid::INSTRUCTIONS, Instructions::allocation_size(8));
            let ins = &mut *(buf.addr() as *mut Instructions);
            ins.size = Value::from_usize(8);
            let entry = ins.entry_point();
            assert_eq!(entry, buf.addr() + Instructions::HEADER_SIZE);
            let back = Instructions::from_entry_point(entry);
            assert_eq!(back as *const Instructions as usize, buf.addr());
            assert_eq!(back.payload().len(), 8);
        }
    }

    // ── Class ids ──────────────────────────────────────────────────

    #[test]
    fn typed_data_cid_mapping() {
        assert_eq!(
            class_id::external_typed_data_cid(cid::TYPED_DATA_INT16),
            cid::EXTERNAL_TYPED_DATA_INT16
        );
        assert_eq!(
            class_id::internal_typed_data_cid(cid::EXTERNAL_TYPED_DATA_FLOAT64),
            cid::TYPED_DATA_FLOAT64
        );
        assert_eq!(class_id::element_size(cid::EXTERNAL_TYPED_DATA_UINT32), 4);
        assert!(class_id::is_user_cid(cid::NUM_PREDEFINED));
        assert!(!class_id::is_user_cid(cid::DYNAMIC));
    }
}
