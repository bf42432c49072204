use proptest::prelude::*;

use tidemark_types::{
    Csr, GcnEvent, RSEG_ID_MAX, SLOT_OFFSET_LIMIT, SlotAddr, SlotPtr, UndoPtr, UndoPtrParts,
};

fn slot_strategy() -> impl Strategy<Value = SlotAddr> {
    prop_oneof![
        Just(SlotAddr::NULL),
        Just(SlotAddr::NO_REDO),
        (1_u8..=RSEG_ID_MAX, any::<u32>(), 0_u16..SLOT_OFFSET_LIMIT)
            .prop_map(|(rseg, page, off)| SlotAddr::new(rseg, page, off)),
    ]
}

fn parts_strategy() -> impl Strategy<Value = UndoPtrParts> {
    (slot_strategy(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(slot, committed, assigned, is_slave)| UndoPtrParts {
            slot,
            committed,
            csr: Csr::from_bit(assigned),
            is_slave,
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 2_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_undo_ptr_decode_encode_identity(parts in parts_strategy()) {
        let ptr = UndoPtr::encode(parts);
        prop_assert_eq!(ptr.decode(), parts);
        prop_assert_eq!(UndoPtr::from_raw(ptr.raw()), ptr);
    }

    #[test]
    fn prop_sentinels_never_decode_as_real_segment(parts in parts_strategy()) {
        let slot = UndoPtr::encode(parts).slot_addr();
        prop_assert_eq!(slot.is_real(), !slot.is_null() && !slot.is_no_redo());
        if slot.is_real() {
            prop_assert!(slot.rseg_id >= 1);
        }
    }

    #[test]
    fn prop_commit_only_touches_flag_bits(
        parts in parts_strategy(),
        assigned in any::<bool>(),
        is_slave in any::<bool>(),
    ) {
        let ptr = UndoPtr::encode(parts);
        let committed = ptr.with_commit(Csr::from_bit(assigned), is_slave);
        prop_assert_eq!(committed.slot_ptr(), ptr.slot_ptr());
        prop_assert!(committed.is_committed());
        prop_assert_eq!(committed.with_commit(Csr::from_bit(assigned), is_slave), committed);
    }

    #[test]
    fn prop_slot_ptr_roundtrip(slot in slot_strategy()) {
        prop_assert_eq!(slot.encode().decode(), slot);
        prop_assert_eq!(SlotPtr::from_raw(slot.encode().raw()), slot.encode());
    }

    #[test]
    fn prop_gcn_event_reencodes_its_input(
        flags in any::<u8>(),
        payload in proptest::collection::vec(any::<u8>(), 12..=12),
    ) {
        let mut bytes = vec![flags];
        bytes.extend_from_slice(&payload);
        let (event, used) = GcnEvent::from_bytes(&bytes).unwrap();
        prop_assert_eq!(used, event.encoded_len());
        prop_assert_eq!(event.to_bytes(), bytes[..used].to_vec());
    }
}
