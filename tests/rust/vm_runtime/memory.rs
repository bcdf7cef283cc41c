use novel_vm_runtime::memory::{
    IntBankId, IntLocation, Memory, MemoryError, INT_BANK_SIZE, STRING_BANK_SIZE, STRING_K_SIZE,
    STRK_TYPE, STRM_TYPE, STRS_TYPE,
};

/// Type code for `bank` viewed as `bits`-wide cells (0 = whole words).
fn type_code(bank: IntBankId, bits: u32) -> i32 {
    let selector = match bits {
        0 => 0,
        other => other.trailing_zeros() as i32 + 1,
    };
    selector * 26 + bank.bytecode_index()
}

const ALL_BANKS: [IntBankId; 9] = [
    IntBankId::A,
    IntBankId::B,
    IntBankId::C,
    IntBankId::D,
    IntBankId::E,
    IntBankId::F,
    IntBankId::G,
    IntBankId::Z,
    IntBankId::L,
];

#[test]
fn type_codes_decode_to_banks_and_views() {
    let view = IntLocation::decode(0).expect("intA decodes");
    assert_eq!(view.bank, IntBankId::A);
    assert_eq!(view.bits, 0);

    let view = IntLocation::decode(25).expect("intZ decodes");
    assert_eq!(view.bank, IntBankId::Z);

    let view = IntLocation::decode(11).expect("intL decodes");
    assert_eq!(view.bank, IntBankId::L);

    let view = IntLocation::decode(26 * 4 + 1).expect("intB8b decodes");
    assert_eq!(view.bank, IntBankId::B);
    assert_eq!(view.bits, 8);
    assert_eq!(view.capacity(), 8000);

    for bad in [7, 10, 12, 24, 26 * 7, -1] {
        assert!(
            matches!(IntLocation::decode(bad), Err(MemoryError::IllegalBank(_))),
            "type code {bad} should be rejected"
        );
    }
}

#[test]
fn out_of_range_locations_fail_without_touching_neighbours() {
    let mut memory = Memory::new();
    for bank in ALL_BANKS {
        for bits in [0, 1, 2, 4, 8, 16, 32] {
            let code = type_code(bank, bits);
            let capacity = IntLocation::decode(code).expect("valid code").capacity();
            let last = capacity as i32 - 1;
            memory
                .set_int_value(code, last, 1)
                .expect("last cell is addressable");

            for location in [capacity as i32, capacity as i32 + 17, -1] {
                let read = memory.get_int_value(code, location);
                assert!(
                    matches!(read, Err(MemoryError::IllegalIndex { .. })),
                    "read {bank:?}/{bits} at {location} should fail, got {read:?}"
                );
                let write = memory.set_int_value(code, location, -1);
                assert!(
                    matches!(write, Err(MemoryError::IllegalIndex { .. })),
                    "write {bank:?}/{bits} at {location} should fail"
                );
            }
            assert_eq!(
                memory.get_int_value(code, last).expect("readable"),
                1,
                "failed writes must not disturb {bank:?}/{bits}"
            );
            memory.set_int_value(code, last, 0).expect("reset cell");
        }
    }
    let untouched = Memory::new();
    assert_eq!(memory, untouched, "every bank should be back to zero");
}

#[test]
fn packed_views_mask_values_and_preserve_other_bits() {
    let mut memory = Memory::new();
    let word_code = type_code(IntBankId::C, 0);
    memory
        .set_int_value(word_code, 3, -1)
        .expect("whole word write");

    for bits in [1u32, 2, 4, 8, 16] {
        let code = type_code(IntBankId::C, bits);
        let cells_per_word = 32 / bits as i32;
        let location = 3 * cells_per_word + 1;
        let shift = bits;
        memory
            .set_int_value(code, location, 0x7FFF_FFFF)
            .expect("packed write");
        let mask = (1u32 << bits) - 1;
        assert_eq!(
            memory.get_int_value(code, location).expect("packed read") as u32,
            0x7FFF_FFFF & mask,
            "{bits}-bit view should mask the stored value"
        );

        memory.set_int_value(code, location, 0).expect("clear cell");
        let word = memory.get_int_value(word_code, 3).expect("word read") as u32;
        let window = mask << shift;
        assert_eq!(word & window, 0, "{bits}-bit cell should be cleared");
        assert_eq!(
            word | window,
            u32::MAX,
            "{bits}-bit write must not touch bits outside its window"
        );
        memory
            .set_int_value(word_code, 3, -1)
            .expect("restore word");
    }

    let full = type_code(IntBankId::C, 32);
    memory.set_int_value(full, 5, -42).expect("32-bit view write");
    assert_eq!(memory.get_int_value(word_code, 5).expect("word read"), -42);
}

#[test]
fn string_banks_enforce_their_own_limits() {
    let mut memory = Memory::new();
    memory
        .set_string_value(STRS_TYPE, 1999, "last")
        .expect("strS holds 2000 entries");
    memory
        .set_string_value(STRM_TYPE, 0, "global")
        .expect("strM write");
    memory
        .set_string_value(STRK_TYPE, 2, "arg")
        .expect("strK holds 3 entries");

    assert_eq!(memory.get_string_value(STRS_TYPE, 1999).expect("read"), "last");
    assert_eq!(memory.get_string_value(STRM_TYPE, 0).expect("read"), "global");
    assert_eq!(memory.local().str_k.len(), STRING_K_SIZE);
    assert_eq!(memory.global().str_m.len(), STRING_BANK_SIZE);

    assert!(matches!(
        memory.set_string_value(STRK_TYPE, 3, "overflow"),
        Err(MemoryError::IllegalIndex { .. })
    ));
    assert!(matches!(
        memory.get_string_value(STRS_TYPE, STRING_BANK_SIZE as i32),
        Err(MemoryError::IllegalIndex { .. })
    ));
    assert!(matches!(
        memory.get_string_value(0x0B, 0),
        Err(MemoryError::IllegalStringBank(0x0B))
    ));
}

#[test]
fn local_and_global_halves_are_separate() {
    let mut memory = Memory::new();
    memory
        .set_int_value(type_code(IntBankId::G, 0), 7, 70)
        .expect("intG write");
    memory
        .set_int_value(type_code(IntBankId::A, 0), 7, 7)
        .expect("intA write");

    assert_eq!(memory.global().int_g.words()[7], 70);
    assert_eq!(memory.local().int_a.words()[7], 7);
    assert_eq!(memory.local().int_a.words().len(), INT_BANK_SIZE);

    let mut replacement = memory.local().clone();
    replacement.int_a = Default::default();
    memory.replace_local(replacement);
    assert_eq!(memory.get_int_value(0, 7).expect("intA read"), 0);
    assert_eq!(
        memory
            .get_int_value(type_code(IntBankId::G, 0), 7)
            .expect("intG read"),
        70,
        "replacing local memory must keep globals"
    );
    assert!(memory.local().validate().is_ok());
}
