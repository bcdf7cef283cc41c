//! Variable memory for the scene VM.
//!
//! Scripts address integer memory through a combined "type" code: the value
//! modulo 26 picks one of the named banks (A–G, Z and L) while the quotient
//! selects a bit-width view over the 32-bit words of that bank.  A quotient of
//! zero reads whole words; 1 through 6 view each word as packed 1/2/4/8/16/32
//! bit cells.  String memory is addressed by one of three fixed type tags.
//!
//! Memory is split the same way save files split it: the local half travels
//! with each save slot, the global half belongs to the player profile.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of 32-bit words in each integer bank.
pub const INT_BANK_SIZE: usize = 2000;

/// Number of entries in the M and S string banks.
pub const STRING_BANK_SIZE: usize = 2000;

/// The K string bank only holds a handful of call arguments.
pub const STRING_K_SIZE: usize = 3;

/// Bits in one integer bank; bit-width views scale their capacity from this.
const BANK_BITS: usize = INT_BANK_SIZE * 32;

/// Bytecode type tags for the three string banks.
pub const STRK_TYPE: i32 = 0x0A;
pub const STRM_TYPE: i32 = 0x0C;
pub const STRS_TYPE: i32 = 0x12;

/// Bytecode bank indices that do not map one-to-one onto storage.
const INTZ_LOCATION_IN_BYTECODE: i32 = 25;
const INTL_LOCATION_IN_BYTECODE: i32 = 11;

/// Largest bit-width selector (32-bit cells).
const MAX_VIEW_SELECTOR: i32 = 6;

/// Named integer banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntBankId {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    Z,
    L,
}

impl IntBankId {
    /// Map the low part of a bytecode type code onto a bank.
    pub fn from_bytecode(index: i32) -> Option<Self> {
        match index {
            0 => Some(IntBankId::A),
            1 => Some(IntBankId::B),
            2 => Some(IntBankId::C),
            3 => Some(IntBankId::D),
            4 => Some(IntBankId::E),
            5 => Some(IntBankId::F),
            6 => Some(IntBankId::G),
            INTZ_LOCATION_IN_BYTECODE => Some(IntBankId::Z),
            INTL_LOCATION_IN_BYTECODE => Some(IntBankId::L),
            _ => None,
        }
    }

    /// Inverse of [`Self::from_bytecode`].
    pub fn bytecode_index(self) -> i32 {
        match self {
            IntBankId::A => 0,
            IntBankId::B => 1,
            IntBankId::C => 2,
            IntBankId::D => 3,
            IntBankId::E => 4,
            IntBankId::F => 5,
            IntBankId::G => 6,
            IntBankId::Z => INTZ_LOCATION_IN_BYTECODE,
            IntBankId::L => INTL_LOCATION_IN_BYTECODE,
        }
    }

    pub fn letter(self) -> char {
        match self {
            IntBankId::A => 'A',
            IntBankId::B => 'B',
            IntBankId::C => 'C',
            IntBankId::D => 'D',
            IntBankId::E => 'E',
            IntBankId::F => 'F',
            IntBankId::G => 'G',
            IntBankId::Z => 'Z',
            IntBankId::L => 'L',
        }
    }
}

/// Decoded form of an integer type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntLocation {
    pub bank: IntBankId,
    /// Cell width in bits; 0 addresses whole words.
    pub bits: u32,
}

impl IntLocation {
    pub fn decode(raw_type: i32) -> Result<Self, MemoryError> {
        if raw_type < 0 {
            return Err(MemoryError::IllegalBank(raw_type));
        }
        let index = raw_type % 26;
        let selector = raw_type / 26;
        let bank = IntBankId::from_bytecode(index).ok_or(MemoryError::IllegalBank(raw_type))?;
        if selector > MAX_VIEW_SELECTOR {
            return Err(MemoryError::IllegalBank(raw_type));
        }
        let bits = if selector == 0 {
            0
        } else {
            1u32 << (selector - 1)
        };
        Ok(Self { bank, bits })
    }

    /// Number of addressable cells in this view.
    pub fn capacity(&self) -> usize {
        if self.bits == 0 {
            INT_BANK_SIZE
        } else {
            BANK_BITS / self.bits as usize
        }
    }

    fn check(&self, location: i32) -> Result<usize, MemoryError> {
        usize::try_from(location)
            .ok()
            .filter(|index| *index < self.capacity())
            .ok_or(MemoryError::IllegalIndex {
                bank: self.describe(),
                location,
            })
    }

    fn describe(&self) -> String {
        if self.bits == 0 {
            format!("int{}", self.bank.letter())
        } else {
            format!("int{}{}b", self.bank.letter(), self.bits)
        }
    }
}

/// Fixed-size bank of 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntBank(Vec<i32>);

impl Default for IntBank {
    fn default() -> Self {
        Self(vec![0; INT_BANK_SIZE])
    }
}

impl IntBank {
    pub fn words(&self) -> &[i32] {
        &self.0
    }

    fn read(&self, view: &IntLocation, location: i32) -> Result<i32, MemoryError> {
        let index = view.check(location)?;
        if view.bits == 0 {
            return Ok(self.0[index]);
        }
        let (word, shift, mask) = cell_position(view.bits, index);
        Ok(((self.0[word] as u32 >> shift) & mask) as i32)
    }

    fn write(&mut self, view: &IntLocation, location: i32, value: i32) -> Result<(), MemoryError> {
        let index = view.check(location)?;
        if view.bits == 0 {
            self.0[index] = value;
            return Ok(());
        }
        let (word, shift, mask) = cell_position(view.bits, index);
        let current = self.0[word] as u32;
        let updated = (current & !(mask << shift)) | ((value as u32 & mask) << shift);
        self.0[word] = updated as i32;
        Ok(())
    }
}

/// Returns (word index, bit shift, unshifted mask) for a packed cell.
fn cell_position(bits: u32, index: usize) -> (usize, u32, u32) {
    let cells_per_word = (32 / bits) as usize;
    let shift = (index % cells_per_word) as u32 * bits;
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
    (index / cells_per_word, shift, mask)
}

/// Fixed-capacity string bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StringBank(Vec<String>);

impl StringBank {
    pub fn with_size(size: usize) -> Self {
        Self(vec![String::new(); size])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }
}

/// Memory saved alongside each save slot.
///
/// Field order is the on-disk order; changing it breaks existing saves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMemory {
    pub int_a: IntBank,
    pub int_b: IntBank,
    pub int_c: IntBank,
    pub int_d: IntBank,
    pub int_e: IntBank,
    pub int_f: IntBank,
    pub str_s: StringBank,
    pub int_l: IntBank,
    pub str_k: StringBank,
}

impl Default for LocalMemory {
    fn default() -> Self {
        Self {
            int_a: IntBank::default(),
            int_b: IntBank::default(),
            int_c: IntBank::default(),
            int_d: IntBank::default(),
            int_e: IntBank::default(),
            int_f: IntBank::default(),
            str_s: StringBank::with_size(STRING_BANK_SIZE),
            int_l: IntBank::default(),
            str_k: StringBank::with_size(STRING_K_SIZE),
        }
    }
}

impl LocalMemory {
    /// Check bank sizes after deserialisation.  Returns the first offending
    /// bank name.
    pub fn validate(&self) -> Result<(), String> {
        let int_banks = [
            ("intA", &self.int_a),
            ("intB", &self.int_b),
            ("intC", &self.int_c),
            ("intD", &self.int_d),
            ("intE", &self.int_e),
            ("intF", &self.int_f),
            ("intL", &self.int_l),
        ];
        for (name, bank) in int_banks {
            if bank.0.len() != INT_BANK_SIZE {
                return Err(format!(
                    "{name} holds {} words, expected {INT_BANK_SIZE}",
                    bank.0.len()
                ));
            }
        }
        if self.str_s.len() != STRING_BANK_SIZE {
            return Err(format!(
                "strS holds {} entries, expected {STRING_BANK_SIZE}",
                self.str_s.len()
            ));
        }
        if self.str_k.len() != STRING_K_SIZE {
            return Err(format!(
                "strK holds {} entries, expected {STRING_K_SIZE}",
                self.str_k.len()
            ));
        }
        Ok(())
    }
}

/// Memory shared across every save slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMemory {
    pub int_g: IntBank,
    pub int_z: IntBank,
    pub str_m: StringBank,
}

impl Default for GlobalMemory {
    fn default() -> Self {
        Self {
            int_g: IntBank::default(),
            int_z: IntBank::default(),
            str_m: StringBank::with_size(STRING_BANK_SIZE),
        }
    }
}

/// Complete variable memory owned by a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memory {
    local: LocalMemory,
    global: GlobalMemory,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&self) -> &LocalMemory {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalMemory {
        &mut self.local
    }

    pub fn global(&self) -> &GlobalMemory {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut GlobalMemory {
        &mut self.global
    }

    /// Swap in a fully validated local memory image.
    pub fn replace_local(&mut self, local: LocalMemory) {
        self.local = local;
    }

    pub fn get_int_value(&self, raw_type: i32, location: i32) -> Result<i32, MemoryError> {
        let view = IntLocation::decode(raw_type)?;
        self.int_bank(view.bank).read(&view, location)
    }

    pub fn set_int_value(
        &mut self,
        raw_type: i32,
        location: i32,
        value: i32,
    ) -> Result<(), MemoryError> {
        let view = IntLocation::decode(raw_type)?;
        self.int_bank_mut(view.bank).write(&view, location, value)
    }

    pub fn get_string_value(&self, raw_type: i32, location: i32) -> Result<&str, MemoryError> {
        let bank = self.string_bank(raw_type)?;
        let index = string_index(bank, raw_type, location)?;
        Ok(bank.0[index].as_str())
    }

    pub fn set_string_value(
        &mut self,
        raw_type: i32,
        location: i32,
        value: impl Into<String>,
    ) -> Result<(), MemoryError> {
        let bank = self.string_bank_mut(raw_type)?;
        let index = string_index(bank, raw_type, location)?;
        bank.0[index] = value.into();
        Ok(())
    }

    fn int_bank(&self, bank: IntBankId) -> &IntBank {
        match bank {
            IntBankId::A => &self.local.int_a,
            IntBankId::B => &self.local.int_b,
            IntBankId::C => &self.local.int_c,
            IntBankId::D => &self.local.int_d,
            IntBankId::E => &self.local.int_e,
            IntBankId::F => &self.local.int_f,
            IntBankId::G => &self.global.int_g,
            IntBankId::Z => &self.global.int_z,
            IntBankId::L => &self.local.int_l,
        }
    }

    fn int_bank_mut(&mut self, bank: IntBankId) -> &mut IntBank {
        match bank {
            IntBankId::A => &mut self.local.int_a,
            IntBankId::B => &mut self.local.int_b,
            IntBankId::C => &mut self.local.int_c,
            IntBankId::D => &mut self.local.int_d,
            IntBankId::E => &mut self.local.int_e,
            IntBankId::F => &mut self.local.int_f,
            IntBankId::G => &mut self.global.int_g,
            IntBankId::Z => &mut self.global.int_z,
            IntBankId::L => &mut self.local.int_l,
        }
    }

    fn string_bank(&self, raw_type: i32) -> Result<&StringBank, MemoryError> {
        match raw_type {
            STRK_TYPE => Ok(&self.local.str_k),
            STRM_TYPE => Ok(&self.global.str_m),
            STRS_TYPE => Ok(&self.local.str_s),
            other => Err(MemoryError::IllegalStringBank(other)),
        }
    }

    fn string_bank_mut(&mut self, raw_type: i32) -> Result<&mut StringBank, MemoryError> {
        match raw_type {
            STRK_TYPE => Ok(&mut self.local.str_k),
            STRM_TYPE => Ok(&mut self.global.str_m),
            STRS_TYPE => Ok(&mut self.local.str_s),
            other => Err(MemoryError::IllegalStringBank(other)),
        }
    }
}

/// Whether a bytecode type tag names a string bank.
pub fn is_string_type(raw_type: i32) -> bool {
    matches!(raw_type, STRK_TYPE | STRM_TYPE | STRS_TYPE)
}

fn string_bank_name(raw_type: i32) -> &'static str {
    match raw_type {
        STRK_TYPE => "strK",
        STRM_TYPE => "strM",
        _ => "strS",
    }
}

fn string_index(bank: &StringBank, raw_type: i32, location: i32) -> Result<usize, MemoryError> {
    usize::try_from(location)
        .ok()
        .filter(|index| *index < bank.len())
        .ok_or_else(|| MemoryError::IllegalIndex {
            bank: string_bank_name(raw_type).to_owned(),
            location,
        })
}

/// Memory access errors bubbled up to the machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("illegal index location ({location}) in {bank}")]
    IllegalIndex { bank: String, location: i32 },
    #[error("illegal integer bank type code {0}")]
    IllegalBank(i32),
    #[error("illegal string bank type code {0:#x}")]
    IllegalStringBank(i32),
}
