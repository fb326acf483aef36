//! Core word type for the ARINC 429 link layer

use bitfield::bitfield;

use crate::error::{LinkError, Result};

bitfield! {
    /// Raw layout view over a logical 32-bit word
    ///
    /// Only the label byte is broken out: it is the byte whose bit order
    /// differs on the wire. Field meaning is left to higher layers.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct WordLayout(u32);
    impl Debug;
    /// Label byte (bits 7-0)
    pub u8, label, set_label: 7, 0;
    /// Everything above the label (bits 31-8)
    pub u32, body, set_body: 31, 8;
}

/// A single ARINC 429 word
///
/// Exactly 32 bits. No parity or field validation is applied here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArincWord(u32);

impl ArincWord {
    /// Word length in bits
    pub const BITS: usize = crate::arinc::WORD_BITS;
    /// Word length in bytes
    pub const BYTES: usize = crate::arinc::WORD_BYTES;

    /// Wrap a raw 32-bit value
    pub const fn new(value: u32) -> Self {
        ArincWord(value)
    }

    /// Get the raw 32-bit value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Build a word from exactly four bytes, first byte most significant
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 4] = bytes.try_into().map_err(|_| {
            LinkError::length(format!(
                "Expected {} bytes for word, got {}",
                Self::BYTES,
                bytes.len()
            ))
        })?;
        Ok(ArincWord(u32::from_be_bytes(array)))
    }

    /// Bytes in transmission order, most significant first
    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Raw label byte (bits 7-0)
    pub fn label(&self) -> u8 {
        WordLayout(self.0).label()
    }

    /// Layout view of this word
    pub fn layout(&self) -> WordLayout {
        WordLayout(self.0)
    }
}

impl From<u32> for ArincWord {
    fn from(value: u32) -> Self {
        ArincWord(value)
    }
}

impl From<ArincWord> for u32 {
    fn from(word: ArincWord) -> Self {
        word.0
    }
}

impl TryFrom<u64> for ArincWord {
    type Error = LinkError;

    fn try_from(value: u64) -> Result<Self> {
        u32::try_from(value).map(ArincWord).map_err(|_| {
            LinkError::length(format!("Value {:#X} does not fit in 32 bits", value))
        })
    }
}

impl TryFrom<&[u8]> for ArincWord {
    type Error = LinkError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        ArincWord::from_bytes(bytes)
    }
}

impl std::fmt::Display for ArincWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Conversion into a word with the length check applied at the boundary
pub trait IntoArincWord {
    /// Convert, failing with [`LinkError::Length`] for anything but 32 bits
    fn into_arinc_word(self) -> Result<ArincWord>;
}

impl IntoArincWord for ArincWord {
    fn into_arinc_word(self) -> Result<ArincWord> {
        Ok(self)
    }
}

impl IntoArincWord for u32 {
    fn into_arinc_word(self) -> Result<ArincWord> {
        Ok(ArincWord(self))
    }
}

impl IntoArincWord for u64 {
    fn into_arinc_word(self) -> Result<ArincWord> {
        ArincWord::try_from(self)
    }
}

impl IntoArincWord for [u8; 4] {
    fn into_arinc_word(self) -> Result<ArincWord> {
        Ok(ArincWord(u32::from_be_bytes(self)))
    }
}

impl IntoArincWord for &[u8] {
    fn into_arinc_word(self) -> Result<ArincWord> {
        ArincWord::from_bytes(self)
    }
}

impl IntoArincWord for Vec<u8> {
    fn into_arinc_word(self) -> Result<ArincWord> {
        ArincWord::from_bytes(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_from_bytes() {
        let word = ArincWord::from_bytes(&[0x12, 0x34, 0x56, 0x78]).unwrap();
        assert_eq!(word.value(), 0x1234_5678);
        assert_eq!(word.to_bytes(), [0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_word_rejects_bad_length() {
        assert!(matches!(
            ArincWord::from_bytes(&[1, 2, 3]),
            Err(LinkError::Length(_))
        ));
        assert!(matches!(
            ArincWord::from_bytes(&[1, 2, 3, 4, 5]),
            Err(LinkError::Length(_))
        ));
        assert!(ArincWord::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_word_from_u64() {
        assert_eq!(
            ArincWord::try_from(0xFFFF_FFFFu64).unwrap().value(),
            0xFFFF_FFFF
        );
        assert!(matches!(
            ArincWord::try_from(0x1_0000_0000u64),
            Err(LinkError::Length(_))
        ));
    }

    #[test]
    fn test_into_arinc_word() {
        assert!(0xDEAD_BEEFu32.into_arinc_word().is_ok());
        assert!([0u8, 0, 0, 1].into_arinc_word().is_ok());
        assert!(vec![0u8; 3].into_arinc_word().is_err());
        assert!((&[0u8; 8][..]).into_arinc_word().is_err());
        assert!(u64::MAX.into_arinc_word().is_err());
    }

    #[test]
    fn test_label_layout() {
        let word = ArincWord::new(0xABCD_EF5A);
        assert_eq!(word.label(), 0x5A);
        assert_eq!(word.layout().body(), 0x00AB_CDEF);
    }

    #[test]
    fn test_word_display() {
        assert_eq!(ArincWord::new(0x1F).to_string(), "0x0000001F");
    }
}
