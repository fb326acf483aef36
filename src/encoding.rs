//! Wire-order conversion for ARINC 429 words
//!
//! The label byte travels least significant bit first while the rest of the
//! word travels most significant bit first. Reversing the whole word once
//! and then shifting it out MSB-first satisfies both at the same time.

use crate::core::ArincWord;
use crate::error::{LinkError, Result};

/// Bit-order codec shared by the transmit and receive paths
pub struct WordCodec;

impl WordCodec {
    /// Reverse the bit order of a 32-bit word
    ///
    /// Bit `i` of the input lands on bit `31 - i` of the output.
    pub fn reverse(x: u32) -> u32 {
        x.reverse_bits()
    }

    /// Convert a logical word into its wire-order value
    pub fn to_wire(word: ArincWord) -> u32 {
        Self::reverse(word.value())
    }

    /// Convert a received wire-order value back into a logical word
    pub fn from_wire(wire: u32) -> ArincWord {
        ArincWord::new(Self::reverse(wire))
    }

    /// Bits of a wire-order value in transmission order
    ///
    /// Four bytes, each most significant bit first.
    pub fn bits(wire: u32) -> impl Iterator<Item = bool> {
        wire.to_be_bytes()
            .into_iter()
            .flat_map(|byte| (0..8).map(move |i| byte & (0x80 >> i) != 0))
    }

    /// Assemble a wire-order value from bits in transmission order
    pub fn assemble(bits: &[bool]) -> Result<u32> {
        if bits.len() != ArincWord::BITS {
            return Err(LinkError::length(format!(
                "Expected {} bits for word, got {}",
                ArincWord::BITS,
                bits.len()
            )));
        }

        Ok(bits
            .iter()
            .fold(0u32, |acc, &bit| (acc << 1) | u32::from(bit)))
    }
}
