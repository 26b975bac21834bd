//! Frame encoding for the byte-serial sub-channel to the attached chip
//!
//! The stock protocol is a 2-byte request and a 2-byte response: the first
//! request byte carries a write flag and the 7-bit register address, the
//! second the value (or zero for reads); the response echoes and carries
//! the register value in its second byte. Chips with a different framing
//! implement [`SerialFramer`] and register their framer with the model.

use crate::chip::ChipRegister;
use packed_struct::prelude::*;

/// Direction of a chip-register access
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SerialOp {
    Read,
    Write,
}

/// The stock 2-byte request word
#[derive(PackedStruct, Debug, Default, PartialEq, Copy, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "2")]
pub struct SerialRequest {
    /// Set for writes, clear for reads
    #[packed_field(bits = "0")]
    pub write: bool,
    #[packed_field(bits = "1..=7")]
    pub address: Integer<u8, packed_bits::Bits<7>>,
    /// Value for writes, zero for reads
    #[packed_field(bits = "8..=15")]
    pub value: u8,
}

/// Encodes chip-register accesses into serial frames and decodes responses
pub trait SerialFramer: Send + Sync {
    /// Build the request frame for `op` against `register`
    fn encode(&self, op: SerialOp, register: &ChipRegister) -> anyhow::Result<Vec<u8>>;

    /// Extract the register value from a response frame
    fn decode(&self, frame: &[u8], register: &ChipRegister) -> Option<u32>;
}

/// The stock framing described above
#[derive(Debug, Default, Copy, Clone)]
pub struct StandardFramer;

impl SerialFramer for StandardFramer {
    fn encode(&self, op: SerialOp, register: &ChipRegister) -> anyhow::Result<Vec<u8>> {
        let request = SerialRequest {
            write: op == SerialOp::Write,
            address: (register.address() & 0x7F).into(),
            value: match op {
                SerialOp::Write => register.value() as u8,
                SerialOp::Read => 0,
            },
        };
        Ok(request.pack()?.to_vec())
    }

    fn decode(&self, frame: &[u8], _register: &ChipRegister) -> Option<u32> {
        // The response is assumed to be exactly two bytes: echo, value
        frame.get(1).map(|byte| u32::from(*byte))
    }
}
