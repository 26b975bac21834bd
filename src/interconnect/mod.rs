//! The logical contract with the vendor interconnect
//!
//! Only the addressable surface the readout logic depends on is modelled
//! here: level-held wires in both directions, edge-pulsed triggers with
//! latch-and-test readback, streaming block pipes, and a 32-bit register
//! file with batched entry support. Physical transport (USB framing,
//! enumeration) stays behind implementations of [`Interconnect`].

pub mod mock;

use crate::registers::{PipeAddr, RegAddr, TriggerAddr, WireIn, WireOut};
use num_derive::FromPrimitive;

/// Status word returned by every interconnect transaction.
/// Zero is success; negative values map to [`ErrorCode`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Status = Status(0);

    #[must_use]
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// The vendor error code, if this status is a failure
    #[must_use]
    pub fn error(self) -> Option<ErrorCode> {
        if self.is_ok() {
            None
        } else {
            num_traits::FromPrimitive::from_i32(self.0)
        }
    }
}

/// Vendor status codes reported by failed transactions
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum ErrorCode {
    Failed = -1,
    Timeout = -2,
    TransferError = -3,
    CommunicationError = -4,
    DeviceNotOpen = -5,
    InvalidEndpoint = -6,
    InvalidBlockSize = -7,
    UnsupportedFeature = -8,
    FifoUnderflow = -9,
    FifoOverflow = -10,
    DataAlignmentError = -11,
    InvalidParameter = -12,
}

/// One address/value pair of a batched register transaction
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterEntry {
    pub addr: RegAddr,
    pub data: u32,
}

/// The addressable surface of the interconnect.
/// The methods of this trait *assume* the device is already attached;
/// connection tracking lives in [`crate::session::Session`].
pub trait Interconnect {
    /// Stage bits of a wire-in value; only bits under `mask` are touched.
    /// Nothing reaches the device until [`Interconnect::update_wire_ins`].
    fn set_wire_in(&mut self, addr: WireIn, value: u32, mask: u32) -> Status;

    /// Commit all staged wire-in values to the device in one transaction
    fn update_wire_ins(&mut self) -> Status;

    /// Refresh the host-side snapshot of every wire-out value
    fn update_wire_outs(&mut self) -> Status;

    /// Read a wire-out value from the last refreshed snapshot
    fn wire_out(&mut self, addr: WireOut) -> u32;

    /// Pulse a single trigger-in bit
    fn activate_trigger_in(&mut self, addr: TriggerAddr, bit: u8) -> Status;

    /// Latch all trigger-out flags that fired since the previous call
    fn update_trigger_outs(&mut self) -> Status;

    /// Test latched trigger-out bits against `mask`
    fn is_triggered(&mut self, addr: TriggerAddr, mask: u32) -> bool;

    /// Read a block from a streaming pipe into `buf` using the given
    /// hardware block size. Returns the transferred byte count, or a
    /// negative status code.
    fn read_pipe_block(&mut self, addr: PipeAddr, block_size: u16, buf: &mut [u8]) -> i64;

    /// Write one register-file entry
    fn write_register(&mut self, addr: RegAddr, value: u32) -> Status;

    /// Read one register-file entry
    fn read_register(&mut self, addr: RegAddr) -> (u32, Status);

    /// Write a batch of register-file entries in one transaction
    fn write_registers(&mut self, entries: &[RegisterEntry]) -> Status;

    /// Read a batch of register-file entries in one transaction, filling
    /// the `data` member of each entry
    fn read_registers(&mut self, entries: &mut [RegisterEntry]) -> Status;
}
