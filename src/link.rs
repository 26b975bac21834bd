//! Thread-safe primitive I/O against the attached device
//!
//! Every operation takes the session mutex for the span of one interconnect
//! transaction and logs the outcome with the hardware status code. Nothing
//! here sleeps while holding the lock; polling belongs to
//! [`crate::actions`].

use crate::bitfield::BitField;
use crate::error::{LinkError, LinkResult};
use crate::interconnect::{Interconnect, RegisterEntry, Status};
use crate::registers::{PipeAddr, RegAddr, TriggerAddr, WireIn, WireOut};
use crate::session::{Session, LOCK_TIMEOUT};
use std::sync::Arc;
use tracing::{debug, error};

/// Primitive wire/trigger/pipe/register transactions over a shared session
pub struct DeviceLink<I> {
    session: Arc<Session<I>>,
}

impl<I> Clone for DeviceLink<I> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

impl<I> DeviceLink<I> {
    #[must_use]
    pub fn new(session: Arc<Session<I>>) -> Self {
        Self { session }
    }

    /// The session this link transacts through
    #[must_use]
    pub fn session(&self) -> &Arc<Session<I>> {
        &self.session
    }
}

fn check(status: Status, op: &str) -> LinkResult<()> {
    if status.is_ok() {
        debug!(op, "transaction ok");
        Ok(())
    } else {
        error!(op, code = status.0, name = ?status.error(), "transaction failed");
        Err(LinkError::Io { code: status.0 })
    }
}

impl<I> DeviceLink<I>
where
    I: Interconnect,
{
    fn with_handle<R>(&self, f: impl FnOnce(&mut I) -> R) -> LinkResult<R> {
        let mut guard = self.session.lock(LOCK_TIMEOUT)?;
        let handle = guard.handle.as_mut().ok_or(LinkError::NotConnected)?;
        Ok(f(handle))
    }

    /// Stage `value` into `field` of a wire-in. Takes effect at the next
    /// [`DeviceLink::commit_wires`].
    pub fn set_wire(&self, addr: WireIn, value: u32, field: BitField) -> LinkResult<()> {
        let bits = field.apply(value);
        let status = self.with_handle(|h| h.set_wire_in(addr, bits, field.mask()))?;
        debug!(addr = addr.0, bits = format_args!("{bits:#010x}"), mask = format_args!("{:#010x}", field.mask()), "set wire");
        check(status, "set wire")
    }

    /// Commit all staged wire-in values
    pub fn commit_wires(&self) -> LinkResult<()> {
        let status = self.with_handle(Interconnect::update_wire_ins)?;
        check(status, "update wire in")
    }

    /// Drive a wire bit through a full 0→1→0 pulse, committing both edges
    pub fn set_wire_pulse(&self, addr: WireIn, field: BitField) -> LinkResult<()> {
        self.set_wire(addr, 1, field)?;
        self.commit_wires()?;
        self.set_wire(addr, 0, field)?;
        self.commit_wires()
    }

    /// Refresh the wire-out snapshot and extract `field` from `addr`
    pub fn read_wire(&self, addr: WireOut, field: BitField) -> LinkResult<u32> {
        let (status, word) = self.with_handle(|h| {
            let status = h.update_wire_outs();
            (status, h.wire_out(addr))
        })?;
        check(status, "read wire out")?;
        Ok(field.extract(word))
    }

    /// Pulse a trigger-in bit
    pub fn fire_trigger(&self, addr: TriggerAddr, bit: u8) -> LinkResult<()> {
        let status = self.with_handle(|h| h.activate_trigger_in(addr, bit))?;
        debug!(addr = addr.0, bit, "activate trigger");
        check(status, "activate trigger")
    }

    /// Refresh all trigger-out latches, then test the bits of `field`
    pub fn read_trigger(&self, addr: TriggerAddr, field: BitField) -> LinkResult<bool> {
        let (status, triggered) = self.with_handle(|h| {
            let status = h.update_trigger_outs();
            (status, h.is_triggered(addr, field.mask()))
        })?;
        check(status, "update trigger out")?;
        Ok(triggered)
    }

    /// Read `length` bytes from a streaming pipe.
    ///
    /// Pipe reads are best-effort: a vendor failure is logged and the
    /// (zero-filled) buffer is returned as-is, matching the level-held
    /// semantics of the rest of the readout path.
    pub fn read_block(&self, addr: PipeAddr, block_size: u16, length: usize) -> LinkResult<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let transferred = self.with_handle(|h| h.read_pipe_block(addr, block_size, &mut buf))?;
        if transferred < 0 {
            let code = transferred as i32;
            error!(addr = addr.0, code, name = ?Status(code).error(), "pipe read failed");
        } else {
            debug!(addr = addr.0, queried = length, read = transferred, "pipe read");
        }
        Ok(buf)
    }

    /// Write one register-file entry
    pub fn write_register(&self, addr: RegAddr, value: u32) -> LinkResult<()> {
        let status = self.with_handle(|h| h.write_register(addr, value))?;
        debug!(addr = addr.0, value, "write register");
        check(status, "write register")
    }

    /// Read one register-file entry
    pub fn read_register(&self, addr: RegAddr) -> LinkResult<u32> {
        let (value, status) = self.with_handle(|h| h.read_register(addr))?;
        debug!(addr = addr.0, value, "read register");
        check(status, "read register")?;
        Ok(value)
    }

    /// Write a batch of register-file entries in one transaction
    pub fn write_registers(&self, entries: &[RegisterEntry]) -> LinkResult<()> {
        let status = self.with_handle(|h| h.write_registers(entries))?;
        check(status, "write registers")
    }

    /// Read a batch of register-file entries in one transaction
    pub fn read_registers(&self, entries: &mut [RegisterEntry]) -> LinkResult<()> {
        let status = self.with_handle(|h| h.read_registers(entries))?;
        check(status, "read registers")
    }
}

impl<I> std::fmt::Debug for DeviceLink<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink").finish_non_exhaustive()
    }
}
