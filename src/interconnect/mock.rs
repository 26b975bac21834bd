//! Mock interconnect used in testing the readout layers
//!
//! The mock keeps its state behind an `Arc` so tests can hold a scripting
//! handle while the session owns the attached instance. Beyond plain
//! wire/register memory it emulates the two stateful endpoints the readout
//! logic polls against: trigger-out latches and the serial FIFO pair.

use super::{Interconnect, RegisterEntry, Status};
use crate::registers::{self, PipeAddr, RegAddr, TriggerAddr, WireIn, WireOut};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct State {
    staged: HashMap<u8, u32>,
    committed: HashMap<u8, u32>,
    wire_outs: HashMap<u8, u32>,
    wire_out_snapshot: HashMap<u8, u32>,
    pending_triggers: HashMap<u8, u32>,
    auto_triggers: HashMap<u8, u32>,
    latched_triggers: HashMap<u8, u32>,
    registers: HashMap<u32, u32>,
    pipe_data: HashMap<u8, VecDeque<u8>>,
    fired: Vec<(TriggerAddr, u8)>,
    pipe_reads: Vec<usize>,
    wire_commits: usize,
    commit_history: Vec<HashMap<u8, u32>>,
    fail_next: Option<i32>,
    serial_rx: VecDeque<u8>,
    serial_tx: Vec<u8>,
    frame: Vec<u8>,
    tx_expected: usize,
    responder: Option<Responder>,
}

impl State {
    fn take_fault(&mut self) -> Option<Status> {
        self.fail_next.take().map(Status)
    }

    /// Mirror the RX FIFO into the serial status wire
    fn sync_serial_status(&mut self, last_byte: Option<u8>) {
        let addr = registers::serial_status::ADDR.0;
        let word = self.wire_outs.entry(addr).or_insert(0);
        if let Some(byte) = last_byte {
            *word = (*word & !registers::serial_status::RX_BYTE.mask())
                | registers::serial_status::RX_BYTE.apply(u32::from(byte));
        }
        let empty = registers::serial_status::RX_EMPTY.mask();
        if self.serial_rx.is_empty() {
            *word |= empty;
        } else {
            *word &= !empty;
        }
    }

    fn on_trigger(&mut self, addr: TriggerAddr, bit: u8) {
        if addr != registers::trig_in::ADDR {
            return;
        }
        match bit {
            registers::trig_in::SERIAL_RX_RST_FIFO => {
                self.tx_expected = self
                    .registers
                    .get(&registers::SERIAL_LEN_REG.0)
                    .copied()
                    .unwrap_or(0) as usize;
                self.frame.clear();
                // Unread RX data is lost when the FIFOs reset
                self.serial_rx.clear();
                self.sync_serial_status(None);
            }
            registers::trig_in::SERIAL_TX_WEN => {
                let word = self
                    .committed
                    .get(&registers::serial_tx::ADDR.0)
                    .copied()
                    .unwrap_or(0);
                let take = self.tx_expected.min(4);
                for lane in &registers::serial_tx::LANES[..take] {
                    let byte = lane.extract(word) as u8;
                    self.serial_tx.push(byte);
                    self.frame.push(byte);
                }
                self.tx_expected -= take;
                if self.tx_expected == 0 && !self.frame.is_empty() {
                    if let Some(responder) = self.responder.as_mut() {
                        let frame = std::mem::take(&mut self.frame);
                        let reply = responder(&frame);
                        self.serial_rx.extend(reply);
                        self.sync_serial_status(None);
                    }
                }
            }
            registers::trig_in::SERIAL_RX_REN => {
                let byte = self.serial_rx.pop_front();
                self.sync_serial_status(byte);
            }
            _ => {}
        }
    }
}

/// A scriptable in-memory interconnect
#[derive(Clone)]
pub struct Mock {
    state: Arc<Mutex<State>>,
}

impl Default for Mock {
    fn default() -> Self {
        Self::new()
    }
}

impl Mock {
    #[must_use]
    pub fn new() -> Self {
        let mut state = State::default();
        state.sync_serial_status(None);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Set the live value of a wire-out; visible after the next refresh
    pub fn script_wire_out(&self, addr: WireOut, value: u32) {
        self.lock().wire_outs.insert(addr.0, value);
    }

    /// Latch trigger-out bits exactly once at the next refresh
    pub fn script_trigger_out(&self, addr: TriggerAddr, mask: u32) {
        *self.lock().pending_triggers.entry(addr.0).or_insert(0) |= mask;
    }

    /// Latch trigger-out bits at every refresh until cleared
    pub fn auto_trigger_out(&self, addr: TriggerAddr, mask: u32) {
        self.lock().auto_triggers.insert(addr.0, mask);
    }

    pub fn clear_auto_trigger_out(&self, addr: TriggerAddr) {
        self.lock().auto_triggers.remove(&addr.0);
    }

    /// Preload bytes into the streaming pipe
    pub fn push_pipe(&self, addr: PipeAddr, bytes: &[u8]) {
        self.lock()
            .pipe_data
            .entry(addr.0)
            .or_default()
            .extend(bytes);
    }

    /// Preload the serial RX FIFO
    pub fn push_serial_rx(&self, bytes: &[u8]) {
        let mut state = self.lock();
        state.serial_rx.extend(bytes);
        state.sync_serial_status(None);
    }

    /// Attach a closure that answers each completed TX frame on the RX FIFO
    pub fn set_serial_responder<F>(&self, f: F)
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(f));
    }

    /// Force the next transaction to fail with `code`
    pub fn fail_next(&self, code: i32) {
        self.lock().fail_next = Some(code);
    }

    /// Bytes transmitted through the serial TX lanes, in transmit order
    #[must_use]
    pub fn sent_serial(&self) -> Vec<u8> {
        self.lock().serial_tx.clone()
    }

    /// The committed value of a wire-in
    #[must_use]
    pub fn committed_wire(&self, addr: WireIn) -> u32 {
        self.lock().committed.get(&addr.0).copied().unwrap_or(0)
    }

    /// The staged (not yet committed) value of a wire-in
    #[must_use]
    pub fn staged_wire(&self, addr: WireIn) -> u32 {
        self.lock().staged.get(&addr.0).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn register(&self, addr: RegAddr) -> u32 {
        self.lock().registers.get(&addr.0).copied().unwrap_or(0)
    }

    pub fn set_register(&self, addr: RegAddr, value: u32) {
        self.lock().registers.insert(addr.0, value);
    }

    /// Every trigger-in pulse, in order
    #[must_use]
    pub fn fired_triggers(&self) -> Vec<(TriggerAddr, u8)> {
        self.lock().fired.clone()
    }

    /// Byte counts of the block-pipe reads, in order
    #[must_use]
    pub fn pipe_read_sizes(&self) -> Vec<usize> {
        self.lock().pipe_reads.clone()
    }

    /// How many wire-in commits have happened
    #[must_use]
    pub fn wire_commit_count(&self) -> usize {
        self.lock().wire_commits
    }

    /// The value one wire-in held at each commit, in order
    #[must_use]
    pub fn wire_commit_values(&self, addr: WireIn) -> Vec<u32> {
        self.lock()
            .commit_history
            .iter()
            .map(|commit| commit.get(&addr.0).copied().unwrap_or(0))
            .collect()
    }
}

impl std::fmt::Debug for Mock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mock").finish_non_exhaustive()
    }
}

impl Interconnect for Mock {
    fn set_wire_in(&mut self, addr: WireIn, value: u32, mask: u32) -> Status {
        let mut state = self.lock();
        if let Some(fault) = state.take_fault() {
            return fault;
        }
        let staged = state.staged.entry(addr.0).or_insert(0);
        *staged = (*staged & !mask) | (value & mask);
        Status::OK
    }

    fn update_wire_ins(&mut self) -> Status {
        let mut state = self.lock();
        if let Some(fault) = state.take_fault() {
            return fault;
        }
        state.committed = state.staged.clone();
        state.wire_commits += 1;
        let committed = state.committed.clone();
        state.commit_history.push(committed);
        Status::OK
    }

    fn update_wire_outs(&mut self) -> Status {
        let mut state = self.lock();
        if let Some(fault) = state.take_fault() {
            return fault;
        }
        state.wire_out_snapshot = state.wire_outs.clone();
        Status::OK
    }

    fn wire_out(&mut self, addr: WireOut) -> u32 {
        self.lock()
            .wire_out_snapshot
            .get(&addr.0)
            .copied()
            .unwrap_or(0)
    }

    fn activate_trigger_in(&mut self, addr: TriggerAddr, bit: u8) -> Status {
        let mut state = self.lock();
        if let Some(fault) = state.take_fault() {
            return fault;
        }
        state.fired.push((addr, bit));
        state.on_trigger(addr, bit);
        Status::OK
    }

    fn update_trigger_outs(&mut self) -> Status {
        let mut state = self.lock();
        if let Some(fault) = state.take_fault() {
            return fault;
        }
        let mut latched: HashMap<u8, u32> = std::mem::take(&mut state.pending_triggers);
        for (addr, mask) in &state.auto_triggers {
            *latched.entry(*addr).or_insert(0) |= mask;
        }
        state.latched_triggers = latched;
        Status::OK
    }

    fn is_triggered(&mut self, addr: TriggerAddr, mask: u32) -> bool {
        self.lock()
            .latched_triggers
            .get(&addr.0)
            .is_some_and(|bits| bits & mask != 0)
    }

    fn read_pipe_block(&mut self, addr: PipeAddr, _block_size: u16, buf: &mut [u8]) -> i64 {
        let mut state = self.lock();
        if let Some(fault) = state.take_fault() {
            return i64::from(fault.0);
        }
        state.pipe_reads.push(buf.len());
        let queue = state.pipe_data.entry(addr.0).or_default();
        for slot in buf.iter_mut() {
            *slot = queue.pop_front().unwrap_or(0);
        }
        buf.len() as i64
    }

    fn write_register(&mut self, addr: RegAddr, value: u32) -> Status {
        let mut state = self.lock();
        if let Some(fault) = state.take_fault() {
            return fault;
        }
        state.registers.insert(addr.0, value);
        Status::OK
    }

    fn read_register(&mut self, addr: RegAddr) -> (u32, Status) {
        let mut state = self.lock();
        if let Some(fault) = state.take_fault() {
            return (0, fault);
        }
        (state.registers.get(&addr.0).copied().unwrap_or(0), Status::OK)
    }

    fn write_registers(&mut self, entries: &[RegisterEntry]) -> Status {
        let mut state = self.lock();
        if let Some(fault) = state.take_fault() {
            return fault;
        }
        for entry in entries {
            state.registers.insert(entry.addr.0, entry.data);
        }
        Status::OK
    }

    fn read_registers(&mut self, entries: &mut [RegisterEntry]) -> Status {
        let mut state = self.lock();
        if let Some(fault) = state.take_fault() {
            return fault;
        }
        for entry in entries.iter_mut() {
            entry.data = state.registers.get(&entry.addr.0).copied().unwrap_or(0);
        }
        Status::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{serial_status, serial_tx, trig_in, trig_out};

    #[test]
    fn staged_wires_commit_on_update() {
        let mut mock = Mock::new();
        mock.set_wire_in(WireIn(0), 0b100, 0b100);
        assert_eq!(mock.committed_wire(WireIn(0)), 0);
        mock.update_wire_ins();
        assert_eq!(mock.committed_wire(WireIn(0)), 0b100);
    }

    #[test]
    fn set_wire_only_touches_masked_bits() {
        let mut mock = Mock::new();
        mock.set_wire_in(WireIn(0), 0xFFFF_FFFF, 0x0000_00F0);
        mock.set_wire_in(WireIn(0), 0x0000_000A, 0x0000_000F);
        mock.update_wire_ins();
        assert_eq!(mock.committed_wire(WireIn(0)), 0xFA);
    }

    #[test]
    fn trigger_latches_clear_after_refresh() {
        let mut mock = Mock::new();
        mock.script_trigger_out(trig_out::ADDR, trig_out::VIDEO_DONE.mask());
        mock.update_trigger_outs();
        assert!(mock.is_triggered(trig_out::ADDR, trig_out::VIDEO_DONE.mask()));
        mock.update_trigger_outs();
        assert!(!mock.is_triggered(trig_out::ADDR, trig_out::VIDEO_DONE.mask()));
    }

    #[test]
    fn pipe_reads_zero_fill_when_drained() {
        let mut mock = Mock::new();
        mock.push_pipe(registers::RAM_PIPE, &[1, 2, 3]);
        let mut buf = [0xFFu8; 5];
        let n = mock.read_pipe_block(registers::RAM_PIPE, 32, &mut buf);
        assert_eq!(n, 5);
        assert_eq!(buf, [1, 2, 3, 0, 0]);
    }

    #[test]
    fn serial_rx_drains_through_ren_pulses() {
        let mut mock = Mock::new();
        // Empty FIFO reads back as empty
        mock.update_wire_outs();
        let word = mock.wire_out(serial_status::ADDR);
        assert_eq!(serial_status::RX_EMPTY.extract(word), 1);

        mock.push_serial_rx(&[0xAB, 0xCD]);
        mock.update_wire_outs();
        let word = mock.wire_out(serial_status::ADDR);
        assert_eq!(serial_status::RX_EMPTY.extract(word), 0);

        mock.activate_trigger_in(trig_in::ADDR, trig_in::SERIAL_RX_REN);
        mock.update_wire_outs();
        let word = mock.wire_out(serial_status::ADDR);
        assert_eq!(serial_status::RX_BYTE.extract(word), 0xAB);
        assert_eq!(serial_status::RX_EMPTY.extract(word), 0);

        mock.activate_trigger_in(trig_in::ADDR, trig_in::SERIAL_RX_REN);
        mock.update_wire_outs();
        let word = mock.wire_out(serial_status::ADDR);
        assert_eq!(serial_status::RX_BYTE.extract(word), 0xCD);
        assert_eq!(serial_status::RX_EMPTY.extract(word), 1);
    }

    #[test]
    fn tx_lanes_accumulate_in_transmit_order() {
        let mut mock = Mock::new();
        mock.write_register(registers::SERIAL_LEN_REG, 2);
        mock.activate_trigger_in(trig_in::ADDR, trig_in::SERIAL_RX_RST_FIFO);
        let word = serial_tx::BYTE3.apply(0x97) | serial_tx::BYTE2.apply(0x3C);
        mock.set_wire_in(serial_tx::ADDR, word, u32::MAX);
        mock.update_wire_ins();
        mock.activate_trigger_in(trig_in::ADDR, trig_in::SERIAL_TX_WEN);
        assert_eq!(mock.sent_serial(), vec![0x97, 0x3C]);
    }

    #[test]
    fn fault_injection_hits_exactly_one_transaction() {
        let mut mock = Mock::new();
        mock.fail_next(-2);
        assert_eq!(mock.update_wire_ins(), Status(-2));
        assert_eq!(mock.update_wire_ins(), Status::OK);
    }
}
