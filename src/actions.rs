//! Device operations composed from [`DeviceLink`] primitives
//!
//! Each operation reproduces the exact wire/trigger sequencing the gateware
//! expects; order matters wherever a trigger commits previously latched
//! wire values. Hardware-status failures are absorbed and logged here so
//! the acquisition layers above see best-effort values.

use crate::error::LinkResult;
use crate::interconnect::{Interconnect, RegisterEntry};
use crate::link::DeviceLink;
use crate::registers::{
    adc_data, adc_select, aer_xy, calib, control, dac, evt_count, pcb_switches, ram_addr,
    serial_status, serial_tx, trig_in, trig_out, RegAddr, RAM_PIPE, SERIAL_LEN_REG,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pipe reads must cover a multiple of this many addresses
const RAM_BLOCK_SIZE: u16 = 32;
/// Upper bound on a single streaming chunk
const RAM_READBUF_SIZE: usize = 1024 * 1024;
/// Budget for the ADC data-valid flag
const ADC_TIMEOUT: Duration = Duration::from_secs(1);
/// Poll period for fast hardware flags
const FLAG_POLL: Duration = Duration::from_millis(10);

/// Poll `pred` every `period` until it holds or `timeout` expires
pub fn wait_until<F>(mut pred: F, timeout: Duration, period: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let must_end = Instant::now() + timeout;
    while Instant::now() < must_end {
        if pred() {
            return true;
        }
        std::thread::sleep(period);
    }
    false
}

/// Higher-level operations over the shared device link
pub struct ProtocolActions<I> {
    link: DeviceLink<I>,
}

impl<I> Clone for ProtocolActions<I> {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
        }
    }
}

impl<I> ProtocolActions<I> {
    #[must_use]
    pub fn new(link: DeviceLink<I>) -> Self {
        Self { link }
    }

    #[must_use]
    pub fn link(&self) -> &DeviceLink<I> {
        &self.link
    }
}

impl<I> ProtocolActions<I>
where
    I: Interconnect,
{
    //
    // Register file
    //

    pub fn write_register(&self, addr: RegAddr, value: u32) -> LinkResult<()> {
        self.link.write_register(addr, value)
    }

    pub fn read_register(&self, addr: RegAddr) -> LinkResult<u32> {
        self.link.read_register(addr)
    }

    /// Write a batch of register entries in one transaction. Failures are
    /// logged, never propagated.
    pub fn write_registers(&self, entries: &[RegisterEntry]) {
        match self.link.write_registers(entries) {
            Ok(()) => info!(count = entries.len(), "device register write success"),
            Err(e) => error!(error = %e, "device register write failed"),
        }
    }

    /// Read a batch of register entries in one transaction. Failures are
    /// logged and yield an empty map.
    pub fn read_registers(&self, addrs: &[RegAddr]) -> HashMap<RegAddr, u32> {
        let mut entries: Vec<RegisterEntry> = addrs
            .iter()
            .map(|addr| RegisterEntry {
                addr: *addr,
                data: 0,
            })
            .collect();
        match self.link.read_registers(&mut entries) {
            Ok(()) => {
                info!(count = entries.len(), "device register read success");
                entries.into_iter().map(|e| (e.addr, e.data)).collect()
            }
            Err(e) => {
                error!(error = %e, "device register read failed");
                HashMap::new()
            }
        }
    }

    //
    // DAC / ADC
    //

    /// Program one DAC output. The trigger commits the four previously
    /// latched wire fields, so it must come last.
    pub fn write_dac(&self, address: u32, channel: u32, value: u32) -> LinkResult<()> {
        self.link.set_wire(dac::ADDR, address, dac::SELECT)?;
        self.link.set_wire(dac::ADDR, dac::WRITE_MODE, dac::MODE)?;
        self.link.set_wire(dac::ADDR, channel, dac::CHANNEL)?;
        self.link.set_wire(dac::ADDR, value, dac::VALUE)?;
        self.link.commit_wires()?;
        self.link.fire_trigger(trig_in::ADDR, trig_in::TRIG_DAC)
    }

    /// Whether the last requested ADC conversion has data ready
    pub fn adc_data_valid(&self) -> LinkResult<bool> {
        self.link.read_trigger(trig_out::ADDR, trig_out::ADC_DATA_VALID)
    }

    /// Request one ADC conversion and wait for the data-valid flag.
    /// `None` means the conversion never completed, not a zero reading.
    pub fn read_adc(&self, device_id: u32, channel: u32) -> LinkResult<Option<u16>> {
        self.link
            .set_wire(adc_select::ADDR, device_id, adc_select::DEVICE_ID)?;
        self.link
            .set_wire(adc_select::ADDR, channel, adc_select::CHANNEL)?;
        self.link.commit_wires()?;
        self.link.fire_trigger(trig_in::ADDR, trig_in::TRIG_ADC)?;

        let valid = wait_until(
            || self.adc_data_valid().unwrap_or(false),
            ADC_TIMEOUT,
            FLAG_POLL,
        );
        if !valid {
            error!(device_id, channel, "adc data-valid timeout");
            return Ok(None);
        }
        let raw = self.link.read_wire(adc_data::ADDR, adc_data::DATA)?;
        Ok(Some(raw as u16))
    }

    //
    // Capture control
    //

    pub fn start_capture(&self) -> LinkResult<()> {
        self.reset_fifo()?;
        self.reset_ram()?;
        self.link.set_wire(control::ADDR, 1, control::WRITE_EN_RAM)?;
        self.link.commit_wires()?;
        self.link.fire_trigger(trig_in::ADDR, trig_in::START)
    }

    pub fn stop_capture(&self) -> LinkResult<()> {
        self.link.fire_trigger(trig_in::ADDR, trig_in::STOP)
    }

    /// Whether a full frame has been captured since the last poll
    pub fn is_captured(&self) -> LinkResult<bool> {
        self.link.read_trigger(trig_out::ADDR, trig_out::VIDEO_DONE)
    }

    /// Whether a set of events is ready to be read out
    pub fn events_done(&self) -> LinkResult<bool> {
        self.link.read_trigger(trig_out::ADDR, trig_out::EVENTS_DONE)
    }

    //
    // Resets and mode lines
    //

    pub fn reset_device(&self) -> LinkResult<()> {
        self.link.set_wire_pulse(control::ADDR, control::RESET)
    }

    pub fn reset_chip(&self) -> LinkResult<()> {
        self.link.set_wire_pulse(control::ADDR, control::RESET_CHIP)
    }

    pub fn reset_peripheral(&self) -> LinkResult<()> {
        self.link.set_wire_pulse(control::ADDR, control::RESET_PERIPH)
    }

    pub fn reset_ram(&self) -> LinkResult<()> {
        self.link.set_wire_pulse(control::ADDR, control::RESET_RAM)
    }

    /// Clear both RAM enables, then pulse the FIFO reset
    pub fn reset_fifo(&self) -> LinkResult<()> {
        self.link.set_wire(control::ADDR, 0, control::READ_EN_RAM)?;
        self.link.set_wire(control::ADDR, 0, control::WRITE_EN_RAM)?;
        self.link.set_wire_pulse(control::ADDR, control::RESET_FIFO)
    }

    /// Whether the RAM controller finished its power-on calibration
    pub fn check_calibration(&self) -> LinkResult<bool> {
        Ok(self.link.read_wire(calib::ADDR, calib::CALIB)? != 0)
    }

    pub fn event_count(&self) -> LinkResult<u32> {
        self.link.read_wire(evt_count::ADDR, evt_count::COUNT)
    }

    /// RAM (read, write) pointers for backpressure checks
    pub fn ram_addresses(&self) -> LinkResult<(u32, u32)> {
        let rd = self.link.read_wire(ram_addr::READ_ADDR, ram_addr::ADDR_RD)?;
        let wr = self.link.read_wire(ram_addr::WRITE_ADDR, ram_addr::ADDR_WR)?;
        Ok((rd, wr))
    }

    /// The latched AER (x, y) address pair
    pub fn read_aer_xy(&self) -> LinkResult<(u32, u32)> {
        let x = self.link.read_wire(aer_xy::ADDR, aer_xy::X)?;
        let y = self.link.read_wire(aer_xy::ADDR, aer_xy::Y)?;
        Ok((x, y))
    }

    /// Drive the 3-bit acquisition mode lines
    pub fn set_mode(&self, mode: u32) -> LinkResult<()> {
        self.link.set_wire(control::ADDR, mode, control::MODES)?;
        self.link.commit_wires()
    }

    pub fn set_test_mode(&self, enabled: bool) -> LinkResult<()> {
        let value = u32::from(enabled);
        self.link.set_wire(control::ADDR, value, control::TEST_TFS_EN)?;
        self.link.set_wire(control::ADDR, value, control::CLK_TFS_EN)?;
        self.link.commit_wires()
    }

    pub fn enable_chip_clock(&self, enabled: bool) -> LinkResult<()> {
        self.link
            .set_wire(control::ADDR, u32::from(enabled), control::CLK_20M_EN)?;
        self.link.commit_wires()
    }

    pub fn set_aux_signal(&self, index: usize, value: u32) -> LinkResult<()> {
        let Some(field) = control::AUX.get(index) else {
            warn!(index, "no such aux signal");
            return Ok(());
        };
        self.link.set_wire(control::ADDR, value, *field)?;
        self.link.commit_wires()
    }

    pub fn set_pcb_switch(&self, bit: usize, value: u32) -> LinkResult<()> {
        let Some(field) = pcb_switches::BITS.get(bit) else {
            warn!(bit, "no such pcb switch");
            return Ok(());
        };
        self.link.set_wire(pcb_switches::ADDR, value, *field)?;
        self.link.commit_wires()
    }

    //
    // RAM streaming
    //

    /// Read `n` bytes of RAM after a FIFO/RAM reset, deasserting the read
    /// enable afterwards. `n` is rounded down to a multiple of 16.
    pub fn read_ram(&self, n: usize) -> LinkResult<Vec<u8>> {
        self.reset_fifo()?;
        self.reset_ram()?;
        let data = self.read_ram_chunks(n)?;
        self.link.set_wire(control::ADDR, 0, control::READ_EN_RAM)?;
        self.link.commit_wires()?;
        Ok(data)
    }

    /// Read `n` bytes of RAM without disturbing an ongoing capture, then
    /// acknowledge the events as consumed
    pub fn read_ram_raw(&self, n: usize) -> LinkResult<Vec<u8>> {
        let data = self.read_ram_chunks(n)?;
        self.link.fire_trigger(trig_in::ADDR, trig_in::EVENTS_READ)?;
        Ok(data)
    }

    fn read_ram_chunks(&self, n: usize) -> LinkResult<Vec<u8>> {
        self.link.set_wire(control::ADDR, 1, control::READ_EN_RAM)?;
        self.link.commit_wires()?;
        // The block pipe serves multiples of 16 only
        let total = (n / 16) * 16;
        let mut data = Vec::with_capacity(total);
        let mut read = 0;
        while read < total {
            let chunk = RAM_READBUF_SIZE.min(total - read);
            data.extend(self.link.read_block(RAM_PIPE, RAM_BLOCK_SIZE, chunk)?);
            read += chunk;
        }
        Ok(data)
    }

    //
    // Serial sub-channel
    //

    pub fn serial_tx_full(&self) -> LinkResult<bool> {
        Ok(self
            .link
            .read_wire(serial_status::ADDR, serial_status::TX_FULL)?
            != 0)
    }

    pub fn serial_rx_empty(&self) -> LinkResult<bool> {
        Ok(self
            .link
            .read_wire(serial_status::ADDR, serial_status::RX_EMPTY)?
            != 0)
    }

    /// Push `data` through the serial TX FIFO. The byte count is programmed
    /// first, the FIFOs are reset (unread RX data is lost), then bytes go
    /// out through the four byte lanes, one trigger pulse per chunk of four.
    /// The TX-full spin has no deadline; a stuck FIFO stalls the caller.
    pub fn write_serial(&self, data: &[u8]) -> LinkResult<()> {
        let mut buf = data.to_vec();
        buf.reverse();
        self.link
            .write_register(SERIAL_LEN_REG, data.len() as u32)?;
        self.link
            .fire_trigger(trig_in::ADDR, trig_in::SERIAL_RX_RST_FIFO)?;

        let mut remaining = buf.len();
        while remaining > 0 {
            while self.serial_tx_full().unwrap_or(false) {
                debug!("serial tx fifo full");
                std::thread::sleep(FLAG_POLL);
            }
            for (i, lane) in serial_tx::LANES.iter().enumerate() {
                if remaining > i {
                    self.link
                        .set_wire(serial_tx::ADDR, u32::from(buf[remaining - 1 - i]), *lane)?;
                }
            }
            self.link.commit_wires()?;
            self.link
                .fire_trigger(trig_in::ADDR, trig_in::SERIAL_TX_WEN)?;
            remaining = remaining.saturating_sub(4);
        }
        debug!(bytes = data.len(), "bytes sent to the serial driver");
        Ok(())
    }

    /// Drain the serial RX FIFO. `None` means the FIFO was empty before the
    /// first read (the chip never answered), which is distinct from an
    /// empty-but-valid response.
    pub fn read_serial(&self) -> LinkResult<Option<Vec<u8>>> {
        if self.serial_rx_empty()? {
            error!("no rx data in the serial fifo; chip did not answer or the delay was too short");
            return Ok(None);
        }
        let mut data = Vec::new();
        loop {
            self.link
                .fire_trigger(trig_in::ADDR, trig_in::SERIAL_RX_REN)?;
            let byte = self
                .link
                .read_wire(serial_status::ADDR, serial_status::RX_BYTE)?;
            data.push(byte as u8);
            if self.serial_rx_empty()? {
                break;
            }
        }
        debug!(bytes = data.len(), "bytes read from the serial driver");
        Ok(Some(data))
    }
}

impl<I> std::fmt::Debug for ProtocolActions<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolActions").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interconnect::mock::Mock;
    use crate::registers::WireIn;
    use crate::session::{DeviceInfo, Session};
    use std::sync::Arc;

    fn rig() -> (ProtocolActions<Mock>, Mock) {
        let mock = Mock::new();
        let session = Arc::new(Session::new());
        session.attach(mock.clone(), DeviceInfo::default()).unwrap();
        (ProtocolActions::new(DeviceLink::new(session)), mock)
    }

    macro_rules! test_reset_line {
        ($name:ident, $field:expr) => {
            paste::paste! {
                #[test]
                fn [<$name _pulses_its_line>]() {
                    let (actions, mock) = rig();
                    actions.$name().unwrap();
                    let pulses = mock
                        .wire_commit_values(control::ADDR)
                        .iter()
                        .filter(|word| $field.extract(**word) == 1)
                        .count();
                    assert_eq!(pulses, 1);
                    // The line is back low after the pulse
                    assert_eq!($field.extract(mock.committed_wire(control::ADDR)), 0);
                }
            }
        };
    }

    test_reset_line!(reset_device, control::RESET);
    test_reset_line!(reset_chip, control::RESET_CHIP);
    test_reset_line!(reset_ram, control::RESET_RAM);
    test_reset_line!(reset_peripheral, control::RESET_PERIPH);

    #[test]
    fn dac_write_latches_fields_then_triggers() {
        let (actions, mock) = rig();
        actions.write_dac(2, 1, 0xABC).unwrap();
        let word = mock.committed_wire(dac::ADDR);
        assert_eq!(dac::SELECT.extract(word), 2);
        assert_eq!(dac::MODE.extract(word), dac::WRITE_MODE);
        assert_eq!(dac::CHANNEL.extract(word), 1);
        assert_eq!(dac::VALUE.extract(word), 0xABC);
        assert_eq!(
            mock.fired_triggers().last(),
            Some(&(trig_in::ADDR, trig_in::TRIG_DAC))
        );
    }

    #[test]
    fn adc_read_returns_data_when_valid() {
        let (actions, mock) = rig();
        mock.auto_trigger_out(trig_out::ADDR, trig_out::ADC_DATA_VALID.mask());
        mock.script_wire_out(adc_data::ADDR, 0x5A5);
        let value = actions.read_adc(1, 2).unwrap();
        assert_eq!(value, Some(0x5A5));
        let word = mock.committed_wire(adc_select::ADDR);
        assert_eq!(adc_select::DEVICE_ID.extract(word), 1);
        assert_eq!(adc_select::CHANNEL.extract(word), 2);
    }

    #[test]
    fn adc_read_times_out_to_no_reading() {
        let (actions, _mock) = rig();
        // Data-valid never latches
        assert_eq!(actions.read_adc(0, 0).unwrap(), None);
    }

    #[test]
    fn start_capture_enables_ram_writes() {
        let (actions, mock) = rig();
        actions.start_capture().unwrap();
        let word = mock.committed_wire(control::ADDR);
        assert_eq!(control::WRITE_EN_RAM.extract(word), 1);
        assert_eq!(control::READ_EN_RAM.extract(word), 0);
        assert_eq!(
            mock.fired_triggers().last(),
            Some(&(trig_in::ADDR, trig_in::START))
        );
    }

    #[test]
    fn ram_read_rounds_down_and_deasserts_enable() {
        let (actions, mock) = rig();
        let data = actions.read_ram(100).unwrap();
        assert_eq!(data.len(), 96);
        assert_eq!(mock.pipe_read_sizes(), vec![96]);
        let word = mock.committed_wire(control::ADDR);
        assert_eq!(control::READ_EN_RAM.extract(word), 0);
    }

    #[test]
    fn ram_read_chunks_at_the_buffer_bound() {
        let (actions, mock) = rig();
        let n = RAM_READBUF_SIZE * 2 + 100;
        let data = actions.read_ram(n).unwrap();
        assert_eq!(data.len(), (n / 16) * 16);
        assert_eq!(
            mock.pipe_read_sizes(),
            vec![RAM_READBUF_SIZE, RAM_READBUF_SIZE, (n / 16) * 16 - 2 * RAM_READBUF_SIZE]
        );
    }

    #[test]
    fn raw_ram_read_acknowledges_events() {
        let (actions, mock) = rig();
        let data = actions.read_ram_raw(32).unwrap();
        assert_eq!(data.len(), 32);
        assert_eq!(
            mock.fired_triggers().last(),
            Some(&(trig_in::ADDR, trig_in::EVENTS_READ))
        );
    }

    #[test]
    fn serial_write_reverses_and_groups_into_lanes() {
        let (actions, mock) = rig();
        actions.write_serial(&[0x10, 0x20, 0x30]).unwrap();
        assert_eq!(mock.register(SERIAL_LEN_REG), 3);
        // One chunk, three lanes populated, transmit order preserved
        let wens = mock
            .fired_triggers()
            .iter()
            .filter(|(_, bit)| *bit == trig_in::SERIAL_TX_WEN)
            .count();
        assert_eq!(wens, 1);
        let word = mock.committed_wire(serial_tx::ADDR);
        assert_eq!(serial_tx::BYTE3.extract(word), 0x10);
        assert_eq!(serial_tx::BYTE2.extract(word), 0x20);
        assert_eq!(serial_tx::BYTE1.extract(word), 0x30);
        assert_eq!(serial_tx::BYTE0.extract(word), 0);
        assert_eq!(mock.sent_serial(), vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn serial_write_splits_chunks_of_four() {
        let (actions, mock) = rig();
        actions
            .write_serial(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
            .unwrap();
        let wens = mock
            .fired_triggers()
            .iter()
            .filter(|(_, bit)| *bit == trig_in::SERIAL_TX_WEN)
            .count();
        assert_eq!(wens, 2);
        assert_eq!(mock.sent_serial(), vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn serial_write_waits_for_tx_space() {
        let (actions, mock) = rig();
        mock.script_wire_out(serial_status::ADDR, serial_status::TX_FULL.mask());
        let unblock = {
            let mock = mock.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                mock.script_wire_out(serial_status::ADDR, 0);
            })
        };
        actions.write_serial(&[0xEE]).unwrap();
        unblock.join().unwrap();
        assert_eq!(mock.sent_serial(), vec![0xEE]);
    }

    #[test]
    fn serial_read_distinguishes_no_data() {
        let (actions, mock) = rig();
        assert_eq!(actions.read_serial().unwrap(), None);
        mock.push_serial_rx(&[0x17, 0x3C]);
        assert_eq!(actions.read_serial().unwrap(), Some(vec![0x17, 0x3C]));
    }

    #[test]
    fn calibration_flag_reads_back() {
        let (actions, mock) = rig();
        assert!(!actions.check_calibration().unwrap());
        mock.script_wire_out(calib::ADDR, 1);
        assert!(actions.check_calibration().unwrap());
    }

    #[test]
    fn batched_register_failure_is_absorbed() {
        let (actions, mock) = rig();
        mock.fail_next(-1);
        // Must not return an error
        actions.write_registers(&[RegisterEntry {
            addr: RegAddr(0x01),
            data: 7,
        }]);
        mock.fail_next(-1);
        let map = actions.read_registers(&[RegAddr(0x01)]);
        assert!(map.is_empty());
    }

    #[test]
    fn aux_signal_out_of_range_is_ignored() {
        let (actions, mock) = rig();
        actions.set_aux_signal(9, 1).unwrap();
        assert_eq!(mock.committed_wire(control::ADDR), 0);
        actions.set_aux_signal(0, 1).unwrap();
        assert_eq!(
            control::AUX[0].extract(mock.committed_wire(control::ADDR)),
            1
        );
    }

    #[test]
    fn pcb_switch_drives_its_bit() {
        let (actions, mock) = rig();
        actions.set_pcb_switch(3, 1).unwrap();
        assert_eq!(mock.committed_wire(WireIn(0x03)), 1 << 3);
    }
}
