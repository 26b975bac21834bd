//! Endpoint addresses and bit assignments of the readout gateware
//!
//! The interconnect exposes four disjoint address spaces (wire-in, wire-out,
//! trigger, pipe) plus a 32-bit register file. Each space gets its own
//! newtype so an address can never be used against the wrong space, and the
//! bit assignments inside each word live next to the address they belong to.

use crate::bitfield::BitField;

/// Address of a host-to-device level-held wire
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WireIn(pub u8);

/// Address of a device-to-host level-held wire
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WireOut(pub u8);

/// Address of an edge-pulsed trigger bank (either direction)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TriggerAddr(pub u8);

/// Address of a streaming block pipe
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PipeAddr(pub u8);

/// Address in the 32-bit register file
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegAddr(pub u32);

/// Peripheral control wire
pub mod control {
    use super::*;

    pub const ADDR: WireIn = WireIn(0x00);

    pub const RESET: BitField = BitField::bit(0);
    pub const RESET_FIFO: BitField = BitField::bit(1);
    pub const RESET_RAM: BitField = BitField::bit(2);
    pub const READ_EN_RAM: BitField = BitField::bit(3);
    pub const WRITE_EN_RAM: BitField = BitField::bit(4);
    pub const RESET_PERIPH: BitField = BitField::bit(5);
    pub const SHORT_MODE: BitField = BitField::bit(7);
    pub const TEST_TFS_EN: BitField = BitField::bit(8);
    pub const TEST_TFS_MODE: BitField = BitField::bit(9);
    pub const RESET_CHIP: BitField = BitField::bit(10);
    pub const AUX0: BitField = BitField::bit(20);
    pub const AUX1: BitField = BitField::bit(21);
    pub const AUX2: BitField = BitField::bit(22);
    pub const AUX3: BitField = BitField::bit(23);
    pub const AUX4: BitField = BitField::bit(24);
    pub const AUX5: BitField = BitField::bit(25);
    pub const CLK_20M_EN: BitField = BitField::bit(26);
    pub const CLK_TFS_EN: BitField = BitField::bit(27);
    pub const MODES: BitField = BitField::new(29, 3);

    /// Auxiliary lines in index order
    pub const AUX: [BitField; 6] = [AUX0, AUX1, AUX2, AUX3, AUX4, AUX5];
}

/// Serial TX byte-lane wire; four bytes are loaded per commit
pub mod serial_tx {
    use super::*;

    pub const ADDR: WireIn = WireIn(0x01);

    pub const BYTE0: BitField = BitField::new(0, 8);
    pub const BYTE1: BitField = BitField::new(8, 8);
    pub const BYTE2: BitField = BitField::new(16, 8);
    pub const BYTE3: BitField = BitField::new(24, 8);
    /// Lanes in transmit order (first byte of a chunk goes to BYTE3)
    pub const LANES: [BitField; 4] = [BYTE3, BYTE2, BYTE1, BYTE0];
}

/// ADC channel-select wire
pub mod adc_select {
    use super::*;

    pub const ADDR: WireIn = WireIn(0x02);

    pub const CHANNEL: BitField = BitField::new(0, 2);
    pub const DEVICE_ID: BitField = BitField::new(2, 2);
}

/// PCB switch wire
pub mod pcb_switches {
    use super::*;

    pub const ADDR: WireIn = WireIn(0x03);

    pub const BITS: [BitField; 7] = [
        BitField::bit(0),
        BitField::bit(1),
        BitField::bit(2),
        BitField::bit(3),
        BitField::bit(4),
        BitField::bit(5),
        BitField::bit(6),
    ];
}

/// DAC programming wire
pub mod dac {
    use super::*;

    pub const ADDR: WireIn = WireIn(0x04);

    pub const VALUE: BitField = BitField::new(0, 12);
    pub const CHANNEL: BitField = BitField::new(12, 2);
    pub const MODE: BitField = BitField::new(14, 2);
    pub const SELECT: BitField = BitField::new(16, 2);

    /// MODE field value that commits a write
    pub const WRITE_MODE: u32 = 0x01;
}

/// Register-file address holding the serial TX byte count
pub const SERIAL_LEN_REG: RegAddr = RegAddr(0x08);

/// RAM calibration status wire
pub mod calib {
    use super::*;

    pub const ADDR: WireOut = WireOut(0x20);

    pub const CALIB: BitField = BitField::bit(0);
}

/// Serial controller status wire
pub mod serial_status {
    use super::*;

    pub const ADDR: WireOut = WireOut(0x21);

    pub const RX_BYTE: BitField = BitField::new(0, 8);
    pub const RX_EMPTY: BitField = BitField::bit(8);
    pub const CTRL_OVERFLOW: BitField = BitField::bit(9);
    pub const TX_FULL: BitField = BitField::bit(10);
}

/// Latched AER address wire
pub mod aer_xy {
    use super::*;

    pub const ADDR: WireOut = WireOut(0x22);

    pub const X: BitField = BitField::new(0, 16);
    pub const Y: BitField = BitField::new(16, 16);
}

/// ADC conversion result wire
pub mod adc_data {
    use super::*;

    pub const ADDR: WireOut = WireOut(0x23);

    pub const DATA: BitField = BitField::new(0, 12);
}

/// Accumulated event counter wire
pub mod evt_count {
    use super::*;

    pub const ADDR: WireOut = WireOut(0x27);

    pub const COUNT: BitField = BitField::new(0, 32);
}

/// RAM read/write pointer wires
pub mod ram_addr {
    use super::*;

    pub const READ_ADDR: WireOut = WireOut(0x28);
    pub const WRITE_ADDR: WireOut = WireOut(0x29);

    pub const ADDR_RD: BitField = BitField::new(0, 32);
    pub const ADDR_WR: BitField = BitField::new(0, 32);
}

/// Command trigger bank
pub mod trig_in {
    use super::*;

    pub const ADDR: TriggerAddr = TriggerAddr(0x41);

    pub const START: u8 = 0;
    pub const TRIG_DAC: u8 = 1;
    pub const SERIAL_TX_WEN: u8 = 2;
    pub const SERIAL_RX_RST_FIFO: u8 = 3;
    pub const SERIAL_RX_REN: u8 = 4;
    pub const TRIG_ADC: u8 = 5;
    pub const STOP: u8 = 6;
    pub const EVENTS_READ: u8 = 7;
}

/// Completion trigger bank; flags are latch-and-test
pub mod trig_out {
    use super::*;

    pub const ADDR: TriggerAddr = TriggerAddr(0x60);

    pub const FRAME_DONE: BitField = BitField::bit(0);
    pub const VIDEO_DONE: BitField = BitField::bit(1);
    pub const ADC_DATA_VALID: BitField = BitField::bit(2);
    pub const EVENTS_DONE: BitField = BitField::bit(3);
}

/// RAM readout pipe
pub const RAM_PIPE: PipeAddr = PipeAddr(0xA0);
