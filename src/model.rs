//! The device model: configuration-driven banks bound to protocol actions
//!
//! All mutating operations push a [`ModelEvent`] so display collaborators
//! can refresh. Hardware-status failures are absorbed here (the link layer
//! already logged them); only configuration violations surface.

use crate::actions::ProtocolActions;
use crate::adc::AdcChannel;
use crate::chip::{Bank, ChipRegister, ChipSignal, Dac, DeviceRegister};
use crate::config::{ImageGeometry, SensorConfig};
use crate::error::{ConfigError, LinkResult};
use crate::interconnect::{Interconnect, RegisterEntry};
use crate::notify::Notifier;
use crate::registers::RegAddr;
use crate::serial::{SerialFramer, SerialOp};
use kstring::KString;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Pushed to subscribers after the model mutates
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ModelEvent;

/// In-memory snapshot of every writable setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub mode: String,
    pub device_registers: Vec<(String, u32)>,
    pub chip_signals: Vec<(String, u32)>,
    pub dacs: Vec<(String, u32)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared state of one attached sensor
pub struct SensorModel<I> {
    chip_name: KString,
    actions: ProtocolActions<I>,
    framer: Box<dyn SerialFramer>,
    device_registers: Mutex<Bank<DeviceRegister>>,
    chip_registers: Mutex<Bank<ChipRegister>>,
    dacs: Mutex<Bank<Dac>>,
    adcs: Mutex<Bank<AdcChannel>>,
    modes: Vec<(KString, u32)>,
    current_mode: AtomicU32,
    geometry: ImageGeometry,
    operation_timeout: Duration,
    adc_interval: Mutex<Duration>,
    updates: Notifier<ModelEvent>,
}

impl<I> SensorModel<I> {
    /// Build the banks from a validated configuration
    pub fn new(
        config: &SensorConfig,
        actions: ProtocolActions<I>,
        framer: Box<dyn SerialFramer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut device_registers = Bank::new();
        for def in &config.device_registers {
            device_registers.insert(DeviceRegister::new(
                KString::from_ref(def.label.as_str()),
                RegAddr(def.address),
                def.default,
            ));
        }

        let mut chip_registers = Bank::new();
        for def in &config.chip_registers {
            let register = if def.signals.is_empty() {
                ChipRegister::new(KString::from_ref(def.label.as_str()), def.address, def.default)
            } else {
                let signals = def
                    .signals
                    .iter()
                    .map(|s| ChipSignal::new(KString::from_ref(s.label.as_str()), s.bit, s.width))
                    .collect();
                ChipRegister::with_signals(KString::from_ref(def.label.as_str()), def.address, def.default, signals)
            };
            chip_registers.insert(register);
        }

        let mut dacs = Bank::new();
        for def in &config.dacs {
            dacs.insert(Dac::new(
                KString::from_ref(def.label.as_str()),
                def.address,
                def.channel,
                def.default,
            ));
        }

        let mut adcs = Bank::new();
        for def in &config.adcs {
            adcs.insert(AdcChannel::new(
                KString::from_ref(def.label.as_str()),
                def.device_id,
                def.channel,
                def.offset,
                def.slope,
            ));
        }

        let modes: Vec<(KString, u32)> = config
            .modes
            .iter()
            .map(|m| (KString::from_ref(&m.label), m.code))
            .collect();
        let current_mode = AtomicU32::new(modes[0].1);

        Ok(Self {
            chip_name: KString::from_ref(&config.chip_name),
            actions,
            framer,
            device_registers: Mutex::new(device_registers),
            chip_registers: Mutex::new(chip_registers),
            dacs: Mutex::new(dacs),
            adcs: Mutex::new(adcs),
            modes,
            current_mode,
            geometry: config.image,
            operation_timeout: config.operation_timeout(),
            adc_interval: Mutex::new(config.adc_interval()),
            updates: Notifier::default(),
        })
    }

    #[must_use]
    pub fn actions(&self) -> &ProtocolActions<I> {
        &self.actions
    }

    /// The configured chip name, as used by the hook registry
    #[must_use]
    pub fn chip_name(&self) -> &str {
        &self.chip_name
    }

    #[must_use]
    pub fn geometry(&self) -> ImageGeometry {
        self.geometry
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    #[must_use]
    pub fn adc_interval(&self) -> Duration {
        *lock(&self.adc_interval)
    }

    pub fn set_adc_interval(&self, interval: Duration) {
        *lock(&self.adc_interval) = interval;
    }

    /// Register a model-update subscriber
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&ModelEvent) + Send + Sync + 'static,
    {
        self.updates.subscribe(f);
    }

    pub(crate) fn notify(&self) {
        self.updates.notify(&ModelEvent);
    }

    /// The gateware code of the active mode
    #[must_use]
    pub fn current_mode(&self) -> u32 {
        self.current_mode.load(Ordering::SeqCst)
    }

    /// The label of the active mode
    #[must_use]
    pub fn current_mode_label(&self) -> &str {
        let code = self.current_mode();
        self.modes
            .iter()
            .find(|(_, c)| *c == code)
            .map_or("", |(label, _)| label)
    }

    /// The cached value of a device register
    #[must_use]
    pub fn device_register_value(&self, label: &str) -> Option<u32> {
        lock(&self.device_registers).get(label).map(|r| r.value)
    }

    /// The cached value of the device register at `addr`
    #[must_use]
    pub fn device_register_value_by_address(&self, addr: RegAddr) -> Option<u32> {
        lock(&self.device_registers)
            .iter()
            .find(|r| r.address == addr)
            .map(|r| r.value)
    }

    /// Cached (label, value) pairs of every device register
    #[must_use]
    pub fn device_register_values(&self) -> Vec<(String, u32)> {
        lock(&self.device_registers)
            .iter()
            .map(|r| (r.label.to_string(), r.value))
            .collect()
    }

    /// Run `f` against the ADC bank
    pub fn with_adcs<R>(&self, f: impl FnOnce(&mut Bank<AdcChannel>) -> R) -> R {
        f(&mut lock(&self.adcs))
    }

    pub fn reset_adc_samples(&self) {
        for channel in lock(&self.adcs).iter_mut() {
            channel.reset_samples();
        }
    }
}

impl<I> SensorModel<I>
where
    I: Interconnect,
{
    /// Write one device register and mirror it in the bank
    pub fn write_device_register(&self, label: &str, value: u32) -> Result<(), ConfigError> {
        let addr = {
            let mut bank = lock(&self.device_registers);
            let Some(register) = bank.get_mut(label) else {
                return Err(ConfigError::MissingRegister(label.to_string()));
            };
            register.value = value;
            register.address
        };
        if let Err(e) = self.actions.write_register(addr, value) {
            error!(label, error = %e, "device register write failed");
        }
        self.notify();
        Ok(())
    }

    /// Read one device register from the hardware
    pub fn read_device_register(&self, label: &str) -> Result<u32, ConfigError> {
        let addr = lock(&self.device_registers)
            .get(label)
            .map(|r| r.address)
            .ok_or_else(|| ConfigError::MissingRegister(label.to_string()))?;
        Ok(self.actions.read_register(addr).unwrap_or(0))
    }

    /// Update the named registers in the bank, then push the whole bank to
    /// the device in one batched transaction
    pub fn write_device_registers(&self, values: &[(String, u32)]) {
        let entries: Vec<RegisterEntry> = {
            let mut bank = lock(&self.device_registers);
            for (label, value) in values {
                bank.update_or_warn(label, |r| r.value = *value);
            }
            bank.iter()
                .map(|r| RegisterEntry {
                    addr: r.address,
                    data: r.value,
                })
                .collect()
        };
        self.actions.write_registers(&entries);
        self.notify();
    }

    /// Refresh the whole bank from the device in one batched transaction
    pub fn read_device_registers(&self) {
        let addrs: Vec<RegAddr> = lock(&self.device_registers)
            .iter()
            .map(|r| r.address)
            .collect();
        let read = self.actions.read_registers(&addrs);
        {
            let mut bank = lock(&self.device_registers);
            for register in bank.iter_mut() {
                if let Some(value) = read.get(&register.address) {
                    register.value = *value;
                }
            }
        }
        self.notify();
    }

    /// Write one chip signal through the serial sub-channel.
    /// Every register carrying the signal is updated and sent.
    pub fn write_signal(&self, label: &str, value: u32) -> Result<(), ConfigError> {
        let mut frames = Vec::new();
        {
            let mut bank = lock(&self.chip_registers);
            for register in bank.iter_mut() {
                if register.set_signal(label, value) {
                    match self.framer.encode(SerialOp::Write, register) {
                        Ok(frame) => frames.push(frame),
                        Err(e) => error!(label, error = %e, "serial frame encoding failed"),
                    }
                }
            }
        }
        if frames.is_empty() {
            return Err(ConfigError::MissingSignal(label.to_string()));
        }
        for frame in frames {
            debug!(frame = ?frame, "serial write");
            if let Err(e) = self.actions.write_serial(&frame) {
                error!(label, error = %e, "serial write failed");
            }
        }
        self.notify();
        Ok(())
    }

    /// Write several chip signals
    pub fn write_signals(&self, values: &[(String, u32)]) -> Result<(), ConfigError> {
        for (label, value) in values {
            self.write_signal(label, *value)?;
        }
        Ok(())
    }

    /// Refresh every chip register through the serial sub-channel
    pub fn read_signals(&self) {
        let labels: Vec<KString> = lock(&self.chip_registers)
            .iter()
            .map(|r| KString::from_ref(crate::chip::Labeled::label(r)))
            .collect();
        for label in labels {
            let frame = {
                let bank = lock(&self.chip_registers);
                let Some(register) = bank.get(&label) else {
                    continue;
                };
                self.framer.encode(SerialOp::Read, register)
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    error!(label = %label, error = %e, "serial frame encoding failed");
                    continue;
                }
            };
            debug!(frame = ?frame, "serial read request");
            if let Err(e) = self.actions.write_serial(&frame) {
                error!(label = %label, error = %e, "serial write failed");
                continue;
            }
            match self.actions.read_serial() {
                Ok(Some(reply)) => {
                    let mut bank = lock(&self.chip_registers);
                    if let Some(register) = bank.get_mut(&label) {
                        match self.framer.decode(&reply, register) {
                            Some(value) => register.set_value(value),
                            None => error!(label = %label, "malformed serial response"),
                        }
                    }
                }
                Ok(None) => error!(label = %label, "no serial response"),
                Err(e) => error!(label = %label, error = %e, "serial read failed"),
            }
        }
        self.notify();
    }

    /// Read one chip signal, refreshing every register first
    pub fn read_signal(&self, label: &str) -> Result<u32, ConfigError> {
        self.read_signals();
        lock(&self.chip_registers)
            .iter()
            .find_map(|r| r.get_signal(label))
            .ok_or_else(|| ConfigError::MissingSignal(label.to_string()))
    }

    /// Cached (label, value) pairs of every chip signal
    #[must_use]
    pub fn chip_signal_values(&self) -> Vec<(String, u32)> {
        lock(&self.chip_registers)
            .iter()
            .flat_map(|r| {
                r.signals()
                    .iter()
                    .filter_map(|s| Some((s.label.to_string(), r.get_signal(&s.label)?)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Update the named DACs in the bank, then program every DAC
    pub fn write_dacs(&self, values: &[(String, u32)]) {
        let programmed: Vec<(u32, u32, u32)> = {
            let mut bank = lock(&self.dacs);
            for (label, value) in values {
                bank.update_or_warn(label, |d| d.value = *value);
            }
            bank.iter()
                .map(|d| (d.address, d.channel, d.value))
                .collect()
        };
        for (address, channel, value) in programmed {
            if let Err(e) = self.actions.write_dac(address, channel, value) {
                error!(error = %e, "dac write failed");
            }
        }
        self.notify();
    }

    /// Cached (label, value) pairs of every DAC
    #[must_use]
    pub fn dac_values(&self) -> Vec<(String, u32)> {
        lock(&self.dacs)
            .iter()
            .map(|d| (d.label.to_string(), d.value))
            .collect()
    }

    /// Select an acquisition mode by label and drive the mode lines
    pub fn set_mode(&self, label: &str) -> Result<(), ConfigError> {
        let code = self
            .modes
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, c)| *c)
            .ok_or_else(|| ConfigError::UnknownMode(label.to_string()))?;
        if code > 7 {
            warn!(label, code, "mode code is wider than the 3-bit field");
        }
        self.current_mode.store(code, Ordering::SeqCst);
        if let Err(e) = self.actions.set_mode(code & 7) {
            error!(label, error = %e, "mode select failed");
        }
        Ok(())
    }

    /// Read one image buffer: `width * height * nsamples` 32-bit pixels
    pub fn read_image(&self, nsamples: usize) -> LinkResult<Vec<u32>> {
        let nbytes = self.geometry.width * self.geometry.height * 4 * nsamples;
        Ok(to_words(&self.actions.read_ram(nbytes)?))
    }

    /// Read `nbytes` of raw event words without disturbing the capture
    pub fn read_raw(&self, nbytes: usize) -> LinkResult<Vec<u32>> {
        Ok(to_words(&self.actions.read_ram_raw(nbytes)?))
    }

    /// Sweep every enabled ADC channel once, stamping samples with `t`
    pub fn sample_adcs(&self, t: f64) {
        {
            let mut bank = lock(&self.adcs);
            for channel in bank.iter_mut().filter(|c| c.enabled) {
                match self.actions.read_adc(channel.device_id, channel.channel) {
                    Ok(Some(raw)) => channel.add_sample(t, raw, false),
                    Ok(None) => {}
                    Err(e) => error!(label = %channel.label, error = %e, "adc read failed"),
                }
            }
        }
        self.notify();
    }

    /// Snapshot every writable setting
    #[must_use]
    pub fn preset(&self) -> Preset {
        Preset {
            mode: self.current_mode_label().to_string(),
            device_registers: self.device_register_values(),
            chip_signals: self.chip_signal_values(),
            dacs: self.dac_values(),
        }
    }

    /// Apply a snapshot: mode, registers, DACs, then chip signals
    pub fn apply_preset(&self, preset: &Preset) -> Result<(), ConfigError> {
        self.set_mode(&preset.mode)?;
        self.write_device_registers(&preset.device_registers);
        self.write_dacs(&preset.dacs);
        self.write_signals(&preset.chip_signals)
    }
}

/// Reinterpret a little-endian byte buffer as 32-bit event words
fn to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl<I> std::fmt::Debug for SensorModel<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorModel")
            .field("modes", &self.modes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdcDef, ChipRegisterDef, DacDef, DeviceRegisterDef, SignalDef};
    use crate::interconnect::mock::Mock;
    use crate::link::DeviceLink;
    use crate::registers::{adc_data, trig_out};
    use crate::serial::StandardFramer;
    use crate::session::{DeviceInfo, Session};
    use std::sync::Arc;

    fn test_config() -> SensorConfig {
        let mut config = crate::config::tests::minimal();
        config.device_registers = vec![
            DeviceRegisterDef {
                label: "EXPOSURE".into(),
                address: 0x05,
                default: 10,
            },
            DeviceRegisterDef {
                label: "N_FRAMES".into(),
                address: 0x06,
                default: 1,
            },
        ];
        config.chip_registers = vec![ChipRegisterDef {
            label: "CTRL".into(),
            address: 0x17,
            default: 0,
            signals: vec![SignalDef {
                label: "GAIN".into(),
                bit: 0,
                width: 3,
            }],
        }];
        config.dacs = vec![DacDef {
            label: "VREF".into(),
            address: 1,
            channel: 2,
            default: 0x100,
        }];
        config.adcs = vec![AdcDef {
            label: "VDD".into(),
            device_id: 0,
            channel: 1,
            offset: 0.0,
            slope: 1.0,
        }];
        config
    }

    fn rig() -> (Arc<SensorModel<Mock>>, Mock) {
        let mock = Mock::new();
        let session = Arc::new(Session::new());
        session.attach(mock.clone(), DeviceInfo::default()).unwrap();
        let actions = ProtocolActions::new(DeviceLink::new(session));
        let model = SensorModel::new(&test_config(), actions, Box::new(StandardFramer)).unwrap();
        (Arc::new(model), mock)
    }

    #[test]
    fn device_register_write_reaches_hardware_and_bank() {
        let (model, mock) = rig();
        model.write_device_register("EXPOSURE", 42).unwrap();
        assert_eq!(mock.register(RegAddr(0x05)), 42);
        assert_eq!(model.device_register_value("EXPOSURE"), Some(42));
        assert!(model.write_device_register("MISSING", 1).is_err());
    }

    #[test]
    fn device_register_read_comes_from_hardware() {
        let (model, mock) = rig();
        mock.set_register(RegAddr(0x06), 7);
        assert_eq!(model.read_device_register("N_FRAMES").unwrap(), 7);
        // The cached value only refreshes through the batched read
        assert_eq!(model.device_register_value("N_FRAMES"), Some(1));
        model.read_device_registers();
        assert_eq!(model.device_register_value("N_FRAMES"), Some(7));
    }

    #[test]
    fn signal_write_frames_and_sends() {
        let (model, mock) = rig();
        model.write_signal("GAIN", 5).unwrap();
        // Write frame: address 0x17 with the write bit, value 5
        assert_eq!(mock.sent_serial(), vec![0x97, 0x05]);
        assert!(matches!(
            model.write_signal("NOPE", 1),
            Err(ConfigError::MissingSignal(_))
        ));
    }

    #[test]
    fn signal_readback_decodes_the_reply() {
        let (model, mock) = rig();
        mock.set_serial_responder(|frame| vec![frame[0], 0x42]);
        assert_eq!(model.read_signal("GAIN").unwrap(), 0x42 & 0b111);
        // The whole register value was refreshed, not just the signal
        let values = model.chip_signal_values();
        assert_eq!(values, vec![("GAIN".to_string(), 0x42 & 0b111)]);
    }

    #[test]
    fn dac_bank_programs_every_output() {
        let (model, mock) = rig();
        model.write_dacs(&[("VREF".to_string(), 0xABC)]);
        let word = mock.committed_wire(crate::registers::dac::ADDR);
        assert_eq!(crate::registers::dac::VALUE.extract(word), 0xABC);
        assert_eq!(crate::registers::dac::CHANNEL.extract(word), 2);
        assert_eq!(crate::registers::dac::SELECT.extract(word), 1);
    }

    #[test]
    fn image_read_is_sized_by_geometry() {
        let (model, mock) = rig();
        mock.push_pipe(crate::registers::RAM_PIPE, &[1, 0, 0, 0, 2, 0, 0, 0]);
        let image = model.read_image(1).unwrap();
        // 4x4 pixels, 4 bytes each
        assert_eq!(image.len(), 16);
        assert_eq!(image[0], 1);
        assert_eq!(image[1], 2);
        assert_eq!(image[2], 0);
    }

    #[test]
    fn adc_sweep_fills_the_window_and_notifies() {
        let (model, mock) = rig();
        mock.auto_trigger_out(trig_out::ADDR, trig_out::ADC_DATA_VALID.mask());
        mock.script_wire_out(adc_data::ADDR, 0x123);
        let events = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let events = Arc::clone(&events);
            model.subscribe(move |_| {
                events.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        model.sample_adcs(0.5);
        assert_eq!(events.load(std::sync::atomic::Ordering::SeqCst), 1);
        let samples = model.with_adcs(|bank| {
            bank.get("VDD")
                .map(|c| c.samples().collect::<Vec<_>>())
                .unwrap_or_default()
        });
        assert_eq!(samples, vec![(0.5, f64::from(0x123u16))]);
    }

    #[test]
    fn mode_select_masks_to_three_bits() {
        let (model, mock) = rig();
        model.set_mode("frames").unwrap();
        assert_eq!(model.current_mode(), 0);
        assert!(model.set_mode("nope").is_err());
        let word = mock.committed_wire(crate::registers::control::ADDR);
        assert_eq!(crate::registers::control::MODES.extract(word), 0);
    }

    #[test]
    fn preset_roundtrips_through_apply() {
        let (model, _mock) = rig();
        model.write_device_register("EXPOSURE", 99).unwrap();
        model.write_dacs(&[("VREF".to_string(), 0x200)]);
        model.write_signal("GAIN", 3).unwrap();
        let preset = model.preset();
        assert_eq!(preset.mode, "frames");

        let (fresh, _mock2) = rig();
        fresh.apply_preset(&preset).unwrap();
        assert_eq!(fresh.device_register_value("EXPOSURE"), Some(99));
        assert_eq!(fresh.dac_values(), vec![("VREF".to_string(), 0x200)]);
        assert_eq!(fresh.chip_signal_values(), vec![("GAIN".to_string(), 3)]);
    }
}
