//! Typed configuration schema
//!
//! Parsing a file into this schema is the caller's concern; the schema
//! itself is validated once at load time so malformed sections fail with a
//! [`ConfigError`] up front instead of at first use.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

/// Frame rotation applied by display collaborators
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotate {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

/// Frame mirroring applied by display collaborators
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flip {
    #[default]
    None,
    MX,
    MY,
}

/// Pixel geometry of the sensor
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub rotate: Rotate,
    #[serde(default)]
    pub flip: Flip,
}

/// One acquisition mode and its 3-bit gateware code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeDef {
    pub label: String,
    pub code: u32,
}

/// One FPGA register-file entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegisterDef {
    pub label: String,
    pub address: u32,
    #[serde(default)]
    pub default: u32,
}

/// One named sub-field of a chip register
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDef {
    pub label: String,
    pub bit: u32,
    pub width: u32,
}

/// One register of the attached chip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipRegisterDef {
    pub label: String,
    pub address: u8,
    #[serde(default)]
    pub default: u32,
    #[serde(default)]
    pub signals: Vec<SignalDef>,
}

/// One DAC output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DacDef {
    pub label: String,
    pub address: u32,
    pub channel: u32,
    #[serde(default)]
    pub default: u32,
}

/// One housekeeping ADC channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdcDef {
    pub label: String,
    pub device_id: u32,
    pub channel: u32,
    pub offset: f64,
    pub slope: f64,
}

fn default_operation_timeout() -> f64 {
    5.0
}

fn default_adc_interval() -> f64 {
    1.0
}

/// The whole per-device-type configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Selects the capture-hook factory from the registry
    pub chip_name: String,
    pub image: ImageGeometry,
    /// Budget for polled hardware waits, seconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_s: f64,
    /// Pause between housekeeping sweeps, seconds
    #[serde(default = "default_adc_interval")]
    pub adc_sample_interval_s: f64,
    pub modes: Vec<ModeDef>,
    #[serde(default)]
    pub device_registers: Vec<DeviceRegisterDef>,
    #[serde(default)]
    pub chip_registers: Vec<ChipRegisterDef>,
    #[serde(default)]
    pub dacs: Vec<DacDef>,
    #[serde(default)]
    pub adcs: Vec<AdcDef>,
}

fn check_unique<'a>(
    labels: impl Iterator<Item = &'a str>,
    section: &'static str,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for label in labels {
        if !seen.insert(label) {
            return Err(ConfigError::DuplicateLabel(label.to_string(), section));
        }
    }
    Ok(())
}

impl SensorConfig {
    /// Check every invariant the banks rely on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.width == 0 || self.image.height == 0 {
            return Err(ConfigError::BadGeometry {
                width: self.image.width,
                height: self.image.height,
            });
        }
        if self.modes.is_empty() {
            return Err(ConfigError::EmptySection("modes"));
        }
        for mode in &self.modes {
            if mode.code > 7 {
                warn!(label = %mode.label, code = mode.code, "mode code is wider than the 3-bit field");
            }
        }
        check_unique(self.modes.iter().map(|m| m.label.as_str()), "modes")?;
        check_unique(
            self.device_registers.iter().map(|r| r.label.as_str()),
            "device_registers",
        )?;
        check_unique(
            self.chip_registers.iter().map(|r| r.label.as_str()),
            "chip_registers",
        )?;
        check_unique(self.dacs.iter().map(|d| d.label.as_str()), "dacs")?;
        check_unique(self.adcs.iter().map(|a| a.label.as_str()), "adcs")?;

        for register in &self.chip_registers {
            let mut used = 0u32;
            for signal in &register.signals {
                if signal.width == 0 {
                    return Err(ConfigError::ZeroWidthSignal(signal.label.clone()));
                }
                let mask = crate::bitfield::BitField::new(signal.bit, signal.width).mask();
                if used & mask != 0 {
                    return Err(ConfigError::OverlappingSignals(
                        signal.label.clone(),
                        register.label.clone(),
                    ));
                }
                used |= mask;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.operation_timeout_s)
    }

    #[must_use]
    pub fn adc_interval(&self) -> Duration {
        Duration::from_secs_f64(self.adc_sample_interval_s)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn minimal() -> SensorConfig {
        SensorConfig {
            chip_name: "test-chip".into(),
            image: ImageGeometry {
                width: 4,
                height: 4,
                rotate: Rotate::R0,
                flip: Flip::None,
            },
            operation_timeout_s: 0.2,
            adc_sample_interval_s: 0.01,
            modes: vec![ModeDef {
                label: "frames".into(),
                code: 0,
            }],
            device_registers: Vec::new(),
            chip_registers: Vec::new(),
            dacs: Vec::new(),
            adcs: Vec::new(),
        }
    }

    #[test]
    fn minimal_config_validates() {
        minimal().validate().unwrap();
    }

    #[test]
    fn empty_modes_are_rejected() {
        let mut config = minimal();
        config.modes.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptySection("modes"))
        ));
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let mut config = minimal();
        config.dacs = vec![
            DacDef {
                label: "VREF".into(),
                address: 0,
                channel: 0,
                default: 0,
            },
            DacDef {
                label: "VREF".into(),
                address: 1,
                channel: 1,
                default: 0,
            },
        ];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateLabel(label, "dacs")) if label == "VREF"
        ));
    }

    #[test]
    fn overlapping_signals_are_rejected() {
        let mut config = minimal();
        config.chip_registers = vec![ChipRegisterDef {
            label: "CTRL".into(),
            address: 0x17,
            default: 0,
            signals: vec![
                SignalDef {
                    label: "A".into(),
                    bit: 0,
                    width: 3,
                },
                SignalDef {
                    label: "B".into(),
                    bit: 2,
                    width: 2,
                },
            ],
        }];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OverlappingSignals(signal, _)) if signal == "B"
        ));
    }

    #[test]
    fn zero_geometry_is_rejected() {
        let mut config = minimal();
        config.image.width = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadGeometry { .. })
        ));
    }

    #[test]
    fn unknown_rotate_codes_fail_at_parse() {
        assert!(serde_json::from_value::<Rotate>(serde_json::json!("R90")).is_ok());
        assert!(serde_json::from_value::<Rotate>(serde_json::json!("R45")).is_err());
        assert!(serde_json::from_value::<Flip>(serde_json::json!("MZ")).is_err());
    }
}
