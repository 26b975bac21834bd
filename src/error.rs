//! Error taxonomy for device transactions and configuration loading

use std::time::Duration;
use thiserror::Error;

/// Failures of primitive or composed device transactions.
///
/// Hardware-status failures (`Io`) are logged where they occur and absorbed
/// by the acquisition layers, which fall back to a zero/default result.
/// `NotConnected` and `LockTimeout` abort the operation without effect.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No device is attached to the session
    #[error("no device is attached")]
    NotConnected,
    /// The device mutex could not be acquired within its bound
    #[error("device mutex not acquired within {0:?}")]
    LockTimeout(Duration),
    /// The interconnect reported a nonzero status for a transaction
    #[error("interconnect transaction failed with code {code}")]
    Io {
        /// Raw vendor status code
        code: i32,
    },
}

/// Alias for results of device transactions
pub type LinkResult<T> = Result<T, LinkError>;

/// Configuration-schema violations. These are fatal and surface to the
/// caller instead of being absorbed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration section {0} is empty")]
    EmptySection(&'static str),
    #[error("duplicate label {0:?} in {1}")]
    DuplicateLabel(String, &'static str),
    #[error("signal {0:?} overlaps another signal in register {1:?}")]
    OverlappingSignals(String, String),
    #[error("signal {0:?} has zero width")]
    ZeroWidthSignal(String),
    #[error("signal {0:?} is not defined by any chip register")]
    MissingSignal(String),
    #[error("register {0:?} is not defined")]
    MissingRegister(String),
    #[error("mode {0:?} is not defined")]
    UnknownMode(String),
    #[error("image geometry must be nonzero, got {width}x{height}")]
    BadGeometry { width: usize, height: usize },
}
