//! Radio configuration and the validation gate in front of capture.
//!
//! Hardware is free to clamp or round what we ask for without complaining, so
//! every setting is read back and compared before a single sample is kept.

use thiserror::Error;
use tracing::{debug, error, info};

use crate::hardware::{HardwareError, RadioSession, TuneRequest};

/// Fraction of one second of samples pulled from the stream per call
pub const CHUNK_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadioConfig {
    /// Center frequency in Hz
    pub center_freq: f64,
    /// Samples per second. One capture buffer holds one second of these.
    pub sample_rate: f64,
    /// Receive gain in dB
    pub gain: f64,
    /// LO offset in Hz used while tuning
    pub lo_offset: f64,
    pub channel: usize,
}

impl RadioConfig {
    pub fn tune_request(&self) -> TuneRequest {
        TuneRequest::new(self.center_freq, self.lo_offset)
    }

    fn check_request(&self) -> Result<(), ConfigError> {
        if !self.sample_rate.is_finite() || self.sample_rate < 1.0 {
            return Err(ConfigError::InvalidRequest("sample rate must be at least 1 S/s"));
        }
        if !self.center_freq.is_finite() || !self.gain.is_finite() || !self.lo_offset.is_finite()
        {
            return Err(ConfigError::InvalidRequest(
                "frequency, gain and LO offset must be finite",
            ));
        }
        Ok(())
    }
}

/// Where a receiver is on its way to capturing. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ConfigState {
    #[default]
    Uninitialized,
    Initialized,
    Configured,
    Validated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    Gain,
    Frequency,
    Rate,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("cannot {action} while the receiver is {state:?}")]
    InvalidState {
        action: &'static str,
        state: ConfigState,
    },
    #[error("invalid configuration: {0}")]
    InvalidRequest(&'static str),
    #[error("gain mismatch: requested {requested} dB, hardware reports {actual} dB")]
    GainMismatch { requested: f64, actual: f64 },
    #[error("frequency mismatch: requested {requested:.4} Hz, hardware reports {actual} Hz")]
    FrequencyMismatch { requested: f64, actual: f64 },
    #[error("rate mismatch: requested {requested} S/s, hardware reports {actual} S/s")]
    RateMismatch { requested: f64, actual: f64 },
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl ConfigError {
    /// Which setting the hardware refused to honor, if that is what went wrong
    pub fn field(&self) -> Option<ConfigField> {
        match self {
            ConfigError::GainMismatch { .. } => Some(ConfigField::Gain),
            ConfigError::FrequencyMismatch { .. } => Some(ConfigField::Frequency),
            ConfigError::RateMismatch { .. } => Some(ConfigField::Rate),
            _ => None,
        }
    }
}

/// Buffer sizes that follow from the sample rate the hardware actually accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureGeometry {
    /// Samples per buffer, one second's worth
    pub buffer_capacity: usize,
    /// Samples per stream pull
    pub chunk_len: usize,
}

impl CaptureGeometry {
    pub fn from_rate(rate: f64) -> Self {
        let buffer_capacity = (rate.round() as usize).max(1);
        let chunk_len = ((CHUNK_FRACTION * rate) as usize).clamp(1, buffer_capacity);
        Self {
            buffer_capacity,
            chunk_len,
        }
    }
}

/// Push `config` to the hardware: rate, then frequency, then gain.
///
/// Rate goes first so the tuning isn't computed against a stale rate. The
/// returned geometry is derived from the rate read back after setting it.
pub fn apply<S: RadioSession>(
    session: &mut S,
    config: &RadioConfig,
) -> Result<CaptureGeometry, ConfigError> {
    config.check_request()?;
    let ch = config.channel;

    debug!("Setting RX rate to {} S/s", config.sample_rate);
    session.set_rate(config.sample_rate, ch)?;
    let geometry = CaptureGeometry::from_rate(session.rate(ch)?);

    let request = config.tune_request();
    debug!(
        "Tuning RX to {} Hz (LO at {} Hz)",
        request.target_freq,
        request.lo_freq()
    );
    session.set_frequency(request, ch)?;

    debug!("Setting RX gain to {} dB", config.gain);
    session.set_gain(config.gain, ch)?;

    info!(
        "Configured channel {}: {} Hz, {} S/s, {} dB",
        ch, config.center_freq, config.sample_rate, config.gain
    );
    Ok(geometry)
}

/// Read every setting back and fail on the first one that doesn't match.
/// No attempt is made to correct anything.
pub fn validate<S: RadioSession>(session: &S, config: &RadioConfig) -> Result<(), ConfigError> {
    let ch = config.channel;

    let gain = session.gain(ch)?;
    if gain != config.gain {
        error!("Actual RX gain: {} dB", gain);
        return Err(ConfigError::GainMismatch {
            requested: config.gain,
            actual: gain,
        });
    }

    let freq = session.frequency(ch)?;
    if freq.round() != config.center_freq {
        error!("Intended RX freq: {:.4} Hz", config.center_freq);
        error!("Actual RX freq: {} Hz", freq);
        return Err(ConfigError::FrequencyMismatch {
            requested: config.center_freq,
            actual: freq,
        });
    }

    let rate = session.rate(ch)?;
    if rate.round() != config.sample_rate {
        error!("Actual RX rate: {} S/s", rate);
        return Err(ConfigError::RateMismatch {
            requested: config.sample_rate,
            actual: rate,
        });
    }

    info!("Hardware honored the requested configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBoardConfig, SimRadioConfig, SimulatedRadio};

    fn config(rate: f64) -> RadioConfig {
        RadioConfig {
            center_freq: 915e6,
            sample_rate: rate,
            gain: 20.0,
            lo_offset: 5e3,
            channel: 0,
        }
    }

    #[test]
    fn test_geometry_from_rate() {
        let g = CaptureGeometry::from_rate(1_000_000.0);
        assert_eq!(g.buffer_capacity, 1_000_000);
        assert_eq!(g.chunk_len, 100_000);
        // Tiny rates still pull at least one sample at a time
        assert_eq!(CaptureGeometry::from_rate(5.0).chunk_len, 1);
    }

    #[test]
    fn test_apply_order_and_validate() {
        let mut radio = SimulatedRadio::new(SimRadioConfig::default());
        let cfg = config(1e6);
        let geometry = apply(&mut radio, &cfg).unwrap();
        assert_eq!(geometry.buffer_capacity, 1_000_000);
        assert_eq!(radio.call_log(), vec!["set_rate", "set_frequency", "set_gain"]);
        assert_eq!(radio.last_tune_request(), Some(cfg.tune_request()));
        validate(&radio, &cfg).unwrap();
    }

    #[test]
    fn test_fractional_rate_is_a_mismatch() {
        let mut radio = SimulatedRadio::new(SimRadioConfig {
            rate_resolution: Some(1.0),
            ..Default::default()
        });
        let cfg = config(999_999.6);
        apply(&mut radio, &cfg).unwrap();
        assert_eq!(radio.rate(0).unwrap(), 1_000_000.0);
        let err = validate(&radio, &cfg).unwrap_err();
        assert_eq!(err.field(), Some(ConfigField::Rate));
        assert!(matches!(
            err,
            ConfigError::RateMismatch { actual, .. } if actual == 1_000_000.0
        ));
    }

    #[test]
    fn test_clamped_gain_fails_first() {
        let mut radio = SimulatedRadio::new(SimRadioConfig {
            max_gain: 10.0,
            // Also knock the rate off so we can see gain is checked first
            rate_resolution: Some(3.0),
            ..Default::default()
        });
        let cfg = config(1e6);
        apply(&mut radio, &cfg).unwrap();
        let err = validate(&radio, &cfg).unwrap_err();
        assert_eq!(
            err,
            ConfigError::GainMismatch {
                requested: 20.0,
                actual: 10.0
            }
        );
    }

    #[test]
    fn test_frequency_rounding() {
        let mut radio = SimulatedRadio::new(SimRadioConfig {
            freq_resolution: Some(1e3),
            ..Default::default()
        });
        // 915 MHz lands on the 1 kHz grid, 915.0004 MHz doesn't
        apply(&mut radio, &config(1e6)).unwrap();
        validate(&radio, &config(1e6)).unwrap();

        let mut radio = SimulatedRadio::new(SimRadioConfig {
            freq_resolution: Some(1e3),
            ..Default::default()
        });
        let cfg = RadioConfig {
            center_freq: 915_000_400.0,
            ..config(1e6)
        };
        apply(&mut radio, &cfg).unwrap();
        assert_eq!(
            validate(&radio, &cfg).unwrap_err().field(),
            Some(ConfigField::Frequency)
        );
    }

    #[test]
    fn test_bad_request_never_touches_hardware() {
        let mut radio = SimulatedRadio::new(SimRadioConfig {
            boards: vec![SimBoardConfig::default()],
            ..Default::default()
        });
        let err = apply(&mut radio, &config(0.0)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRequest(_)));
        assert!(radio.call_log().is_empty());
    }
}
