//! The interface to the radio front end.
//!
//! Everything the capture and discipline logic needs from the hardware goes
//! through [`RadioSession`] and [`RxStream`]. Board-level calls (clock source,
//! sensors, PPS time) take a board index the same way a multi-board USRP
//! session addresses its motherboards.

use std::time::Duration;

use hifitime::Epoch;
use thiserror::Error;

use crate::complex::ComplexShort;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("driver call `{call}` failed: {message}")]
    Driver { call: &'static str, message: String },
    #[error("board {0} does not exist")]
    NoSuchBoard(usize),
    #[error("sensor `{0}` is not present")]
    NoSuchSensor(String),
    #[error("sensor `{name}` returned `{value}`, which is not a {expected}")]
    SensorType {
        name: String,
        value: String,
        expected: &'static str,
    },
}

impl HardwareError {
    pub fn driver(call: &'static str, message: impl Into<String>) -> Self {
        Self::Driver {
            call,
            message: message.into(),
        }
    }
}

/// Center frequency request, with the local oscillator pushed `lo_offset` Hz
/// away from the target so its leakage lands outside the band of interest
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneRequest {
    pub target_freq: f64,
    pub lo_offset: f64,
}

impl TuneRequest {
    pub fn new(target_freq: f64, lo_offset: f64) -> Self {
        Self {
            target_freq,
            lo_offset,
        }
    }

    /// Where the LO itself ends up
    pub fn lo_freq(&self) -> f64 {
        self.target_freq + self.lo_offset
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl SensorValue {
    pub fn to_bool(&self, name: &str) -> Result<bool, HardwareError> {
        match self {
            SensorValue::Bool(b) => Ok(*b),
            SensorValue::Int(i) => Ok(*i != 0),
            SensorValue::Text(s) => match s.trim() {
                "true" | "TRUE" | "True" | "1" => Ok(true),
                "false" | "FALSE" | "False" | "0" => Ok(false),
                _ => Err(self.type_error(name, "bool")),
            },
        }
    }

    pub fn to_int(&self, name: &str) -> Result<i64, HardwareError> {
        match self {
            SensorValue::Int(i) => Ok(*i),
            SensorValue::Bool(b) => Ok(*b as i64),
            SensorValue::Text(s) => s.trim().parse().map_err(|_| self.type_error(name, "int")),
        }
    }

    fn type_error(&self, name: &str, expected: &'static str) -> HardwareError {
        HardwareError::SensorType {
            name: name.to_owned(),
            value: format!("{:?}", self),
            expected,
        }
    }
}

/// Per-pull status reported by the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Ok,
    Timeout,
    Overflow,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    /// Samples actually written into the front of the buffer
    pub count: usize,
    pub status: StreamStatus,
    /// Hardware time of the first sample, in nanoseconds, if the stream has one
    pub time_ns: Option<i64>,
}

/// A receive stream of complex 16-bit samples
pub trait RxStream {
    fn issue_start_continuous(&mut self) -> Result<(), HardwareError>;
    fn issue_stop_continuous(&mut self) -> Result<(), HardwareError>;
    /// Pull at most `buf.len()` samples, blocking no longer than `timeout`
    fn pull(
        &mut self,
        buf: &mut [ComplexShort],
        timeout: Duration,
    ) -> Result<PullResult, HardwareError>;
}

/// An open connection to one or more radio boards
pub trait RadioSession {
    type Stream: RxStream;

    fn num_boards(&self) -> usize;
    fn board_name(&self, board: usize) -> Result<String, HardwareError>;
    /// Whether the attached model carries a GPS-disciplined oscillator at all
    fn has_gpsdo(&self) -> bool;

    fn set_rate(&mut self, rate: f64, channel: usize) -> Result<(), HardwareError>;
    fn rate(&self, channel: usize) -> Result<f64, HardwareError>;
    fn set_frequency(&mut self, request: TuneRequest, channel: usize)
        -> Result<(), HardwareError>;
    fn frequency(&self, channel: usize) -> Result<f64, HardwareError>;
    fn set_gain(&mut self, gain: f64, channel: usize) -> Result<(), HardwareError>;
    fn gain(&self, channel: usize) -> Result<f64, HardwareError>;

    fn set_clock_source(&mut self, source: &str, board: usize) -> Result<(), HardwareError>;
    fn set_time_source(&mut self, source: &str, board: usize) -> Result<(), HardwareError>;
    fn sensor_names(&self, board: usize) -> Result<Vec<String>, HardwareError>;
    fn sensor(&self, name: &str, board: usize) -> Result<SensorValue, HardwareError>;
    /// Board time latched at the most recent PPS edge
    fn time_last_pps(&self, board: usize) -> Result<Epoch, HardwareError>;
    /// Program the board time to become `time` at the next PPS edge
    fn set_time_next_pps(&mut self, time: Epoch, board: usize) -> Result<(), HardwareError>;

    fn open_stream(&mut self, channels: &[usize]) -> Result<Self::Stream, HardwareError>;
}
