//! Real hardware through SoapySDR.
//!
//! Every board is its own [`soapysdr::Device`]; the first one carries the
//! receive chain and the stream. Clock and time sources, sensors and PPS time
//! are addressed per board.

use std::time::Duration;

use hifitime::Epoch;
use soapysdr::{Args, Device, Direction, ErrorCode};
use tracing::{debug, error, info};

use crate::{
    complex::ComplexShort,
    hardware::{
        HardwareError, PullResult, RadioSession, RxStream, SensorValue, StreamStatus, TuneRequest,
    },
};

/// Hardware time key that addresses the last latched PPS edge
const PPS_TIME: &str = "PPS";

/// Logs which SoapySDR call failed before turning the error into ours
fn soapycheck<T>(call: &'static str, result: Result<T, soapysdr::Error>) -> Result<T, HardwareError> {
    result.map_err(|e| {
        error!("SoapySDR: Failed to {}: {}", call, e);
        HardwareError::driver(call, e.to_string())
    })
}

fn parse_sensor(raw: String) -> SensorValue {
    let trimmed = raw.trim();
    match trimmed {
        "true" => SensorValue::Bool(true),
        "false" => SensorValue::Bool(false),
        _ => match trimmed.parse() {
            Ok(i) => SensorValue::Int(i),
            Err(_) => SensorValue::Text(raw),
        },
    }
}

pub struct SoapySession {
    boards: Vec<Device>,
    gpsdo: bool,
}

impl SoapySession {
    /// Open one device per `key=value,...` argument string
    pub fn open(device_args: &[String]) -> Result<Self, HardwareError> {
        let mut boards = Vec::with_capacity(device_args.len().max(1));
        if device_args.is_empty() {
            boards.push(soapycheck("open SoapySDR device", Device::new(Args::new()))?);
        }
        for args in device_args {
            boards.push(soapycheck(
                "open SoapySDR device",
                Device::new(args.as_str()),
            )?);
        }
        // A GPSDO shows up as a selectable clock source
        let gpsdo = match boards.first() {
            Some(dev) => soapycheck("list clock sources", dev.list_clock_sources())?
                .iter()
                .any(|s| s == "gpsdo"),
            None => false,
        };
        info!("Opened {} SoapySDR device(s)", boards.len());
        Ok(Self { boards, gpsdo })
    }

    fn board(&self, board: usize) -> Result<&Device, HardwareError> {
        self.boards.get(board).ok_or(HardwareError::NoSuchBoard(board))
    }

    fn rx(&self) -> Result<&Device, HardwareError> {
        self.board(0)
    }
}

impl RadioSession for SoapySession {
    type Stream = SoapyStream;

    fn num_boards(&self) -> usize {
        self.boards.len()
    }

    fn board_name(&self, board: usize) -> Result<String, HardwareError> {
        soapycheck("read hardware key", self.board(board)?.hardware_key())
    }

    fn has_gpsdo(&self) -> bool {
        self.gpsdo
    }

    fn set_rate(&mut self, rate: f64, channel: usize) -> Result<(), HardwareError> {
        soapycheck(
            "set RX sample rate",
            self.rx()?.set_sample_rate(Direction::Rx, channel, rate),
        )
    }

    fn rate(&self, channel: usize) -> Result<f64, HardwareError> {
        soapycheck(
            "read RX sample rate",
            self.rx()?.sample_rate(Direction::Rx, channel),
        )
    }

    fn set_frequency(
        &mut self,
        request: TuneRequest,
        channel: usize,
    ) -> Result<(), HardwareError> {
        let mut args = Args::new();
        args.set("OFFSET", request.lo_offset.to_string());
        soapycheck(
            "set RX frequency",
            self.rx()?
                .set_frequency(Direction::Rx, channel, request.target_freq, args),
        )
    }

    fn frequency(&self, channel: usize) -> Result<f64, HardwareError> {
        soapycheck("read RX frequency", self.rx()?.frequency(Direction::Rx, channel))
    }

    fn set_gain(&mut self, gain: f64, channel: usize) -> Result<(), HardwareError> {
        soapycheck("set RX gain", self.rx()?.set_gain(Direction::Rx, channel, gain))
    }

    fn gain(&self, channel: usize) -> Result<f64, HardwareError> {
        soapycheck("read RX gain", self.rx()?.gain(Direction::Rx, channel))
    }

    fn set_clock_source(&mut self, source: &str, board: usize) -> Result<(), HardwareError> {
        soapycheck("set clock source", self.board(board)?.set_clock_source(source))
    }

    fn set_time_source(&mut self, source: &str, board: usize) -> Result<(), HardwareError> {
        soapycheck("set time source", self.board(board)?.set_time_source(source))
    }

    fn sensor_names(&self, board: usize) -> Result<Vec<String>, HardwareError> {
        soapycheck("list sensors", self.board(board)?.list_sensors())
    }

    fn sensor(&self, name: &str, board: usize) -> Result<SensorValue, HardwareError> {
        let dev = self.board(board)?;
        let present = soapycheck("list sensors", dev.list_sensors())?;
        if !present.iter().any(|s| s == name) {
            return Err(HardwareError::NoSuchSensor(name.to_owned()));
        }
        soapycheck("read sensor", dev.read_sensor(name)).map(parse_sensor)
    }

    fn time_last_pps(&self, board: usize) -> Result<Epoch, HardwareError> {
        let ns = soapycheck(
            "read PPS time",
            self.board(board)?.get_hardware_time(Some(PPS_TIME)),
        )?;
        Ok(Epoch::from_unix_seconds(ns as f64 / 1e9))
    }

    fn set_time_next_pps(&mut self, time: Epoch, board: usize) -> Result<(), HardwareError> {
        let ns = time.to_unix_seconds().round() as i64 * 1_000_000_000;
        soapycheck(
            "set time at next PPS",
            self.board(board)?.set_hardware_time(Some(PPS_TIME), ns),
        )
    }

    fn open_stream(&mut self, channels: &[usize]) -> Result<SoapyStream, HardwareError> {
        let stream = soapycheck(
            "setup RX stream",
            self.rx()?.rx_stream::<ComplexShort>(channels),
        )?;
        debug!("Opened SoapySDR RX stream on channels {:?}", channels);
        Ok(SoapyStream { stream })
    }
}

pub struct SoapyStream {
    stream: soapysdr::RxStream<ComplexShort>,
}

/// Drivers without hardware time leave the stream time at zero
fn stream_time(ns: i64) -> Option<i64> {
    (ns > 0).then_some(ns)
}

impl RxStream for SoapyStream {
    fn issue_start_continuous(&mut self) -> Result<(), HardwareError> {
        soapycheck("activate RX stream", self.stream.activate(None))
    }

    fn issue_stop_continuous(&mut self) -> Result<(), HardwareError> {
        soapycheck("deactivate RX stream", self.stream.deactivate(None))
    }

    fn pull(
        &mut self,
        buf: &mut [ComplexShort],
        timeout: Duration,
    ) -> Result<PullResult, HardwareError> {
        let timeout_us = timeout.as_micros().min(i64::MAX as u128) as i64;
        match self.stream.read(&mut [buf], timeout_us) {
            Ok(count) => Ok(PullResult {
                count,
                status: StreamStatus::Ok,
                time_ns: stream_time(self.stream.time_ns()),
            }),
            Err(e) => {
                let status = match e.code {
                    ErrorCode::Timeout => StreamStatus::Timeout,
                    ErrorCode::Overflow => StreamStatus::Overflow,
                    _ => StreamStatus::Other(e.message),
                };
                Ok(PullResult {
                    count: 0,
                    status,
                    time_ns: None,
                })
            }
        }
    }
}
