//! A simulated multi-board radio.
//!
//! Stands in for the real front end in tests and in `--simulate` runs. It
//! clamps and rounds settings the way real hardware does, runs every board off
//! a shared PPS edge grid, and can inject stream faults at chosen pulls.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use hifitime::Epoch;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace};

use crate::{
    complex::{Complex, ComplexShort},
    hardware::{
        HardwareError, PullResult, RadioSession, RxStream, SensorValue, StreamStatus, TuneRequest,
    },
};

/// Receive channels on every simulated board
pub const SIM_CHANNELS: usize = 2;

#[derive(Debug, Clone)]
pub struct SimBoardConfig {
    pub name: String,
    /// Whether the board exposes a `ref_locked` sensor at all
    pub ref_lock_sensor: bool,
    /// Reference lock is reported after this many polls. `None` never locks.
    pub ref_lock_after: Option<u32>,
    pub gps_locked: bool,
    /// Seconds added to every time this board latches, so it never agrees with GPS
    pub pps_skew_secs: i64,
    /// Make the `gps_time` sensor fail like a missing GPSDO would
    pub gps_fault: bool,
}

impl Default for SimBoardConfig {
    fn default() -> Self {
        Self {
            name: "SIM-N210".to_owned(),
            ref_lock_sensor: true,
            ref_lock_after: Some(0),
            gps_locked: true,
            pps_skew_secs: 0,
            gps_fault: false,
        }
    }
}

/// Something to go wrong on a particular stream pull
#[derive(Debug, Clone, PartialEq)]
pub enum SimFault {
    Timeout,
    Overflow,
    Other(String),
    /// The driver call itself errors out
    Driver,
}

#[derive(Debug, Clone)]
pub struct SimRadioConfig {
    pub boards: Vec<SimBoardConfig>,
    pub gpsdo: bool,
    /// Rates snap to multiples of this
    pub rate_resolution: Option<f64>,
    /// Frequencies snap to multiples of this
    pub freq_resolution: Option<f64>,
    /// Gains clamp to `0..=max_gain`
    pub max_gain: f64,
    pub pps_period: Duration,
    /// Sleep in each pull for as long as the samples would take to arrive
    pub realtime: bool,
    /// Random samples instead of a ramp
    pub noise: bool,
    /// Faults keyed by the zero-based pull index they happen on
    pub faults: Vec<(u64, SimFault)>,
}

impl Default for SimRadioConfig {
    fn default() -> Self {
        Self {
            boards: vec![SimBoardConfig::default()],
            gpsdo: true,
            rate_resolution: None,
            freq_resolution: None,
            max_gain: 76.0,
            pps_period: Duration::from_secs(1),
            realtime: false,
            noise: false,
            faults: vec![],
        }
    }
}

fn snap(value: f64, resolution: Option<f64>) -> f64 {
    match resolution {
        Some(res) if res > 0.0 => (value / res).round() * res,
        _ => value,
    }
}

/// Board time at edge `edge` is `secs`
#[derive(Debug, Clone, Copy)]
struct Anchor {
    edge: u64,
    secs: i64,
}

#[derive(Debug)]
struct SimBoard {
    cfg: SimBoardConfig,
    ref_polls: u32,
    clock_source: String,
    time_source: String,
    anchor: Anchor,
    pending: Option<Anchor>,
}

impl SimBoard {
    fn new(cfg: SimBoardConfig) -> Self {
        Self {
            cfg,
            ref_polls: 0,
            clock_source: "internal".to_owned(),
            time_source: "internal".to_owned(),
            anchor: Anchor { edge: 0, secs: 0 },
            pending: None,
        }
    }

    /// Board time in whole seconds as latched at `edge`
    fn time_at_edge(&mut self, edge: u64) -> i64 {
        if let Some(pending) = self.pending {
            if edge >= pending.edge {
                self.anchor = pending;
                self.pending = None;
            }
        }
        self.anchor.secs + edge.saturating_sub(self.anchor.edge) as i64
    }
}

/// The PPS edge grid every board shares
#[derive(Debug, Clone, Copy)]
struct EdgeClock {
    origin: Instant,
    period: Duration,
    /// GPS (UNIX) seconds at edge zero
    gps_origin_secs: i64,
}

impl EdgeClock {
    fn edge(&self) -> (u64, Duration) {
        let elapsed = self.origin.elapsed();
        let period = self.period.as_nanos().max(1);
        let edge = (elapsed.as_nanos() / period) as u64;
        let since = elapsed.as_nanos() - edge as u128 * period;
        (edge, Duration::from_nanos(since as u64))
    }

    fn gps_secs(&self) -> i64 {
        self.gps_origin_secs + self.edge().0 as i64
    }
}

pub struct SimulatedRadio {
    cfg: SimRadioConfig,
    clock: EdgeClock,
    boards: Arc<Mutex<Vec<SimBoard>>>,
    rate: f64,
    freq: f64,
    gain: f64,
    last_tune: Option<TuneRequest>,
    calls: Vec<&'static str>,
}

fn lock(boards: &Mutex<Vec<SimBoard>>) -> MutexGuard<'_, Vec<SimBoard>> {
    boards.lock().unwrap_or_else(|p| p.into_inner())
}

impl SimulatedRadio {
    pub fn new(cfg: SimRadioConfig) -> Self {
        let clock = EdgeClock {
            origin: Instant::now(),
            period: cfg.pps_period,
            gps_origin_secs: chrono::Utc::now().timestamp(),
        };
        let boards = cfg.boards.iter().cloned().map(SimBoard::new).collect();
        Self {
            cfg,
            clock,
            boards: Arc::new(Mutex::new(boards)),
            rate: 0.0,
            freq: 0.0,
            gain: 0.0,
            last_tune: None,
            calls: vec![],
        }
    }

    /// The settings calls made so far, in order
    pub fn call_log(&self) -> Vec<&'static str> {
        self.calls.clone()
    }

    pub fn last_tune_request(&self) -> Option<TuneRequest> {
        self.last_tune
    }

    /// How many times `ref_locked` has been read on `board`
    pub fn ref_polls(&self, board: usize) -> Option<u32> {
        lock(&self.boards).get(board).map(|b| b.ref_polls)
    }

    /// Clock and time source last selected on `board`
    pub fn sources(&self, board: usize) -> Option<(String, String)> {
        lock(&self.boards)
            .get(board)
            .map(|b| (b.clock_source.clone(), b.time_source.clone()))
    }

    fn check_channel(&self, channel: usize) -> Result<(), HardwareError> {
        if channel < SIM_CHANNELS {
            Ok(())
        } else {
            Err(HardwareError::driver(
                "channel",
                format!("channel {} out of range", channel),
            ))
        }
    }

    fn with_board<T>(
        &self,
        board: usize,
        f: impl FnOnce(&mut SimBoard) -> Result<T, HardwareError>,
    ) -> Result<T, HardwareError> {
        let mut boards = lock(&self.boards);
        let b = boards
            .get_mut(board)
            .ok_or(HardwareError::NoSuchBoard(board))?;
        f(b)
    }
}

impl RadioSession for SimulatedRadio {
    type Stream = SimStream;

    fn num_boards(&self) -> usize {
        self.cfg.boards.len()
    }

    fn board_name(&self, board: usize) -> Result<String, HardwareError> {
        self.with_board(board, |b| Ok(b.cfg.name.clone()))
    }

    fn has_gpsdo(&self) -> bool {
        self.cfg.gpsdo
    }

    fn set_rate(&mut self, rate: f64, channel: usize) -> Result<(), HardwareError> {
        self.check_channel(channel)?;
        self.calls.push("set_rate");
        self.rate = snap(rate, self.cfg.rate_resolution);
        Ok(())
    }

    fn rate(&self, channel: usize) -> Result<f64, HardwareError> {
        self.check_channel(channel)?;
        Ok(self.rate)
    }

    fn set_frequency(
        &mut self,
        request: TuneRequest,
        channel: usize,
    ) -> Result<(), HardwareError> {
        self.check_channel(channel)?;
        self.calls.push("set_frequency");
        // The DSP stage shifts the LO offset back out, so only the target is visible
        self.freq = snap(request.target_freq, self.cfg.freq_resolution);
        self.last_tune = Some(request);
        Ok(())
    }

    fn frequency(&self, channel: usize) -> Result<f64, HardwareError> {
        self.check_channel(channel)?;
        Ok(self.freq)
    }

    fn set_gain(&mut self, gain: f64, channel: usize) -> Result<(), HardwareError> {
        self.check_channel(channel)?;
        self.calls.push("set_gain");
        self.gain = gain.clamp(0.0, self.cfg.max_gain);
        Ok(())
    }

    fn gain(&self, channel: usize) -> Result<f64, HardwareError> {
        self.check_channel(channel)?;
        Ok(self.gain)
    }

    fn set_clock_source(&mut self, source: &str, board: usize) -> Result<(), HardwareError> {
        self.with_board(board, |b| {
            b.clock_source = source.to_owned();
            Ok(())
        })
    }

    fn set_time_source(&mut self, source: &str, board: usize) -> Result<(), HardwareError> {
        self.with_board(board, |b| {
            b.time_source = source.to_owned();
            Ok(())
        })
    }

    fn sensor_names(&self, board: usize) -> Result<Vec<String>, HardwareError> {
        self.with_board(board, |b| {
            let mut names = vec!["gps_locked".to_owned(), "gps_time".to_owned()];
            if b.cfg.ref_lock_sensor {
                names.push("ref_locked".to_owned());
            }
            Ok(names)
        })
    }

    fn sensor(&self, name: &str, board: usize) -> Result<SensorValue, HardwareError> {
        let gps_secs = self.clock.gps_secs();
        self.with_board(board, |b| match name {
            "ref_locked" if b.cfg.ref_lock_sensor => {
                let polls = b.ref_polls;
                b.ref_polls += 1;
                let locked = b.cfg.ref_lock_after.map_or(false, |n| polls >= n);
                Ok(SensorValue::Bool(locked))
            }
            "gps_locked" => Ok(SensorValue::Bool(b.cfg.gps_locked)),
            "gps_time" if b.cfg.gps_fault => Err(HardwareError::driver(
                "get_mboard_sensor",
                "no response from GPSDO",
            )),
            "gps_time" => Ok(SensorValue::Int(gps_secs)),
            other => Err(HardwareError::NoSuchSensor(other.to_owned())),
        })
    }

    fn time_last_pps(&self, board: usize) -> Result<Epoch, HardwareError> {
        let (edge, _) = self.clock.edge();
        self.with_board(board, |b| {
            Ok(Epoch::from_unix_seconds(b.time_at_edge(edge) as f64))
        })
    }

    fn set_time_next_pps(&mut self, time: Epoch, board: usize) -> Result<(), HardwareError> {
        let (edge, _) = self.clock.edge();
        self.with_board(board, |b| {
            // Settle anything already pending before queuing the next one
            b.time_at_edge(edge);
            let secs = time.to_unix_seconds().round() as i64 + b.cfg.pps_skew_secs;
            trace!("Board {} time -> {} at edge {}", b.cfg.name, secs, edge + 1);
            b.pending = Some(Anchor {
                edge: edge + 1,
                secs,
            });
            Ok(())
        })
    }

    fn open_stream(&mut self, channels: &[usize]) -> Result<SimStream, HardwareError> {
        for &ch in channels {
            self.check_channel(ch)?;
        }
        if self.rate <= 0.0 {
            return Err(HardwareError::driver("get_rx_stream", "rate not set"));
        }
        let mut faults: Vec<_> = self.cfg.faults.clone();
        faults.sort_by_key(|(idx, _)| *idx);
        debug!("Opened simulated stream on channels {:?}", channels);
        Ok(SimStream {
            clock: self.clock,
            boards: self.boards.clone(),
            rate: self.rate,
            realtime: self.cfg.realtime,
            rng: if self.cfg.noise {
                Some(StdRng::from_entropy())
            } else {
                None
            },
            faults: faults.into(),
            streaming: false,
            start_ns: 0,
            pulled: 0,
            pulls: 0,
        })
    }
}

pub struct SimStream {
    clock: EdgeClock,
    boards: Arc<Mutex<Vec<SimBoard>>>,
    rate: f64,
    realtime: bool,
    rng: Option<StdRng>,
    faults: VecDeque<(u64, SimFault)>,
    streaming: bool,
    start_ns: i64,
    pulled: u64,
    pulls: u64,
}

impl SimStream {
    /// Board 0's notion of now, in nanoseconds
    fn board_now_ns(&self) -> i64 {
        let (edge, since) = self.clock.edge();
        let secs = lock(&self.boards)
            .get_mut(0)
            .map_or(0, |b| b.time_at_edge(edge));
        let frac = since.as_nanos() * 1_000_000_000 / self.clock.period.as_nanos().max(1);
        secs * 1_000_000_000 + frac as i64
    }

    fn sample(&mut self, n: u64) -> ComplexShort {
        match self.rng.as_mut() {
            Some(rng) => Complex::new(rng.gen(), rng.gen()),
            None => {
                let v = (n & 0x7fff) as i16;
                Complex::new(v, -v)
            }
        }
    }
}

impl RxStream for SimStream {
    fn issue_start_continuous(&mut self) -> Result<(), HardwareError> {
        self.start_ns = self.board_now_ns();
        self.streaming = true;
        Ok(())
    }

    fn issue_stop_continuous(&mut self) -> Result<(), HardwareError> {
        self.streaming = false;
        Ok(())
    }

    fn pull(
        &mut self,
        buf: &mut [ComplexShort],
        _timeout: Duration,
    ) -> Result<PullResult, HardwareError> {
        if !self.streaming {
            return Err(HardwareError::driver("recv", "stream is not running"));
        }
        let idx = self.pulls;
        self.pulls += 1;

        if self.faults.front().map_or(false, |(at, _)| *at == idx) {
            if let Some((_, fault)) = self.faults.pop_front() {
                let status = match fault {
                    SimFault::Timeout => StreamStatus::Timeout,
                    SimFault::Overflow => StreamStatus::Overflow,
                    SimFault::Other(msg) => StreamStatus::Other(msg),
                    SimFault::Driver => {
                        return Err(HardwareError::driver("recv", "simulated driver fault"))
                    }
                };
                return Ok(PullResult {
                    count: 0,
                    status,
                    time_ns: None,
                });
            }
        }

        let first = self.pulled;
        for (i, s) in buf.iter_mut().enumerate() {
            *s = self.sample(first + i as u64);
        }
        self.pulled += buf.len() as u64;
        if self.realtime {
            thread::sleep(Duration::from_secs_f64(buf.len() as f64 / self.rate));
        }
        Ok(PullResult {
            count: buf.len(),
            status: StreamStatus::Ok,
            time_ns: Some(self.start_ns + (first as f64 * 1e9 / self.rate) as i64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge_wait(period: Duration) {
        thread::sleep(period * 2 + period / 2);
    }

    #[test]
    fn test_settings_snap_and_clamp() {
        let mut radio = SimulatedRadio::new(SimRadioConfig {
            rate_resolution: Some(1.0),
            freq_resolution: Some(100.0),
            max_gain: 31.5,
            ..Default::default()
        });
        radio.set_rate(250_000.4, 0).unwrap();
        radio
            .set_frequency(TuneRequest::new(100_000_049.0, 1e3), 0)
            .unwrap();
        radio.set_gain(40.0, 0).unwrap();
        assert_eq!(radio.rate(0).unwrap(), 250_000.0);
        assert_eq!(radio.frequency(0).unwrap(), 100_000_000.0);
        assert_eq!(radio.gain(0).unwrap(), 31.5);
        assert!(radio.set_rate(1e6, SIM_CHANNELS).is_err());
    }

    #[test]
    fn test_ref_lock_after_polls() {
        let radio = SimulatedRadio::new(SimRadioConfig {
            boards: vec![SimBoardConfig {
                ref_lock_after: Some(2),
                ..Default::default()
            }],
            ..Default::default()
        });
        let polls: Vec<bool> = (0..3)
            .map(|_| radio.sensor("ref_locked", 0).unwrap().to_bool("ref_locked").unwrap())
            .collect();
        assert_eq!(polls, vec![false, false, true]);
    }

    #[test]
    fn test_missing_sensor() {
        let radio = SimulatedRadio::new(SimRadioConfig {
            boards: vec![SimBoardConfig {
                ref_lock_sensor: false,
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(!radio
            .sensor_names(0)
            .unwrap()
            .contains(&"ref_locked".to_owned()));
        assert_eq!(
            radio.sensor("ref_locked", 0),
            Err(HardwareError::NoSuchSensor("ref_locked".to_owned()))
        );
        assert_eq!(radio.board_name(3), Err(HardwareError::NoSuchBoard(3)));
    }

    #[test]
    fn test_time_applies_at_next_edge() {
        let period = Duration::from_millis(40);
        let mut radio = SimulatedRadio::new(SimRadioConfig {
            pps_period: period,
            ..Default::default()
        });
        let target = Epoch::from_unix_seconds(1_700_000_000.0);
        radio.set_time_next_pps(target, 0).unwrap();
        edge_wait(period);
        let now = radio.time_last_pps(0).unwrap();
        // At least one more edge went by after the one that latched the time
        assert!(now.to_unix_seconds() >= 1_700_000_001.0);
        assert!(now.to_unix_seconds() < 1_700_000_100.0);
    }

    #[test]
    fn test_stream_ramp_and_faults() {
        let mut radio = SimulatedRadio::new(SimRadioConfig {
            faults: vec![(1, SimFault::Overflow), (2, SimFault::Driver)],
            ..Default::default()
        });
        radio.set_rate(1000.0, 0).unwrap();
        let mut stream = radio.open_stream(&[0]).unwrap();
        let mut buf = vec![ComplexShort::default(); 10];
        let timeout = Duration::from_millis(500);
        assert!(stream.pull(&mut buf, timeout).is_err());

        stream.issue_start_continuous().unwrap();
        let first = stream.pull(&mut buf, timeout).unwrap();
        assert_eq!(first.count, 10);
        assert_eq!(first.status, StreamStatus::Ok);
        assert_eq!(buf[3], Complex::new(3, -3));

        let second = stream.pull(&mut buf, timeout).unwrap();
        assert_eq!(second.status, StreamStatus::Overflow);
        assert_eq!(second.count, 0);
        assert!(stream.pull(&mut buf, timeout).is_err());

        let fourth = stream.pull(&mut buf, timeout).unwrap();
        assert_eq!(buf[0], Complex::new(10, -10));
        // 10 samples at 1 kS/s is 10 ms later
        assert_eq!(
            fourth.time_ns.unwrap() - first.time_ns.unwrap(),
            10_000_000
        );
    }
}
