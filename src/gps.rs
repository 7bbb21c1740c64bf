//! Disciplining board clocks and time to a GPSDO.
//!
//! For each board: switch clock and time to the GPSDO, wait for the 10 MHz
//! reference to lock, check GPS lock, latch GPS time at the next PPS edge and
//! read it back. With several GPS-locked boards, finish by checking they all
//! latched the same time on a common edge.
//!
//! Nothing here aborts the process. Every problem ends up in the returned
//! [`DisciplineReport`] (and the log); capture can carry on with less
//! trustworthy timestamps.

use std::{
    thread,
    time::{Duration, Instant},
};

use hifitime::{Epoch, Unit};
use tracing::{debug, error, info, warn};

use crate::hardware::{HardwareError, RadioSession};

pub const GPSDO_SOURCE: &str = "gpsdo";
pub const REF_LOCK_SENSOR: &str = "ref_locked";
pub const GPS_LOCK_SENSOR: &str = "gps_locked";
pub const GPS_TIME_SENSOR: &str = "gps_time";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisciplineSettings {
    /// Clock and time source to select
    pub source: &'static str,
    pub ref_lock_attempts: u32,
    pub ref_lock_interval: Duration,
    /// How long to wait after programming the next edge before checking it.
    /// Some boards don't update the last-PPS time right at the edge it was set
    /// for, so this covers more than one edge.
    pub settle: Duration,
    pub edge_poll: Duration,
    /// Give up waiting for a PPS edge after this long
    pub edge_timeout: Duration,
    /// Extra wait after an edge so every board has seen it
    pub edge_pad: Duration,
}

impl Default for DisciplineSettings {
    fn default() -> Self {
        Self {
            source: GPSDO_SOURCE,
            ref_lock_attempts: 30,
            ref_lock_interval: Duration::from_secs(1),
            settle: Duration::from_secs(2),
            edge_poll: Duration::from_millis(1),
            edge_timeout: Duration::from_secs(3),
            edge_pad: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefLock {
    Locked,
    Failed,
    /// No `ref_locked` sensor; the board is assumed locked
    SensorMissing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeSync {
    Synchronized(Epoch),
    Mismatch { board: Epoch, gps: Epoch },
}

/// What we know about one board's clock after disciplining it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockState {
    pub reference_locked: bool,
    pub gps_locked: bool,
    pub last_applied_edge: Epoch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardReport {
    pub board: usize,
    pub name: String,
    pub ref_lock: RefLock,
    pub gps_locked: bool,
    pub time_sync: TimeSync,
}

impl BoardReport {
    pub fn clock_state(&self) -> ClockState {
        ClockState {
            reference_locked: self.ref_lock != RefLock::Failed,
            gps_locked: self.gps_locked,
            last_applied_edge: match self.time_sync {
                TimeSync::Synchronized(t) => t,
                TimeSync::Mismatch { board, .. } => board,
            },
        }
    }

    pub fn synchronized(&self) -> bool {
        matches!(self.time_sync, TimeSync::Synchronized(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Misalignment {
    pub board: usize,
    pub board_time: Epoch,
    pub reference_time: Epoch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Alignment {
    /// Fewer than two GPS-locked boards
    NotChecked,
    Aligned,
    /// No PPS edge showed up while we were waiting for one
    NoEdge,
    Misaligned(Vec<Misalignment>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisciplineReport {
    /// The attached model has no GPSDO
    Unsupported,
    Completed {
        boards: Vec<BoardReport>,
        alignment: Alignment,
    },
    /// The hardware threw something at us part way through
    Faulted {
        boards: Vec<BoardReport>,
        error: HardwareError,
    },
}

impl DisciplineReport {
    pub fn boards(&self) -> &[BoardReport] {
        match self {
            DisciplineReport::Unsupported => &[],
            DisciplineReport::Completed { boards, .. } | DisciplineReport::Faulted { boards, .. } => {
                boards.as_slice()
            }
        }
    }

    pub fn clock_states(&self) -> Vec<ClockState> {
        self.boards().iter().map(BoardReport::clock_state).collect()
    }

    /// Every board locked and latched GPS time, and they agree with each other
    pub fn timestamps_trusted(&self) -> bool {
        match self {
            DisciplineReport::Completed { boards, alignment } => {
                !boards.is_empty()
                    && boards.iter().all(|b| {
                        b.gps_locked && b.synchronized() && b.ref_lock != RefLock::Failed
                    })
                    && matches!(alignment, Alignment::Aligned | Alignment::NotChecked)
            }
            _ => false,
        }
    }
}

/// Bring every board onto GPS time. Never fails; see the report.
pub fn discipline_to_gps<S: RadioSession>(
    session: &mut S,
    settings: &DisciplineSettings,
) -> DisciplineReport {
    if !session.has_gpsdo() {
        warn!("Connected radio does not have a GPSDO, skipping GPS sync");
        return DisciplineReport::Unsupported;
    }

    let mut boards = Vec::with_capacity(session.num_boards());
    match discipline_boards(session, settings, &mut boards) {
        Ok(alignment) => DisciplineReport::Completed { boards, alignment },
        Err(error) => {
            error!("GPS sync failed: {}", error);
            warn!("This could mean that the GPSDO is not installed correctly");
            DisciplineReport::Faulted { boards, error }
        }
    }
}

fn discipline_boards<S: RadioSession>(
    session: &mut S,
    settings: &DisciplineSettings,
    boards: &mut Vec<BoardReport>,
) -> Result<Alignment, HardwareError> {
    for board in 0..session.num_boards() {
        boards.push(sync_board(session, board, settings)?);
    }
    let locked = boards.iter().filter(|b| b.gps_locked).count();
    if locked > 1 {
        check_alignment(session, settings)
    } else {
        Ok(Alignment::NotChecked)
    }
}

fn read_gps_time<S: RadioSession>(session: &S, board: usize) -> Result<Epoch, HardwareError> {
    let secs = session
        .sensor(GPS_TIME_SENSOR, board)?
        .to_int(GPS_TIME_SENSOR)?;
    Ok(Epoch::from_unix_seconds(secs as f64))
}

fn sync_board<S: RadioSession>(
    session: &mut S,
    board: usize,
    settings: &DisciplineSettings,
) -> Result<BoardReport, HardwareError> {
    let name = session.board_name(board)?;
    info!("Synchronizing board {}: {}", board, name);

    session.set_clock_source(settings.source, board)?;
    session.set_time_source(settings.source, board)?;

    let ref_lock = wait_for_ref_lock(session, board, settings)?;

    let gps_locked = session
        .sensor(GPS_LOCK_SENSOR, board)?
        .to_bool(GPS_LOCK_SENSOR)?;
    if gps_locked {
        info!("GPS locked");
    } else {
        warn!("GPS not locked - time will not be accurate until locked");
    }

    // Latch GPS time on the next edge
    let gps_time = read_gps_time(session, board)?;
    session.set_time_next_pps(gps_time + Unit::Second * 1_i64, board)?;
    thread::sleep(settings.settle);

    let gps_time = read_gps_time(session, board)?;
    let board_time = session.time_last_pps(board)?;
    info!("Board {} time: {}", board, board_time);
    info!("GPSDO time: {}", gps_time);
    let time_sync = if board_time == gps_time {
        info!("SUCCESS: board {} time synchronized to GPS time", board);
        TimeSync::Synchronized(board_time)
    } else {
        error!("ERROR: failed to synchronize board {} time to GPS time", board);
        TimeSync::Mismatch {
            board: board_time,
            gps: gps_time,
        }
    };

    Ok(BoardReport {
        board,
        name,
        ref_lock,
        gps_locked,
        time_sync,
    })
}

fn wait_for_ref_lock<S: RadioSession>(
    session: &S,
    board: usize,
    settings: &DisciplineSettings,
) -> Result<RefLock, HardwareError> {
    if !session
        .sensor_names(board)?
        .iter()
        .any(|s| s == REF_LOCK_SENSOR)
    {
        warn!("ref_locked sensor not present on board {}", board);
        return Ok(RefLock::SensorMissing);
    }

    info!("Waiting for reference lock...");
    for attempt in 1..=settings.ref_lock_attempts {
        if session
            .sensor(REF_LOCK_SENSOR, board)?
            .to_bool(REF_LOCK_SENSOR)?
        {
            info!("LOCKED");
            return Ok(RefLock::Locked);
        }
        debug!("No reference lock after {} polls", attempt);
        if attempt < settings.ref_lock_attempts {
            thread::sleep(settings.ref_lock_interval);
        }
    }
    error!(
        "FAILED to lock board {} to the GPSDO 10 MHz reference",
        board
    );
    Ok(RefLock::Failed)
}

fn check_alignment<S: RadioSession>(
    session: &S,
    settings: &DisciplineSettings,
) -> Result<Alignment, HardwareError> {
    // Wait for an edge
    let last = session.time_last_pps(0)?;
    let deadline = Instant::now() + settings.edge_timeout;
    while session.time_last_pps(0)? == last {
        if Instant::now() >= deadline {
            warn!("No PPS edge within {:?}, can't check alignment", settings.edge_timeout);
            return Ok(Alignment::NoEdge);
        }
        thread::sleep(settings.edge_poll);
    }
    thread::sleep(settings.edge_pad);

    let reference_time = session.time_last_pps(0)?;
    let mut misaligned = vec![];
    for board in 1..session.num_boards() {
        let board_time = session.time_last_pps(board)?;
        if board_time != reference_time {
            error!(
                "ERROR: times are not aligned: board 0={}, board {}={}",
                reference_time, board, board_time
            );
            misaligned.push(Misalignment {
                board,
                board_time,
                reference_time,
            });
        }
    }
    if misaligned.is_empty() {
        info!("SUCCESS: board times aligned");
        Ok(Alignment::Aligned)
    } else {
        Ok(Alignment::Misaligned(misaligned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBoardConfig, SimRadioConfig, SimulatedRadio};

    const PERIOD: Duration = Duration::from_millis(100);

    fn fast() -> DisciplineSettings {
        DisciplineSettings {
            ref_lock_attempts: 3,
            ref_lock_interval: Duration::from_millis(1),
            settle: PERIOD * 5 / 2,
            edge_poll: Duration::from_millis(1),
            edge_timeout: PERIOD * 3,
            edge_pad: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn radio(boards: Vec<SimBoardConfig>) -> SimulatedRadio {
        SimulatedRadio::new(SimRadioConfig {
            boards,
            pps_period: PERIOD,
            ..Default::default()
        })
    }

    #[test]
    fn test_no_gpsdo() {
        let mut radio = SimulatedRadio::new(SimRadioConfig {
            gpsdo: false,
            ..Default::default()
        });
        let report = discipline_to_gps(&mut radio, &fast());
        assert_eq!(report, DisciplineReport::Unsupported);
        assert!(!report.timestamps_trusted());
        assert_eq!(
            radio.sources(0),
            Some(("internal".to_owned(), "internal".to_owned()))
        );
    }

    #[test]
    fn test_single_board() {
        let mut radio = radio(vec![SimBoardConfig::default()]);
        let report = discipline_to_gps(&mut radio, &fast());
        let DisciplineReport::Completed { boards, alignment } = &report else {
            panic!("unexpected report {:?}", report)
        };
        assert_eq!(*alignment, Alignment::NotChecked);
        assert_eq!(boards[0].ref_lock, RefLock::Locked);
        assert!(boards[0].gps_locked);
        assert!(boards[0].synchronized());
        assert!(report.timestamps_trusted());
        assert_eq!(
            radio.sources(0),
            Some((GPSDO_SOURCE.to_owned(), GPSDO_SOURCE.to_owned()))
        );
    }

    #[test]
    fn test_missing_ref_sensor_proceeds() {
        let mut radio = radio(vec![SimBoardConfig {
            ref_lock_sensor: false,
            ..Default::default()
        }]);
        let report = discipline_to_gps(&mut radio, &fast());
        let board = &report.boards()[0];
        assert_eq!(board.ref_lock, RefLock::SensorMissing);
        // Still went on to the GPS checks
        assert!(board.gps_locked);
        assert!(board.synchronized());
        assert!(report.clock_states()[0].reference_locked);
    }

    #[test]
    fn test_ref_lock_bounded() {
        let mut radio = radio(vec![
            SimBoardConfig {
                ref_lock_after: None,
                ..Default::default()
            },
            SimBoardConfig {
                ref_lock_after: Some(2),
                ..Default::default()
            },
        ]);
        let report = discipline_to_gps(&mut radio, &fast());
        let boards = report.boards();
        assert_eq!(boards[0].ref_lock, RefLock::Failed);
        assert_eq!(boards[1].ref_lock, RefLock::Locked);
        // A failed lock is reported, not fatal
        assert!(boards[0].synchronized());
        assert!(!report.timestamps_trusted());
        // Polling gives up after the configured number of attempts
        assert_eq!(radio.ref_polls(0), Some(fast().ref_lock_attempts));
        assert_eq!(radio.ref_polls(1), Some(3));
    }

    #[test]
    fn test_gps_unlocked_is_a_warning() {
        let mut radio = radio(vec![
            SimBoardConfig {
                gps_locked: false,
                ..Default::default()
            },
            SimBoardConfig::default(),
        ]);
        let report = discipline_to_gps(&mut radio, &fast());
        let DisciplineReport::Completed { boards, alignment } = &report else {
            panic!("unexpected report {:?}", report)
        };
        assert!(!boards[0].gps_locked);
        assert!(boards[1].gps_locked);
        // Only one locked board, nothing to align
        assert_eq!(*alignment, Alignment::NotChecked);
        assert!(!report.timestamps_trusted());
    }

    #[test]
    fn test_two_boards_aligned() {
        let mut radio = radio(vec![SimBoardConfig::default(), SimBoardConfig::default()]);
        let report = discipline_to_gps(&mut radio, &fast());
        assert!(matches!(
            report,
            DisciplineReport::Completed {
                alignment: Alignment::Aligned,
                ..
            }
        ));
        assert!(report.timestamps_trusted());
    }

    #[test]
    fn test_no_edge_for_alignment() {
        // Edges so far apart that none shows up while we wait
        let mut radio = SimulatedRadio::new(SimRadioConfig {
            boards: vec![SimBoardConfig::default(), SimBoardConfig::default()],
            pps_period: Duration::from_secs(3600),
            ..Default::default()
        });
        let settings = DisciplineSettings {
            settle: Duration::from_millis(10),
            edge_timeout: Duration::from_millis(50),
            ..fast()
        };
        let started = Instant::now();
        let report = discipline_to_gps(&mut radio, &settings);
        assert!(started.elapsed() < Duration::from_secs(5));
        let DisciplineReport::Completed { boards, alignment } = &report else {
            panic!("unexpected report {:?}", report)
        };
        assert_eq!(boards.len(), 2);
        assert_eq!(*alignment, Alignment::NoEdge);
        assert!(!report.timestamps_trusted());
    }

    #[test]
    fn test_board_that_never_converges() {
        let mut radio = radio(vec![
            SimBoardConfig::default(),
            SimBoardConfig {
                pps_skew_secs: 3,
                ..Default::default()
            },
        ]);
        let report = discipline_to_gps(&mut radio, &fast());
        let DisciplineReport::Completed { boards, alignment } = &report else {
            panic!("unexpected report {:?}", report)
        };
        assert!(boards[0].synchronized());
        assert!(matches!(boards[1].time_sync, TimeSync::Mismatch { .. }));
        let Alignment::Misaligned(off) = alignment else {
            panic!("expected misalignment, got {:?}", alignment)
        };
        assert_eq!(off.len(), 1);
        assert_eq!(off[0].board, 1);
        let skew = off[0].board_time.to_unix_seconds() - off[0].reference_time.to_unix_seconds();
        assert!((skew - 3.0).abs() < 1e-3);
        assert!(!report.timestamps_trusted());
    }

    #[test]
    fn test_hardware_fault_becomes_advisory() {
        let mut radio = radio(vec![
            SimBoardConfig::default(),
            SimBoardConfig {
                gps_fault: true,
                ..Default::default()
            },
        ]);
        let report = discipline_to_gps(&mut radio, &fast());
        let DisciplineReport::Faulted { boards, error } = &report else {
            panic!("unexpected report {:?}", report)
        };
        // What we learned before the fault is kept
        assert_eq!(boards.len(), 1);
        assert!(boards[0].synchronized());
        assert!(matches!(error, HardwareError::Driver { .. }));
    }
}
