//! The receiver ties a radio session to everything else.
//!
//! It owns the session for its whole life and walks it through
//! `Uninitialized -> Initialized -> Configured -> Validated` before capture is
//! allowed. Clock discipline borrows the session mutably, as does capture, so
//! the two can never overlap.

use tracing::{info, warn};

use crate::{
    capture::{CaptureError, CapturePipeline, CaptureSettings},
    config::{self, CaptureGeometry, ConfigError, ConfigState, RadioConfig},
    exfil::SampleSink,
    gps::{discipline_to_gps, ClockState, DisciplineReport, DisciplineSettings},
    hardware::RadioSession,
    monitoring::CaptureReport,
};

pub struct Receiver<S: RadioSession> {
    session: S,
    state: ConfigState,
    config: Option<RadioConfig>,
    geometry: Option<CaptureGeometry>,
    clock: Option<DisciplineReport>,
}

impl<S: RadioSession> Receiver<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            state: ConfigState::Uninitialized,
            config: None,
            geometry: None,
            clock: None,
        }
    }

    pub fn state(&self) -> ConfigState {
        self.state
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn config(&self) -> Option<&RadioConfig> {
        self.config.as_ref()
    }

    /// Buffer sizes, known once a configuration has been applied
    pub fn geometry(&self) -> Option<CaptureGeometry> {
        self.geometry
    }

    fn expect_state(&self, expected: ConfigState, action: &'static str) -> Result<(), ConfigError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ConfigError::InvalidState {
                action,
                state: self.state,
            })
        }
    }

    /// Identify the attached hardware
    pub fn initialize(&mut self) -> Result<(), ConfigError> {
        self.expect_state(ConfigState::Uninitialized, "initialize")?;
        for board in 0..self.session.num_boards() {
            info!("Using board {}: {}", board, self.session.board_name(board)?);
        }
        if !self.session.has_gpsdo() {
            warn!("Attached radio has no GPSDO, GPS sync will be skipped");
        }
        self.state = ConfigState::Initialized;
        Ok(())
    }

    /// Apply `config` to the hardware. Only allowed once.
    pub fn apply(&mut self, config: RadioConfig) -> Result<(), ConfigError> {
        self.expect_state(ConfigState::Initialized, "apply a configuration")?;
        let geometry = config::apply(&mut self.session, &config)?;
        self.config = Some(config);
        self.geometry = Some(geometry);
        self.state = ConfigState::Configured;
        Ok(())
    }

    /// Check the hardware kept every setting we asked for
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.expect_state(ConfigState::Configured, "validate")?;
        let config = self.config.ok_or(ConfigError::InvalidState {
            action: "validate",
            state: self.state,
        })?;
        config::validate(&self.session, &config)?;
        self.state = ConfigState::Validated;
        Ok(())
    }

    /// Discipline every board to GPS. Problems are reported, never returned as
    /// errors; the only error is calling this before the session is initialized.
    pub fn sync_to_gps(
        &mut self,
        settings: &DisciplineSettings,
    ) -> Result<&DisciplineReport, ConfigError> {
        if self.state < ConfigState::Initialized {
            return Err(ConfigError::InvalidState {
                action: "sync to GPS",
                state: self.state,
            });
        }
        let report = discipline_to_gps(&mut self.session, settings);
        Ok(&*self.clock.insert(report))
    }

    pub fn clock_report(&self) -> Option<&DisciplineReport> {
        self.clock.as_ref()
    }

    pub fn clock_states(&self) -> Vec<ClockState> {
        self.clock
            .as_ref()
            .map(DisciplineReport::clock_states)
            .unwrap_or_default()
    }

    /// Allocate the double buffer for the validated configuration
    pub fn prepare_capture(&self, max_buffers: Option<u64>) -> Result<CapturePipeline, CaptureError> {
        match (self.state, self.geometry) {
            (ConfigState::Validated, Some(geometry)) => Ok(CapturePipeline::new(CaptureSettings {
                max_buffers,
                ..CaptureSettings::new(geometry)
            })),
            (state, _) => Err(CaptureError::NotValidated(state)),
        }
    }

    /// Open the stream and capture until `pipeline` is cancelled
    pub fn start<K: SampleSink + Send>(
        &mut self,
        pipeline: &CapturePipeline,
        sink: K,
    ) -> Result<CaptureReport, CaptureError> {
        let config = match (self.state, self.config) {
            (ConfigState::Validated, Some(config)) => config,
            (state, _) => return Err(CaptureError::NotValidated(state)),
        };
        if !self
            .clock
            .as_ref()
            .map_or(false, DisciplineReport::timestamps_trusted)
        {
            warn!("Board time is not verified against GPS, file time tags may be off");
        }
        let stream = self.session.open_stream(&[config.channel])?;
        pipeline.start(stream, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::CaptureState,
        config::ConfigField,
        exfil::FileSink,
        sim::{SimRadioConfig, SimulatedRadio},
    };
    use std::{fs, time::Duration};

    fn config() -> RadioConfig {
        RadioConfig {
            center_freq: 1e9,
            sample_rate: 10_000.0,
            gain: 20.0,
            lo_offset: 5e3,
            channel: 0,
        }
    }

    fn quick_sync() -> DisciplineSettings {
        DisciplineSettings {
            ref_lock_interval: Duration::from_millis(1),
            settle: Duration::from_millis(250),
            edge_timeout: Duration::from_millis(300),
            edge_pad: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn receiver() -> Receiver<SimulatedRadio> {
        Receiver::new(SimulatedRadio::new(SimRadioConfig {
            pps_period: Duration::from_millis(100),
            ..Default::default()
        }))
    }

    #[test]
    fn test_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut rx = receiver();
        rx.initialize().unwrap();
        rx.apply(config()).unwrap();
        rx.validate().unwrap();
        assert_eq!(rx.state(), ConfigState::Validated);

        assert!(rx.sync_to_gps(&quick_sync()).unwrap().timestamps_trusted());
        assert_eq!(rx.clock_states().len(), 1);
        assert!(rx.clock_states()[0].gps_locked);

        let pipeline = rx.prepare_capture(Some(2)).unwrap();
        let report = rx
            .start(&pipeline, FileSink::new(dir.path()).unwrap())
            .unwrap();
        assert_eq!(pipeline.state(), CaptureState::Stopped);
        assert_eq!(report.saved, 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_states_only_move_forward() {
        let mut rx = receiver();
        assert!(matches!(
            rx.apply(config()),
            Err(ConfigError::InvalidState {
                state: ConfigState::Uninitialized,
                ..
            })
        ));
        assert!(rx.sync_to_gps(&quick_sync()).is_err());
        rx.initialize().unwrap();
        assert!(rx.initialize().is_err());
        assert!(rx.validate().is_err());
        rx.apply(config()).unwrap();
        // Applied exactly once
        assert!(rx.apply(config()).is_err());
        assert_eq!(rx.session().call_log().len(), 3);
    }

    #[test]
    fn test_no_capture_without_validation() {
        let mut rx = Receiver::new(SimulatedRadio::new(SimRadioConfig {
            max_gain: 10.0,
            ..Default::default()
        }));
        rx.initialize().unwrap();
        rx.apply(config()).unwrap();
        assert_eq!(rx.geometry().unwrap().buffer_capacity, 10_000);
        let err = rx.validate().unwrap_err();
        assert_eq!(err.field(), Some(ConfigField::Gain));
        assert_eq!(rx.state(), ConfigState::Configured);
        assert!(matches!(
            rx.prepare_capture(None),
            Err(CaptureError::NotValidated(ConfigState::Configured))
        ));
    }
}
