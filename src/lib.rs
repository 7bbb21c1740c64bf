pub mod args;
pub mod capture;
pub mod complex;
pub mod config;
pub mod exfil;
pub mod gps;
pub mod hardware;
pub mod monitoring;
pub mod receiver;
pub mod sim;
#[cfg(feature = "soapy")]
pub mod soapy;

pub use capture::{CancelToken, CaptureError, CapturePipeline, CaptureSettings, Slot};
pub use complex::{Complex, ComplexShort};
pub use config::{ConfigError, ConfigState, RadioConfig};
pub use exfil::{FileSink, SampleSink, TimeTag};
pub use gps::{ClockState, DisciplineReport, DisciplineSettings};
pub use hardware::{HardwareError, RadioSession, RxStream};
pub use monitoring::CaptureReport;
pub use receiver::Receiver;
