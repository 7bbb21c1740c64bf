//! In this module, we keep the runtime stats for a capture run.
//! Both the producer and the save thread feed a [`CaptureReport`], which gets
//! summarized in the log when the run is over.

use std::time::Duration;

use tracing::{info, warn};

use crate::exfil::TimeTag;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    /// Buffers filled end to end and handed off
    pub completed: u64,
    /// Buffers the save thread got onto storage
    pub saved: u64,
    pub failed_saves: u64,
    pub overflows: u64,
    pub timeouts: u64,
    /// Any other receiver error, including driver faults during a pull
    pub stream_errors: u64,
    /// Times the producer had a full buffer but the previous save was still going
    pub stalls: u64,
    pub stall_time: Duration,
    /// Tag of the first and the latest buffer that made it to storage
    pub first_tag: Option<TimeTag>,
    pub last_tag: Option<TimeTag>,
}

impl CaptureReport {
    /// Fill attempts thrown away
    pub fn aborted(&self) -> u64 {
        self.overflows + self.timeouts + self.stream_errors
    }

    pub fn record_saved(&mut self, tag: TimeTag) {
        self.saved += 1;
        self.first_tag.get_or_insert(tag);
        self.last_tag = Some(tag);
    }

    pub fn log_summary(&self) {
        info!(
            "Captured {} buffers, saved {}, aborted {} ({} overflow, {} timeout, {} other)",
            self.completed,
            self.saved,
            self.aborted(),
            self.overflows,
            self.timeouts,
            self.stream_errors
        );
        if let (Some(first), Some(last)) = (self.first_tag, self.last_tag) {
            info!("Saved files span tags {} to {}", first, last);
        }
        if self.failed_saves > 0 {
            warn!("{} buffers failed to save", self.failed_saves);
        }
        if self.stalls > 0 {
            warn!(
                "Saving fell behind capture {} times ({:?} total)",
                self.stalls, self.stall_time
            );
        }
    }
}
