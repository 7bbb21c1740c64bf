//! This module contains all the capture logic

// The capture side does one thing, at the pace the radio dictates: pull
// samples into whichever of the two one-second buffers is active. The moment a
// buffer is full it is handed to the save thread and the producer moves on to
// the other one. The two sides share exactly one mutex-protected handoff record
// and one condvar; a buffer is only ever touched by whoever the record says
// owns it.

use std::{
    fmt, io,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::{
    complex::ComplexShort,
    config::{CaptureGeometry, ConfigState},
    exfil::{SampleSink, SavedBlock, TimeTag},
    hardware::{HardwareError, RxStream, StreamStatus},
    monitoring::CaptureReport,
};

/// How long one pull may block before the stream reports a timeout
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_millis(500);

/// Nanoseconds covered by one buffer (one second of samples)
const BUFFER_SPAN_NS: u64 = 1_000_000_000;

/// One of the two capture buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Zero,
    One,
}

impl Slot {
    pub fn index(self) -> usize {
        match self {
            Slot::Zero => 0,
            Slot::One => 1,
        }
    }

    pub fn other(self) -> Slot {
        match self {
            Slot::Zero => Slot::One,
            Slot::One => Slot::Zero,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Fixed-size block of samples, allocated once and never resized
#[derive(Debug)]
pub struct SampleBuffer {
    samples: Vec<ComplexShort>,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![ComplexShort::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn as_slice(&self) -> &[ComplexShort] {
        &self.samples
    }

    fn as_mut_slice(&mut self) -> &mut [ComplexShort] {
        &mut self.samples
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Streaming,
    Draining,
    Stopped,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture can only be started once, pipeline is {0:?}")]
    NotIdle(CaptureState),
    #[error("receiver must be validated before capture, it is {0:?}")]
    NotValidated(ConfigState),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error("could not spawn the save thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("the save thread panicked")]
    SaveTaskPanicked,
}

/// Everything the producer and the save thread share
struct Handoff {
    state: CaptureState,
    cancelled: bool,
    /// Only the producer moves this
    active_slot: Slot,
    /// Set by the producer, cleared by the save thread once the write is done
    pending_save: Option<Slot>,
    tags: [TimeTag; 2],
    /// Buffers not currently checked out by either side
    parked: [Option<SampleBuffer>; 2],
    saver_alive: bool,
}

struct Shared {
    handoff: Mutex<Handoff>,
    cv: Condvar,
}

impl Shared {
    // The handoff record is plain data that is never left half-updated, so a
    // panic on the other side doesn't invalidate it
    fn lock(&self) -> MutexGuard<'_, Handoff> {
        self.handoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, Handoff>,
        condition: impl FnMut(&mut Handoff) -> bool,
    ) -> MutexGuard<'a, Handoff> {
        self.cv
            .wait_while(guard, condition)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        let mut h = self.lock();
        if !h.cancelled {
            debug!("Capture cancelled");
            h.cancelled = true;
        }
        drop(h);
        self.cv.notify_all();
    }
}

/// Stops a running capture from any thread. Cancelling twice is harmless.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    pub geometry: CaptureGeometry,
    pub timeout: Duration,
    /// Stop on our own after this many completed buffers
    pub max_buffers: Option<u64>,
}

impl CaptureSettings {
    pub fn new(geometry: CaptureGeometry) -> Self {
        Self {
            geometry,
            timeout: DEFAULT_PULL_TIMEOUT,
            max_buffers: None,
        }
    }
}

/// How one attempt at filling a buffer ended
#[derive(Debug, PartialEq)]
enum Fill {
    Full(TimeTag),
    Cancelled,
    Timeout,
    Overflow,
    Failed(String),
}

/// Marks the save thread as gone when it returns or unwinds, so the producer
/// never waits on a save that will not finish
struct SaverAlive<'a>(&'a Shared);

impl Drop for SaverAlive<'_> {
    fn drop(&mut self) {
        self.0.lock().saver_alive = false;
        self.0.cv.notify_all();
    }
}

pub struct CapturePipeline {
    shared: Arc<Shared>,
    settings: CaptureSettings,
}

impl CapturePipeline {
    /// Allocates both buffers up front
    pub fn new(settings: CaptureSettings) -> Self {
        let capacity = settings.geometry.buffer_capacity;
        let handoff = Handoff {
            state: CaptureState::Idle,
            cancelled: false,
            active_slot: Slot::Zero,
            pending_save: None,
            tags: [TimeTag::default(); 2],
            parked: [
                Some(SampleBuffer::new(capacity)),
                Some(SampleBuffer::new(capacity)),
            ],
            saver_alive: true,
        };
        Self {
            shared: Arc::new(Shared {
                handoff: Mutex::new(handoff),
                cv: Condvar::new(),
            }),
            settings,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.shared.lock().state
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Start streaming and run the producer on the calling thread until
    /// cancelled, then drain the save thread and stop the stream.
    pub fn start<R, K>(&self, mut stream: R, sink: K) -> Result<CaptureReport, CaptureError>
    where
        R: RxStream,
        K: SampleSink + Send,
    {
        {
            let mut h = self.shared.lock();
            if h.state != CaptureState::Idle {
                return Err(CaptureError::NotIdle(h.state));
            }
            h.state = CaptureState::Streaming;
            // The save thread from a previous life doesn't exist, this one will
            h.saver_alive = true;
        }

        let result = match stream.issue_start_continuous() {
            Ok(()) => self.stream_and_save(&mut stream, sink),
            Err(e) => Err(e.into()),
        };

        self.shared.lock().state = CaptureState::Stopped;
        // Hardware stream resources are released last
        drop(stream);
        info!("Capture stopped");
        result
    }

    fn stream_and_save<R, K>(&self, stream: &mut R, sink: K) -> Result<CaptureReport, CaptureError>
    where
        R: RxStream,
        K: SampleSink + Send,
    {
        let shared: &Shared = &self.shared;
        thread::scope(|scope| {
            let saver = match thread::Builder::new()
                .name("save".to_owned())
                .spawn_scoped(scope, move || save_loop(shared, sink))
            {
                Ok(handle) => handle,
                Err(e) => {
                    if let Err(e) = stream.issue_stop_continuous() {
                        error!("Failed to stop stream: {}", e);
                    }
                    return Err(CaptureError::Spawn(e));
                }
            };
            info!(
                "Streaming {} samples per buffer in chunks of {}",
                self.settings.geometry.buffer_capacity, self.settings.geometry.chunk_len
            );

            let mut report = self.produce(stream);

            // Draining: no more pulls, stop the stream, let the saver finish
            shared.lock().state = CaptureState::Draining;
            shared.cv.notify_all();
            if let Err(e) = stream.issue_stop_continuous() {
                error!("Failed to stop stream: {}", e);
            }
            let saves = saver.join().map_err(|_| CaptureError::SaveTaskPanicked)?;
            report.saved = saves.saved;
            report.failed_saves = saves.failed_saves;
            report.first_tag = saves.first_tag;
            report.last_tag = saves.last_tag;
            Ok(report)
        })
    }

    fn produce<R: RxStream>(&self, stream: &mut R) -> CaptureReport {
        let mut report = CaptureReport::default();
        let mut last_tag = None;
        loop {
            // Check out the active buffer
            let (slot, mut buffer) = {
                let mut h = self.shared.lock();
                if h.cancelled {
                    break;
                }
                let slot = h.active_slot;
                match h.parked[slot.index()].take() {
                    Some(buffer) => (slot, buffer),
                    None => {
                        error!("Buffer {} went missing, stopping capture", slot);
                        break;
                    }
                }
            };

            match self.fill(stream, &mut buffer) {
                Fill::Full(tag) => {
                    let tag = next_tag(last_tag, tag);
                    last_tag = Some(tag);
                    report.completed += 1;
                    if !self.hand_off(slot, buffer, tag, &mut report) {
                        error!("Save thread is gone, stopping capture");
                        break;
                    }
                    if Some(report.completed) == self.settings.max_buffers {
                        info!("Captured {} buffers, stopping", report.completed);
                        self.shared.cancel();
                    }
                    continue;
                }
                Fill::Cancelled => {}
                Fill::Timeout => {
                    warn!("Timeout while streaming");
                    report.timeouts += 1;
                }
                Fill::Overflow => {
                    // A buffer with a gap in it isn't one second of contiguous samples
                    warn!("Got an overflow indication, dropping buffer {}", slot);
                    report.overflows += 1;
                }
                Fill::Failed(msg) => {
                    error!("Receiver error: {}", msg);
                    report.stream_errors += 1;
                }
            }
            // Aborted fills go back on the shelf and the same slot is refilled
            self.shared.lock().parked[slot.index()] = Some(buffer);
        }
        report
    }

    /// Pull chunk by chunk until the buffer is full or something goes wrong
    fn fill<R: RxStream>(&self, stream: &mut R, buffer: &mut SampleBuffer) -> Fill {
        let chunk = self.settings.geometry.chunk_len;
        let samples = buffer.as_mut_slice();
        let mut filled = 0usize;
        let mut tag = None;
        while filled < samples.len() {
            if self.shared.lock().cancelled {
                return Fill::Cancelled;
            }
            let end = (filled + chunk).min(samples.len());
            let pulled = match stream.pull(&mut samples[filled..end], self.settings.timeout) {
                Ok(pulled) => pulled,
                Err(e) => return Fill::Failed(e.to_string()),
            };
            match pulled.status {
                StreamStatus::Ok => {}
                StreamStatus::Timeout => return Fill::Timeout,
                StreamStatus::Overflow => return Fill::Overflow,
                StreamStatus::Other(msg) => return Fill::Failed(msg),
            }
            if tag.is_none() && pulled.count > 0 {
                tag = Some(pulled.time_ns.map_or_else(TimeTag::now, TimeTag::from_ns));
            }
            filled += pulled.count.min(end - filled);
        }
        Fill::Full(tag.unwrap_or_else(TimeTag::now))
    }

    /// Mark `slot` pending-save and flip to the other one. Waits first if the
    /// previous save hasn't finished. Returns false if the save thread is gone.
    fn hand_off(
        &self,
        slot: Slot,
        buffer: SampleBuffer,
        tag: TimeTag,
        report: &mut CaptureReport,
    ) -> bool {
        let mut h = self.shared.lock();
        h.parked[slot.index()] = Some(buffer);
        if let Some(outstanding) = h.pending_save {
            warn!(
                "Buffer {} is still being saved, holding buffer {}",
                outstanding, slot
            );
            let since = Instant::now();
            h = self
                .shared
                .wait_while(h, |h| h.pending_save.is_some() && h.saver_alive);
            report.stalls += 1;
            report.stall_time += since.elapsed();
        }
        if !h.saver_alive {
            return false;
        }
        h.tags[slot.index()] = tag;
        h.pending_save = Some(slot);
        h.active_slot = slot.other();
        drop(h);
        self.shared.cv.notify_all();
        trace!("Handed off buffer {} ({})", slot, tag);
        true
    }
}

/// Tags name the files, so every handed-off buffer gets a later one than the
/// buffer before it even when the stream clock stands still
fn next_tag(last: Option<TimeTag>, tag: TimeTag) -> TimeTag {
    match last {
        Some(last) if tag <= last => {
            let bumped = TimeTag(last.0.saturating_add(BUFFER_SPAN_NS));
            warn!(
                "Stream time {} is not after the previous buffer's {}, tagging as {}",
                tag, last, bumped
            );
            bumped
        }
        _ => tag,
    }
}

/// The save thread: wait for a pending buffer, write it, give it back
fn save_loop<K: SampleSink>(shared: &Shared, mut sink: K) -> CaptureReport {
    let _alive = SaverAlive(shared);
    let mut report = CaptureReport::default();
    let mut h = shared.lock();
    loop {
        h = shared.wait_while(h, |h| {
            h.pending_save.is_none() && h.state == CaptureState::Streaming
        });
        // Draining with nothing left to write
        let Some(slot) = h.pending_save else { break };
        let tag = h.tags[slot.index()];
        let buffer = h.parked[slot.index()].take();
        drop(h);

        match &buffer {
            Some(buffer) => match sink.persist(SavedBlock {
                slot,
                tag,
                samples: buffer.as_slice(),
            }) {
                Ok(()) => report.record_saved(tag),
                Err(e) => {
                    error!("Failed to save buffer {}: {}", slot, e);
                    report.failed_saves += 1;
                }
            },
            None => {
                error!("Buffer {} was marked for saving but isn't there", slot);
                report.failed_saves += 1;
            }
        }

        h = shared.lock();
        if buffer.is_some() {
            h.parked[slot.index()] = buffer;
        }
        h.pending_save = None;
        shared.cv.notify_all();
    }
    debug!("Save thread exiting");
    report
}
