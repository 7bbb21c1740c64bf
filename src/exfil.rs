//! This module is responsible for exfilling filled sample buffers to disk
//!
//! One flat file per buffer, named after the time tag of its first sample, holding
//! nothing but the raw sc16 samples. No header, no appending.

use std::{
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    capture::Slot,
    complex::{as_bytes, ComplexShort},
};

/// Capture-epoch identifier of one buffer: UNIX nanoseconds of its first sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeTag(pub u64);

impl TimeTag {
    pub fn from_ns(ns: i64) -> Self {
        Self(ns.max(0) as u64)
    }

    /// Host clock, for streams that don't timestamp their samples
    pub fn now() -> Self {
        Self::from_ns(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0))
    }

    pub fn file_name(&self) -> String {
        format!("{}.bin", self.0)
    }
}

impl fmt::Display for TimeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A full buffer on its way to storage
#[derive(Debug, Clone, Copy)]
pub struct SavedBlock<'a> {
    pub slot: Slot,
    pub tag: TimeTag,
    pub samples: &'a [ComplexShort],
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("could not write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Wherever full buffers end up
pub trait SampleSink {
    fn persist(&mut self, block: SavedBlock<'_>) -> Result<(), SinkError>;
}

impl<S: SampleSink + ?Sized> SampleSink for &mut S {
    fn persist(&mut self, block: SavedBlock<'_>) -> Result<(), SinkError> {
        (**self).persist(block)
    }
}

/// Writes `<tag>.bin` files into a directory
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, tag: TimeTag) -> PathBuf {
        self.dir.join(tag.file_name())
    }
}

impl SampleSink for FileSink {
    fn persist(&mut self, block: SavedBlock<'_>) -> Result<(), SinkError> {
        let path = self.path_for(block.tag);
        let wrap = |source: io::Error| SinkError::Io {
            path: path.clone(),
            source,
        };
        debug!("Opening {}", path.display());
        // Create-or-truncate, the file is closed when it drops
        let mut file = File::create(&path).map_err(wrap)?;
        file.write_all(as_bytes(block.samples)).map_err(wrap)?;
        file.flush().map_err(wrap)?;
        info!(
            "Wrote from buffer {}, {} samples to {}",
            block.slot,
            block.samples.len(),
            path.display()
        );
        Ok(())
    }
}
