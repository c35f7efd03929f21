use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use aya::maps::{MapError, perf::PerfBufferError};
use bytes::Bytes;
use thiserror::Error;

/// One read from the kernel transport: either a raw sample or a report
/// that the kernel had to drop samples because the buffer was full.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub raw_sample: Bytes,
    pub lost_samples: u64,
}

impl Record {
    pub fn sample(raw_sample: impl Into<Bytes>) -> Self {
        Self {
            raw_sample: raw_sample.into(),
            lost_samples: 0,
        }
    }

    pub fn lost(lost_samples: u64) -> Self {
        Self {
            raw_sample: Bytes::new(),
            lost_samples,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReaderError {
    /// The reader was closed on purpose. Not a failure.
    #[error("perf reader closed")]
    Closed,

    #[error("failed to open chunks map: {0}")]
    Map(#[from] MapError),

    #[error("failed to list online cpus ({context}): {source}")]
    Cpus {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("perf buffer error: {0}")]
    PerfBuffer(#[from] PerfBufferError),

    #[error("failed to poll perf buffers: {0}")]
    Poll(#[source] io::Error),
}

impl ReaderError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ReaderError::Closed)
    }
}

/// Blocking source of chunk records.
///
/// `read` blocks until a record is available or the reader is closed, in
/// which case it returns [`ReaderError::Closed`] from then on.
pub trait ChunkReader: Send {
    fn read(&mut self) -> Result<Record, ReaderError>;
}

/// Handle used to close a reader from outside the thread blocked in `read`.
#[derive(Debug, Clone, Default)]
pub struct ReaderCloser {
    closed: Arc<AtomicBool>,
}

impl ReaderCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
