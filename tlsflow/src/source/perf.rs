//! Perf event array reader for TLS chunk records.
//!
//! The probes write into a `BPF_MAP_TYPE_PERF_EVENT_ARRAY` with one ring per
//! CPU. This reader opens every per-CPU ring, blocks in `poll(2)` until any
//! of them is readable and drains the readable rings into a local queue, so
//! callers see a single sequential stream of [`Record`]s.

use std::{
    collections::VecDeque,
    io,
    os::fd::{AsFd, AsRawFd},
    path::Path,
};

use aya::{
    maps::{
        Map, MapData,
        perf::{PerfEventArray, PerfEventArrayBuffer},
    },
    util::online_cpus,
};
use bytes::BytesMut;
use tlsflow_common::CHUNK_RECORD_SIZE;
use tracing::{debug, info};

use crate::source::reader::{ChunkReader, ReaderCloser, ReaderError, Record};

/// How long a single `poll(2)` may block before the closed flag is rechecked.
const POLL_TICK_MS: libc::c_int = 100;

/// Number of samples drained from one ring per `read_events` call.
const EVENTS_PER_READ: usize = 16;

pub struct PerfChunkReader {
    buffers: Vec<PerfEventArrayBuffer<MapData>>,
    out_bufs: Vec<BytesMut>,
    pending: VecDeque<Record>,
    closer: ReaderCloser,
}

impl PerfChunkReader {
    /// Open the perf event array pinned at `pin_path` and one ring of
    /// `page_count` pages (a power of two) per online CPU.
    pub fn from_pin(pin_path: &Path, page_count: usize) -> Result<Self, ReaderError> {
        let map_data = MapData::from_pin(pin_path)?;
        let map = Map::PerfEventArray(map_data);
        Self::new(map, page_count)
    }

    pub fn new(map: Map, page_count: usize) -> Result<Self, ReaderError> {
        let mut array: PerfEventArray<MapData> = PerfEventArray::try_from(map)?;
        let cpus = online_cpus().map_err(|(context, source)| ReaderError::Cpus { context, source })?;

        let mut buffers = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            buffers.push(array.open(cpu, Some(page_count))?);
        }

        info!(
            event.name = "perf.opened",
            perf.cpus = buffers.len(),
            perf.page_count = page_count,
            "opened per-cpu perf buffers for tls chunks"
        );

        let out_bufs = (0..EVENTS_PER_READ)
            .map(|_| BytesMut::with_capacity(CHUNK_RECORD_SIZE + 8))
            .collect();

        Ok(Self {
            buffers,
            out_bufs,
            pending: VecDeque::new(),
            closer: ReaderCloser::new(),
        })
    }

    /// Handle that makes the next `read` return [`ReaderError::Closed`].
    pub fn closer(&self) -> ReaderCloser {
        self.closer.clone()
    }

    /// Block for at most one tick waiting for any ring to become readable.
    fn wait_readable(&self) -> Result<(), ReaderError> {
        let mut fds: Vec<libc::pollfd> = self
            .buffers
            .iter()
            .map(|buf| libc::pollfd {
                fd: buf.as_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        // SAFETY: `fds` is a valid, exclusively borrowed array of `fds.len()`
        // pollfd entries for the duration of the call.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TICK_MS) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(ReaderError::Poll(err));
        }
        Ok(())
    }

    fn drain_readable(&mut self) -> Result<(), ReaderError> {
        for buf in self.buffers.iter_mut() {
            while buf.readable() {
                let events = buf.read_events(&mut self.out_bufs)?;
                if events.lost > 0 {
                    self.pending.push_back(Record::lost(events.lost as u64));
                }
                for out in self.out_bufs.iter_mut().take(events.read) {
                    self.pending.push_back(Record::sample(out.split().freeze()));
                }
                if events.read == 0 && events.lost == 0 {
                    break;
                }
            }
        }
        Ok(())
    }
}

impl ChunkReader for PerfChunkReader {
    fn read(&mut self) -> Result<Record, ReaderError> {
        loop {
            if self.closer.is_closed() {
                debug!(event.name = "perf.closed", "perf reader closed");
                return Err(ReaderError::Closed);
            }
            if let Some(record) = self.pending.pop_front() {
                return Ok(record);
            }
            self.wait_readable()?;
            self.drain_readable()?;
        }
    }
}
