//! Stream demultiplexer.
//!
//! [`TlsPoller`] is the single owner of the flow key -> stream registry. One
//! task runs [`TlsPoller::poll`], which waits on two queues at once:
//!
//! - the handoff queue fed by [`poll_chunks`] with decoded chunks, and
//! - the teardown queue on which stream owners post flow keys to forget.
//!
//! Neither queue has priority over the other. Since the registry is only
//! touched from that task, it needs no locking.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinError};
use tracing::{debug, info, warn};

use crate::{
    address::{AddressPair, FlowKey},
    cache::{CacheError, CorrelationCache},
    chunk::RawChunkRecord,
    metrics::registry::{
        CHUNK_DISPATCH_ERRORS_TOTAL, CHUNKS_UNRESOLVED_TOTAL, STREAMS_ACTIVE, STREAMS_CREATED_TOTAL,
        STREAMS_REMOVED_TOTAL,
    },
    runtime::conf::PollerConf,
    source::{ingest::poll_chunks, reader::ChunkReader},
    stream::{TlsStream, map::StreamMap, sorter::PacketSorter, spawn_idle_watch},
};

/// `(tgid, fd)` of the socket a chunk was captured on.
pub type FdKey = (u32, u32);

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("failed to build fd cache: {0}")]
    FdCache(#[from] CacheError),

    #[error("chunk ingestion task failed: {0}")]
    Ingest(#[from] JoinError),
}

/// Everything needed to bring a new stream to life.
struct StreamFactory {
    stream_map: Arc<StreamMap>,
    sorter: PacketSorter,
    teardown_tx: mpsc::Sender<FlowKey>,
    idle_timeout: Duration,
}

impl StreamFactory {
    /// `request_side` is the address pair oriented client -> server.
    fn open(&self, key: FlowKey, request_side: &AddressPair) -> TlsStream {
        let id = self.stream_map.next_id();
        let stream = TlsStream::new(id, key, request_side, &self.sorter);
        self.stream_map.store(id, Arc::clone(stream.handle()));

        if !self.idle_timeout.is_zero() {
            spawn_idle_watch(
                Arc::clone(stream.handle()),
                self.idle_timeout,
                Arc::clone(&self.stream_map),
                self.teardown_tx.clone(),
            );
        }

        STREAMS_CREATED_TOTAL.inc();
        debug!(
            event.name = "stream.created",
            stream.id = id,
            stream.key = %stream.handle().key(),
            "new tls stream"
        );
        stream
    }
}

pub struct TlsPoller {
    streams: HashMap<FlowKey, TlsStream>,
    close_streams: mpsc::Receiver<FlowKey>,
    fd_cache: CorrelationCache<FdKey, AddressPair>,
    factory: StreamFactory,
}

impl TlsPoller {
    pub fn new(
        conf: &PollerConf,
        stream_map: Arc<StreamMap>,
        sorter: PacketSorter,
    ) -> Result<Self, PollerError> {
        let fd_cache = CorrelationCache::with_memory_ceiling(
            "fd",
            conf.fd_cache_memory,
            conf.fd_cache_entry_size,
        )?;
        let (teardown_tx, close_streams) = mpsc::channel(conf.teardown_channel_capacity.max(1));

        Ok(Self {
            streams: HashMap::new(),
            close_streams,
            fd_cache,
            factory: StreamFactory {
                stream_map,
                sorter,
                teardown_tx,
                idle_timeout: conf.stream_idle_timeout,
            },
        })
    }

    /// Queue on which any stream owner may request that a flow be forgotten.
    pub fn teardown_sender(&self) -> mpsc::Sender<FlowKey> {
        self.factory.teardown_tx.clone()
    }

    /// Number of flows currently routable.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_id(&self, key: &FlowKey) -> Option<i64> {
        self.streams.get(key).map(TlsStream::id)
    }

    /// Run until `reader` is closed or fails.
    ///
    /// Ingestion runs on a blocking thread and hands chunks over through a
    /// queue of one slot, so a slow demultiplexer throttles reads. Teardown
    /// requests still queued when ingestion ends are not processed.
    pub async fn poll<R>(&mut self, reader: R) -> Result<(), PollerError>
    where
        R: ChunkReader + 'static,
    {
        let (chunks_tx, mut chunks_rx) = mpsc::channel(1);
        let ingest = tokio::task::spawn_blocking(move || poll_chunks(reader, chunks_tx));

        info!(event.name = "poller.started", "tls stream demultiplexer started");

        loop {
            tokio::select! {
                chunk = chunks_rx.recv() => match chunk {
                    Some(chunk) => self.handle_chunk(chunk).await,
                    None => break,
                },
                Some(key) = self.close_streams.recv() => self.handle_teardown(&key),
            }
        }

        info!(
            event.name = "poller.stopped",
            poller.active_streams = self.streams.len(),
            "tls stream demultiplexer stopped"
        );

        ingest.await?;
        Ok(())
    }

    pub async fn handle_chunk(&mut self, chunk: RawChunkRecord) {
        let Some(observed) = self.resolve_address(&chunk) else {
            CHUNKS_UNRESOLVED_TOTAL.inc();
            debug!(
                event.name = "stream.chunk_unresolved",
                process.tgid = chunk.tgid,
                socket.fd = chunk.fd,
                "dropping chunk with no known address"
            );
            return;
        };

        let is_request = chunk.is_request();
        let flow = observed.oriented(is_request);
        let key = FlowKey::new(&flow, is_request);
        // client -> server, whichever side opens the stream
        let request_side = flow.oriented(is_request);

        let stream = match self.streams.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let stream = self.factory.open(entry.key().clone(), &request_side);
                let stream = entry.insert(stream);
                STREAMS_ACTIVE.inc();
                stream
            }
        };

        if let Err(e) = stream.dispatch(&chunk).await {
            CHUNK_DISPATCH_ERRORS_TOTAL.inc();
            warn!(
                event.name = "stream.dispatch_failed",
                stream.id = stream.id(),
                error.message = %e,
                "failed to hand chunk to reassembly"
            );
        }
    }

    /// Forget `key`. The stream itself may live on with its other owners.
    pub fn handle_teardown(&mut self, key: &FlowKey) {
        if let Some(stream) = self.streams.remove(key) {
            STREAMS_REMOVED_TOTAL.inc();
            STREAMS_ACTIVE.dec();
            debug!(
                event.name = "stream.removed",
                stream.id = stream.id(),
                stream.key = %key,
                "tls stream removed from demultiplexer"
            );
        }
    }

    /// The socket quad of `chunk` as observed. Chunks the probe could not
    /// resolve borrow the last quad seen on the same `(tgid, fd)`, and are
    /// `None` when there is none.
    fn resolve_address(&mut self, chunk: &RawChunkRecord) -> Option<AddressPair> {
        let fd_key = (chunk.tgid, chunk.fd);
        let address = chunk.address_pair();

        if !address.is_unset() {
            self.fd_cache.insert(fd_key, address);
            return Some(address);
        }

        self.fd_cache.lookup(&fd_key).copied()
    }
}
