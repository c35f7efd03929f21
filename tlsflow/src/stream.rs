//! TLS streams and their per-direction reassembly contexts.
//!
//! A [`TlsStream`] is created by the demultiplexer for every new flow key. It
//! owns one [`reader::TlsReader`] per direction and shares a [`StreamHandle`]
//! with the process-wide [`map::StreamMap`] and with its idle watch.
//!
//! # Architecture
//!
//! - `map`: Stream identity allocator and id -> stream table
//! - `reader`: Per-direction reassembly context
//! - `sorter`: Downstream packet queue fed by the readers

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::debug;

use crate::{
    address::{AddressPair, FlowKey, TcpId},
    chunk::RawChunkRecord,
    stream::{
        map::StreamMap,
        reader::{DispatchError, TlsReader},
        sorter::PacketSorter,
    },
};

pub mod map;
pub mod reader;
pub mod sorter;

/// Shareable face of a stream: identity, activity clock and closed flag.
#[derive(Debug)]
pub struct StreamHandle {
    id: i64,
    key: FlowKey,
    born: Instant,
    /// Nanoseconds after `born` at which the last chunk was accepted.
    last_active: AtomicU64,
    closed: AtomicBool,
}

impl StreamHandle {
    pub fn new(id: i64, key: FlowKey) -> Self {
        Self {
            id,
            key,
            born: Instant::now(),
            last_active: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn mark_active(&self) {
        let nanos = u64::try_from(self.born.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_active.store(nanos, Ordering::Relaxed);
    }

    /// Time since the last accepted chunk, or since creation if none.
    pub fn idle_for(&self) -> Duration {
        let last_active = Duration::from_nanos(self.last_active.load(Ordering::Relaxed));
        self.born.elapsed().saturating_sub(last_active)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One TCP flow: a client-side and a server-side reassembly context.
pub struct TlsStream {
    handle: Arc<StreamHandle>,
    client: TlsReader,
    server: TlsReader,
}

impl TlsStream {
    /// Both readers are bound here from `address`, oriented client -> server:
    /// the client to the request orientation and the server to the response
    /// orientation.
    pub fn new(id: i64, key: FlowKey, address: &AddressPair, sorter: &PacketSorter) -> Self {
        let handle = Arc::new(StreamHandle::new(id, key));
        let client = TlsReader::new(
            TcpId::new(address, true),
            Arc::clone(&handle),
            true,
            sorter.clone(),
        );
        let server = TlsReader::new(
            TcpId::new(address, false),
            Arc::clone(&handle),
            false,
            sorter.clone(),
        );

        Self {
            handle,
            client,
            server,
        }
    }

    pub fn handle(&self) -> &Arc<StreamHandle> {
        &self.handle
    }

    pub fn id(&self) -> i64 {
        self.handle.id()
    }

    pub fn client(&self) -> &TlsReader {
        &self.client
    }

    pub fn server(&self) -> &TlsReader {
        &self.server
    }

    /// Request-side chunks go to the client context, the rest to the server.
    pub async fn dispatch(&mut self, chunk: &RawChunkRecord) -> Result<(), DispatchError> {
        if chunk.is_request() {
            self.client.new_chunk(chunk).await
        } else {
            self.server.new_chunk(chunk).await
        }
    }
}

/// Retire `handle` once it has seen no chunk for `idle_timeout`.
///
/// Retiring closes the handle, drops it from `stream_map` and sends its flow
/// key on `teardown_tx`, waiting for room if the queue is full.
pub fn spawn_idle_watch(
    handle: Arc<StreamHandle>,
    idle_timeout: Duration,
    stream_map: Arc<StreamMap>,
    teardown_tx: mpsc::Sender<FlowKey>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let idle = handle.idle_for();
            if idle >= idle_timeout {
                break;
            }
            sleep(idle_timeout - idle).await;
        }

        handle.close();
        stream_map.delete(handle.id());
        debug!(
            event.name = "stream.idle_timeout",
            stream.id = handle.id(),
            stream.key = %handle.key(),
            "stream idle, requesting teardown"
        );

        if teardown_tx.send(handle.key().clone()).await.is_err() {
            debug!(
                event.name = "stream.teardown_dropped",
                stream.id = handle.id(),
                "demultiplexer is gone, teardown not delivered"
            );
        }
    })
}
