//! Global metrics registry and collector definitions.
//!
//! This module defines all Prometheus metrics exported by tlsflow and a
//! single registry they are collected into.

use std::sync::Mutex;

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

static REGISTRY_INITIALIZED: Mutex<bool> = Mutex::new(false);

lazy_static! {
    /// Global Prometheus registry for all tlsflow metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Ingestion Subsystem
    // ============================================================================

    /// Raw samples handed over by the perf reader, before decoding.
    pub static ref CHUNKS_READ_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("chunks_read_total", "Total number of raw chunk samples read from the perf buffer")
            .namespace("tlsflow")
            .subsystem("ingest")
    ).expect("failed to create chunks_read_total metric");

    pub static ref CHUNKS_LOST_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("chunks_lost_total", "Total number of chunks the kernel dropped because the perf buffer was full")
            .namespace("tlsflow")
            .subsystem("ingest")
    ).expect("failed to create chunks_lost_total metric");

    pub static ref CHUNK_DECODE_ERRORS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("chunk_decode_errors_total", "Total number of samples that could not be decoded as a chunk record")
            .namespace("tlsflow")
            .subsystem("ingest")
    ).expect("failed to create chunk_decode_errors_total metric");

    // ============================================================================
    // Stream Subsystem
    // ============================================================================

    pub static ref STREAMS_CREATED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("streams_created_total", "Total number of TLS streams created by the demultiplexer")
            .namespace("tlsflow")
            .subsystem("stream")
    ).expect("failed to create streams_created_total metric");

    pub static ref STREAMS_REMOVED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("streams_removed_total", "Total number of TLS streams removed from the demultiplexer after teardown")
            .namespace("tlsflow")
            .subsystem("stream")
    ).expect("failed to create streams_removed_total metric");

    pub static ref STREAMS_ACTIVE: IntGauge = IntGauge::with_opts(
        Opts::new("streams_active", "Current number of TLS streams routable by the demultiplexer")
            .namespace("tlsflow")
            .subsystem("stream")
    ).expect("failed to create streams_active metric");

    pub static ref CHUNK_DISPATCH_ERRORS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("chunk_dispatch_errors_total", "Total number of chunks a reassembly context failed to accept")
            .namespace("tlsflow")
            .subsystem("stream")
    ).expect("failed to create chunk_dispatch_errors_total metric");

    pub static ref CHUNKS_UNRESOLVED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("chunks_unresolved_total", "Total number of chunks dropped because their socket address was never seen")
            .namespace("tlsflow")
            .subsystem("stream")
    ).expect("failed to create chunks_unresolved_total metric");

    pub static ref PACKETS_SORTED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("packets_sorted_total", "Total number of packets handed to the sorter output queue")
            .namespace("tlsflow")
            .subsystem("stream")
    ).expect("failed to create packets_sorted_total metric");

    // ============================================================================
    // Cache Subsystem
    // ============================================================================

    /// Labels: cache = name given to the cache at construction (e.g. "fd")
    pub static ref CACHE_EVICTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("evictions_total", "Total number of entries evicted from bounded correlation caches")
            .namespace("tlsflow")
            .subsystem("cache"),
        &["cache"]
    ).expect("failed to create cache_evictions_total metric");
}

macro_rules! register {
    ($metric:expr) => {{
        REGISTRY.register(Box::new($metric.clone()))?;
    }};
}

/// Register every collector with [`REGISTRY`].
///
/// Safe to call more than once; only the first call registers.
pub fn init_registry() -> Result<(), prometheus::Error> {
    let mut initialized = REGISTRY_INITIALIZED
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if *initialized {
        return Ok(());
    }

    register!(CHUNKS_READ_TOTAL);
    register!(CHUNKS_LOST_TOTAL);
    register!(CHUNK_DECODE_ERRORS_TOTAL);

    register!(STREAMS_CREATED_TOTAL);
    register!(STREAMS_REMOVED_TOTAL);
    register!(STREAMS_ACTIVE);
    register!(CHUNK_DISPATCH_ERRORS_TOTAL);
    register!(CHUNKS_UNRESOLVED_TOTAL);
    register!(PACKETS_SORTED_TOTAL);

    register!(CACHE_EVICTIONS_TOTAL);

    *initialized = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_registry_is_idempotent() {
        init_registry().expect("first init should succeed");
        init_registry().expect("second init should be a no-op");

        let body = prometheus::TextEncoder::new()
            .encode_to_string(&REGISTRY.gather())
            .expect("metrics should encode");
        assert!(body.contains("tlsflow_ingest_chunks_lost_total"));
        assert!(body.contains("tlsflow_stream_streams_active"));
    }
}
