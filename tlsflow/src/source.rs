//! Chunk source handling.
//!
//! This module contains the components responsible for reading TLS chunk
//! records out of the kernel perf buffer and handing decoded records to the
//! stream demultiplexer.
//!
//! # Architecture
//!
//! - `reader`: The blocking [`reader::ChunkReader`] seam and its close handle
//! - `perf`: Per-CPU perf event array implementation of that seam
//! - `ingest`: Blocking loop that decodes records and feeds the handoff queue

pub mod ingest;
pub mod perf;
pub mod reader;
