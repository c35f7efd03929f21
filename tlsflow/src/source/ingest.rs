use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    chunk::RawChunkRecord,
    metrics::registry::{CHUNK_DECODE_ERRORS_TOTAL, CHUNKS_LOST_TOTAL, CHUNKS_READ_TOTAL},
    source::reader::ChunkReader,
};

/// Read, decode and hand over chunk records until the reader closes.
///
/// Blocking; run it with `tokio::task::spawn_blocking`. Returning drops
/// `chunks_tx`, which is how the consumer learns that ingestion is over.
pub fn poll_chunks<R: ChunkReader>(mut reader: R, chunks_tx: mpsc::Sender<RawChunkRecord>) {
    info!(
        event.name = "ingest.started",
        "userspace task started: polling perf buffer for tls chunks"
    );

    loop {
        let record = match reader.read() {
            Ok(record) => record,
            Err(e) if e.is_closed() => {
                debug!(event.name = "ingest.closed", "chunk reader closed, stopping ingestion");
                return;
            }
            Err(e) => {
                error!(
                    event.name = "ingest.read_failed",
                    error.message = %e,
                    "error reading chunks from tls perf buffer, aborting tls ingestion"
                );
                return;
            }
        };

        if record.lost_samples != 0 {
            CHUNKS_LOST_TOTAL.inc_by(record.lost_samples);
            info!(
                event.name = "ingest.samples_lost",
                ingest.lost = record.lost_samples,
                "buffer is full, dropped {} chunks",
                record.lost_samples
            );
            continue;
        }

        CHUNKS_READ_TOTAL.inc();

        let chunk = match RawChunkRecord::decode(&record.raw_sample) {
            Ok(chunk) => chunk,
            Err(e) => {
                CHUNK_DECODE_ERRORS_TOTAL.inc();
                warn!(
                    event.name = "ingest.decode_failed",
                    error.message = %e,
                    "error parsing chunk, skipping"
                );
                continue;
            }
        };

        if chunks_tx.blocking_send(chunk).is_err() {
            debug!(
                event.name = "ingest.consumer_gone",
                "chunk consumer dropped, stopping ingestion"
            );
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        chunk::fixture::ChunkFixture,
        source::{
            reader::{ReaderError, Record},
            testing::ChannelReader,
        },
    };

    fn run_to_end(reader: ChannelReader) -> Vec<RawChunkRecord> {
        let (tx, mut rx) = mpsc::channel(16);
        poll_chunks(reader, tx);

        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn forwards_decoded_chunks_in_order() {
        let (reader, feed) = ChannelReader::new();
        for fd in [1, 2, 3] {
            let raw = ChunkFixture {
                fd,
                ..Default::default()
            }
            .encode();
            feed.send(Ok(Record::sample(raw))).expect("feed open");
        }
        drop(feed);

        let chunks = run_to_end(reader);
        let fds: Vec<u32> = chunks.iter().map(|c| c.fd).collect();
        assert_eq!(fds, vec![1, 2, 3]);
    }

    #[test]
    fn lost_samples_are_skipped() {
        let (reader, feed) = ChannelReader::new();
        feed.send(Ok(Record::lost(12))).expect("feed open");
        feed.send(Ok(Record::sample(ChunkFixture::default().encode())))
            .expect("feed open");
        drop(feed);

        let chunks = run_to_end(reader);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload(), b"hello");
    }

    #[test]
    fn undecodable_sample_is_skipped() {
        let (reader, feed) = ChannelReader::new();
        feed.send(Ok(Record::sample(vec![0u8; 10]))).expect("feed open");
        feed.send(Ok(Record::sample(ChunkFixture::default().encode())))
            .expect("feed open");
        drop(feed);

        let chunks = run_to_end(reader);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn fatal_read_error_stops_ingestion() {
        let (reader, feed) = ChannelReader::new();
        feed.send(Err(ReaderError::Poll(io::Error::other("boom"))))
            .expect("feed open");
        feed.send(Ok(Record::sample(ChunkFixture::default().encode())))
            .expect("feed open");

        let chunks = run_to_end(reader);
        assert!(chunks.is_empty(), "nothing after a fatal error is forwarded");
    }

    #[test]
    fn closing_the_handoff_queue_stops_ingestion() {
        let (reader, feed) = ChannelReader::new();
        feed.send(Ok(Record::sample(ChunkFixture::default().encode())))
            .expect("feed open");

        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        // Returns instead of blocking forever on a reader that is never closed.
        poll_chunks(reader, tx);
    }

    #[test]
    fn sender_is_dropped_on_return() {
        let (reader, feed) = ChannelReader::new();
        drop(feed);

        let (tx, mut rx) = mpsc::channel::<RawChunkRecord>(1);
        poll_chunks(reader, tx);

        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
