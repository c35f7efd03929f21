use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use crate::{
    address::TcpId,
    chunk::RawChunkRecord,
    stream::{
        StreamHandle,
        sorter::{PacketSorter, SortedPacket},
    },
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("packet sorter queue is closed")]
    SorterClosed,
}

/// Reassembly context for one direction of a stream.
pub struct TlsReader {
    tcp_id: Arc<TcpId>,
    stream: Arc<StreamHandle>,
    is_client: bool,
    sorter: PacketSorter,
    seq: u64,
    offset: u64,
}

impl TlsReader {
    pub fn new(tcp_id: TcpId, stream: Arc<StreamHandle>, is_client: bool, sorter: PacketSorter) -> Self {
        Self {
            tcp_id: Arc::new(tcp_id),
            stream,
            is_client,
            sorter,
            seq: 0,
            offset: 0,
        }
    }

    pub fn tcp_id(&self) -> &TcpId {
        &self.tcp_id
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Accept one chunk for this direction and forward it to the sorter.
    ///
    /// The byte offset advances by the intercepted length, not the recorded
    /// length, so a truncated chunk still accounts for the bytes it dropped.
    pub async fn new_chunk(&mut self, chunk: &RawChunkRecord) -> Result<(), DispatchError> {
        self.stream.mark_active();

        let packet = SortedPacket {
            stream_id: self.stream.id(),
            tcp_id: Arc::clone(&self.tcp_id),
            is_client: self.is_client,
            seq: self.seq,
            offset: self.offset,
            truncated: chunk.is_truncated(),
            payload: Bytes::copy_from_slice(chunk.payload()),
        };

        self.sorter
            .send(packet)
            .await
            .map_err(|_| DispatchError::SorterClosed)?;

        trace!(
            event.name = "stream.chunk_accepted",
            stream.id = self.stream.id(),
            stream.is_client = self.is_client,
            stream.seq = self.seq,
            chunk.len = chunk.len,
            "chunk handed to sorter"
        );

        self.seq += 1;
        self.offset += u64::from(chunk.len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{address::FlowKey, chunk::fixture::ChunkFixture};

    fn chunk(fixture: ChunkFixture) -> RawChunkRecord {
        RawChunkRecord::decode(&fixture.encode()).expect("fixture should decode")
    }

    fn reader(sorter: PacketSorter) -> TlsReader {
        let address = chunk(ChunkFixture::default()).address_pair();
        let handle = Arc::new(StreamHandle::new(7, FlowKey::new(&address, true)));
        TlsReader::new(TcpId::new(&address, true), handle, true, sorter)
    }

    #[tokio::test]
    async fn sequence_and_offset_advance_per_chunk() {
        let (sorter, mut rx) = PacketSorter::new(8);
        let mut reader = reader(sorter);

        reader
            .new_chunk(&chunk(ChunkFixture::default()))
            .await
            .expect("sorter open");
        reader
            .new_chunk(&chunk(ChunkFixture {
                len: 6000,
                recorded: 3,
                payload: b"abc".to_vec(),
                ..Default::default()
            }))
            .await
            .expect("sorter open");
        reader
            .new_chunk(&chunk(ChunkFixture::default()))
            .await
            .expect("sorter open");

        let first = rx.recv().await.expect("first packet");
        assert_eq!((first.seq, first.offset), (0, 0));
        assert_eq!(first.payload.as_ref(), b"hello");
        assert_eq!(first.stream_id, 7);
        assert!(first.is_client);

        let second = rx.recv().await.expect("second packet");
        assert_eq!((second.seq, second.offset), (1, 5));
        assert!(second.truncated);
        assert_eq!(second.payload.as_ref(), b"abc");

        let third = rx.recv().await.expect("third packet");
        assert_eq!((third.seq, third.offset), (2, 6005));
    }

    #[tokio::test]
    async fn closed_sorter_is_a_dispatch_error() {
        let (sorter, rx) = PacketSorter::new(1);
        drop(rx);
        let mut reader = reader(sorter);

        let err = reader
            .new_chunk(&chunk(ChunkFixture::default()))
            .await
            .expect_err("sorter is closed");
        assert_eq!(err, DispatchError::SorterClosed);
    }
}
