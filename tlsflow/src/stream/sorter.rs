use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{address::TcpId, metrics::registry::PACKETS_SORTED_TOTAL};

/// One reassembled unit of TLS payload, ready for downstream consumers.
#[derive(Debug, Clone)]
pub struct SortedPacket {
    pub stream_id: i64,
    pub tcp_id: Arc<TcpId>,
    pub is_client: bool,
    /// Per-direction sequence number, starting at 0.
    pub seq: u64,
    /// Bytes seen in this direction before this packet.
    pub offset: u64,
    /// The intercepted call moved more bytes than `payload` holds.
    pub truncated: bool,
    pub payload: Bytes,
}

/// Entry point of the downstream packet queue.
///
/// Cheap to clone; every reassembly context holds one.
#[derive(Debug, Clone)]
pub struct PacketSorter {
    tx: mpsc::Sender<SortedPacket>,
}

impl PacketSorter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SortedPacket>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Waits for queue space.
    pub async fn send(
        &self,
        packet: SortedPacket,
    ) -> Result<(), mpsc::error::SendError<SortedPacket>> {
        self.tx.send(packet).await?;
        PACKETS_SORTED_TOTAL.inc();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
