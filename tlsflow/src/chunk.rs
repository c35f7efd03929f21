//! Decoding of raw chunk records read from the perf buffer.
//!
//! Each field is read at its explicit offset from `tlsflow_common`, so a
//! layout change on the probe side shows up as a failing fixture test here
//! rather than as silently shifted values.

use std::net::Ipv4Addr;

use thiserror::Error;
use tlsflow_common::{
    CHUNK_DATA_SIZE, CHUNK_RECORD_SIZE, FLAGS_IS_CLIENT_BIT, FLAGS_IS_READ_BIT, OFFSET_DADDR,
    OFFSET_DATA, OFFSET_DPORT, OFFSET_FD, OFFSET_FLAGS, OFFSET_LEN, OFFSET_PID, OFFSET_RECORDED,
    OFFSET_SADDR, OFFSET_SPORT, OFFSET_START, OFFSET_TGID,
};

use crate::address::AddressPair;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("chunk record too short: got {actual} bytes, expected {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("chunk claims {recorded} recorded bytes but the payload holds at most {capacity}")]
    RecordedOverflow { recorded: u32, capacity: usize },
}

/// One decoded TLS chunk. Immutable once decoded.
#[derive(Clone, PartialEq, Eq)]
pub struct RawChunkRecord {
    pub pid: u32,
    pub tgid: u32,
    /// Length of the intercepted read/write; may exceed the payload capacity.
    pub len: u32,
    pub start: u32,
    /// Number of meaningful bytes in `data`.
    pub recorded: u32,
    pub fd: u32,
    pub flags: u32,
    /// Network byte order.
    pub saddr: u32,
    /// Network byte order.
    pub daddr: u32,
    /// Network byte order.
    pub sport: u16,
    /// Network byte order.
    pub dport: u16,
    data: Box<[u8; CHUNK_DATA_SIZE]>,
}

impl RawChunkRecord {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < CHUNK_RECORD_SIZE {
            return Err(DecodeError::Truncated {
                expected: CHUNK_RECORD_SIZE,
                actual: buf.len(),
            });
        }

        let recorded = read_u32(buf, OFFSET_RECORDED);
        if recorded as usize > CHUNK_DATA_SIZE {
            return Err(DecodeError::RecordedOverflow {
                recorded,
                capacity: CHUNK_DATA_SIZE,
            });
        }

        let mut data = Box::new([0u8; CHUNK_DATA_SIZE]);
        data.copy_from_slice(&buf[OFFSET_DATA..OFFSET_DATA + CHUNK_DATA_SIZE]);

        Ok(Self {
            pid: read_u32(buf, OFFSET_PID),
            tgid: read_u32(buf, OFFSET_TGID),
            len: read_u32(buf, OFFSET_LEN),
            start: read_u32(buf, OFFSET_START),
            recorded,
            fd: read_u32(buf, OFFSET_FD),
            flags: read_u32(buf, OFFSET_FLAGS),
            saddr: read_u32(buf, OFFSET_SADDR),
            daddr: read_u32(buf, OFFSET_DADDR),
            sport: read_u16(buf, OFFSET_SPORT),
            dport: read_u16(buf, OFFSET_DPORT),
            data,
        })
    }

    /// The meaningful prefix of the payload buffer.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.recorded as usize]
    }

    /// The kernel saw more bytes than it could copy into the record.
    pub fn is_truncated(&self) -> bool {
        self.len > self.recorded
    }

    pub fn is_client(&self) -> bool {
        self.flags & FLAGS_IS_CLIENT_BIT != 0
    }

    pub fn is_read(&self) -> bool {
        self.flags & FLAGS_IS_READ_BIT != 0
    }

    /// A client write or a server read both travel client -> server.
    pub fn is_request(&self) -> bool {
        (self.is_client() && !self.is_read()) || (!self.is_client() && self.is_read())
    }

    /// The socket quad as the probe copied it, regardless of direction.
    pub fn address_pair(&self) -> AddressPair {
        AddressPair {
            src_ip: Ipv4Addr::from(self.saddr.to_le_bytes()),
            src_port: u16::from_be_bytes(self.sport.to_le_bytes()),
            dst_ip: Ipv4Addr::from(self.daddr.to_le_bytes()),
            dst_port: u16::from_be_bytes(self.dport.to_le_bytes()),
        }
    }

    /// The quad oriented along the data flow: swapped for response chunks.
    pub fn flow_address(&self) -> AddressPair {
        self.address_pair().oriented(self.is_request())
    }
}

impl std::fmt::Debug for RawChunkRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawChunkRecord")
            .field("pid", &self.pid)
            .field("tgid", &self.tgid)
            .field("len", &self.len)
            .field("start", &self.start)
            .field("recorded", &self.recorded)
            .field("fd", &self.fd)
            .field("flags", &self.flags)
            .field("address", &self.address_pair())
            .finish_non_exhaustive()
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

/// Builds an encoded record the way the probes lay it out. Test support only.
#[cfg(test)]
pub(crate) mod fixture {
    use std::net::Ipv4Addr;

    use tlsflow_common::*;

    pub struct ChunkFixture {
        pub pid: u32,
        pub tgid: u32,
        pub len: u32,
        pub recorded: u32,
        pub fd: u32,
        pub flags: u32,
        pub src: (Ipv4Addr, u16),
        pub dst: (Ipv4Addr, u16),
        pub payload: Vec<u8>,
    }

    impl Default for ChunkFixture {
        fn default() -> Self {
            Self {
                pid: 4242,
                tgid: 4242,
                len: 5,
                recorded: 5,
                fd: 7,
                flags: FLAGS_IS_CLIENT_BIT,
                src: (Ipv4Addr::new(10, 0, 0, 1), 5000),
                dst: (Ipv4Addr::new(10, 0, 0, 2), 443),
                payload: b"hello".to_vec(),
            }
        }
    }

    impl ChunkFixture {
        pub fn encode(&self) -> Vec<u8> {
            let mut buf = vec![0u8; CHUNK_RECORD_SIZE];
            buf[OFFSET_PID..OFFSET_PID + 4].copy_from_slice(&self.pid.to_le_bytes());
            buf[OFFSET_TGID..OFFSET_TGID + 4].copy_from_slice(&self.tgid.to_le_bytes());
            buf[OFFSET_LEN..OFFSET_LEN + 4].copy_from_slice(&self.len.to_le_bytes());
            buf[OFFSET_RECORDED..OFFSET_RECORDED + 4]
                .copy_from_slice(&self.recorded.to_le_bytes());
            buf[OFFSET_FD..OFFSET_FD + 4].copy_from_slice(&self.fd.to_le_bytes());
            buf[OFFSET_FLAGS..OFFSET_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
            // addresses and ports are copied from the socket in network order
            buf[OFFSET_SADDR..OFFSET_SADDR + 4].copy_from_slice(&self.src.0.octets());
            buf[OFFSET_DADDR..OFFSET_DADDR + 4].copy_from_slice(&self.dst.0.octets());
            buf[OFFSET_SPORT..OFFSET_SPORT + 2].copy_from_slice(&self.src.1.to_be_bytes());
            buf[OFFSET_DPORT..OFFSET_DPORT + 2].copy_from_slice(&self.dst.1.to_be_bytes());
            buf[OFFSET_DATA..OFFSET_DATA + self.payload.len()].copy_from_slice(&self.payload);
            buf
        }
    }
}
