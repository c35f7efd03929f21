#![no_std]

//! Wire contract between the kernel-side TLS probes and userspace.
//!
//! The probes emit one fixed-size `tls_chunk` record per intercepted read or
//! write through the `chunks_buffer` perf event array. Every multi-byte
//! integer is little-endian except the address quad, which is copied
//! verbatim from the socket and therefore stays in network byte order.

/// Capacity of the payload buffer carried by every chunk record.
pub const CHUNK_DATA_SIZE: usize = 4096;

/// Total size in bytes of one encoded chunk record.
pub const CHUNK_RECORD_SIZE: usize = OFFSET_DATA + CHUNK_DATA_SIZE;

/// Set when the intercepted socket belongs to the client side of the connection.
pub const FLAGS_IS_CLIENT_BIT: u32 = 1 << 0;
/// Set when the chunk was captured on a read (as opposed to a write).
pub const FLAGS_IS_READ_BIT: u32 = 1 << 1;

// Field offsets
// ---
pub const OFFSET_PID: usize = 0;
pub const OFFSET_TGID: usize = 4;
pub const OFFSET_LEN: usize = 8;
pub const OFFSET_START: usize = 12;
pub const OFFSET_RECORDED: usize = 16;
pub const OFFSET_FD: usize = 20;
pub const OFFSET_FLAGS: usize = 24;
pub const OFFSET_SADDR: usize = 28;
pub const OFFSET_DADDR: usize = 32;
pub const OFFSET_SPORT: usize = 36;
pub const OFFSET_DPORT: usize = 38;
pub const OFFSET_DATA: usize = 40;

/// In-kernel layout of the address quad attached to each chunk.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressInfo {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
}

/// In-kernel layout of one chunk record, as written by the probes.
///
/// Userspace never reinterprets raw bytes as this struct; it exists so the
/// probe side and the offsets above can be checked against each other.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TlsChunk {
    pub pid: u32,
    pub tgid: u32,
    pub len: u32,
    pub start: u32,
    pub recorded: u32,
    pub fd: u32,
    pub flags: u32,
    pub address_info: AddressInfo,
    pub data: [u8; CHUNK_DATA_SIZE],
}
