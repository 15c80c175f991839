//! Shared protocol constants for the cookfs framed transport

// Header magic for messages sent directly over a plain TCP transport
pub const TCP_MAGIC: u32 = 0x9E2B_83C1;

// Header magic for messages carried inside a multichannel transport channel
pub const CHANNEL_MAGIC: u32 = 0xA690_C3B7;

// Magic of the multiplexer's own packets on the raw socket (outer and inner frame)
pub const MULTIPLEX_MAGIC: u32 = 0x5A7C_1D2E;

// Header: magic (4) | payload size (4) | payload crc (4)
pub const HEADER_SIZE: usize = 12;

// Maximum frame payload size (1GB) - bounds allocation on a corrupted size field
pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024 * 1024;

// Sent with GetFileList; bumped whenever a payload layout changes
pub const PROTOCOL_VERSION: u32 = 1;

pub const DEFAULT_TCP_PORT: u16 = 41899;
pub const DEFAULT_HTTP_PORT: u16 = 41898;

/// Multiplexer channel ids
pub mod channel {
    // Acknowledgements only; never throttled
    pub const CONTROL: u32 = 0;
    // Synchronous request/response traffic
    pub const MAIN: u32 = 100;
}

/// Multiplexer tuning
pub mod multiplex {
    // Stays under typical blocking-socket send limits once framing is added
    pub const MAX_PACKET: usize = 128 * 1024 - 8;
    pub const DEFAULT_BANDWIDTH_LATENCY_PRODUCT: u64 = 2 * 1024 * 1024;
}

/// Read-ahead cache size for streaming handles
pub const STREAMING_CACHE_SIZE: usize = 64 * 1024;

/// Chunk size used when streaming a synced payload to disk
pub const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Local and server timestamps closer than this are considered equal
pub const TIMESTAMP_TOLERANCE_MS: i64 = 1000;

/// Connection flags sent with GetFileList
pub mod flags {
    pub const NONE: u32 = 0;
    pub const STREAMING: u32 = 0b0000_0001;
    pub const PRECOOKED_ITERATIVE: u32 = 0b0000_0010;
}

/// Request kinds. Every request payload starts with the kind as a u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    GetFileList = 1,
    SyncFile = 2,
    Heartbeat = 3,
    RecompileShaders = 4,
    DeleteFile = 10,
    MoveFile = 11,
    SetReadOnly = 12,
    CreateDirectory = 13,
    DeleteDirectory = 14,
    DeleteDirectoryRecursively = 15,
    CopyFile = 16,
    ToAbsolutePathForRead = 17,
    ToAbsolutePathForWrite = 18,
    GetFileInfo = 19,
    Open = 30,
    Read = 31,
    Write = 32,
    Seek = 33,
    Close = 34,
}

impl MessageKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        use MessageKind::*;
        let kind = match value {
            1 => GetFileList,
            2 => SyncFile,
            3 => Heartbeat,
            4 => RecompileShaders,
            10 => DeleteFile,
            11 => MoveFile,
            12 => SetReadOnly,
            13 => CreateDirectory,
            14 => DeleteDirectory,
            15 => DeleteDirectoryRecursively,
            16 => CopyFile,
            17 => ToAbsolutePathForRead,
            18 => ToAbsolutePathForWrite,
            19 => GetFileInfo,
            30 => Open,
            31 => Read,
            32 => Write,
            33 => Seek,
            34 => Close,
            _ => return None,
        };
        Some(kind)
    }
}
