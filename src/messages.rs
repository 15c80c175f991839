//! Typed request and response payloads.
//!
//! Requests begin with their [`MessageKind`]; responses carry no tag since
//! every exchange is a strict request/response pair. Unsolicited files that
//! follow a SyncFile response are plain [`SyncedFile`] payloads.

use crate::archive::{PayloadReader, PayloadWriter};
use crate::error::{NetError, NetResult};
use crate::frame::Payload;
use crate::protocol::MessageKind;
use crate::toc::FileStamp;

pub type Listing = Vec<(String, FileStamp)>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileListRequest {
    pub platforms: Vec<String>,
    pub project_name: String,
    pub engine_dir: String,
    pub project_dir: String,
    pub directories: Vec<String>,
    pub flags: u32,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetFileList(FileListRequest),
    SyncFile { path: String },
    Heartbeat,
    RecompileShaders { blob: Vec<u8> },
    DeleteFile { path: String },
    MoveFile { from: String, to: String },
    SetReadOnly { path: String, read_only: bool },
    CreateDirectory { path: String },
    DeleteDirectory { path: String },
    DeleteDirectoryRecursively { path: String },
    CopyFile { from: String, to: String },
    ToAbsolutePathForRead { path: String },
    ToAbsolutePathForWrite { path: String },
    GetFileInfo { path: String },
    Open { path: String, write: bool, append: bool },
    Read { handle: u64, len: u64 },
    Write { handle: u64, data: Vec<u8> },
    Seek { handle: u64, position: i64 },
    Close { handle: u64 },
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::GetFileList(_) => MessageKind::GetFileList,
            Request::SyncFile { .. } => MessageKind::SyncFile,
            Request::Heartbeat => MessageKind::Heartbeat,
            Request::RecompileShaders { .. } => MessageKind::RecompileShaders,
            Request::DeleteFile { .. } => MessageKind::DeleteFile,
            Request::MoveFile { .. } => MessageKind::MoveFile,
            Request::SetReadOnly { .. } => MessageKind::SetReadOnly,
            Request::CreateDirectory { .. } => MessageKind::CreateDirectory,
            Request::DeleteDirectory { .. } => MessageKind::DeleteDirectory,
            Request::DeleteDirectoryRecursively { .. } => MessageKind::DeleteDirectoryRecursively,
            Request::CopyFile { .. } => MessageKind::CopyFile,
            Request::ToAbsolutePathForRead { .. } => MessageKind::ToAbsolutePathForRead,
            Request::ToAbsolutePathForWrite { .. } => MessageKind::ToAbsolutePathForWrite,
            Request::GetFileInfo { .. } => MessageKind::GetFileInfo,
            Request::Open { .. } => MessageKind::Open,
            Request::Read { .. } => MessageKind::Read,
            Request::Write { .. } => MessageKind::Write,
            Request::Seek { .. } => MessageKind::Seek,
            Request::Close { .. } => MessageKind::Close,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::request(self.kind());
        match self {
            Request::GetFileList(req) => {
                w.put_str_list(&req.platforms)
                    .put_str(&req.project_name)
                    .put_str(&req.engine_dir)
                    .put_str(&req.project_dir)
                    .put_str_list(&req.directories)
                    .put_u32(req.flags)
                    .put_u32(req.version);
            }
            Request::Heartbeat => {}
            Request::RecompileShaders { blob } => {
                w.put_bytes(blob);
            }
            Request::SyncFile { path }
            | Request::DeleteFile { path }
            | Request::CreateDirectory { path }
            | Request::DeleteDirectory { path }
            | Request::DeleteDirectoryRecursively { path }
            | Request::ToAbsolutePathForRead { path }
            | Request::ToAbsolutePathForWrite { path }
            | Request::GetFileInfo { path } => {
                w.put_str(path);
            }
            Request::MoveFile { from, to } | Request::CopyFile { from, to } => {
                w.put_str(from).put_str(to);
            }
            Request::SetReadOnly { path, read_only } => {
                w.put_str(path).put_bool(*read_only);
            }
            Request::Open { path, write, append } => {
                w.put_str(path).put_bool(*write).put_bool(*append);
            }
            Request::Read { handle, len } => {
                w.put_u64(*handle).put_u64(*len);
            }
            Request::Write { handle, data } => {
                w.put_u64(*handle).put_bytes(data);
            }
            Request::Seek { handle, position } => {
                w.put_u64(*handle).put_i64(*position);
            }
            Request::Close { handle } => {
                w.put_u64(*handle);
            }
        }
        w.finish()
    }

    pub fn decode(payload: &Payload) -> NetResult<Self> {
        let mut r = payload.reader();
        let request = match r.get_kind()? {
            MessageKind::GetFileList => Request::GetFileList(FileListRequest {
                platforms: r.get_str_list()?,
                project_name: r.get_string()?,
                engine_dir: r.get_string()?,
                project_dir: r.get_string()?,
                directories: r.get_str_list()?,
                flags: r.get_u32()?,
                version: r.get_u32()?,
            }),
            MessageKind::SyncFile => Request::SyncFile { path: r.get_string()? },
            MessageKind::Heartbeat => Request::Heartbeat,
            MessageKind::RecompileShaders => Request::RecompileShaders {
                blob: r.get_bytes()?.to_vec(),
            },
            MessageKind::DeleteFile => Request::DeleteFile { path: r.get_string()? },
            MessageKind::MoveFile => Request::MoveFile {
                from: r.get_string()?,
                to: r.get_string()?,
            },
            MessageKind::SetReadOnly => Request::SetReadOnly {
                path: r.get_string()?,
                read_only: r.get_bool()?,
            },
            MessageKind::CreateDirectory => Request::CreateDirectory { path: r.get_string()? },
            MessageKind::DeleteDirectory => Request::DeleteDirectory { path: r.get_string()? },
            MessageKind::DeleteDirectoryRecursively => {
                Request::DeleteDirectoryRecursively { path: r.get_string()? }
            }
            MessageKind::CopyFile => Request::CopyFile {
                from: r.get_string()?,
                to: r.get_string()?,
            },
            MessageKind::ToAbsolutePathForRead => {
                Request::ToAbsolutePathForRead { path: r.get_string()? }
            }
            MessageKind::ToAbsolutePathForWrite => {
                Request::ToAbsolutePathForWrite { path: r.get_string()? }
            }
            MessageKind::GetFileInfo => Request::GetFileInfo { path: r.get_string()? },
            MessageKind::Open => Request::Open {
                path: r.get_string()?,
                write: r.get_bool()?,
                append: r.get_bool()?,
            },
            MessageKind::Read => Request::Read {
                handle: r.get_u64()?,
                len: r.get_u64()?,
            },
            MessageKind::Write => Request::Write {
                handle: r.get_u64()?,
                data: r.get_bytes()?.to_vec(),
            },
            MessageKind::Seek => Request::Seek {
                handle: r.get_u64()?,
                position: r.get_i64()?,
            },
            MessageKind::Close => Request::Close { handle: r.get_u64()? },
        };
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileListResponse {
    pub cooked_version: i32,
    pub licensee_version: i32,
    pub engine_dir: String,
    pub project_dir: String,
    pub listing: Listing,
    /// Files the server already has cooked; present only in iterative mode.
    pub cached_files: Option<Listing>,
}

impl FileListResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.put_i32(self.cooked_version)
            .put_i32(self.licensee_version)
            .put_str(&self.engine_dir)
            .put_str(&self.project_dir)
            .put_listing(&self.listing);
        match &self.cached_files {
            Some(cached) => w.put_bool(true).put_listing(cached),
            None => w.put_bool(false),
        };
        w.finish()
    }

    pub fn decode(payload: &Payload) -> NetResult<Self> {
        let mut r = payload.reader();
        let cooked_version = r.get_i32()?;
        let licensee_version = r.get_i32()?;
        let engine_dir = r.get_string()?;
        let project_dir = r.get_string()?;
        let listing = r.get_listing()?;
        let cached_files = if r.get_bool()? {
            Some(r.get_listing()?)
        } else {
            None
        };
        Ok(Self {
            cooked_version,
            licensee_version,
            engine_dir,
            project_dir,
            listing,
            cached_files,
        })
    }
}

/// One file's content as sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedFile {
    pub path: String,
    pub stamp: FileStamp,
    pub contents: Vec<u8>,
}

impl SyncedFile {
    pub fn absent(path: &str) -> Self {
        Self {
            path: path.to_string(),
            stamp: FileStamp::Absent,
            contents: Vec::new(),
        }
    }

    fn put(&self, w: &mut PayloadWriter) {
        w.put_str(&self.path).put_stamp(self.stamp).put_bytes(&self.contents);
    }

    fn get(r: &mut PayloadReader<'_>) -> NetResult<Self> {
        Ok(Self {
            path: r.get_string()?,
            stamp: r.get_stamp()?,
            contents: r.get_bytes()?.to_vec(),
        })
    }

    /// Standalone payload, used for unsolicited files.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        self.put(&mut w);
        w.finish()
    }

    pub fn decode(payload: &Payload) -> NetResult<Self> {
        Self::get(&mut payload.reader())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFileResponse {
    pub file: SyncedFile,
    /// Companion files that follow as separate messages.
    pub unsolicited: u32,
}

impl SyncFileResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        self.file.put(&mut w);
        w.put_u32(self.unsolicited);
        w.finish()
    }

    pub fn decode(payload: &Payload) -> NetResult<Self> {
        let mut r = payload.reader();
        let file = SyncedFile::get(&mut r)?;
        let unsolicited = r.get_u32()?;
        Ok(Self { file, unsolicited })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeartbeatResponse {
    pub updated: Vec<String>,
}

impl HeartbeatResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.put_str_list(&self.updated);
        w.finish()
    }

    pub fn decode(payload: &Payload) -> NetResult<Self> {
        Ok(Self {
            updated: payload.reader().get_str_list()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub stamp: FileStamp,
    pub size: i64,
    pub read_only: bool,
}

impl FileInfo {
    pub fn absent() -> Self {
        Self {
            stamp: FileStamp::Absent,
            size: -1,
            read_only: false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.put_stamp(self.stamp).put_i64(self.size).put_bool(self.read_only);
        w.finish()
    }

    pub fn decode(payload: &Payload) -> NetResult<Self> {
        let mut r = payload.reader();
        Ok(Self {
            stamp: r.get_stamp()?,
            size: r.get_i64()?,
            read_only: r.get_bool()?,
        })
    }
}

/// Result of a streaming Open. A zero handle means the open failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenResponse {
    pub handle: u64,
    pub stamp: FileStamp,
    pub size: i64,
}

impl OpenResponse {
    pub fn failed() -> Self {
        Self {
            handle: 0,
            stamp: FileStamp::Absent,
            size: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.put_u64(self.handle).put_stamp(self.stamp).put_i64(self.size);
        w.finish()
    }

    pub fn decode(payload: &Payload) -> NetResult<Self> {
        let mut r = payload.reader();
        Ok(Self {
            handle: r.get_u64()?,
            stamp: r.get_stamp()?,
            size: r.get_i64()?,
        })
    }
}

// Single-field responses

pub fn encode_status(ok: bool) -> Vec<u8> {
    vec![ok as u8]
}

pub fn decode_status(payload: &Payload) -> NetResult<bool> {
    payload.reader().get_bool()
}

pub fn encode_string(s: &str) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.put_str(s);
    w.finish()
}

pub fn decode_string(payload: &Payload) -> NetResult<String> {
    payload.reader().get_string()
}

pub fn encode_blob(bytes: &[u8]) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.put_bytes(bytes);
    w.finish()
}

pub fn decode_blob(payload: &Payload) -> NetResult<Vec<u8>> {
    Ok(payload.reader().get_bytes()?.to_vec())
}

pub fn encode_i64(v: i64) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.put_i64(v);
    w.finish()
}

pub fn decode_i64(payload: &Payload) -> NetResult<i64> {
    payload.reader().get_i64()
}

/// Error for a response that decoded but makes no sense for the request.
pub fn unexpected(what: impl Into<String>) -> NetError {
    NetError::UnexpectedResponse(what.into())
}
