//! Handle-oriented remote file access with no local mirror.
//!
//! Every open, read, write, seek and close is a round trip to the server.
//! Reads go through two alternating read-ahead buffers so sequential access
//! and short backward hops are served locally. Seeks only move the local
//! position; the server hears about it on the next read or write.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::address::parse_host_list;
use crate::client::ServerInfo;
use crate::config::ClientConfig;
use crate::error::{NetError, NetResult};
use crate::frame::{self, Payload};
use crate::messages::{
    self, FileInfo, FileListRequest, FileListResponse, OpenResponse, Request,
};
use crate::paths::normalize_path;
use crate::protocol::{flags, PROTOCOL_VERSION, STREAMING_CACHE_SIZE};
use crate::toc::{now_millis, FileStamp, ServerToc, TocEntry};
use crate::transport::{connect_first, Transport};

struct StreamingInner {
    transport: Mutex<Box<dyn Transport>>,
    toc: Mutex<ServerToc>,
    server: ServerInfo,
}

impl StreamingInner {
    fn round_trip(&self, request: &Request) -> NetResult<Payload> {
        let mut transport = self.transport.lock();
        frame::send_and_receive(&request.encode(), &mut **transport)
    }
}

/// Remote filesystem client; no local cache.
pub struct StreamingFileClient {
    inner: Arc<StreamingInner>,
}

impl StreamingFileClient {
    pub fn connect(config: &ClientConfig) -> NetResult<Self> {
        let hosts = parse_host_list(&config.hosts);
        let (transport, address) =
            connect_first(&hosts, config.multichannel, config.bandwidth_latency_product)?;
        Self::with_transport(config, transport, address.to_string())
    }

    pub fn with_transport(
        config: &ClientConfig,
        mut transport: Box<dyn Transport>,
        address: String,
    ) -> NetResult<Self> {
        let request = Request::GetFileList(FileListRequest {
            platforms: config.platforms.clone(),
            project_name: config.project_name.clone(),
            engine_dir: config.engine_dir.clone(),
            project_dir: config.project_dir.clone(),
            directories: config.directories.clone(),
            flags: config.connection_flags() | flags::STREAMING,
            version: PROTOCOL_VERSION,
        });
        let response = frame::send_and_receive(&request.encode(), &mut *transport)
            .and_then(|payload| FileListResponse::decode(&payload))
            .map_err(|e| NetError::Handshake(format!("file list request failed: {}", e)))?;

        let mut toc = ServerToc::new();
        for (path, stamp) in &response.listing {
            if let Some(entry) = stamp.entry() {
                toc.add_file_or_directory(path, entry);
            }
        }
        info!(files = toc.file_count(), "streaming client connected");

        Ok(Self {
            inner: Arc::new(StreamingInner {
                transport: Mutex::new(transport),
                toc: Mutex::new(toc),
                server: ServerInfo {
                    address,
                    cooked_version: response.cooked_version,
                    licensee_version: response.licensee_version,
                    engine_dir: response.engine_dir,
                    project_dir: response.project_dir,
                },
            }),
        })
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.inner.server
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.inner.toc.lock().find_file(path).is_some()
    }

    pub fn directory_exists(&self, path: &str) -> bool {
        self.inner.toc.lock().find_directory(path).is_some()
    }

    pub fn file_info(&self, path: &str) -> NetResult<FileInfo> {
        let payload = self.inner.round_trip(&Request::GetFileInfo {
            path: normalize_path(path),
        })?;
        FileInfo::decode(&payload)
    }

    pub fn open_read(&self, path: &str) -> NetResult<StreamingFileHandle> {
        self.open(path, false, false)
    }

    pub fn open_write(&self, path: &str, append: bool) -> NetResult<StreamingFileHandle> {
        let handle = self.open(path, true, append)?;
        self.inner
            .toc
            .lock()
            .add_file_or_directory(&handle.path, TocEntry::File(now_millis()));
        Ok(handle)
    }

    fn open(&self, path: &str, write: bool, append: bool) -> NetResult<StreamingFileHandle> {
        let rel = normalize_path(path);
        let payload = self.inner.round_trip(&Request::Open {
            path: rel.clone(),
            write,
            append,
        })?;
        let opened = OpenResponse::decode(&payload)?;
        if opened.handle == 0 || (!write && opened.stamp == FileStamp::Absent) {
            debug!(path = %rel, write, "open refused by server");
            let kind = if write {
                io::ErrorKind::PermissionDenied
            } else {
                io::ErrorKind::NotFound
            };
            return Err(NetError::Io(io::Error::new(kind, format!("cannot open {}", rel))));
        }
        let position = if append { opened.size } else { 0 };
        Ok(StreamingFileHandle {
            client: self.inner.clone(),
            path: rel,
            handle: opened.handle,
            stamp: opened.stamp,
            size: opened.size,
            position,
            server_position: position,
            writable: write,
            caches: [ReadCache::default(), ReadCache::default()],
            current: 0,
            lazy_seek: false,
        })
    }

    fn status(&self, request: Request) -> NetResult<bool> {
        let payload = self.inner.round_trip(&request)?;
        messages::decode_status(&payload)
    }

    pub fn delete_file(&self, path: &str) -> NetResult<bool> {
        let rel = normalize_path(path);
        let ok = self.status(Request::DeleteFile { path: rel.clone() })?;
        if ok {
            self.inner.toc.lock().remove_file_or_directory(&rel);
        }
        Ok(ok)
    }

    pub fn move_file(&self, from: &str, to: &str) -> NetResult<bool> {
        let (from, to) = (normalize_path(from), normalize_path(to));
        let ok = self.status(Request::MoveFile {
            from: from.clone(),
            to: to.clone(),
        })?;
        if ok {
            let mut toc = self.inner.toc.lock();
            let entry = toc.find(&from).unwrap_or(TocEntry::File(now_millis()));
            toc.remove_file_or_directory(&from);
            toc.add_file_or_directory(&to, entry);
        }
        Ok(ok)
    }

    pub fn set_read_only(&self, path: &str, read_only: bool) -> NetResult<bool> {
        self.status(Request::SetReadOnly {
            path: normalize_path(path),
            read_only,
        })
    }

    pub fn create_directory(&self, path: &str) -> NetResult<bool> {
        let rel = normalize_path(path);
        let ok = self.status(Request::CreateDirectory { path: rel.clone() })?;
        if ok {
            self.inner
                .toc
                .lock()
                .add_file_or_directory(&rel, TocEntry::Directory);
        }
        Ok(ok)
    }

    pub fn delete_directory(&self, path: &str) -> NetResult<bool> {
        let rel = normalize_path(path);
        let ok = self.status(Request::DeleteDirectory { path: rel.clone() })?;
        if ok {
            self.inner.toc.lock().remove_file_or_directory(&rel);
        }
        Ok(ok)
    }

    pub fn delete_directory_recursively(&self, path: &str) -> NetResult<bool> {
        let rel = normalize_path(path);
        let ok = self.status(Request::DeleteDirectoryRecursively { path: rel.clone() })?;
        if ok {
            self.inner.toc.lock().remove_file_or_directory(&rel);
        }
        Ok(ok)
    }

    pub fn copy_file(&self, from: &str, to: &str) -> NetResult<bool> {
        let to = normalize_path(to);
        let ok = self.status(Request::CopyFile {
            from: normalize_path(from),
            to: to.clone(),
        })?;
        if ok {
            self.inner
                .toc
                .lock()
                .add_file_or_directory(&to, TocEntry::File(now_millis()));
        }
        Ok(ok)
    }

    pub fn to_absolute_path_for_read(&self, path: &str) -> NetResult<String> {
        let payload = self.inner.round_trip(&Request::ToAbsolutePathForRead {
            path: normalize_path(path),
        })?;
        messages::decode_string(&payload)
    }

    pub fn to_absolute_path_for_write(&self, path: &str) -> NetResult<String> {
        let payload = self.inner.round_trip(&Request::ToAbsolutePathForWrite {
            path: normalize_path(path),
        })?;
        messages::decode_string(&payload)
    }

    pub fn recompile_shaders(&self, blob: &[u8]) -> NetResult<Vec<u8>> {
        let payload = self.inner.round_trip(&Request::RecompileShaders {
            blob: blob.to_vec(),
        })?;
        messages::decode_blob(&payload)
    }
}

/// `[start, start + data.len())` of the file.
#[derive(Debug, Default)]
struct ReadCache {
    start: i64,
    data: Vec<u8>,
}

impl ReadCache {
    fn end(&self) -> i64 {
        self.start + self.data.len() as i64
    }

    fn contains(&self, pos: i64) -> bool {
        pos >= self.start && pos < self.end()
    }

    fn clear(&mut self) {
        self.start = 0;
        self.data.clear();
    }
}

/// An open remote file. Dropping it closes the server handle.
pub struct StreamingFileHandle {
    client: Arc<StreamingInner>,
    path: String,
    handle: u64,
    stamp: FileStamp,
    size: i64,
    position: i64,
    server_position: i64,
    writable: bool,
    caches: [ReadCache; 2],
    current: usize,
    lazy_seek: bool,
}

impl StreamingFileHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handle_id(&self) -> u64 {
        self.handle
    }

    pub fn stamp(&self) -> FileStamp {
        self.stamp
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn sync_server_position(&mut self) -> NetResult<()> {
        if !self.lazy_seek && self.server_position == self.position {
            return Ok(());
        }
        if self.server_position != self.position {
            let payload = self.client.round_trip(&Request::Seek {
                handle: self.handle,
                position: self.position,
            })?;
            if !messages::decode_status(&payload)? {
                return Err(messages::unexpected(format!(
                    "server refused seek to {} on {}",
                    self.position, self.path
                )));
            }
            self.server_position = self.position;
        }
        self.lazy_seek = false;
        Ok(())
    }

    /// Read `len` bytes at the current position straight from the server.
    fn remote_read(&mut self, len: usize) -> NetResult<Vec<u8>> {
        self.sync_server_position()?;
        let payload = self.client.round_trip(&Request::Read {
            handle: self.handle,
            len: len as u64,
        })?;
        let data = messages::decode_blob(&payload)?;
        if data.len() > len {
            return Err(messages::unexpected(format!(
                "asked for {} bytes, got {}",
                len,
                data.len()
            )));
        }
        self.server_position += data.len() as i64;
        Ok(data)
    }

    fn copy_from_cache(&mut self, out: &mut [u8]) -> usize {
        for idx in [self.current, 1 - self.current] {
            let cache = &self.caches[idx];
            if !cache.contains(self.position) {
                continue;
            }
            let offset = (self.position - cache.start) as usize;
            let n = out.len().min(cache.data.len() - offset);
            out[..n].copy_from_slice(&cache.data[offset..offset + n]);
            self.current = idx;
            self.position += n as i64;
            return n;
        }
        0
    }

    /// Refill the older buffer from the current position. Returns bytes cached.
    fn fill_cache(&mut self) -> NetResult<usize> {
        let len = (self.size - self.position).clamp(0, STREAMING_CACHE_SIZE as i64) as usize;
        if len == 0 {
            return Ok(0);
        }
        let start = self.position;
        let data = self.remote_read(len)?;
        let next = 1 - self.current;
        let n = data.len();
        self.caches[next] = ReadCache { start, data };
        self.current = next;
        Ok(n)
    }

    fn invalidate_caches(&mut self) {
        for cache in &mut self.caches {
            cache.clear();
        }
    }

    fn read_impl(&mut self, buf: &mut [u8]) -> NetResult<usize> {
        let available = (self.size - self.position).max(0) as usize;
        let want = buf.len().min(available);
        let mut done = 0;
        while done < want {
            let n = self.copy_from_cache(&mut buf[done..want]);
            if n > 0 {
                done += n;
                continue;
            }
            let remaining = want - done;
            if remaining >= STREAMING_CACHE_SIZE {
                // Large reads bypass the buffers
                let data = self.remote_read(remaining)?;
                if data.is_empty() {
                    break;
                }
                buf[done..done + data.len()].copy_from_slice(&data);
                done += data.len();
                self.position += data.len() as i64;
            } else if self.fill_cache()? == 0 {
                break;
            }
        }
        Ok(done)
    }

    fn write_impl(&mut self, buf: &[u8]) -> NetResult<usize> {
        if !self.writable {
            return Err(NetError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} was opened read-only", self.path),
            )));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.sync_server_position()?;
        let payload = self.client.round_trip(&Request::Write {
            handle: self.handle,
            data: buf.to_vec(),
        })?;
        let written = messages::decode_i64(&payload)?;
        if written < 0 || written as usize > buf.len() {
            return Err(messages::unexpected(format!("server reported {} bytes written", written)));
        }
        self.invalidate_caches();
        self.position += written;
        self.server_position += written;
        self.size = self.size.max(self.position);
        Ok(written as usize)
    }
}

impl Read for StreamingFileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_impl(buf)?)
    }
}

impl Write for StreamingFileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_impl(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for StreamingFileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => i64::try_from(p).ok(),
            SeekFrom::End(off) => self.size.checked_add(off),
            SeekFrom::Current(off) => self.position.checked_add(off),
        };
        match target {
            Some(t) if t >= 0 => {
                self.position = t;
                self.lazy_seek = true;
                Ok(t as u64)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

impl Drop for StreamingFileHandle {
    fn drop(&mut self) {
        let result = self
            .client
            .round_trip(&Request::Close {
                handle: self.handle,
            })
            .and_then(|payload| messages::decode_status(&payload));
        if let Err(e) = result {
            warn!(path = %self.path, "close failed: {}", e);
        }
    }
}
