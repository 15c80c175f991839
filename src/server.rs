//! Reference cook server.
//!
//! Serves a directory tree to network and streaming clients. One thread per
//! connection; the transport (plain or multiplexed) is picked from the magic
//! of the first frame the client sends.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::cache;
use crate::error::NetError;
use crate::frame;
use crate::messages::{
    self, FileInfo, FileListRequest, FileListResponse, HeartbeatResponse, Listing, OpenResponse,
    Request, SyncFileResponse, SyncedFile,
};
use crate::multichannel::MultichannelSocket;
use crate::paths::{self, normalize_path, normalize_under_root, relative_to, COMPANION_EXTENSIONS};
use crate::protocol::{flags, multiplex, MessageKind, MULTIPLEX_MAGIC};
use crate::toc::FileStamp;
use crate::transport::{MultichannelTransport, TcpTransport, Transport};

// Upper bound for one streaming Read response
const MAX_READ_CHUNK: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub root: PathBuf,
    pub cooked_version: i32,
    pub licensee_version: i32,
    pub bandwidth_latency_product: u64,
}

impl ServerOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cooked_version: 1,
            licensee_version: 0,
            bandwidth_latency_product: multiplex::DEFAULT_BANDWIDTH_LATENCY_PRODUCT,
        }
    }
}

/// Request counters, shared across connections.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections: AtomicU64,
    requests: Mutex<HashMap<MessageKind, u64>>,
    syncs: Mutex<HashMap<String, u64>>,
}

impl ServerStats {
    fn record(&self, kind: MessageKind) {
        *self.requests.lock().entry(kind).or_default() += 1;
    }

    fn record_sync(&self, path: &str) {
        *self.syncs.lock().entry(path.to_string()).or_default() += 1;
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn requests(&self, kind: MessageKind) -> u64 {
        self.requests.lock().get(&kind).copied().unwrap_or(0)
    }

    /// SyncFile requests for one path.
    pub fn sync_count(&self, path: &str) -> u64 {
        self.syncs.lock().get(&normalize_path(path)).copied().unwrap_or(0)
    }
}

pub struct CookServer {
    listener: TcpListener,
    options: Arc<ServerOptions>,
    stats: Arc<ServerStats>,
    shutdown: Arc<AtomicBool>,
}

impl CookServer {
    pub fn bind(addr: &str, mut options: ServerOptions) -> Result<Self> {
        if !options.root.is_dir() {
            anyhow::bail!("root is not a directory: {}", options.root.display());
        }
        options.root = fs::canonicalize(&options.root)
            .with_context(|| format!("canonicalize {}", options.root.display()))?;
        let listener = TcpListener::bind(addr).with_context(|| format!("bind {}", addr))?;
        Ok(Self {
            listener,
            options: Arc::new(options),
            stats: Arc::new(ServerStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    pub fn root(&self) -> &Path {
        &self.options.root
    }

    /// Flag that stops the accept loop once set (and a connection wakes it).
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Accept connections until the shutdown flag is set.
    pub fn serve(&self) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            root = %self.options.root.display(),
            "cook server listening"
        );
        for conn in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match conn {
                Ok(stream) => {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    self.stats.connections.fetch_add(1, Ordering::Relaxed);
                    let options = self.options.clone();
                    let stats = self.stats.clone();
                    let spawned = thread::Builder::new()
                        .name("cookfs-conn".into())
                        .spawn(move || {
                            info!(%peer, "client connected");
                            match serve_connection(stream, options, stats) {
                                Ok(()) => info!(%peer, "client disconnected"),
                                Err(e) => warn!(%peer, "connection ended with error: {:#}", e),
                            }
                        });
                    if let Err(e) = spawned {
                        error!("could not spawn connection thread: {}", e);
                    }
                }
                Err(e) => warn!("accept error: {}", e),
            }
        }
        Ok(())
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let stats = self.stats();
        let shutdown = self.shutdown_flag();
        let thread = thread::Builder::new()
            .name("cookfs-accept".into())
            .spawn(move || {
                if let Err(e) = self.serve() {
                    error!("server stopped: {:#}", e);
                }
            })?;
        Ok(ServerHandle {
            addr,
            stats,
            shutdown,
            thread: Some(thread),
        })
    }
}

/// A server running on its own thread. Stops on drop.
pub struct ServerHandle {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the blocking accept
        let _ = TcpStream::connect(self.addr);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait until the first four bytes are buffered and report whether they are
/// the multiplexer magic in either byte order.
fn is_multiplexed(stream: &TcpStream) -> Result<bool> {
    let mut magic = [0u8; 4];
    for _ in 0..500 {
        let n = stream.peek(&mut magic)?;
        if n == 0 {
            anyhow::bail!("client closed before sending anything");
        }
        if n == 4 {
            let raw = u32::from_le_bytes(magic);
            return Ok(raw == MULTIPLEX_MAGIC || raw.swap_bytes() == MULTIPLEX_MAGIC);
        }
        thread::sleep(Duration::from_millis(2));
    }
    anyhow::bail!("timed out waiting for the first frame")
}

fn serve_connection(
    stream: TcpStream,
    options: Arc<ServerOptions>,
    stats: Arc<ServerStats>,
) -> Result<()> {
    let mut transport: Box<dyn Transport> = if is_multiplexed(&stream)? {
        debug!("multiplexed connection");
        let socket = MultichannelSocket::with_bandwidth_latency_product(
            stream,
            options.bandwidth_latency_product,
        )?;
        Box::new(MultichannelTransport::main(socket))
    } else {
        Box::new(TcpTransport::new(stream))
    };
    let mut conn = Connection::new(&options, &stats);
    loop {
        let payload = match frame::receive(&mut *transport) {
            Ok(p) => p,
            Err(NetError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let request = Request::decode(&payload)?;
        stats.record(request.kind());
        conn.handle(request, &mut *transport)?;
    }
}

struct OpenFile {
    file: File,
    writable: bool,
}

/// Per-connection state.
struct Connection<'a> {
    options: &'a ServerOptions,
    stats: &'a ServerStats,
    /// Files this client has seen, with the mtime it saw.
    sent: HashMap<String, i64>,
    handles: HashMap<u64, OpenFile>,
    next_handle: u64,
}

impl<'a> Connection<'a> {
    fn new(options: &'a ServerOptions, stats: &'a ServerStats) -> Self {
        Self {
            options,
            stats,
            sent: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    fn root(&self) -> &Path {
        &self.options.root
    }

    fn resolve(&self, rel: &str) -> Option<PathBuf> {
        match normalize_under_root(self.root(), rel) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(path = rel, "rejecting path: {:#}", e);
                None
            }
        }
    }

    fn handle(&mut self, request: Request, transport: &mut dyn Transport) -> Result<()> {
        debug!(kind = ?request.kind(), "request");
        let response = match request {
            Request::GetFileList(req) => self.file_list(&req).encode(),
            Request::SyncFile { path } => {
                let (response, companions) = self.sync_file(&path);
                frame::send(&response.encode(), transport)?;
                for file in companions {
                    frame::send(&file.encode(), transport)?;
                }
                return Ok(());
            }
            Request::Heartbeat => self.heartbeat().encode(),
            Request::RecompileShaders { blob } => {
                debug!(bytes = blob.len(), "shader recompile requested; nothing to do");
                messages::encode_blob(&[])
            }
            Request::DeleteFile { path } => messages::encode_status(
                self.resolve(&path)
                    .is_some_and(|p| cache::remove_file(&p).unwrap_or(false)),
            ),
            Request::MoveFile { from, to } => {
                let ok = match (self.resolve(&from), self.resolve(&to)) {
                    (Some(src), Some(dst)) => {
                        paths::ensure_parent_exists(&dst).is_ok() && fs::rename(src, dst).is_ok()
                    }
                    _ => false,
                };
                messages::encode_status(ok)
            }
            Request::SetReadOnly { path, read_only } => messages::encode_status(
                self.resolve(&path)
                    .is_some_and(|p| cache::set_read_only(&p, read_only).is_ok()),
            ),
            Request::CreateDirectory { path } => messages::encode_status(
                self.resolve(&path).is_some_and(|p| fs::create_dir_all(p).is_ok()),
            ),
            Request::DeleteDirectory { path } => messages::encode_status(
                self.resolve(&path).is_some_and(|p| fs::remove_dir(p).is_ok()),
            ),
            Request::DeleteDirectoryRecursively { path } => messages::encode_status(
                self.resolve(&path)
                    .is_some_and(|p| p != self.root() && fs::remove_dir_all(p).is_ok()),
            ),
            Request::CopyFile { from, to } => {
                let ok = match (self.resolve(&from), self.resolve(&to)) {
                    (Some(src), Some(dst)) => {
                        paths::ensure_parent_exists(&dst).is_ok() && fs::copy(src, dst).is_ok()
                    }
                    _ => false,
                };
                messages::encode_status(ok)
            }
            Request::ToAbsolutePathForRead { path } | Request::ToAbsolutePathForWrite { path } => {
                let abs = self
                    .resolve(&path)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                messages::encode_string(&abs)
            }
            Request::GetFileInfo { path } => self.file_info(&path).encode(),
            Request::Open { path, write, append } => self.open(&path, write, append).encode(),
            Request::Read { handle, len } => {
                let data = self.read(handle, len);
                messages::encode_blob(&data)
            }
            Request::Write { handle, data } => messages::encode_i64(self.write(handle, &data)),
            Request::Seek { handle, position } => {
                let ok = match (self.handles.get_mut(&handle), u64::try_from(position)) {
                    (Some(open), Ok(pos)) => open.file.seek(SeekFrom::Start(pos)).is_ok(),
                    _ => false,
                };
                messages::encode_status(ok)
            }
            Request::Close { handle } => {
                messages::encode_status(self.handles.remove(&handle).is_some())
            }
        };
        frame::send(&response, transport)?;
        Ok(())
    }

    fn walk_listing(&self, directories: &[String]) -> Listing {
        let root = self.root();
        let prefixes: Vec<String> = directories.iter().map(|d| normalize_path(d)).collect();
        let mut listing = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).into_iter().filter_map(|e| e.ok()) {
            let Some(rel) = relative_to(root, entry.path()) else {
                continue;
            };
            if !prefixes.is_empty()
                && !prefixes
                    .iter()
                    .any(|p| rel == *p || rel.starts_with(&format!("{}/", p)))
            {
                continue;
            }
            let stamp = if entry.file_type().is_dir() {
                FileStamp::Directory
            } else {
                match cache::local_millis(entry.path()) {
                    Ok(ms) => FileStamp::File(ms),
                    Err(_) => continue,
                }
            };
            listing.push((rel, stamp));
        }
        listing
    }

    fn file_list(&mut self, req: &FileListRequest) -> FileListResponse {
        info!(
            project = %req.project_name,
            platforms = ?req.platforms,
            flags = req.flags,
            version = req.version,
            "file list requested"
        );
        let listing = self.walk_listing(&req.directories);
        for (path, stamp) in &listing {
            if let FileStamp::File(ms) = stamp {
                self.sent.insert(path.clone(), *ms);
            }
        }
        let cached_files = (req.flags & flags::PRECOOKED_ITERATIVE != 0).then(|| {
            listing
                .iter()
                .filter(|(_, stamp)| matches!(stamp, FileStamp::File(_)))
                .cloned()
                .collect()
        });
        FileListResponse {
            cooked_version: self.options.cooked_version,
            licensee_version: self.options.licensee_version,
            engine_dir: self.root().join("Engine").to_string_lossy().into_owned(),
            project_dir: self.root().to_string_lossy().into_owned(),
            listing,
            cached_files,
        }
    }

    fn load(&mut self, rel: &str) -> SyncedFile {
        let Some(abs) = self.resolve(rel) else {
            return SyncedFile::absent(rel);
        };
        if abs.is_dir() {
            return SyncedFile {
                path: rel.to_string(),
                stamp: FileStamp::Directory,
                contents: Vec::new(),
            };
        }
        let (contents, ms) = match (fs::read(&abs), cache::local_millis(&abs)) {
            (Ok(c), Ok(ms)) => (c, ms),
            _ => return SyncedFile::absent(rel),
        };
        self.sent.insert(rel.to_string(), ms);
        SyncedFile {
            path: rel.to_string(),
            stamp: FileStamp::File(ms),
            contents,
        }
    }

    fn sync_file(&mut self, path: &str) -> (SyncFileResponse, Vec<SyncedFile>) {
        let rel = normalize_path(path);
        self.stats.record_sync(&rel);
        let file = self.load(&rel);

        let mut companions = Vec::new();
        let is_package = matches!(paths::extension(&rel).as_deref(), Some("uasset") | Some("umap"));
        if is_package && matches!(file.stamp, FileStamp::File(_)) {
            for ext in COMPANION_EXTENSIONS {
                let companion = paths::with_extension(&rel, ext);
                let companion_file = self.load(&companion);
                if matches!(companion_file.stamp, FileStamp::File(_)) {
                    companions.push(companion_file);
                }
            }
        }
        debug!(path = %rel, stamp = ?file.stamp, companions = companions.len(), "sync");
        (
            SyncFileResponse {
                file,
                unsolicited: companions.len() as u32,
            },
            companions,
        )
    }

    /// Files whose mtime moved since this client last saw them.
    fn heartbeat(&mut self) -> HeartbeatResponse {
        let root = self.options.root.clone();
        let mut updated = Vec::new();
        for (path, seen) in self.sent.iter_mut() {
            let current = cache::local_millis(&root.join(path.as_str())).ok();
            if current != Some(*seen) {
                updated.push(path.clone());
                if let Some(ms) = current {
                    *seen = ms;
                }
            }
        }
        // Deleted files are reported once
        self.sent
            .retain(|path, _| root.join(path.as_str()).is_file());
        updated.sort();
        if !updated.is_empty() {
            info!(count = updated.len(), "reporting updated files");
        }
        HeartbeatResponse { updated }
    }

    fn file_info(&self, path: &str) -> FileInfo {
        let Some(abs) = self.resolve(path) else {
            return FileInfo::absent();
        };
        match fs::metadata(&abs) {
            Ok(meta) if meta.is_dir() => FileInfo {
                stamp: FileStamp::Directory,
                size: 0,
                read_only: meta.permissions().readonly(),
            },
            Ok(meta) => FileInfo {
                stamp: cache::local_millis(&abs).map_or(FileStamp::Absent, FileStamp::File),
                size: meta.len() as i64,
                read_only: meta.permissions().readonly(),
            },
            Err(_) => FileInfo::absent(),
        }
    }

    fn open(&mut self, path: &str, write: bool, append: bool) -> OpenResponse {
        let Some(abs) = self.resolve(path) else {
            return OpenResponse::failed();
        };
        let opened = if write {
            paths::ensure_parent_exists(&abs).and_then(|_| {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .append(append)
                    .truncate(!append)
                    .open(&abs)
            })
        } else if abs.is_file() {
            File::open(&abs)
        } else {
            Err(ErrorKind::NotFound.into())
        };
        let file = match opened {
            Ok(f) => f,
            Err(e) => {
                debug!(path, write, "open failed: {}", e);
                return OpenResponse::failed();
            }
        };
        let size = file.metadata().map(|m| m.len() as i64).unwrap_or(0);
        let stamp = cache::local_millis(&abs).map_or(FileStamp::Absent, FileStamp::File);
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, OpenFile { file, writable: write });
        OpenResponse { handle, stamp, size }
    }

    fn read(&mut self, handle: u64, len: u64) -> Vec<u8> {
        let Some(open) = self.handles.get_mut(&handle) else {
            return Vec::new();
        };
        let mut data = Vec::new();
        let limit = len.min(MAX_READ_CHUNK);
        if let Err(e) = (&mut open.file).take(limit).read_to_end(&mut data) {
            warn!(handle, "read failed: {}", e);
        }
        data
    }

    fn write(&mut self, handle: u64, data: &[u8]) -> i64 {
        match self.handles.get_mut(&handle) {
            Some(open) if open.writable => match open.file.write_all(data) {
                Ok(()) => data.len() as i64,
                Err(e) => {
                    warn!(handle, "write failed: {}", e);
                    -1
                }
            },
            _ => -1,
        }
    }
}
