//! Network platform file client.
//!
//! Mirrors the cook server's output into a local root on demand. Every
//! content-bearing call first runs [`NetworkFileClient::ensure_file_is_local`],
//! which fetches the file over the transport once and serves it from disk
//! afterwards. Companion files the server pushes along with a package are
//! received and written by a background task; the next caller waits for it.
//!
//! Paths named by the server are confined to the local root. Any transport or
//! decode failure leaves the stream at an unknown offset, so the client shuts
//! the connection and every later fetch is a soft miss.
//!
//! Locking: the transport mutex is taken before the state mutex, never the
//! other way round, and the state mutex is never held across a network call
//! or a blocking wait.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::address::parse_host_list;
use crate::cache::{self, VersionStamp};
use crate::config::ClientConfig;
use crate::error::{NetError, NetResult};
use crate::frame;
use crate::hooks::{ClientHooks, NoopHooks};
use crate::messages::{
    FileListRequest, FileListResponse, HeartbeatResponse, Request, SyncFileResponse, SyncedFile,
};
use crate::paths::{
    escapes_root, is_cookable, is_local_only, normalize_path, normalize_under_root, package_name,
};
use crate::protocol::{PROTOCOL_VERSION, TIMESTAMP_TOLERANCE_MS};
use crate::task::{Completion, TaskGroup, TaskHandle};
use crate::toc::{now_millis, FileStamp, ServerToc, TocEntry};
use crate::transport::{connect_first, Transport};

/// What the server told us about itself at bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub address: String,
    pub cooked_version: i32,
    pub licensee_version: i32,
    pub engine_dir: String,
    pub project_dir: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Waited on an unsolicited batch that delivered the requested file.
    pub unsolicited_hits: u64,
    /// Waited on an unsolicited batch that did not.
    pub unsolicited_waits: u64,
    /// SyncFile round trips.
    pub syncs: u64,
    pub unsolicited_files: u64,
    pub heartbeats: u64,
    pub heartbeat_evictions: u64,
}

#[derive(Default)]
struct Counters {
    unsolicited_hits: AtomicU64,
    unsolicited_waits: AtomicU64,
    syncs: AtomicU64,
    unsolicited_files: AtomicU64,
    heartbeats: AtomicU64,
    heartbeat_evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ClientStats {
        ClientStats {
            unsolicited_hits: self.unsolicited_hits.load(Ordering::Relaxed),
            unsolicited_waits: self.unsolicited_waits.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            unsolicited_files: self.unsolicited_files.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            heartbeat_evictions: self.heartbeat_evictions.load(Ordering::Relaxed),
        }
    }
}

/// Companion files still arriving after a SyncFile response.
#[derive(Default)]
struct PendingUnsolicited {
    network_read: Arc<Completion>,
    disk_write: Arc<Completion>,
}

impl PendingUnsolicited {
    fn wait(&self) {
        self.network_read.wait();
        self.disk_write.wait();
    }

    fn is_done(&self) -> bool {
        self.network_read.is_signaled() && self.disk_write.is_signaled()
    }
}

#[derive(Default)]
struct ClientState {
    toc: ServerToc,
    /// Present locally, or about to be.
    cached: HashSet<String>,
    /// Fetches in progress; waiters block on the completion outside the lock.
    in_flight: HashMap<String, Arc<Completion>>,
    pending: Option<Arc<PendingUnsolicited>>,
}

struct ClientInner {
    config: ClientConfig,
    local_root: PathBuf,
    transport: Mutex<Box<dyn Transport>>,
    state: Mutex<ClientState>,
    hooks: Arc<dyn ClientHooks>,
    server: Mutex<ServerInfo>,
    counters: Counters,
    last_heartbeat: Mutex<Instant>,
    background: Mutex<Option<TaskHandle<()>>>,
    // First consistency failure seen by a background write
    fatal: Mutex<Option<String>>,
    // Stream position unknown after a failed exchange
    broken: AtomicBool,
}

/// Client that mirrors a cook server into a local directory.
pub struct NetworkFileClient {
    inner: Arc<ClientInner>,
}

impl NetworkFileClient {
    /// Connect to the first reachable host in `config.hosts` and bootstrap.
    pub fn connect(config: ClientConfig, hooks: Arc<dyn ClientHooks>) -> NetResult<Self> {
        let hosts = parse_host_list(&config.hosts);
        let (transport, address) =
            connect_first(&hosts, config.multichannel, config.bandwidth_latency_product)?;
        Self::with_transport(config, transport, address.to_string(), hooks)
    }

    /// Bootstrap over an already connected transport.
    pub fn with_transport(
        config: ClientConfig,
        transport: Box<dyn Transport>,
        address: String,
        hooks: Arc<dyn ClientHooks>,
    ) -> NetResult<Self> {
        let local_root = config.local_root.clone();
        fs::create_dir_all(&local_root)?;
        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                local_root,
                transport: Mutex::new(transport),
                state: Mutex::new(ClientState::default()),
                hooks,
                server: Mutex::new(ServerInfo {
                    address,
                    ..ServerInfo::default()
                }),
                counters: Counters::default(),
                last_heartbeat: Mutex::new(Instant::now()),
                background: Mutex::new(None),
                fatal: Mutex::new(None),
                broken: AtomicBool::new(false),
            }),
        };
        client.inner.bootstrap()?;
        Ok(client)
    }

    pub fn connect_default(config: ClientConfig) -> NetResult<Self> {
        Self::connect(config, Arc::new(NoopHooks))
    }

    pub fn server_info(&self) -> ServerInfo {
        self.inner.server.lock().clone()
    }

    pub fn local_root(&self) -> &Path {
        &self.inner.local_root
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> ClientStats {
        self.inner.counters.snapshot()
    }

    /// Copy of the current TOC.
    pub fn toc(&self) -> ServerToc {
        self.inner.state.lock().toc.clone()
    }

    /// A transport or protocol failure closed the connection.
    pub fn is_connection_broken(&self) -> bool {
        self.inner.broken.load(Ordering::SeqCst)
    }

    pub fn is_cached(&self, path: &str) -> bool {
        self.inner.state.lock().cached.contains(&normalize_path(path))
    }

    /// Make `path` present on local disk if the server has it. A miss is not an error.
    pub fn ensure_file_is_local(&self, path: &str) -> NetResult<()> {
        self.inner.ensure_file_is_local(path)
    }

    /// Ask the server for changed files and evict them. Returns how many were evicted.
    pub fn perform_heartbeat(&self) -> NetResult<usize> {
        self.inner.perform_heartbeat()
    }

    /// Heartbeat if the configured interval has elapsed since the last one.
    pub fn tick(&self) -> NetResult<usize> {
        let Some(interval) = self.inner.config.heartbeat_interval() else {
            return Ok(0);
        };
        {
            let mut last = self.inner.last_heartbeat.lock();
            if last.elapsed() < interval {
                return Ok(0);
            }
            *last = Instant::now();
        }
        self.inner.perform_heartbeat()
    }

    // Platform file operations

    fn local(&self, path: &str) -> (String, PathBuf) {
        let rel = normalize_path(path);
        let abs = cache::local_path(&self.inner.local_root, &rel);
        (rel, abs)
    }

    pub fn file_exists(&self, path: &str) -> bool {
        let (rel, abs) = self.local(path);
        if abs.is_file() {
            return true;
        }
        !is_local_only(&rel) && self.inner.state.lock().toc.find_file(&rel).is_some()
    }

    pub fn directory_exists(&self, path: &str) -> bool {
        let (rel, abs) = self.local(path);
        if abs.is_dir() {
            return true;
        }
        !is_local_only(&rel) && self.inner.state.lock().toc.find_directory(&rel).is_some()
    }

    /// Server timestamp when the TOC knows the path, local metadata otherwise.
    pub fn timestamp(&self, path: &str) -> FileStamp {
        let (rel, abs) = self.local(path);
        if !is_local_only(&rel) {
            if let Some(entry) = self.inner.state.lock().toc.find(&rel) {
                return entry.into();
            }
        }
        match fs::metadata(&abs) {
            Ok(meta) if meta.is_dir() => FileStamp::Directory,
            Ok(_) => cache::local_millis(&abs).map_or(FileStamp::Absent, FileStamp::File),
            Err(_) => FileStamp::Absent,
        }
    }

    pub fn file_size(&self, path: &str) -> NetResult<Option<u64>> {
        let (rel, abs) = self.local(path);
        self.inner.ensure_file_is_local(&rel)?;
        match fs::metadata(abs) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_read_only(&self, path: &str) -> NetResult<bool> {
        let (rel, abs) = self.local(path);
        self.inner.ensure_file_is_local(&rel)?;
        match fs::metadata(abs) {
            Ok(meta) => Ok(meta.permissions().readonly()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn open_read(&self, path: &str) -> NetResult<File> {
        let (rel, abs) = self.local(path);
        self.inner.ensure_file_is_local(&rel)?;
        Ok(File::open(abs)?)
    }

    pub fn read_to_vec(&self, path: &str) -> NetResult<Vec<u8>> {
        let (rel, abs) = self.local(path);
        self.inner.ensure_file_is_local(&rel)?;
        Ok(fs::read(abs)?)
    }

    /// Open for writing. Local writes become the authoritative copy.
    pub fn open_write(&self, path: &str, append: bool) -> NetResult<File> {
        let (rel, abs) = self.local(path);
        if append {
            self.inner.ensure_file_is_local(&rel)?;
        }
        crate::paths::ensure_parent_exists(&abs)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(&abs)?;
        if !is_local_only(&rel) {
            self.inner.state.lock().cached.insert(rel);
        }
        Ok(file)
    }

    pub fn delete_file(&self, path: &str) -> NetResult<bool> {
        let (rel, abs) = self.local(path);
        let removed = cache::remove_file(&abs)?;
        if !is_local_only(&rel) {
            let mut st = self.inner.state.lock();
            st.cached.remove(&rel);
            st.toc.remove_file_or_directory(&rel);
        }
        Ok(removed)
    }

    pub fn move_file(&self, from: &str, to: &str) -> NetResult<()> {
        let (from_rel, from_abs) = self.local(from);
        let (to_rel, to_abs) = self.local(to);
        self.inner.ensure_file_is_local(&from_rel)?;
        crate::paths::ensure_parent_exists(&to_abs)?;
        fs::rename(&from_abs, &to_abs)?;

        let mtime = cache::local_millis(&to_abs).unwrap_or_else(|_| now_millis());
        let mut st = self.inner.state.lock();
        if !is_local_only(&from_rel) {
            st.cached.remove(&from_rel);
            st.toc.remove_file_or_directory(&from_rel);
        }
        if !is_local_only(&to_rel) {
            st.cached.insert(to_rel.clone());
            st.toc.add_file_or_directory(&to_rel, TocEntry::File(mtime));
        }
        Ok(())
    }

    pub fn set_read_only(&self, path: &str, read_only: bool) -> NetResult<()> {
        let (rel, abs) = self.local(path);
        self.inner.ensure_file_is_local(&rel)?;
        Ok(cache::set_read_only(&abs, read_only)?)
    }

    pub fn copy_file(&self, from: &str, to: &str) -> NetResult<u64> {
        let (from_rel, from_abs) = self.local(from);
        let (to_rel, to_abs) = self.local(to);
        self.inner.ensure_file_is_local(&from_rel)?;
        crate::paths::ensure_parent_exists(&to_abs)?;
        let bytes = fs::copy(&from_abs, &to_abs)?;
        if !is_local_only(&to_rel) {
            self.inner.state.lock().cached.insert(to_rel);
        }
        Ok(bytes)
    }

    pub fn create_directory(&self, path: &str) -> NetResult<()> {
        let (rel, abs) = self.local(path);
        fs::create_dir_all(&abs)?;
        if !is_local_only(&rel) {
            self.inner
                .state
                .lock()
                .toc
                .add_file_or_directory(&rel, TocEntry::Directory);
        }
        Ok(())
    }

    pub fn delete_directory(&self, path: &str) -> NetResult<()> {
        let (rel, abs) = self.local(path);
        match fs::remove_dir(&abs) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if !is_local_only(&rel) {
            self.inner.state.lock().toc.remove_file_or_directory(&rel);
        }
        Ok(())
    }

    pub fn delete_directory_recursively(&self, path: &str) -> NetResult<()> {
        let (rel, abs) = self.local(path);
        if abs.exists() {
            for (file, _) in cache::scan_local_files(&abs) {
                let _ = cache::clear_read_only(&abs.join(file));
            }
            fs::remove_dir_all(&abs)?;
        }
        if !is_local_only(&rel) {
            let prefix = format!("{}/", rel);
            let mut st = self.inner.state.lock();
            st.cached.retain(|p| !p.starts_with(&prefix));
            st.toc.remove_file_or_directory(&rel);
        }
        Ok(())
    }

    /// Union of the TOC listing and what is on local disk, sorted by path.
    pub fn iterate_directory(&self, path: &str) -> Vec<(String, FileStamp)> {
        let (rel, abs) = self.local(path);
        let mut entries: BTreeMap<String, FileStamp> = BTreeMap::new();
        if !is_local_only(&rel) {
            if let Some(dir) = self.inner.state.lock().toc.find_directory(&rel) {
                for (p, entry) in dir {
                    entries.insert(p.clone(), (*entry).into());
                }
            }
        }
        if let Ok(read_dir) = fs::read_dir(&abs) {
            for entry in read_dir.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().into_owned();
                let child = if rel.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel, name)
                };
                let stamp = match entry.file_type() {
                    Ok(t) if t.is_dir() => FileStamp::Directory,
                    _ => cache::local_millis(&entry.path()).map_or(FileStamp::Absent, FileStamp::File),
                };
                entries.entry(child).or_insert(stamp);
            }
        }
        entries.into_iter().collect()
    }
}

impl Drop for NetworkFileClient {
    fn drop(&mut self) {
        if let Some(task) = self.inner.background.lock().take() {
            let _ = task.join();
        }
    }
}

impl ClientInner {
    fn check_fatal(&self) -> NetResult<()> {
        match self.fatal.lock().as_ref() {
            Some(msg) => Err(NetError::Fatal(msg.clone())),
            None => Ok(()),
        }
    }

    fn record_fatal(&self, e: &NetError) {
        error!("fatal cache error: {}", e);
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(e.to_string());
        }
    }

    /// Close a stream whose position can no longer be trusted.
    fn mark_broken(&self, transport: &mut dyn Transport, context: &str, e: &NetError) {
        if e.is_integrity() {
            error!("{}: {}; connection presumed corrupted", context, e);
        } else {
            warn!("{}: {}; connection closed", context, e);
        }
        if !self.broken.swap(true, Ordering::SeqCst) {
            transport.shutdown();
        }
    }

    /// A path the server sent, if it names a mirrorable file under the local root.
    fn server_path(&self, path: &str) -> Option<String> {
        let rel = normalize_path(path);
        if rel.is_empty() || is_local_only(&rel) {
            return None;
        }
        if let Err(e) = normalize_under_root(&self.local_root, &rel) {
            warn!(path, "ignoring server path: {}", e);
            return None;
        }
        Some(rel)
    }

    fn bootstrap(self: &Arc<Self>) -> NetResult<()> {
        let cfg = &self.config;
        let request = Request::GetFileList(FileListRequest {
            platforms: cfg.platforms.clone(),
            project_name: cfg.project_name.clone(),
            engine_dir: cfg.engine_dir.clone(),
            project_dir: cfg.project_dir.clone(),
            directories: cfg.directories.clone(),
            flags: cfg.connection_flags(),
            version: PROTOCOL_VERSION,
        });
        let response = {
            let mut transport = self.transport.lock();
            frame::send_and_receive(&request.encode(), &mut **transport)
                .and_then(|payload| FileListResponse::decode(&payload))
                .map_err(|e| NetError::Handshake(format!("file list request failed: {}", e)))?
        };
        info!(
            files = response.listing.len(),
            cooked_version = response.cooked_version,
            licensee_version = response.licensee_version,
            "received server file list"
        );

        {
            let mut st = self.state.lock();
            for (path, stamp) in &response.listing {
                if let Some(entry) = stamp.entry() {
                    st.toc.add_file_or_directory(path, entry);
                }
            }
        }
        {
            let mut server = self.server.lock();
            server.cooked_version = response.cooked_version;
            server.licensee_version = response.licensee_version;
            server.engine_dir = response.engine_dir.clone();
            server.project_dir = response.project_dir.clone();
        }

        self.reconcile_local_cache(&response)?;
        self.validate_connection()
    }

    /// Drop local files that no longer match the server.
    fn reconcile_local_cache(&self, response: &FileListResponse) -> NetResult<()> {
        let root = &self.local_root;
        let expected = VersionStamp {
            cooked: response.cooked_version,
            licensee: response.licensee_version,
        };
        let found = cache::read_version_stamp(root)?;
        if found != Some(expected) {
            let removed = cache::wipe(root)?;
            info!(?found, ?expected, removed, "cooked version changed; local cache wiped");
            cache::write_version_stamp(root, expected)?;
            return Ok(());
        }

        // Reference timestamps: the cached-files list in iterative mode, the TOC otherwise
        let reference: HashMap<String, i64> = match &response.cached_files {
            Some(cached) => cached
                .iter()
                .filter_map(|(p, stamp)| stamp.millis().map(|ms| (normalize_path(p), ms)))
                .collect(),
            None => self
                .state
                .lock()
                .toc
                .files()
                .map(|(p, ms)| (p.to_string(), ms))
                .collect(),
        };
        let iterative = response.cached_files.is_some();

        let mut removed = 0usize;
        for (rel, local_ms) in cache::scan_local_files(root) {
            let stale = match reference.get(&rel) {
                Some(server_ms) => (server_ms - local_ms).abs() > TIMESTAMP_TOLERANCE_MS,
                None => iterative,
            };
            if !stale {
                continue;
            }
            debug!(path = %rel, "removing stale local file");
            if let Err(e) = cache::remove_file(&cache::local_path(root, &rel)) {
                warn!(path = %rel, "could not remove stale file: {}", e);
                continue;
            }
            removed += 1;
        }
        info!(removed, iterative, "local cache reconciled");
        Ok(())
    }

    /// Force a fresh sync of the validation file and check it landed.
    fn validate_connection(self: &Arc<Self>) -> NetResult<()> {
        let rel = normalize_path(&self.config.validation_file);
        let abs = cache::local_path(&self.local_root, &rel);
        if let Err(e) = cache::remove_file(&abs) {
            return Err(NetError::Fatal(format!(
                "cannot delete validation file {}: {}",
                abs.display(),
                e
            )));
        }
        self.state.lock().cached.remove(&rel);
        let Some(synced) = self.ensure_local(&rel)? else {
            error!(path = %rel, "validation file did not sync");
            return Err(NetError::Handshake(format!(
                "validation file {} could not be synced",
                rel
            )));
        };
        check_read_back(&rel, &abs, synced)?;
        info!(path = %rel, bytes = synced, "connection validated");
        Ok(())
    }

    /// Block until the outstanding unsolicited batch (if any) is on disk.
    fn wait_for_unsolicited(&self, rel: &str) {
        let Some(pending) = self.state.lock().pending.clone() else {
            return;
        };
        pending.wait();
        let mut st = self.state.lock();
        if st.cached.contains(rel) {
            Counters::bump(&self.counters.unsolicited_hits);
        } else {
            Counters::bump(&self.counters.unsolicited_waits);
        }
        if st.pending.as_ref().is_some_and(|p| Arc::ptr_eq(p, &pending)) {
            st.pending = None;
        }
    }

    fn ensure_file_is_local(self: &Arc<Self>, path: &str) -> NetResult<()> {
        self.ensure_local(path).map(|_| ())
    }

    /// Returns the size on disk when this call fetched the file.
    fn ensure_local(self: &Arc<Self>, path: &str) -> NetResult<Option<u64>> {
        let rel = normalize_path(path);
        if rel.is_empty() || is_local_only(&rel) || escapes_root(&rel) {
            return Ok(None);
        }
        self.check_fatal()?;

        let completion = loop {
            self.wait_for_unsolicited(&rel);
            let mut st = self.state.lock();
            if st.pending.is_some() {
                // A new batch started between the wait and the lock
                continue;
            }
            if st.cached.contains(&rel) {
                let in_flight = st.in_flight.get(&rel).cloned();
                drop(st);
                if let Some(c) = in_flight {
                    c.wait();
                }
                return self.check_fatal().map(|()| None);
            }
            st.cached.insert(rel.clone());
            let c = Arc::new(Completion::new());
            st.in_flight.insert(rel.clone(), c.clone());
            break c;
        };

        let result = self.fetch(&rel);
        {
            let mut st = self.state.lock();
            if st.in_flight.get(&rel).is_some_and(|c| Arc::ptr_eq(c, &completion)) {
                st.in_flight.remove(&rel);
            }
            if !matches!(result, Ok(Some(_))) {
                // Not on disk; a later call may retry
                st.cached.remove(&rel);
            }
        }
        completion.signal();
        result
    }

    /// Fetch one file and return its size on disk. `Ok(None)` is a soft miss.
    fn fetch(self: &Arc<Self>, rel: &str) -> NetResult<Option<u64>> {
        let abs = cache::local_path(&self.local_root, rel);

        // Hold the transport only while no unsolicited batch owns the stream
        let mut transport = loop {
            if let Ok(meta) = fs::metadata(&abs) {
                if meta.is_file() {
                    debug!(path = rel, "using existing local file");
                    return Ok(Some(meta.len()));
                }
            }
            let transport = self.transport.lock();
            let pending = self.state.lock().pending.clone();
            match pending {
                None => break transport,
                Some(p) => {
                    drop(transport);
                    p.wait();
                    let mut st = self.state.lock();
                    if st.pending.as_ref().is_some_and(|q| Arc::ptr_eq(q, &p)) {
                        st.pending = None;
                    }
                }
            }
        };

        let known = self.state.lock().toc.find_file(rel).is_some();
        if !known && !is_cookable(rel) {
            debug!(path = rel, "not on server and not cookable");
            return Ok(None);
        }
        if self.broken.load(Ordering::SeqCst) {
            debug!(path = rel, "connection closed, file unavailable");
            return Ok(None);
        }

        let request = Request::SyncFile {
            path: rel.to_string(),
        };
        let response = match frame::send_and_receive(&request.encode(), &mut **transport)
            .and_then(|payload| SyncFileResponse::decode(&payload))
        {
            Ok(r) => r,
            Err(e) => {
                self.mark_broken(&mut **transport, &format!("sync of {} failed", rel), &e);
                return Ok(None);
            }
        };
        Counters::bump(&self.counters.syncs);

        if normalize_path(&response.file.path) != rel {
            let e = NetError::UnexpectedResponse(format!(
                "asked for {}, server answered with {}",
                rel, response.file.path
            ));
            self.mark_broken(&mut **transport, "sync", &e);
            return Ok(None);
        }

        let written = match response.file.stamp {
            FileStamp::Absent => {
                debug!(path = rel, "server has no such file");
                Ok(None)
            }
            FileStamp::Directory => {
                self.state
                    .lock()
                    .toc
                    .add_file_or_directory(rel, TocEntry::Directory);
                Ok(None)
            }
            FileStamp::File(ms) => {
                match cache::write_synced_file(&self.local_root, rel, &response.file.contents, ms) {
                    Ok(()) => {
                        self.state.lock().toc.add_file_or_directory(rel, TocEntry::File(ms));
                        Ok(Some(response.file.contents.len() as u64))
                    }
                    Err(e) => {
                        if e.is_fatal() {
                            self.record_fatal(&e);
                        }
                        Err(e)
                    }
                }
            }
        };

        // The companions follow on the stream regardless of how the write went
        if response.unsolicited > 0 {
            self.start_unsolicited(transport, response.unsolicited);
        }
        written
    }

    /// Hand the stream to a background task that drains `count` unsolicited files.
    fn start_unsolicited(
        self: &Arc<Self>,
        transport: parking_lot::MutexGuard<'_, Box<dyn Transport>>,
        count: u32,
    ) {
        let pending = Arc::new(PendingUnsolicited::default());
        self.state.lock().pending = Some(pending.clone());
        drop(transport);

        let inner = self.clone();
        let batch = pending.clone();
        let spawned = TaskHandle::spawn("cookfs-unsolicited", move || {
            inner.receive_unsolicited(count, &batch)
        });
        match spawned {
            Ok(task) => {
                let previous = self.background.lock().replace(task);
                if let Some(previous) = previous {
                    let _ = previous.join();
                }
            }
            Err(e) => {
                // Nothing will drain the stream; release waiters anyway
                error!("could not start unsolicited receive: {}", e);
                pending.network_read.signal();
                pending.disk_write.signal();
            }
        }
    }

    fn receive_unsolicited(&self, count: u32, pending: &PendingUnsolicited) {
        let mut writes: TaskGroup<(String, NetResult<()>)> = TaskGroup::new();
        {
            let mut transport = self.transport.lock();
            for i in 0..count {
                let file = match frame::receive(&mut **transport)
                    .and_then(|payload| SyncedFile::decode(&payload))
                {
                    Ok(f) => f,
                    Err(e) => {
                        let context = format!("unsolicited file {} of {}", i + 1, count);
                        self.mark_broken(&mut **transport, &context, &e);
                        break;
                    }
                };
                Counters::bump(&self.counters.unsolicited_files);
                let FileStamp::File(ms) = file.stamp else {
                    continue;
                };
                let Some(rel) = self.server_path(&file.path) else {
                    continue;
                };
                debug!(path = %rel, bytes = file.contents.len(), "unsolicited file");
                {
                    let mut st = self.state.lock();
                    st.cached.insert(rel.clone());
                    st.toc.add_file_or_directory(&rel, TocEntry::File(ms));
                    st.in_flight
                        .entry(rel.clone())
                        .or_insert_with(|| pending.disk_write.clone());
                }
                let root = self.local_root.clone();
                let task_rel = rel.clone();
                let contents = file.contents;
                let spawned = writes.spawn("cookfs-write", move || {
                    let result = cache::write_synced_file(&root, &task_rel, &contents, ms);
                    (task_rel, result)
                });
                if let Err(e) = spawned {
                    warn!(path = %rel, "could not start disk write: {}", e);
                    self.state.lock().cached.remove(&rel);
                }
            }
        }
        pending.network_read.signal();

        let mut failed = Vec::new();
        for joined in writes.join_all() {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((rel, Err(e))) => {
                    if e.is_fatal() {
                        self.record_fatal(&e);
                    } else {
                        warn!(path = %rel, "unsolicited write failed: {}", e);
                    }
                    failed.push(rel);
                }
                Err(_) => error!("disk write task panicked"),
            }
        }
        {
            let mut st = self.state.lock();
            for rel in failed {
                st.cached.remove(&rel);
            }
            st.in_flight
                .retain(|_, c| !Arc::ptr_eq(c, &pending.disk_write));
        }
        pending.disk_write.signal();
    }

    fn perform_heartbeat(&self) -> NetResult<usize> {
        if !self.config.heartbeat_enabled() || self.hooks.is_async_loading() {
            return Ok(0);
        }
        let mut transport = self.transport.lock();
        {
            let mut st = self.state.lock();
            if let Some(p) = &st.pending {
                if !p.is_done() {
                    debug!("unsolicited files in flight; heartbeat postponed");
                    return Ok(0);
                }
                st.pending = None;
            }
        }

        if self.broken.load(Ordering::SeqCst) {
            debug!("connection closed; heartbeat skipped");
            return Ok(0);
        }

        let response = match frame::send_and_receive(&Request::Heartbeat.encode(), &mut **transport)
            .and_then(|payload| HeartbeatResponse::decode(&payload))
        {
            Ok(r) => r,
            Err(e) => {
                self.mark_broken(&mut **transport, "heartbeat failed", &e);
                return Err(e);
            }
        };
        Counters::bump(&self.counters.heartbeats);

        // Keep the transport so no fetch interleaves with the eviction
        let now = now_millis();
        let mut evicted = 0;
        let mut packages = Vec::new();
        for path in &response.updated {
            let Some(rel) = self.server_path(path) else {
                continue;
            };
            if let Err(e) = cache::remove_file(&cache::local_path(&self.local_root, &rel)) {
                warn!(path = %rel, "could not evict updated file: {}", e);
            }
            {
                let mut st = self.state.lock();
                st.cached.remove(&rel);
                st.toc.add_file_or_directory(&rel, TocEntry::File(now));
            }
            evicted += 1;
            Counters::bump(&self.counters.heartbeat_evictions);
            info!(path = %rel, "server file changed; local copy evicted");
            if let Some(package) = package_name(&rel) {
                packages.push(package);
            }
        }
        drop(transport);

        for package in &packages {
            self.hooks.request_package_reload(package);
        }
        Ok(evicted)
    }
}

/// Read a freshly synced file back and compare its length with what arrived.
fn check_read_back(rel: &str, abs: &Path, expected: u64) -> NetResult<()> {
    let read = fs::read(abs)
        .map_err(|e| NetError::Handshake(format!("cannot read back {}: {}", rel, e)))?;
    if read.len() as u64 != expected {
        error!(path = rel, read = read.len(), expected, "validation file read back short");
        return Err(NetError::Handshake(format!(
            "validation file {} read back {} bytes, expected {}",
            rel,
            read.len(),
            expected
        )));
    }
    Ok(())
}
