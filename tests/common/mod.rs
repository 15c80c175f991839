#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cookfs::cache::millis_to_filetime;
use cookfs::{ClientConfig, ClientHooks, CookServer, ServerHandle, ServerOptions};
use parking_lot::Mutex;

pub const VALIDATION_FILE: &str = "Config/BaseEngine.ini";

pub fn write_file(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
}

pub fn write_file_at(root: &Path, rel: &str, contents: &[u8], mtime_ms: i64) {
    write_file(root, rel, contents);
    set_mtime(root, rel, mtime_ms);
}

pub fn set_mtime(root: &Path, rel: &str, mtime_ms: i64) {
    filetime::set_file_mtime(root.join(rel), millis_to_filetime(mtime_ms)).unwrap();
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Server root with the validation file every bootstrap needs.
pub fn server_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_file_at(dir.path(), VALIDATION_FILE, b"[Core.System]\nPaths=../../Content\n", 1_600_000_000_000);
    dir
}

pub fn start_server(root: &Path, cooked_version: i32, licensee_version: i32) -> ServerHandle {
    let mut options = ServerOptions::new(root);
    options.cooked_version = cooked_version;
    options.licensee_version = licensee_version;
    CookServer::bind("127.0.0.1:0", options).unwrap().spawn().unwrap()
}

pub fn client_config(server: &ServerHandle, local_root: &Path) -> ClientConfig {
    ClientConfig {
        hosts: format!("tcp://{}", server.addr()),
        local_root: local_root.to_path_buf(),
        project_name: "Shooter".into(),
        heartbeat_frequency: 0.0,
        ..ClientConfig::default()
    }
}

/// Hooks that remember reload requests and can pretend to be loading.
#[derive(Default)]
pub struct RecordingHooks {
    pub loading: AtomicBool,
    pub reloads: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }

    pub fn reloads(&self) -> Vec<String> {
        self.reloads.lock().clone()
    }
}

impl ClientHooks for RecordingHooks {
    fn is_async_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    fn request_package_reload(&self, package: &str) {
        self.reloads.lock().push(package.to_string());
    }
}
