mod common;

use std::fs;
use std::sync::Arc;
use std::thread;

use cookfs::cache::{local_millis, read_version_stamp, write_version_stamp, VersionStamp};
use cookfs::protocol::MessageKind;
use cookfs::{FileStamp, NetError, NetworkFileClient, NoopHooks};

use common::*;

#[test]
fn fresh_bootstrap_stamps_version_and_validates() {
    let srv = server_root();
    write_file_at(srv.path(), "Content/Maps/level.umap", b"map", 1_650_000_000_000);
    let server = start_server(srv.path(), 100, 5);
    let local = tempfile::tempdir().unwrap();

    let client = NetworkFileClient::connect(client_config(&server, local.path()), Arc::new(NoopHooks)).unwrap();

    let stamp = read_version_stamp(local.path()).unwrap();
    assert_eq!(stamp, Some(VersionStamp { cooked: 100, licensee: 5 }));
    let raw = fs::read(local.path().join("Saved/Config/CookedVersion.bin")).unwrap();
    assert_eq!(raw, vec![100, 0, 0, 0, 5, 0, 0, 0]);

    // Validation file was force-synced with the server's timestamp
    let validation = local.path().join(VALIDATION_FILE);
    assert!(validation.is_file());
    assert_eq!(local_millis(&validation).unwrap(), 1_600_000_000_000);
    assert_eq!(server.stats().sync_count(VALIDATION_FILE), 1);

    let info = client.server_info();
    assert_eq!((info.cooked_version, info.licensee_version), (100, 5));
    assert_eq!(client.toc().find_file("Content/Maps/level.umap"), Some(1_650_000_000_000));
    assert!(client.directory_exists("Content/Maps"));
    assert!(client.file_exists("Content/Maps/level.umap"));
    // Nothing but the validation file is fetched eagerly
    assert!(!local.path().join("Content/Maps/level.umap").exists());
}

#[test]
fn bootstrap_without_validation_file_fails() {
    let srv = tempfile::tempdir().unwrap();
    write_file(srv.path(), "Content/a.uasset", b"a");
    let server = start_server(srv.path(), 1, 0);
    let local = tempfile::tempdir().unwrap();

    let result = NetworkFileClient::connect(client_config(&server, local.path()), Arc::new(NoopHooks));
    assert!(matches!(result, Err(NetError::Handshake(_))));
}

#[test]
fn no_reachable_host_is_a_handshake_error() {
    let local = tempfile::tempdir().unwrap();
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let config = cookfs::ClientConfig {
        hosts: format!("http://127.0.0.1:{port}+tcp://127.0.0.1:{port}"),
        local_root: local.path().to_path_buf(),
        ..cookfs::ClientConfig::default()
    };
    assert!(matches!(
        NetworkFileClient::connect(config, Arc::new(NoopHooks)),
        Err(NetError::Handshake(_))
    ));
}

#[test]
fn stale_local_file_is_replaced() {
    let srv = server_root();
    write_file_at(srv.path(), "Content/Hero.uasset", b"new hero", 1_700_000_000_000);
    write_file_at(srv.path(), "Content/Same.uasset", b"server same", 1_700_000_000_000);
    let server = start_server(srv.path(), 100, 5);

    let local = tempfile::tempdir().unwrap();
    write_version_stamp(local.path(), VersionStamp { cooked: 100, licensee: 5 }).unwrap();
    write_file_at(local.path(), "Content/Hero.uasset", b"old hero", 1_690_000_000_000);
    // Within the one second tolerance: kept as is
    write_file_at(local.path(), "Content/Same.uasset", b"local same", 1_700_000_000_400);

    let client = NetworkFileClient::connect(client_config(&server, local.path()), Arc::new(NoopHooks)).unwrap();
    assert!(!local.path().join("Content/Hero.uasset").exists());

    assert_eq!(client.read_to_vec("Content/Hero.uasset").unwrap(), b"new hero");
    assert_eq!(
        local_millis(&local.path().join("Content/Hero.uasset")).unwrap(),
        1_700_000_000_000
    );
    assert_eq!(client.read_to_vec("Content/Same.uasset").unwrap(), b"local same");
    assert_eq!(server.stats().sync_count("Content/Same.uasset"), 0);
    assert_eq!(server.stats().sync_count("Content/Hero.uasset"), 1);
}

#[test]
fn version_mismatch_wipes_mirror_but_not_local_only_dirs() {
    let srv = server_root();
    let server = start_server(srv.path(), 100, 5);

    let local = tempfile::tempdir().unwrap();
    write_version_stamp(local.path(), VersionStamp { cooked: 99, licensee: 5 }).unwrap();
    write_file(local.path(), "Content/Old.uasset", b"old");
    write_file(local.path(), "Saved/Logs/Shooter.log", b"log");

    let _client = NetworkFileClient::connect(client_config(&server, local.path()), Arc::new(NoopHooks)).unwrap();
    assert!(!local.path().join("Content/Old.uasset").exists());
    assert!(local.path().join("Saved/Logs/Shooter.log").exists());
    assert_eq!(
        read_version_stamp(local.path()).unwrap(),
        Some(VersionStamp { cooked: 100, licensee: 5 })
    );
}

#[test]
fn iterative_mode_drops_files_the_server_never_cooked() {
    let srv = server_root();
    write_file_at(srv.path(), "Content/Kept.uasset", b"kept", 1_700_000_000_000);
    let server = start_server(srv.path(), 7, 0);

    for iterative in [false, true] {
        let local = tempfile::tempdir().unwrap();
        write_version_stamp(local.path(), VersionStamp { cooked: 7, licensee: 0 }).unwrap();
        write_file_at(local.path(), "Content/Kept.uasset", b"kept", 1_700_000_000_000);
        write_file(local.path(), "Content/Orphan.uasset", b"orphan");

        let mut config = client_config(&server, local.path());
        config.precooked_iterative = iterative;
        let _client = NetworkFileClient::connect(config, Arc::new(NoopHooks)).unwrap();

        assert!(local.path().join("Content/Kept.uasset").exists());
        assert_eq!(local.path().join("Content/Orphan.uasset").exists(), !iterative);
    }
}

#[test]
fn unsolicited_companions_are_prefetched() {
    let srv = server_root();
    write_file_at(srv.path(), "Content/Hero.uasset", b"header", 1_700_000_000_000);
    write_file_at(srv.path(), "Content/Hero.uexp", &patterned(300_000), 1_700_000_001_000);
    write_file_at(srv.path(), "Content/Hero.ubulk", &patterned(70_000), 1_700_000_002_000);
    let server = start_server(srv.path(), 1, 0);
    let local = tempfile::tempdir().unwrap();
    let client = NetworkFileClient::connect(client_config(&server, local.path()), Arc::new(NoopHooks)).unwrap();

    client.ensure_file_is_local("Content/Hero.uasset").unwrap();
    client.ensure_file_is_local("Content/Hero.uexp").unwrap();
    client.ensure_file_is_local("Content/Hero.ubulk").unwrap();

    assert_eq!(fs::read(local.path().join("Content/Hero.uexp")).unwrap(), patterned(300_000));
    assert_eq!(
        local_millis(&local.path().join("Content/Hero.ubulk")).unwrap(),
        1_700_000_002_000
    );
    let stats = server.stats();
    assert_eq!(stats.sync_count("Content/Hero.uasset"), 1);
    assert_eq!(stats.sync_count("Content/Hero.uexp"), 0);
    assert_eq!(stats.sync_count("Content/Hero.ubulk"), 0);

    let client_stats = client.stats();
    assert_eq!(client_stats.unsolicited_files, 2);
    assert_eq!(client_stats.unsolicited_hits, 1);
    assert!(client.is_cached("Content/Hero.ubulk"));
}

#[test]
fn concurrent_requests_fetch_once() {
    let srv = server_root();
    write_file_at(srv.path(), "Content/Big.uasset", &patterned(2_000_000), 1_700_000_000_000);
    let server = start_server(srv.path(), 1, 0);
    let local = tempfile::tempdir().unwrap();
    let client = Arc::new(
        NetworkFileClient::connect(client_config(&server, local.path()), Arc::new(NoopHooks)).unwrap(),
    );

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || {
                client.ensure_file_is_local("Content/Big.uasset").unwrap();
                // Every caller observes the complete file once ensure returns
                client.file_size("Content/Big.uasset").unwrap()
            })
        })
        .collect();
    for w in workers {
        assert_eq!(w.join().unwrap(), Some(2_000_000));
    }
    assert_eq!(server.stats().sync_count("Content/Big.uasset"), 1);
}

#[test]
fn heartbeat_evicts_changed_files_and_requests_reload() {
    let srv = server_root();
    write_file_at(srv.path(), "Content/Maps/level.umap", b"v1", 1_700_000_000_000);
    let server = start_server(srv.path(), 1, 0);
    let local = tempfile::tempdir().unwrap();
    let hooks = RecordingHooks::new();
    let client = NetworkFileClient::connect(client_config(&server, local.path()), hooks.clone()).unwrap();

    assert_eq!(client.read_to_vec("Content/Maps/level.umap").unwrap(), b"v1");
    assert_eq!(client.perform_heartbeat().unwrap(), 0);

    write_file_at(srv.path(), "Content/Maps/level.umap", b"v2", 1_700_000_500_000);
    assert_eq!(client.perform_heartbeat().unwrap(), 1);
    assert!(!local.path().join("Content/Maps/level.umap").exists());
    assert!(!client.is_cached("Content/Maps/level.umap"));
    assert!(matches!(client.timestamp("Content/Maps/level.umap"), FileStamp::File(_)));
    assert_eq!(hooks.reloads(), vec!["/Game/Maps/level".to_string()]);

    // Nothing new to report; state is unchanged by a repeat
    assert_eq!(client.perform_heartbeat().unwrap(), 0);
    assert!(!local.path().join("Content/Maps/level.umap").exists());
    assert_eq!(client.stats().heartbeat_evictions, 1);

    assert_eq!(client.read_to_vec("Content/Maps/level.umap").unwrap(), b"v2");
    assert_eq!(server.stats().sync_count("Content/Maps/level.umap"), 2);
}

#[test]
fn heartbeat_is_postponed_while_host_is_loading() {
    let srv = server_root();
    let server = start_server(srv.path(), 1, 0);
    let local = tempfile::tempdir().unwrap();
    let hooks = RecordingHooks::new();
    let client = NetworkFileClient::connect(client_config(&server, local.path()), hooks.clone()).unwrap();

    hooks.set_loading(true);
    assert_eq!(client.perform_heartbeat().unwrap(), 0);
    assert_eq!(server.stats().requests(MessageKind::Heartbeat), 0);

    hooks.set_loading(false);
    client.perform_heartbeat().unwrap();
    assert_eq!(server.stats().requests(MessageKind::Heartbeat), 1);
}

#[test]
fn disabled_heartbeat_never_contacts_server() {
    let srv = server_root();
    let server = start_server(srv.path(), 1, 0);
    let local = tempfile::tempdir().unwrap();
    let mut config = client_config(&server, local.path());
    config.heartbeat_frequency = -1.0;
    let client = NetworkFileClient::connect(config, Arc::new(NoopHooks)).unwrap();

    assert_eq!(client.tick().unwrap(), 0);
    assert_eq!(client.perform_heartbeat().unwrap(), 0);
    assert_eq!(server.stats().requests(MessageKind::Heartbeat), 0);
}

#[test]
fn local_only_and_unknown_paths_skip_the_network() {
    let srv = server_root();
    write_file(srv.path(), "Saved/Logs/server.log", b"server log");
    let server = start_server(srv.path(), 1, 0);
    let local = tempfile::tempdir().unwrap();
    let client = NetworkFileClient::connect(client_config(&server, local.path()), Arc::new(NoopHooks)).unwrap();
    let before = server.stats().requests(MessageKind::SyncFile);

    client.ensure_file_is_local("Saved/Logs/server.log").unwrap();
    client.ensure_file_is_local("Binaries/Linux/Shooter").unwrap();
    client.ensure_file_is_local("Config/NotThere.ini").unwrap();
    assert_eq!(server.stats().requests(MessageKind::SyncFile), before);
    assert!(!local.path().join("Saved/Logs/server.log").exists());

    // Cookable files are asked for even when the listing lacks them
    client.ensure_file_is_local("Content/NotYetCooked.uasset").unwrap();
    assert_eq!(server.stats().requests(MessageKind::SyncFile), before + 1);
    assert!(!client.file_exists("Content/NotYetCooked.uasset"));
}

#[test]
fn multichannel_connection_syncs_large_files() {
    let srv = server_root();
    write_file_at(srv.path(), "Content/Huge.ubulk", &patterned(5_000_000), 1_700_000_000_000);
    let server = start_server(srv.path(), 3, 1);
    let local = tempfile::tempdir().unwrap();
    let mut config = client_config(&server, local.path());
    config.multichannel = true;
    let client = NetworkFileClient::connect(config, Arc::new(NoopHooks)).unwrap();

    assert_eq!(client.read_to_vec("Content/Huge.ubulk").unwrap(), patterned(5_000_000));
    assert_eq!(client.perform_heartbeat().unwrap(), 0);
    assert_eq!(
        read_version_stamp(local.path()).unwrap(),
        Some(VersionStamp { cooked: 3, licensee: 1 })
    );
}

#[test]
fn file_operations_keep_toc_in_step() {
    let srv = server_root();
    write_file_at(srv.path(), "Content/a.uasset", b"aaa", 1_700_000_000_000);
    write_file_at(srv.path(), "Content/b.uasset", b"bbb", 1_700_000_000_000);
    let server = start_server(srv.path(), 1, 0);
    let local = tempfile::tempdir().unwrap();
    let client = NetworkFileClient::connect(client_config(&server, local.path()), Arc::new(NoopHooks)).unwrap();

    let listing: Vec<String> = client
        .iterate_directory("Content")
        .into_iter()
        .map(|(p, _)| p)
        .collect();
    assert_eq!(listing, vec!["Content/a.uasset", "Content/b.uasset"]);

    client.move_file("Content/a.uasset", "Content/Moved/a.uasset").unwrap();
    assert!(!client.file_exists("Content/a.uasset"));
    assert_eq!(client.read_to_vec("Content/Moved/a.uasset").unwrap(), b"aaa");

    assert!(client.delete_file("Content/Moved/a.uasset").unwrap());
    assert!(!client.file_exists("Content/Moved/a.uasset"));
    assert_eq!(client.timestamp("Content/Moved/a.uasset"), FileStamp::Absent);

    assert_eq!(client.copy_file("Content/b.uasset", "Content/c.uasset").unwrap(), 3);
    client.set_read_only("Content/c.uasset", true).unwrap();
    assert!(client.is_read_only("Content/c.uasset").unwrap());

    {
        use std::io::Write;
        let mut f = client.open_write("Content/Notes/readme.txt", false).unwrap();
        f.write_all(b"hello").unwrap();
    }
    assert_eq!(client.read_to_vec("Content/Notes/readme.txt").unwrap(), b"hello");

    client.create_directory("Content/Empty").unwrap();
    assert!(client.directory_exists("Content/Empty"));
    client.delete_directory("Content/Empty").unwrap();
    assert!(!client.directory_exists("Content/Empty"));

    client.delete_directory_recursively("Content").unwrap();
    assert!(!client.directory_exists("Content"));
    assert!(!client.file_exists("Content/b.uasset"));
}
