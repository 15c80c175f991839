//! cookfs - fetch cooked files from a cook server into a local mirror

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cookfs::cli::ConnectOpts;
use cookfs::toc::format_millis;
use cookfs::{ClientConfig, FileStamp, NetError, NetworkFileClient, StreamingFileClient};

#[derive(Parser, Debug)]
#[command(author, version, about = "cookfs - network file client for a cook server")]
struct Args {
    #[command(flatten)]
    connect: ConnectOpts,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap, make the given files local and print client stats
    Fetch {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Stream one file to stdout without touching the local mirror
    Cat { path: String },
    /// Bootstrap and keep heartbeating until Ctrl-C
    Watch,
}

fn load_config(opts: &ConnectOpts) -> Result<ClientConfig> {
    let base = match &opts.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    Ok(opts.apply(base))
}

fn fetch(config: ClientConfig, paths: &[String]) -> Result<()> {
    let client = NetworkFileClient::connect_default(config)?;
    for path in paths {
        client.ensure_file_is_local(path)?;
        match (client.file_size(path)?, client.timestamp(path)) {
            (Some(size), FileStamp::File(ms)) => {
                println!("{}  {} bytes  {}", path, size, format_millis(ms))
            }
            (Some(size), _) => println!("{}  {} bytes", path, size),
            (None, _) => println!("{}  (not on server)", path),
        }
    }
    let stats = client.stats();
    println!(
        "syncs={} unsolicited={} hits={} waits={}",
        stats.syncs, stats.unsolicited_files, stats.unsolicited_hits, stats.unsolicited_waits
    );
    Ok(())
}

fn cat(config: ClientConfig, path: &str) -> Result<()> {
    let client = StreamingFileClient::connect(&config)?;
    let mut handle = client
        .open_read(path)
        .with_context(|| format!("open {}", path))?;
    let mut stdout = io::stdout().lock();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = handle.read(&mut buf)?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n])?;
    }
    stdout.flush()?;
    Ok(())
}

fn watch(config: ClientConfig) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .context("setting Ctrl-C handler")?;

    let client = NetworkFileClient::connect_default(config)?;
    println!("watching {} (Ctrl-C to stop)", client.server_info().address);
    while running.load(Ordering::SeqCst) {
        match client.tick() {
            Ok(0) => {}
            Ok(n) => println!("{} file(s) changed on server", n),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => eprintln!("heartbeat failed: {}", e),
        }
        if client.is_connection_broken() {
            bail!("connection to {} lost", client.server_info().address);
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    let stats = client.stats();
    println!(
        "heartbeats={} evictions={}",
        stats.heartbeats, stats.heartbeat_evictions
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    cookfs::logging::init(args.verbose);
    let config = load_config(&args.connect)?;

    let result = match &args.command {
        Command::Fetch { paths } => fetch(config, paths),
        Command::Cat { path } => cat(config, path),
        Command::Watch => watch(config),
    };

    // Consistency failures mean the mirror cannot be trusted
    if let Err(e) = &result {
        if e.downcast_ref::<NetError>().is_some_and(NetError::is_fatal) {
            eprintln!("fatal: {:#}", e);
            std::process::exit(2);
        }
    }
    result
}
