use anyhow::{Context, Result};
use clap::Parser;

use cookfs::cli::ServerOpts;
use cookfs::CookServer;

fn main() -> Result<()> {
    let opts = ServerOpts::parse();
    cookfs::logging::init(opts.verbose);

    // Validate root directory exists and is a directory
    if !opts.root.exists() {
        anyhow::bail!("Error: Root directory does not exist: {}", opts.root.display());
    }
    if !opts.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", opts.root.display());
    }

    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // Exit immediately with 130 (128 + SIGINT)
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let server = CookServer::bind(&opts.bind, opts.server_options())?;
    println!("Starting cook server:");
    println!("  Root: {}", server.root().display());
    println!("  Bind: {}", server.local_addr()?);
    println!(
        "  Versions: cooked={} licensee={}",
        opts.cooked_version, opts.licensee_version
    );
    if opts.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the server to all network interfaces");
    }
    server.serve()
}
