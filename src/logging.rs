//! tracing subscriber setup shared by both binaries

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init(verbose: u8) {
    let default = match verbose {
        0 => "warn,cookfs=info",
        1 => "info,cookfs=debug",
        _ => "debug,cookfs=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Ignore a second init (tests, embedding)
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}
