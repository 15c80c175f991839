//! Shared CLI helpers and small reusable Clap fragments

use clap::{ArgAction, Args, Parser};
use std::path::PathBuf;

use crate::config::ClientConfig;
use crate::protocol::multiplex;
use crate::server::ServerOptions;

/// Reference cook server options (cookfsd)
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "cookfsd - serve a cooked directory tree to cookfs clients")]
pub struct ServerOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:41899")]
    pub bind: String,

    /// Root directory to serve
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Cooked package version reported to clients
    #[arg(long, default_value_t = 1)]
    pub cooked_version: i32,

    /// Licensee version reported to clients
    #[arg(long, default_value_t = 0)]
    pub licensee_version: i32,

    /// Bytes a multiplexed connection may have unacknowledged in flight
    #[arg(long, default_value_t = multiplex::DEFAULT_BANDWIDTH_LATENCY_PRODUCT)]
    pub bandwidth_latency_product: u64,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl ServerOpts {
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            root: self.root.clone(),
            cooked_version: self.cooked_version,
            licensee_version: self.licensee_version,
            bandwidth_latency_product: self.bandwidth_latency_product,
        }
    }
}

/// Connection overrides layered over the TOML config
#[derive(Clone, Debug, Default, Args)]
pub struct ConnectOpts {
    /// TOML client configuration
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Host list, e.g. tcp://cookbox:41899+http://fallback
    #[arg(long)]
    pub host: Option<String>,

    /// Local directory mirroring the server
    #[arg(long)]
    pub local_root: Option<PathBuf>,

    /// Multiplex the connection
    #[arg(long)]
    pub multichannel: bool,

    /// Ask the server for its precooked file list
    #[arg(long)]
    pub iterative: bool,

    /// Seconds between heartbeats (negative disables)
    #[arg(long, allow_hyphen_values = true)]
    pub heartbeat: Option<f32>,
}

impl ConnectOpts {
    /// Apply command-line overrides on top of `base`.
    pub fn apply(&self, mut base: ClientConfig) -> ClientConfig {
        if let Some(host) = &self.host {
            base.hosts = host.clone();
        }
        if let Some(root) = &self.local_root {
            base.local_root = root.clone();
        }
        if self.multichannel {
            base.multichannel = true;
        }
        if self.iterative {
            base.precooked_iterative = true;
        }
        if let Some(freq) = self.heartbeat {
            base.heartbeat_frequency = freq;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_only_what_was_given() {
        let opts = ConnectOpts {
            host: Some("tcp://cookbox".into()),
            multichannel: true,
            heartbeat: Some(-1.0),
            ..ConnectOpts::default()
        };
        let cfg = opts.apply(ClientConfig::default());
        assert_eq!(cfg.hosts, "tcp://cookbox");
        assert!(cfg.multichannel);
        assert!(!cfg.heartbeat_enabled());
        assert_eq!(cfg.local_root, ClientConfig::default().local_root);
    }

    #[test]
    fn server_opts_parse() {
        let opts = ServerOpts::parse_from(["cookfsd", "--root", "/srv/cook", "--cooked-version", "100", "-vv"]);
        assert_eq!(opts.verbose, 2);
        let server = opts.server_options();
        assert_eq!(server.cooked_version, 100);
        assert_eq!(server.root, PathBuf::from("/srv/cook"));
    }
}
