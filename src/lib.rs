//! cookfs - network file streaming from a cook server
//!
//! A client that mirrors a remote cook server's output into a local directory
//! on demand, over a framed, CRC-checked protocol that runs on a plain TCP
//! socket or on one channel of a multiplexed connection. A streaming client
//! offers handle-based remote access without a local mirror, and a reference
//! server is included for tools and tests.

pub mod address;
pub mod archive;
pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod hooks;
pub mod logging;
pub mod messages;
pub mod multichannel;
pub mod paths;
pub mod protocol;
pub mod server;
pub mod streaming;
pub mod task;
pub mod toc;
pub mod transport;

pub use client::{ClientStats, NetworkFileClient, ServerInfo};
pub use config::ClientConfig;
pub use error::{NetError, NetResult};
pub use hooks::{ClientHooks, NoopHooks};
pub use server::{CookServer, ServerHandle, ServerOptions, ServerStats};
pub use streaming::{StreamingFileClient, StreamingFileHandle};
pub use toc::{FileStamp, ServerToc, TocEntry};
