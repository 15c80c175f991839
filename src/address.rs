//! Host string parsing: `tcp://host:port+http://other+plainhost`

use std::fmt;

use crate::protocol::{DEFAULT_HTTP_PORT, DEFAULT_TCP_PORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Http,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => DEFAULT_TCP_PORT,
            Scheme::Http => DEFAULT_HTTP_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    /// `host:port` for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            Scheme::Http => "http",
        };
        write!(f, "{}://{}", scheme, self.socket_addr())
    }
}

/// Parse one candidate. Missing scheme means tcp; missing port means the scheme default.
pub fn parse_host(s: &str) -> Option<HostAddress> {
    let s = s.trim();
    let lower = s.to_ascii_lowercase();
    let (scheme, rest) = if lower.starts_with("tcp://") {
        (Scheme::Tcp, &s["tcp://".len()..])
    } else if lower.starts_with("http://") {
        (Scheme::Http, &s["http://".len()..])
    } else {
        (Scheme::Tcp, s)
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return None;
    }

    // [v6]:port
    if let Some(inner) = rest.strip_prefix('[') {
        let (host, tail) = inner.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => scheme.default_port(),
            None => return None,
        };
        return Some(HostAddress {
            scheme,
            host: host.to_string(),
            port,
        });
    }

    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') => (h, p.parse().ok()?),
        _ => (rest, scheme.default_port()),
    };
    if host.is_empty() {
        return None;
    }
    Some(HostAddress {
        scheme,
        host: host.to_string(),
        port,
    })
}

/// Split a `+`-separated candidate list, keeping order. Unparseable entries are dropped.
pub fn parse_host_list(s: &str) -> Vec<HostAddress> {
    s.split('+')
        .filter(|part| !part.trim().is_empty())
        .filter_map(parse_host)
        .collect()
}
