//! Host specifications and hosts-file discovery.
//!
//! Grammar per line: `HOST[:PORT][/LIMIT][,COMPRESSION]` with IPv6 addresses
//! in bracket form. `#` starts a comment, blank lines are skipped, and file
//! order is preserved because the selector walks hosts in order.

use crate::compression::Compression;
use crate::error::HostParseError;
use crate::hashing::digest_bytes;
use std::path::PathBuf;

/// Default TCP port of a homcc server.
pub const DEFAULT_PORT: u16 = 3633;

/// Default number of concurrent compile slots per remote host.
pub const DEFAULT_SLOT_LIMIT: u32 = 2;

/// Environment variable carrying an inline, whitespace-separated hosts list.
pub const HOSTS_ENV: &str = "HOMCC_HOSTS";

/// Environment variable overriding the homcc configuration directory.
pub const DIR_ENV: &str = "HOMCC_DIR";

/// How the client reaches a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Plain TCP to a remote machine.
    Tcp,
    /// TCP to the local machine (loopback names and addresses).
    LocalTcp,
}

/// One compile host. Immutable after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub port: u16,
    pub limit: u32,
    pub compression: Compression,
    pub connection: ConnectionKind,
}

impl Host {
    /// Parse a single host specification.
    pub fn parse(spec: &str) -> Result<Host, HostParseError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(HostParseError::Empty);
        }

        // Trailing `,COMPRESSION` first; the rest of the grammar never
        // contains a comma.
        let (rest, compression) = match spec.split_once(',') {
            Some((head, name)) => {
                let compression = Compression::from_name(name).ok_or_else(|| {
                    HostParseError::UnknownCompression {
                        host: spec.to_string(),
                        name: name.to_string(),
                    }
                })?;
                (head, compression)
            }
            None => (spec, Compression::None),
        };

        // Then `/LIMIT`.
        let (rest, limit) = match rest.rsplit_once('/') {
            Some((head, limit)) => {
                let limit: u32 = limit
                    .parse()
                    .map_err(|_| HostParseError::InvalidLimit(spec.to_string()))?;
                if limit == 0 {
                    return Err(HostParseError::InvalidLimit(spec.to_string()));
                }
                (head, limit)
            }
            None => (rest, DEFAULT_SLOT_LIMIT),
        };

        // Finally `HOST[:PORT]`, with IPv6 in brackets.
        let (name, port) = if let Some(stripped) = rest.strip_prefix('[') {
            let (addr, tail) = stripped
                .split_once(']')
                .ok_or_else(|| HostParseError::Invalid(spec.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port
                    .parse()
                    .map_err(|_| HostParseError::InvalidPort(spec.to_string()))?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(HostParseError::Invalid(spec.to_string())),
            };
            (addr.to_string(), port)
        } else if rest.matches(':').count() > 1 {
            return Err(HostParseError::UnbracketedIpv6(spec.to_string()));
        } else if let Some((name, port)) = rest.split_once(':') {
            let port = port
                .parse()
                .map_err(|_| HostParseError::InvalidPort(spec.to_string()))?;
            (name.to_string(), port)
        } else {
            (rest.to_string(), DEFAULT_PORT)
        };

        if name.is_empty() {
            return Err(HostParseError::Invalid(spec.to_string()));
        }

        let connection = if matches!(name.as_str(), "localhost" | "127.0.0.1" | "::1") {
            ConnectionKind::LocalTcp
        } else {
            ConnectionKind::Tcp
        };

        Ok(Host {
            name,
            port,
            limit,
            compression,
            connection,
        })
    }

    /// `host:port` form suitable for a TCP connect, with IPv6 re-bracketed.
    pub fn addr(&self) -> String {
        if self.name.contains(':') {
            format!("[{}]:{}", self.name, self.port)
        } else {
            format!("{}:{}", self.name, self.port)
        }
    }

    /// Deterministic name for this host's machine-wide slot counter.
    ///
    /// Concurrent client invocations must agree on the name, so it is a
    /// function of `(name, port)` only: a filesystem-safe prefix plus a
    /// short digest to keep distinct hosts distinct after sanitizing.
    pub fn slot_key(&self) -> String {
        let canonical = format!("{}:{}", self.name, self.port);
        let sanitized: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let digest = digest_bytes(canonical.as_bytes());
        format!("{}_{}-{}", sanitized, self.port, &digest[..8])
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr(), self.limit)?;
        if self.compression != Compression::None {
            write!(f, ",{}", self.compression)?;
        }
        Ok(())
    }
}

/// Parse hosts-file content: one host per line, `#` comments, blank lines
/// skipped, order preserved.
pub fn parse_hosts(content: &str) -> Result<Vec<Host>, HostParseError> {
    let mut hosts = Vec::new();
    for line in content.lines() {
        let line = match line.split_once('#') {
            Some((head, _)) => head.trim(),
            None => line.trim(),
        };
        if line.is_empty() {
            continue;
        }
        hosts.push(Host::parse(line)?);
    }
    Ok(hosts)
}

/// Candidate hosts-file locations in lookup order; first found wins.
pub fn hosts_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(dir) = std::env::var(DIR_ENV) {
        candidates.push(PathBuf::from(dir).join("hosts"));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".homcc/hosts"));
    }
    if let Some(config) = dirs::config_dir() {
        candidates.push(config.join("homcc/hosts"));
    }
    candidates.push(PathBuf::from("/etc/homcc/hosts"));
    candidates
}

/// Load the host list: `$HOMCC_HOSTS` (whitespace-separated, inline)
/// overrides any file; otherwise the first existing candidate file is used.
///
/// Returns `None` when no hosts are configured anywhere.
pub fn load_hosts() -> Result<Option<Vec<Host>>, HostParseError> {
    if let Ok(inline) = std::env::var(HOSTS_ENV) {
        let hosts = inline
            .split_whitespace()
            .map(Host::parse)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Some(hosts));
    }

    for candidate in hosts_file_candidates() {
        if let Ok(content) = std::fs::read_to_string(&candidate) {
            tracing::debug!(path = %candidate.display(), "loaded hosts file");
            return parse_hosts(&content).map(Some);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gets_defaults() {
        let host = Host::parse("buildbox").unwrap();
        assert_eq!(host.name, "buildbox");
        assert_eq!(host.port, DEFAULT_PORT);
        assert_eq!(host.limit, DEFAULT_SLOT_LIMIT);
        assert_eq!(host.compression, Compression::None);
        assert_eq!(host.connection, ConnectionKind::Tcp);
    }

    #[test]
    fn full_grammar_parses() {
        let host = Host::parse("buildbox.example.com:3634/8,lzo").unwrap();
        assert_eq!(host.name, "buildbox.example.com");
        assert_eq!(host.port, 3634);
        assert_eq!(host.limit, 8);
        assert_eq!(host.compression, Compression::Lzo);
    }

    #[test]
    fn limit_without_port() {
        let host = Host::parse("10.0.0.7/4").unwrap();
        assert_eq!(host.name, "10.0.0.7");
        assert_eq!(host.port, DEFAULT_PORT);
        assert_eq!(host.limit, 4);
    }

    #[test]
    fn compression_without_limit() {
        let host = Host::parse("buildbox,lzma").unwrap();
        assert_eq!(host.compression, Compression::Lzma);
        assert_eq!(host.limit, DEFAULT_SLOT_LIMIT);
    }

    #[test]
    fn bracketed_ipv6_with_port_and_limit() {
        let host = Host::parse("[fd00::7]:3700/6,lzma").unwrap();
        assert_eq!(host.name, "fd00::7");
        assert_eq!(host.port, 3700);
        assert_eq!(host.limit, 6);
        assert_eq!(host.addr(), "[fd00::7]:3700");
    }

    #[test]
    fn bracketed_ipv6_without_port() {
        let host = Host::parse("[fd00::7]/3").unwrap();
        assert_eq!(host.name, "fd00::7");
        assert_eq!(host.port, DEFAULT_PORT);
        assert_eq!(host.limit, 3);
    }

    #[test]
    fn unbracketed_ipv6_is_rejected() {
        assert_eq!(
            Host::parse("fd00::7"),
            Err(HostParseError::UnbracketedIpv6("fd00::7".to_string()))
        );
    }

    #[test]
    fn localhost_is_local_tcp() {
        assert_eq!(Host::parse("localhost/4").unwrap().connection, ConnectionKind::LocalTcp);
        assert_eq!(Host::parse("127.0.0.1").unwrap().connection, ConnectionKind::LocalTcp);
        assert_eq!(Host::parse("[::1]").unwrap().connection, ConnectionKind::LocalTcp);
    }

    #[test]
    fn zero_limit_is_rejected() {
        assert!(matches!(
            Host::parse("buildbox/0"),
            Err(HostParseError::InvalidLimit(_))
        ));
    }

    #[test]
    fn unknown_compression_is_rejected() {
        assert!(matches!(
            Host::parse("buildbox,zstd"),
            Err(HostParseError::UnknownCompression { .. })
        ));
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(matches!(
            Host::parse("buildbox:notaport"),
            Err(HostParseError::InvalidPort(_))
        ));
    }

    #[test]
    fn hosts_file_skips_comments_and_blanks() {
        let content = "\
# build farm
buildbox1/4,lzo

buildbox2:3634   # second box
   # indented comment
";
        let hosts = parse_hosts(content).unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].name, "buildbox1");
        assert_eq!(hosts[1].name, "buildbox2");
        assert_eq!(hosts[1].port, 3634);
    }

    #[test]
    fn file_order_is_preserved() {
        let hosts = parse_hosts("c\nb\na\n").unwrap();
        let names: Vec<_> = hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["c", "b", "a"]);
    }

    #[test]
    fn slot_key_is_deterministic_and_distinct() {
        let a1 = Host::parse("buildbox:3633").unwrap();
        let a2 = Host::parse("buildbox:3633/8,lzo").unwrap();
        let b = Host::parse("buildbox:3634").unwrap();
        // Same (name, port) share one counter regardless of limit or codec.
        assert_eq!(a1.slot_key(), a2.slot_key());
        assert_ne!(a1.slot_key(), b.slot_key());
        assert!(a1.slot_key().chars().all(|c| c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'));
    }
}
