//! INI-like configuration file loading.
//!
//! One file carries both sections: `[homcc]` for the client, `[homccd]` for
//! the server. Lookup order mirrors the hosts file: `$HOMCC_DIR/config`,
//! `~/.homcc/config`, `~/.config/homcc/config`, `/etc/homcc/config`; the
//! first file found wins. CLI flags override file values, so every field is
//! optional here.

use crate::compression::Compression;
use crate::error::ConfigError;
use crate::host::DIR_ENV;
use std::path::PathBuf;
use std::time::Duration;

/// `[homcc]` section: client defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientConfig {
    pub compiler: Option<String>,
    pub timeout: Option<Duration>,
    pub compression: Option<Compression>,
    pub profile: Option<String>,
    pub docker_container: Option<String>,
    pub log_level: Option<String>,
    pub verbose: bool,
}

/// `[homccd]` section: server defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerConfig {
    pub limit: Option<usize>,
    pub port: Option<u16>,
    pub address: Option<String>,
    pub log_level: Option<String>,
    pub verbose: bool,
}

/// Both sections of a configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Client,
    Server,
}

/// Parse configuration file content.
///
/// Unknown keys are logged and skipped so old binaries tolerate newer
/// files; syntactically broken lines and unparsable values are errors.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    let mut section = Section::None;

    for (index, raw_line) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = match raw_line.split_once('#') {
            Some((head, _)) => head.trim(),
            None => raw_line.trim(),
        };
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = match name.trim() {
                "homcc" => Section::Client,
                "homccd" => Section::Server,
                other => {
                    tracing::warn!(section = other, line = line_no, "unknown config section");
                    Section::None
                }
            };
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax {
                line: line_no,
                text: raw_line.to_string(),
            });
        };
        let key = key.trim();
        let value = value.trim();

        match section {
            Section::Client => apply_client_key(&mut config.client, key, value, line_no)?,
            Section::Server => apply_server_key(&mut config.server, key, value, line_no)?,
            Section::None => {
                tracing::warn!(key, line = line_no, "config key outside any section");
            }
        }
    }

    Ok(config)
}

fn apply_client_key(
    client: &mut ClientConfig,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigError> {
    match key {
        "compiler" => client.compiler = Some(value.to_string()),
        "timeout" => {
            let secs: u64 = value.parse().map_err(|_| invalid(line, key, value))?;
            client.timeout = Some(Duration::from_secs(secs));
        }
        "compression" => {
            client.compression =
                Some(Compression::from_name(value).ok_or_else(|| invalid(line, key, value))?);
        }
        "profile" => client.profile = Some(value.to_string()),
        "docker_container" => client.docker_container = Some(value.to_string()),
        "log_level" => client.log_level = Some(value.to_string()),
        "verbose" => client.verbose = parse_bool(value).ok_or_else(|| invalid(line, key, value))?,
        other => tracing::warn!(key = other, line, "unknown [homcc] key"),
    }
    Ok(())
}

fn apply_server_key(
    server: &mut ServerConfig,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigError> {
    match key {
        "limit" => server.limit = Some(value.parse().map_err(|_| invalid(line, key, value))?),
        "port" => server.port = Some(value.parse().map_err(|_| invalid(line, key, value))?),
        "address" => server.address = Some(value.to_string()),
        "log_level" => server.log_level = Some(value.to_string()),
        "verbose" => server.verbose = parse_bool(value).ok_or_else(|| invalid(line, key, value))?,
        other => tracing::warn!(key = other, line, "unknown [homccd] key"),
    }
    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn invalid(line: usize, key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        line,
        key: key.to_string(),
        detail: format!("'{value}'"),
    }
}

/// Candidate config-file locations in lookup order.
pub fn config_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(dir) = std::env::var(DIR_ENV) {
        candidates.push(PathBuf::from(dir).join("config"));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".homcc/config"));
    }
    if let Some(config) = dirs::config_dir() {
        candidates.push(config.join("homcc/config"));
    }
    candidates.push(PathBuf::from("/etc/homcc/config"));
    candidates
}

/// Load the first configuration file found, or defaults when none exists.
pub fn load_config() -> Result<Config, ConfigError> {
    for candidate in config_file_candidates() {
        if let Ok(content) = std::fs::read_to_string(&candidate) {
            tracing::debug!(path = %candidate.display(), "loaded config file");
            return parse_config(&content);
        }
    }
    Ok(Config::default())
}
