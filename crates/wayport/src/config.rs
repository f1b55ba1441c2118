//! Gateway configuration with layered overrides
//!
//! Each setting is resolved in this order (first found wins):
//! 1. Command line flags
//! 2. Environment variables (PROXY_*)
//! 3. Config file (wayport.toml)
//! 4. Default values

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::endpoint::Credentials;

/// Environment variable prefix
const ENV_PREFIX: &str = "PROXY";

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_PROXY_FILE: &str = "proxy_list.txt";
pub const DEFAULT_STICKY_HEADER: &str = "X-Proxy-Session";

/// Gateway configuration (parsed from TOML, can be overridden by env and flags)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address for the inbound CONNECT listener
    pub listen: Option<String>,

    /// Path to the upstream list
    pub proxy_file: Option<String>,

    /// Default upstream username, used for entries without credentials
    pub username: Option<String>,

    /// Default upstream password
    pub password: Option<String>,

    /// Request header carrying the session key
    pub sticky_header: Option<String>,

    /// Enable debug logging
    pub verbose: Option<bool>,
}

/// Values given on the command line
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub proxy_file: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sticky_header: Option<String>,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedGatewayConfig {
    pub listen_addr: SocketAddr,
    pub proxy_file: PathBuf,
    pub default_credentials: Option<Credentials>,
    pub sticky_header: String,
    pub verbose: bool,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Trimmed value, `None` when blank
fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Accepts `host:port`, or `:port` for all interfaces
fn parse_listen_addr(value: &str) -> anyhow::Result<SocketAddr> {
    let value = value.trim();
    let normalized = if value.starts_with(':') {
        format!("0.0.0.0{}", value)
    } else {
        value.to_string()
    };
    normalized
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", value, e))
}

impl GatewayConfig {
    /// Load configuration from a TOML file (optional)
    ///
    /// A missing file yields the defaults; a file that exists but cannot be
    /// read or parsed is an error.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolve against the process environment
    pub fn resolve(self, cli: CliOverrides) -> anyhow::Result<ResolvedGatewayConfig> {
        self.resolve_with(cli, get_env)
    }

    /// Resolve with a custom environment lookup (`name` is unprefixed)
    pub fn resolve_with<F>(
        self,
        cli: CliOverrides,
        lookup: F,
    ) -> anyhow::Result<ResolvedGatewayConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).and_then(non_blank);

        let listen = cli
            .listen
            .and_then(non_blank)
            .or_else(|| lookup("LISTEN"))
            .or(self.listen.and_then(non_blank))
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen_addr = parse_listen_addr(&listen)?;

        let proxy_file = cli
            .proxy_file
            .or_else(|| lookup("FILE"))
            .or(self.proxy_file.and_then(non_blank))
            .unwrap_or_else(|| DEFAULT_PROXY_FILE.to_string());
        if proxy_file.trim().is_empty() {
            anyhow::bail!("Proxy list path must not be empty");
        }

        let username = cli
            .username
            .and_then(non_blank)
            .or_else(|| lookup("USER"))
            .or(self.username.and_then(non_blank));
        let password = cli
            .password
            .and_then(non_blank)
            .or_else(|| lookup("PASS"))
            .or(self.password.and_then(non_blank));

        let default_credentials = match (username, password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
            (None, None) => None,
            _ => anyhow::bail!(
                "Incomplete credentials: set both username and password (PROXY_USER and PROXY_PASS) or neither"
            ),
        };

        let sticky_header = cli
            .sticky_header
            .and_then(non_blank)
            .or_else(|| lookup("STICKY_HEADER"))
            .or(self.sticky_header.and_then(non_blank))
            .unwrap_or_else(|| DEFAULT_STICKY_HEADER.to_string());

        let verbose = cli.verbose
            || lookup("VERBOSE")
                .map(|v| parse_bool(&v))
                .or(self.verbose)
                .unwrap_or(false);

        Ok(ResolvedGatewayConfig {
            listen_addr,
            proxy_file: PathBuf::from(proxy_file),
            default_credentials,
            sticky_header,
            verbose,
        })
    }
}
