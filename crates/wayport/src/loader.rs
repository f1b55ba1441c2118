//! Upstream list loader
//!
//! One upstream per line, in either of two formats:
//!
//! - `IP:PORT` or `IP:PORT:USER:PASS` (always plain HTTP)
//! - `scheme://[user:pass@]host[:port]` with scheme `http`, `https`,
//!   `socks` or `socks5`
//!
//! Blank lines and lines starting with `#` or `;` are skipped. Entries without
//! their own credentials inherit the default credentials, when valid.

use std::path::Path;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::endpoint::{Credentials, Endpoint, Protocol};
use crate::error::LoadError;
use crate::pool::Registry;

/// Load and parse an upstream list file
pub fn load_file(
    path: impl AsRef<Path>,
    defaults: Option<&Credentials>,
) -> Result<Registry, LoadError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_lines(content.lines(), defaults)
}

/// Parse a sequence of lines into a registry.
///
/// Fails on the first malformed line; no partial registry is returned.
pub fn parse_lines<I, S>(lines: I, defaults: Option<&Credentials>) -> Result<Registry, LoadError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut endpoints = Vec::new();

    for (index, raw) in lines.into_iter().enumerate() {
        let line = raw.as_ref().trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let endpoint =
            parse_line(line, defaults).map_err(|reason| LoadError::parse(index + 1, reason))?;
        endpoints.push(endpoint);
    }

    if endpoints.is_empty() {
        return Err(LoadError::NoEndpoints);
    }

    Registry::new(endpoints).map_err(|_| LoadError::NoEndpoints)
}

/// Parse one non-comment line
pub fn parse_line(line: &str, defaults: Option<&Credentials>) -> Result<Endpoint, String> {
    if let Some(endpoint) = parse_colon_format(line, defaults) {
        return Ok(endpoint);
    }
    parse_url_format(line, defaults)
}

fn inherit(defaults: Option<&Credentials>) -> Option<Credentials> {
    defaults.filter(|c| c.is_valid()).cloned()
}

/// `IP:PORT[:USER:PASS]`
fn parse_colon_format(line: &str, defaults: Option<&Credentials>) -> Option<Endpoint> {
    let parts: Vec<&str> = line.split(':').collect();

    let (ip, port, credentials) = match parts.as_slice() {
        [ip, port] => (*ip, *port, inherit(defaults)),
        [ip, port, user, pass] if !user.is_empty() && !pass.is_empty() => {
            (*ip, *port, Some(Credentials::new(*user, *pass)))
        }
        _ => return None,
    };

    let ip_ok = !ip.is_empty() && ip.chars().all(|c| c.is_ascii_digit() || c == '.');
    let port_ok = !port.is_empty() && port.chars().all(|c| c.is_ascii_digit());
    if !ip_ok || !port_ok {
        return None;
    }

    Some(Endpoint::new(
        Protocol::Http,
        format!("{}:{}", ip, port),
        credentials,
    ))
}

/// `scheme://[user:pass@]host[:port]`
fn parse_url_format(line: &str, defaults: Option<&Credentials>) -> Result<Endpoint, String> {
    let url = Url::parse(line).map_err(|e| format!("invalid proxy URL: {}", e))?;

    let protocol = url.scheme().parse::<Protocol>().map_err(|e| e.to_string())?;

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| "proxy url missing host".to_string())?;

    // `Url` hides a port equal to the scheme default, so recover it from the
    // authority as written
    let address = match url.port().or_else(|| explicit_port(line)) {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let credentials = if url.username().is_empty() && url.password().is_none() {
        inherit(defaults)
    } else {
        Some(Credentials::new(
            decode(url.username()),
            decode(url.password().unwrap_or_default()),
        ))
    };

    Ok(Endpoint::new(protocol, address, credentials))
}

/// Port written in the authority of `scheme://authority/...`, if any
fn explicit_port(line: &str) -> Option<u16> {
    let rest = line.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let (host, port) = host_port.rsplit_once(':')?;
    if host.ends_with(']') || !host.contains(':') {
        port.parse().ok()
    } else {
        None
    }
}

fn decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}
