//! Client key resolution.
//!
//! A client is identified by a trusted identity header when one is present,
//! otherwise by the host portion of the remote socket address.

use axum::http::{HeaderMap, HeaderName};

use crate::error::KeyResolutionError;

/// Header consulted when no identity header is configured or it is absent.
pub const DEFAULT_IP_HEADER: &str = "x-remote-address";

/// A key that identifies one client for rate limiting purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Create a client key from any string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Resolves the client key for a request.
///
/// Lookup order: the configured identity header, then
/// [`DEFAULT_IP_HEADER`], then the host part of the remote address.
///
/// [`DEFAULT_IP_HEADER`] is trusted even when a custom header is configured,
/// so a proxy in front of the service should strip or overwrite it.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    ip_header: Option<HeaderName>,
    fallback_header: HeaderName,
}

impl KeyResolver {
    /// Create a resolver that trusts `ip_header` when it is set.
    pub fn new(ip_header: Option<HeaderName>) -> Self {
        Self {
            ip_header,
            fallback_header: HeaderName::from_static(DEFAULT_IP_HEADER),
        }
    }

    /// The configured identity header, if any.
    pub fn ip_header(&self) -> Option<&HeaderName> {
        self.ip_header.as_ref()
    }

    /// Resolve a client key from request headers and the raw remote address.
    pub fn resolve(
        &self,
        headers: &HeaderMap,
        remote_addr: Option<&str>,
    ) -> Result<ClientKey, KeyResolutionError> {
        let from_header = self
            .ip_header
            .as_ref()
            .and_then(|name| header_value(headers, name))
            .or_else(|| header_value(headers, &self.fallback_header));

        if let Some(value) = from_header {
            return Ok(ClientKey::new(value));
        }

        let addr = remote_addr.ok_or(KeyResolutionError::MissingRemoteAddr)?;
        split_host_port(addr).map(ClientKey::new)
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new(None)
    }
}

/// A header value usable as a key: present, valid visible ASCII, not blank.
fn header_value<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Split a `host:port` or `[host]:port` address and return the host.
///
/// The port may be empty but the separator must be there. Unbracketed hosts
/// may not contain colons, so bare IPv6 literals are rejected.
pub fn split_host_port(addr: &str) -> Result<&str, KeyResolutionError> {
    let malformed = |reason| KeyResolutionError::Malformed {
        addr: addr.to_string(),
        reason,
    };

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| malformed("missing ']' in address"))?;
        let after = &rest[end + 1..];
        let port = match after.strip_prefix(':') {
            Some(port) => port,
            None if after.is_empty() => return Err(malformed("missing port in address")),
            None => return Err(malformed("unexpected text after ']'")),
        };
        (&rest[..end], port)
    } else {
        let colon = addr.rfind(':').ok_or_else(|| malformed("missing port in address"))?;
        let host = &addr[..colon];
        if host.contains(':') {
            return Err(malformed("too many colons in address"));
        }
        (host, &addr[colon + 1..])
    };

    if host.contains(['[', ']']) {
        return Err(malformed("unexpected bracket in host"));
    }
    if port.contains(['[', ']']) {
        return Err(malformed("unexpected bracket in port"));
    }
    if host.is_empty() {
        return Err(malformed("empty host"));
    }

    Ok(host)
}
