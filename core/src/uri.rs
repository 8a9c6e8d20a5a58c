/*
 * uri.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Ruscello, a seekable network audio stream engine.
 *
 * Ruscello is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Ruscello is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Ruscello.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Stream URLs: split an absolute http/https URL into scheme, host, port, request path,
//! and a default filename (last path segment, percent-decoded, "output" when empty).

use crate::error::{StreamError, StreamResult};

/// Filename used when the path has no last segment (e.g. `https://host/`).
pub const DEFAULT_FILENAME: &str = "output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        self == Scheme::Https
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Result of [`parse_url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Request target: path plus query, always starting with '/'. Fragment removed.
    pub path: String,
    pub filename: String,
}

impl ParsedUrl {
    /// Value for the Host header: host, or host:port when the port is not the scheme default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// True when a connection to `self` can serve `other` (same scheme, host, and port).
    pub fn same_origin(&self, other: &ParsedUrl) -> bool {
        self.scheme == other.scheme
            && self.port == other.port
            && self.host.eq_ignore_ascii_case(&other.host)
    }
}

/// Host portion of a URL without validation: text after "://" (or from the start when
/// there is no scheme) up to the first '/', ':', '?', or '#'.
pub fn extract_host(url: &str) -> &str {
    let start = url.find("://").map(|p| p + 3).unwrap_or(0);
    let rest = &url[start..];
    let end = rest.find(['/', ':', '?', '#']).unwrap_or(rest.len());
    &rest[..end]
}

/// Parse an absolute http or https URL.
pub fn parse_url(url: &str) -> StreamResult<ParsedUrl> {
    let scheme_end = url
        .find("://")
        .ok_or_else(|| StreamError::url_format(url, "missing \"://\""))?;
    let scheme = match url[..scheme_end].to_ascii_lowercase().as_str() {
        "https" => Scheme::Https,
        "http" => Scheme::Http,
        other => {
            return Err(StreamError::url_format(
                url,
                format!("unsupported scheme {:?}", other),
            ))
        }
    };

    let remaining = &url[scheme_end + 3..];
    let authority_end = remaining.find(['/', '?', '#']).unwrap_or(remaining.len());
    let authority = &remaining[..authority_end];
    let mut target = &remaining[authority_end..];
    if let Some(hash) = target.find('#') {
        target = &target[..hash];
    }
    let path = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{}", target)
    };

    let (host, port) = split_authority(url, authority, scheme)?;
    if host.is_empty() {
        return Err(StreamError::url_format(url, "empty host"));
    }

    let path_only = path.split('?').next().unwrap_or("");
    let last_segment = path_only.rsplit('/').next().unwrap_or("");
    let filename = if last_segment.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        percent_encoding::percent_decode_str(last_segment)
            .decode_utf8_lossy()
            .into_owned()
    };

    Ok(ParsedUrl {
        scheme,
        host,
        port,
        path,
        filename,
    })
}

/// Split `host[:port]` or `[v6]:port`, dropping any userinfo.
fn split_authority(url: &str, authority: &str, scheme: Scheme) -> StreamResult<(String, u16)> {
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let (host, port_str) = if let Some(rest) = authority.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| StreamError::url_format(url, "unterminated IPv6 literal"))?;
        let after = &rest[close + 1..];
        (&rest[..close], after.strip_prefix(':'))
    } else {
        match authority.rfind(':') {
            Some(colon) => (&authority[..colon], Some(&authority[colon + 1..])),
            None => (authority, None),
        }
    };
    let port = match port_str {
        None | Some("") => scheme.default_port(),
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| StreamError::url_format(url, format!("invalid port {:?}", p)))?,
    };
    Ok((host.to_string(), port))
}
