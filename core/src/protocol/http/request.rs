/*
 * request.rs
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

//! HTTP request: method, path, headers. Serialized by `to_bytes` and written by the
//! stream connection.

use crate::uri::ParsedUrl;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
        }
    }
}

/// Mutable request builder: method, path, headers in the order they are added.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestBuilder {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
        }
    }

    /// GET for bytes `start..=end` of `url`, keeping the connection open.
    pub fn range(url: &ParsedUrl, start: u64, end: u64, user_agent: &str) -> Self {
        let mut req = Self::new(Method::Get, url.path.clone());
        req.header("Host", url.host_header())
            .header("Range", format!("bytes={}-{}", start, end))
            .header("Connection", "Keep-Alive")
            .header("User-Agent", user_agent)
            .header("Accept", "*/*");
        req
    }

    /// Minimal keep-alive request: the first byte of the resource.
    pub fn heartbeat(url: &ParsedUrl, user_agent: &str) -> Self {
        Self::range(url, 0, 0, user_agent)
    }

    /// Add or replace a header. Comparison is case-insensitive per HTTP.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut req = format!("{} {} HTTP/1.1\r\n", self.method.as_str(), self.path);
        for (k, v) in &self.headers {
            req.push_str(k);
            req.push_str(": ");
            req.push_str(v);
            req.push_str("\r\n");
        }
        req.push_str("\r\n");
        req.into_bytes()
    }
}
