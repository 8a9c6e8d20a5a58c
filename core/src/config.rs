/*
 * config.rs
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

//! Engine configuration: buffer and block sizing, connection lifetimes, deadlines.
//! Stored as XML in ~/.ruscello/config.xml. All XML read/write uses the quick_xml
//! parser/writer; unknown elements are ignored so older builds can read newer files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

use crate::error::{StreamError, StreamResult};

/// Ring buffer capacity per connection (4 MiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024 * 1024;
/// Bytes requested per range request (256 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;
/// Bytes to accumulate before decoding starts (2 MiB).
pub const DEFAULT_PREFETCH_THRESHOLD: usize = 2 * 1024 * 1024;
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_USER_AGENT: &str = "Ruscello/0.1";

const ROOT_ELEMENT: &str = "ruscello";

/// Options recognised by the pool and every connection it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub buffer_capacity: usize,
    pub block_size: usize,
    pub prefetch_threshold: usize,
    /// Idle connections older than this are evicted.
    pub idle_ttl: Duration,
    /// Keep-alive heartbeat interval while the socket is open but not fetching.
    pub heartbeat_interval: Duration,
    /// Deadline for each resolve, connect, handshake, write, and read step.
    pub io_timeout: Duration,
    /// How often the pool's background sweep evicts expired idle connections.
    pub sweep_interval: Duration,
    /// Tear down and re-handshake after every block instead of keeping the socket.
    pub reconnect_each_block: bool,
    pub user_agent: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            block_size: DEFAULT_BLOCK_SIZE,
            prefetch_threshold: DEFAULT_PREFETCH_THRESHOLD,
            idle_ttl: DEFAULT_IDLE_TTL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            io_timeout: DEFAULT_IO_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            reconnect_each_block: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl StreamConfig {
    /// Check sizes and intervals. A block must fit in the ring with the one-byte margin,
    /// otherwise flow control could never admit it.
    pub fn validate(&self) -> StreamResult<()> {
        if self.buffer_capacity == 0 {
            return Err(StreamError::config("buffer capacity must be non-zero"));
        }
        if self.block_size == 0 {
            return Err(StreamError::config("block size must be non-zero"));
        }
        if self.block_size >= self.buffer_capacity {
            return Err(StreamError::config(format!(
                "block size {} must be smaller than buffer capacity {}",
                self.block_size, self.buffer_capacity
            )));
        }
        if self.heartbeat_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(StreamError::config("heartbeat and sweep intervals must be non-zero"));
        }
        if self.io_timeout.is_zero() {
            return Err(StreamError::config("I/O timeout must be non-zero"));
        }
        Ok(())
    }

    /// Load from an XML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> StreamResult<Self> {
        let content = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(StreamError::config(format!("{}: {}", path.display(), e))),
        };
        let config = Self::from_xml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse `<ruscello>` with one child element per option. Absent options keep their defaults.
    pub fn from_xml(content: &str) -> StreamResult<Self> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut config = Self::default();
        let mut in_root = false;
        let mut element_name = Vec::<u8>::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Err(e) => return Err(StreamError::config(format!("XML parse error: {}", e))),
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) => {
                    let name = e.name();
                    if name.as_ref() == ROOT_ELEMENT.as_bytes() {
                        in_root = true;
                    } else if in_root {
                        element_name.clear();
                        element_name.extend_from_slice(name.as_ref());
                    }
                }
                Ok(Event::Text(e)) => {
                    if !in_root || element_name.is_empty() {
                        continue;
                    }
                    let text = e
                        .unescape()
                        .map_err(|e| StreamError::config(e.to_string()))?
                        .trim()
                        .to_string();
                    config.apply(&element_name, &text)?;
                    element_name.clear();
                }
                Ok(Event::End(e)) => {
                    if e.name().as_ref() == ROOT_ELEMENT.as_bytes() {
                        in_root = false;
                    }
                    element_name.clear();
                }
                _ => {}
            }
            buf.clear();
        }
        Ok(config)
    }

    fn apply(&mut self, element: &[u8], text: &str) -> StreamResult<()> {
        match element {
            b"buffer-capacity" => self.buffer_capacity = parse_number(element, text)?,
            b"block-size" => self.block_size = parse_number(element, text)?,
            b"prefetch-threshold" => self.prefetch_threshold = parse_number(element, text)?,
            b"idle-ttl-ms" => self.idle_ttl = parse_millis(element, text)?,
            b"heartbeat-interval-ms" => self.heartbeat_interval = parse_millis(element, text)?,
            b"io-timeout-ms" => self.io_timeout = parse_millis(element, text)?,
            b"sweep-interval-ms" => self.sweep_interval = parse_millis(element, text)?,
            b"reconnect-each-block" => {
                self.reconnect_each_block = match text {
                    "true" | "1" | "yes" => true,
                    "false" | "0" | "no" => false,
                    _ => {
                        return Err(StreamError::config(format!(
                            "reconnect-each-block: expected boolean, got {:?}",
                            text
                        )))
                    }
                }
            }
            b"user-agent" => self.user_agent = text.to_string(),
            _ => {}
        }
        Ok(())
    }

    /// Write the configuration to `path`, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> StreamResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StreamError::config(e.to_string()))?;
        }
        let bytes = self.to_xml_bytes()?;
        fs::write(path, bytes).map_err(|e| StreamError::config(e.to_string()))
    }

    fn to_xml_bytes(&self) -> StreamResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut writer = Writer::new_with_indent(&mut out, b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(|e| StreamError::config(e.to_string()))?;
        writer
            .write_event(Event::Start(BytesStart::new(ROOT_ELEMENT)))
            .map_err(|e| StreamError::config(e.to_string()))?;
        let entries: [(&str, String); 9] = [
            ("buffer-capacity", self.buffer_capacity.to_string()),
            ("block-size", self.block_size.to_string()),
            ("prefetch-threshold", self.prefetch_threshold.to_string()),
            ("idle-ttl-ms", self.idle_ttl.as_millis().to_string()),
            ("heartbeat-interval-ms", self.heartbeat_interval.as_millis().to_string()),
            ("io-timeout-ms", self.io_timeout.as_millis().to_string()),
            ("sweep-interval-ms", self.sweep_interval.as_millis().to_string()),
            ("reconnect-each-block", self.reconnect_each_block.to_string()),
            ("user-agent", self.user_agent.clone()),
        ];
        for (name, value) in &entries {
            writer
                .write_event(Event::Start(BytesStart::new(*name)))
                .map_err(|e| StreamError::config(e.to_string()))?;
            writer
                .write_event(Event::Text(BytesText::new(value)))
                .map_err(|e| StreamError::config(e.to_string()))?;
            writer
                .write_event(Event::End(BytesEnd::new(*name)))
                .map_err(|e| StreamError::config(e.to_string()))?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))
            .map_err(|e| StreamError::config(e.to_string()))?;
        Ok(out)
    }
}

fn parse_number(element: &[u8], text: &str) -> StreamResult<usize> {
    text.parse::<usize>().map_err(|_| {
        StreamError::config(format!(
            "{}: expected a byte count, got {:?}",
            String::from_utf8_lossy(element),
            text
        ))
    })
}

fn parse_millis(element: &[u8], text: &str) -> StreamResult<Duration> {
    text.parse::<u64>().map(Duration::from_millis).map_err(|_| {
        StreamError::config(format!(
            "{}: expected milliseconds, got {:?}",
            String::from_utf8_lossy(element),
            text
        ))
    })
}

/// Default config directory: ~/.ruscello.
pub fn default_config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from).map(|h| h.join(".ruscello"))
}

/// Default config file: ~/.ruscello/config.xml.
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|d| d.join("config.xml"))
}
