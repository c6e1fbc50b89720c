//! Datagram framing: parsing, validation, and destination path resolution.
//!
//! The wire format of a datagram is a decimal header count on the first
//! line, that many `key=value` lines, then the body verbatim to the end of
//! the datagram:
//!
//! ```text
//! 2\n
//! filepath=app/today.log\n
//! flush=true\n
//! <body bytes...>
//! ```
//!
//! The body may contain newlines and `=` freely; whatever trailing newline
//! the sender included is kept.

use crate::error::FogError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

// Setting names recognized in packet headers.
pub const FILEPATH: &str = "filepath";
pub const PASSWORD: &str = "password";
pub const FLUSH: &str = "flush";
pub const TRUNCATE: &str = "truncate";
pub const DELETE: &str = "delete";

/// One UDP datagram as received. `data` is truncated to the received size;
/// `count` is the receiving task's arrival counter, used only in debug logs.
pub struct Packet {
    pub data: Vec<u8>,
    pub addr: SocketAddr,
    pub count: u64,
}

impl Packet {
    /// Split the datagram into parsed header settings and the body.
    pub fn parse(&self) -> Result<(Settings, &[u8]), FogError> {
        let newline = self
            .data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| FogError::invalid(self.addr, "missing first newline"))?;

        let count: usize = std::str::from_utf8(&self.data[..newline])
            .ok()
            .and_then(|line| line.parse().ok())
            .ok_or_else(|| {
                FogError::invalid(
                    self.addr,
                    format!(
                        "setting count is not a number: {:?}",
                        String::from_utf8_lossy(&self.data[..newline])
                    ),
                )
            })?;

        let mut settings = HashMap::with_capacity(count);
        let mut pos = newline + 1;

        for remaining in (1..=count).rev() {
            let line_end = self.data[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|offset| pos + offset)
                .ok_or_else(|| {
                    FogError::invalid(
                        self.addr,
                        format!("missing newline with {remaining} settings left"),
                    )
                })?;

            let line = std::str::from_utf8(&self.data[pos..line_end]).map_err(|_| {
                FogError::invalid(self.addr, format!("setting line is not utf-8 at {pos}"))
            })?;

            let (key, value) = line.split_once('=').ok_or_else(|| {
                FogError::invalid(self.addr, format!("setting '{line}' missing equal sign"))
            })?;

            settings.insert(key.to_string(), value.to_string());
            pos = line_end + 1;
        }

        Ok((Settings(settings), &self.data[pos..]))
    }
}

/// Parsed header settings from one packet.
#[derive(Debug, Default)]
pub struct Settings(HashMap<String, String>);

impl Settings {
    fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key) == "true"
    }

    pub fn flush(&self) -> bool {
        self.flag(FLUSH)
    }

    pub fn truncate(&self) -> bool {
        self.flag(TRUNCATE)
    }

    pub fn delete(&self) -> bool {
        self.flag(DELETE)
    }

    /// Check the packet against the configured password and require a
    /// non-empty `filepath`. Returns the relative file path.
    pub fn validate(&self, addr: SocketAddr, password: &str) -> Result<&str, FogError> {
        if !password.is_empty() && self.get(PASSWORD) != password {
            return Err(FogError::BadPassword(addr));
        }

        let filepath = self.get(FILEPATH);
        if filepath.is_empty() {
            return Err(FogError::invalid(
                addr,
                format!("{} settings and no filepath", self.0.len()),
            ));
        }

        Ok(filepath)
    }
}

/// Root `filepath` under `output_path`, stripping one leading copy of
/// `output_path` if the sender already included it. Idempotent, and the
/// result is always under `output_path`.
pub fn resolve_path(output_path: &Path, filepath: &str) -> PathBuf {
    let root = output_path.to_string_lossy();
    let trimmed = filepath.strip_prefix(root.as_ref()).unwrap_or(filepath);

    output_path.join(trimmed.trim_start_matches('/'))
}
