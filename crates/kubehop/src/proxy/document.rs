//! Line-preserving model of an `HAProxy` configuration file.
//!
//! Only `server` lines inside one backend are ever touched; every other byte
//! of the file renders back exactly as it was read.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Keywords that open a new section when they start an unindented line.
const SECTION_KEYWORDS: &[&str] = &[
    "global",
    "defaults",
    "frontend",
    "backend",
    "listen",
    "resolvers",
    "peers",
    "userlist",
    "program",
    "mailers",
    "cache",
    "http-errors",
    "ring",
];

const DEFAULT_INDENT: &str = "    ";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("backend '{0}' not found in proxy configuration")]
    BackendNotFound(String),
}

/// A `server <name> <host>:<port> check` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ServerEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, with IPv6 hosts bracketed.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn render(&self, indent: &str) -> String {
        format!("{indent}server {} {} check\n", self.name, self.address())
    }
}

impl fmt::Display for ServerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address())
    }
}

/// What a mutation did to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerChange {
    Added,
    /// A server with the same name pointed elsewhere and was rewritten.
    Replaced,
    Removed,
    Unchanged,
}

/// A parsed configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfigDocument {
    /// Lines including their terminators.
    lines: Vec<String>,
}

/// Name and address of a `server` line.
fn server_fields(line: &str) -> Option<(&str, &str)> {
    if !line.starts_with(char::is_whitespace) {
        return None;
    }
    let mut tokens = line.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some("server"), Some(name), Some(address)) => Some((name, address)),
        _ => None,
    }
}

fn is_section_header(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    line.split_whitespace()
        .next()
        .is_some_and(|keyword| SECTION_KEYWORDS.contains(&keyword))
}

fn indent_of(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

impl ProxyConfigDocument {
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.split_inclusive('\n').map(str::to_string).collect(),
        }
    }

    #[must_use]
    pub fn render(&self) -> String {
        self.lines.concat()
    }

    /// Servers of `backend` in file order.
    ///
    /// # Errors
    ///
    /// Fails if the backend does not exist.
    pub fn servers(&self, backend: &str) -> Result<Vec<(String, String)>, DocumentError> {
        let (start, end) = self.section(backend)?;
        Ok(self.lines[start..end]
            .iter()
            .filter_map(|line| server_fields(line))
            .map(|(name, address)| (name.to_string(), address.to_string()))
            .collect())
    }

    /// Add `server` to `backend` unless an equivalent line exists.
    ///
    /// A line with the same name and address is equivalent. A line with the
    /// same name and another address is rewritten in place.
    ///
    /// # Errors
    ///
    /// Fails if the backend does not exist.
    pub fn add_server(&mut self, backend: &str, server: &ServerEntry) -> Result<ServerChange, DocumentError> {
        let (start, end) = self.section(backend)?;
        let address = server.address();

        let mut last_server = None;
        for index in start + 1..end {
            let Some((name, existing)) = server_fields(&self.lines[index]) else {
                continue;
            };
            if name == server.name {
                if existing == address {
                    return Ok(ServerChange::Unchanged);
                }
                let indent = indent_of(&self.lines[index]).to_string();
                self.lines[index] = server.render(&indent);
                return Ok(ServerChange::Replaced);
            }
            last_server = Some(index);
        }

        let (insert_at, indent) = match last_server {
            Some(index) => (index + 1, indent_of(&self.lines[index]).to_string()),
            None => {
                let body_end = self.trim_trailing_blank(start, end);
                let indent = self.lines[start + 1..body_end]
                    .iter()
                    .find(|line| !line.trim().is_empty())
                    .map_or(DEFAULT_INDENT, |line| indent_of(line))
                    .to_string();
                (body_end, indent)
            }
        };

        if let Some(previous) = self.lines.get_mut(insert_at - 1) {
            if !previous.ends_with('\n') {
                previous.push('\n');
            }
        }
        self.lines.insert(insert_at, server.render(&indent));
        Ok(ServerChange::Added)
    }

    /// Remove every `server` line named `name` from `backend`.
    ///
    /// # Errors
    ///
    /// Fails if the backend does not exist.
    pub fn remove_server(&mut self, backend: &str, name: &str) -> Result<ServerChange, DocumentError> {
        let (start, end) = self.section(backend)?;
        let before = self.lines.len();

        let mut index = start + 1;
        let mut end = end;
        while index < end {
            if server_fields(&self.lines[index]).is_some_and(|(server, _)| server == name) {
                self.lines.remove(index);
                end -= 1;
            } else {
                index += 1;
            }
        }

        Ok(if self.lines.len() == before {
            ServerChange::Unchanged
        } else {
            ServerChange::Removed
        })
    }

    /// Header index and exclusive end of the `backend` or `listen` section.
    fn section(&self, backend: &str) -> Result<(usize, usize), DocumentError> {
        let start = self
            .lines
            .iter()
            .position(|line| {
                let mut tokens = line.split_whitespace();
                is_section_header(line)
                    && matches!(tokens.next(), Some("backend" | "listen"))
                    && tokens.next() == Some(backend)
            })
            .ok_or_else(|| DocumentError::BackendNotFound(backend.to_string()))?;

        let end = self.lines[start + 1..]
            .iter()
            .position(|line| is_section_header(line))
            .map_or(self.lines.len(), |offset| start + 1 + offset);

        Ok((start, end))
    }

    /// End of the section body without its trailing blank or comment lines.
    fn trim_trailing_blank(&self, start: usize, end: usize) -> usize {
        let mut body_end = end;
        while body_end > start + 1 {
            let line = self.lines[body_end - 1].trim();
            if line.is_empty() || line.starts_with('#') {
                body_end -= 1;
            } else {
                break;
            }
        }
        body_end
    }
}
