//! Severity-tagged log lines.
//!
//! Agents tag their own output with a leading `[LEVEL]` marker. Untagged lines
//! take the default severity of the stream they came from.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Which output stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn default_severity(self) -> Severity {
        match self {
            Self::Stdout => Severity::Info,
            Self::Stderr => Severity::Warning,
        }
    }
}

/// One parsed line of agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: Severity,
    pub stream: Stream,
    pub message: String,
}

impl LogLine {
    /// Parses one raw line from `stream`.
    pub fn parse(raw: &str, stream: Stream) -> Self {
        let raw = raw.trim_end_matches('\r');
        if let Some(caps) = tag_pattern().and_then(|re| re.captures(raw)) {
            if let Some(level) = Severity::from_tag(&caps[1]) {
                return Self {
                    level,
                    stream,
                    message: caps[2].to_string(),
                };
            }
        }
        Self {
            level: stream.default_severity(),
            stream,
            message: raw.to_string(),
        }
    }
}

fn tag_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*\[([A-Za-z]+)\]\s?(.*)$").ok())
        .as_ref()
}

/// Parses stdout then stderr into log lines. Blank lines are dropped.
pub fn parse_streams(stdout: &str, stderr: &str) -> Vec<LogLine> {
    stdout
        .lines()
        .map(|l| (l, Stream::Stdout))
        .chain(stderr.lines().map(|l| (l, Stream::Stderr)))
        .filter(|(l, _)| !l.trim().is_empty())
        .map(|(l, s)| LogLine::parse(l, s))
        .collect()
}
