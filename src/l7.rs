//! Application-layer request logs (newline-delimited JSON).

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{Result, SleuthError};
use crate::flow::Endpoint;
use crate::timestamp::parse_timestamp;

/// `message` value that marks a request log line.
pub const TRAFFIC_LOG_MARKER: &str = "Traffic Log";

const MAPPED_V4_PREFIX: &str = "::ffff:";

/// One logged HTTP request.
///
/// Only `timestamp` and `ip` are required. Every other field is read
/// leniently: a value of an unexpected JSON type is coerced where that is
/// lossless and otherwise treated as absent, so type drift in the logger
/// never costs a request its row. Fields that are only carried into the
/// dataset keep their logged text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct L7LogEntry {
    pub timestamp: String,
    pub ip: String,
    #[serde(default, deserialize_with = "lenient_u16")]
    pub src_port: Option<u16>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub request_id: Option<String>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient_u16")]
    pub response_status: Option<u16>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub duration_ms: Option<String>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub security_level: Option<String>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub response_size: Option<String>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub user_agent: Option<String>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub num_headers: Option<String>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub num_query_params: Option<String>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub num_body_keys: Option<String>,
    #[serde(default, deserialize_with = "scalar_text")]
    pub request_content_length: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl L7LogEntry {
    /// Client address with any IPv4-mapped-IPv6 prefix removed.
    pub fn client_addr(&self) -> &str {
        strip_mapped_prefix(&self.ip)
    }

    /// Client (address, port), if both are present and well formed.
    pub fn client_endpoint(&self) -> Option<Endpoint> {
        let ip = self.client_addr().parse::<IpAddr>().ok()?;
        Some(Endpoint::new(ip, self.src_port?))
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    /// Compact JSON of a non-empty request body, else an empty string.
    pub fn request_body(&self) -> String {
        match &self.body {
            None | Some(Value::Null) => String::new(),
            Some(Value::Object(map)) if map.is_empty() => String::new(),
            Some(Value::Array(items)) if items.is_empty() => String::new(),
            Some(Value::String(s)) if s.is_empty() => String::new(),
            Some(value) => value.to_string(),
        }
    }
}

pub fn strip_mapped_prefix(addr: &str) -> &str {
    addr.strip_prefix(MAPPED_V4_PREFIX).unwrap_or(addr)
}

/// Numbers and numeric strings within `u16` range; anything else is absent.
fn lenient_u16<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(|v| match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    }))
}

/// Logged text of a scalar. Strings are kept as is, numbers and booleans
/// as their JSON text, and nested values as compact JSON.
fn scalar_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Classification of one log line.
#[derive(Debug, Clone, PartialEq)]
pub enum LogLine {
    Entry(Box<L7LogEntry>),
    /// Valid JSON without the request-log marker
    Other,
    Malformed,
}

pub fn parse_log_line(line: &str) -> LogLine {
    let line = line.trim();
    if line.is_empty() {
        return LogLine::Other;
    }
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return LogLine::Malformed;
    };
    if value.get("message").and_then(Value::as_str) != Some(TRAFFIC_LOG_MARKER) {
        return LogLine::Other;
    }
    match serde_json::from_value::<L7LogEntry>(value) {
        Ok(entry) => LogLine::Entry(Box::new(entry)),
        Err(e) => {
            debug!("Unusable request log line: {}", e);
            LogLine::Malformed
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct L7LoadStats {
    pub files: usize,
    pub entries: usize,
    pub other_lines: usize,
    pub malformed_lines: usize,
    pub unreadable_files: Vec<PathBuf>,
}

/// Reads request entries from one log file, in file order.
pub fn read_l7_log(path: &Path, stats: &mut L7LoadStats) -> Result<Vec<L7LogEntry>> {
    let file = File::open(path).map_err(|e| SleuthError::io(path, e))?;
    let mut entries = Vec::new();
    for (idx, raw) in BufReader::new(file).split(b'\n').enumerate() {
        let raw = raw.map_err(|e| SleuthError::io(path, e))?;
        let Ok(line) = String::from_utf8(raw) else {
            debug!("Line {} of {:?} is not valid UTF-8", idx + 1, path);
            stats.malformed_lines += 1;
            continue;
        };
        match parse_log_line(&line) {
            LogLine::Entry(entry) => entries.push(*entry),
            LogLine::Other => stats.other_lines += 1,
            LogLine::Malformed => stats.malformed_lines += 1,
        }
    }
    Ok(entries)
}

/// Loads every `traffic-*.log` in `dir`, in file-name order.
pub fn load_l7_logs(dir: &Path) -> Result<(Vec<L7LogEntry>, L7LoadStats)> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| SleuthError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("traffic-") && n.ends_with(".log"))
        })
        .collect();
    paths.sort();

    let mut stats = L7LoadStats::default();
    let mut entries = Vec::new();
    for path in paths {
        info!("Loading L7 log: {:?}", path);
        match read_l7_log(&path, &mut stats) {
            Ok(file_entries) => {
                stats.files += 1;
                entries.extend(file_entries);
            }
            Err(e) => {
                warn!("{}", e);
                stats.unreadable_files.push(path);
            }
        }
    }
    stats.entries = entries.len();
    info!(
        "Loaded {} L7 log entries ({} malformed lines skipped)",
        stats.entries, stats.malformed_lines
    );
    Ok((entries, stats))
}
