//! Error types shared by the flow-sleuth stages.
//!
//! Per-packet problems are [`DecodeError`]s: they are counted and skipped.
//! Everything that makes a whole file or run unusable is a [`SleuthError`]
//! and carries the path it happened on.

use std::path::PathBuf;

use thiserror::Error;

/// A single frame could not be turned into a [`crate::packet::Packet`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated Ethernet frame")]
    Ethernet,

    #[error("truncated IPv4 header")]
    Ipv4,

    #[error("truncated IPv6 header")]
    Ipv6,

    #[error("truncated TCP header")]
    Tcp,

    #[error("truncated UDP header")]
    Udp,

    #[error("invalid capture timestamp: sec={sec}, usec={usec}")]
    Timestamp { sec: i64, usec: i64 },

    #[error("failed to read packet record: {0}")]
    Read(String),
}

/// Errors that abort processing of one input file or one run.
#[derive(Error, Debug)]
pub enum SleuthError {
    #[error("failed to open capture file {path:?}: {source}")]
    CaptureOpen {
        path: PathBuf,
        #[source]
        source: pcap::Error,
    },

    #[error("unsupported link type {linktype} in capture file {path:?}")]
    UnsupportedLinkType { path: PathBuf, linktype: i32 },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error on {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl SleuthError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SleuthError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        SleuthError::Csv {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SleuthError>;
