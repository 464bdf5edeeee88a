//! Scan Errors
//!
//! One error type flows through both transports, the partition tracker and the
//! recordset. Retryability is decided here and nowhere else, so the round loop
//! never has to know which transport produced a failure.

use crate::cluster::NodeId;
use crate::protocol::result_code;
use std::time::Duration;

/// Error returned by scan execution
#[derive(Debug, Clone, PartialEq)]
pub enum ScanError {
    /// Connection reset, EOF mid-stream, or RPC failure
    Transport {
        node: NodeId,
        message: String,
        retryable: bool,
    },
    /// Socket read deadline or RPC deadline expired
    Timeout { node: NodeId, retryable: bool },
    /// Server attached a non-zero status to a frame
    Server { node: NodeId, code: u8 },
    /// Malformed frame or payload
    Protocol(String),
    /// Partition filter does not fit the cluster's partition space
    InvalidFilter(String),
    /// Connection pool closed or exhausted
    Pool(String),
    /// Retry budget exhausted with partitions still unfinished
    MaxRetriesExceeded { retries: u32, last: Option<Box<ScanError>> },
    /// Total deadline across rounds exceeded
    TotalTimeout(Duration),
}

impl ScanError {
    /// Transport failure, retryable only when the operation cannot have written anything
    pub fn transport(node: &NodeId, message: impl Into<String>, read_only: bool) -> Self {
        ScanError::Transport {
            node: node.clone(),
            message: message.into(),
            retryable: read_only,
        }
    }

    /// Translate a socket error observed while talking to `node`
    pub fn from_io(node: &NodeId, err: std::io::Error, read_only: bool) -> Self {
        match err.kind() {
            std::io::ErrorKind::InvalidData => ScanError::Protocol(err.to_string()),
            std::io::ErrorKind::TimedOut => ScanError::Timeout {
                node: node.clone(),
                retryable: read_only,
            },
            _ => ScanError::transport(node, err.to_string(), read_only),
        }
    }

    /// Whether the partitions affected by this error may be retried next round
    pub fn is_retryable(&self) -> bool {
        match self {
            ScanError::Transport { retryable, .. } | ScanError::Timeout { retryable, .. } => {
                *retryable
            }
            ScanError::Server { .. }
            | ScanError::Protocol(_)
            | ScanError::InvalidFilter(_)
            | ScanError::Pool(_)
            | ScanError::MaxRetriesExceeded { .. }
            | ScanError::TotalTimeout(_) => false,
        }
    }

    /// Node the error originated from, if any
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            ScanError::Transport { node, .. }
            | ScanError::Timeout { node, .. }
            | ScanError::Server { node, .. } => Some(node),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Transport { node, message, .. } => {
                write!(f, "Transport error on node {}: {}", node, message)
            }
            ScanError::Timeout { node, .. } => write!(f, "Timeout waiting for node {}", node),
            ScanError::Server { node, code } => write!(
                f,
                "Server error on node {}: {} ({})",
                node,
                result_code::describe(*code),
                code
            ),
            ScanError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ScanError::InvalidFilter(msg) => write!(f, "Invalid partition filter: {}", msg),
            ScanError::Pool(msg) => write!(f, "Connection pool error: {}", msg),
            ScanError::MaxRetriesExceeded { retries, last } => match last {
                Some(last) => write!(f, "Max retries exceeded: {} (last error: {})", retries, last),
                None => write!(f, "Max retries exceeded: {}", retries),
            },
            ScanError::TotalTimeout(total) => {
                write!(f, "Total timeout of {}ms exceeded", total.as_millis())
            }
        }
    }
}

impl std::error::Error for ScanError {}

/// Error loading engine configuration
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io(std::io::Error),
    /// Config text is not valid TOML for the expected schema
    Parse(String),
    /// Parsed values violate a constraint
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}
