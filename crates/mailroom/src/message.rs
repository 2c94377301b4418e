//! Message records and the on-disk file name grammar.
//!
//! A message is identified by the file that currently holds it; renaming the
//! file moves the message between states. The file name carries all metadata:
//! `<timestamp_ms>[.<flag>]*`, where the flag tokens record each prior failed
//! attempt in order.

use crate::error::{QueueError, QueueResult};
use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A failure reason appended to a message's file name on each failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    /// The handler exceeded its wall-clock ceiling.
    Timeout,
    /// The handler returned an error or panicked.
    Error,
    /// Terminal: the message is routed to the dead-letter queue (or
    /// discarded).
    Dead,
    /// Application-defined failure reason.
    Custom(String),
}

impl Flag {
    /// The on-disk token form of this flag.
    pub fn as_str(&self) -> &str {
        match self {
            Flag::Timeout => "timeout",
            Flag::Error => "error",
            Flag::Dead => "dead",
            Flag::Custom(token) => token,
        }
    }

    /// Creates an application-defined flag, rejecting tokens that would
    /// break the file name grammar.
    pub fn custom(token: impl Into<String>) -> QueueResult<Self> {
        let token = token.into();
        Self::parse_token(&token)
    }

    fn parse_token(token: &str) -> QueueResult<Self> {
        if token.is_empty() || token.contains(['.', '/', '\\']) {
            return Err(QueueError::MalformedName(format!(
                "invalid flag token: {:?}",
                token
            )));
        }
        Ok(match token {
            "timeout" => Flag::Timeout,
            "error" => Flag::Error,
            "dead" => Flag::Dead,
            _ => Flag::Custom(token.to_string()),
        })
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current time as milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Monotonically increasing push timestamp.
///
/// File names carry nothing but the timestamp, so two pushes stamped with
/// the same millisecond would collide in `queued/`. Each call returns at
/// least one more than the previous call, keeping names unique within the
/// process while staying plain digits.
pub(crate) fn unique_now_ms() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = now_ms();
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST.compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

/// Encodes a file name from a timestamp and attempt history.
pub fn encode_file_name(timestamp_ms: u64, attempts: &[Flag]) -> String {
    let mut name = timestamp_ms.to_string();
    for flag in attempts {
        name.push('.');
        name.push_str(flag.as_str());
    }
    name
}

/// Parses `<timestamp_ms>[.<flag>]*` back into its parts.
pub fn parse_file_name(name: &str) -> QueueResult<(u64, Vec<Flag>)> {
    let mut tokens = name.split('.');
    let timestamp = tokens
        .next()
        .filter(|t| !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|t| t.parse::<u64>().ok())
        .ok_or_else(|| QueueError::MalformedName(name.to_string()))?;
    let attempts = tokens
        .map(Flag::parse_token)
        .collect::<QueueResult<Vec<_>>>()
        .map_err(|_| QueueError::MalformedName(name.to_string()))?;
    Ok((timestamp, attempts))
}

/// A single unit of work, owned by whichever state directory its file
/// currently sits in.
#[derive(Debug, Clone)]
pub struct Message {
    /// Absolute location of the file that holds this message. This is the
    /// message's identity.
    pub path: PathBuf,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,

    /// Prior failed attempts, oldest first.
    pub attempts: Vec<Flag>,
}

impl Message {
    /// Reconstructs a message from its file path and payload, recovering the
    /// timestamp and attempt history from the file name.
    pub fn from_path(path: PathBuf, payload: Vec<u8>) -> QueueResult<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| QueueError::MalformedName(path.display().to_string()))?;
        let (timestamp_ms, attempts) = parse_file_name(name)?;
        Ok(Self {
            path,
            payload,
            timestamp_ms,
            attempts,
        })
    }

    /// The file name this message currently encodes to.
    pub fn file_name(&self) -> String {
        encode_file_name(self.timestamp_ms, &self.attempts)
    }

    /// The file name this message would have after one more failed attempt.
    pub fn file_name_with(&self, flag: &Flag) -> String {
        let mut name = self.file_name();
        name.push('.');
        name.push_str(flag.as_str());
        name
    }

    /// Age of this message relative to `now_ms`.
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.timestamp_ms))
    }
}
