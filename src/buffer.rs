//! Growable text buffer for sink output
//!
//! Growth is fallible: when memory cannot be reserved, or the configured
//! ceiling is reached, the buffer keeps what it already holds and records
//! that the output was truncated.
//!
//! Developed by GoCortex.io

use std::collections::TryReserveError;
use std::fmt;

pub const TRUNCATED_MARKER: &str = "[TRUNCATED]";

const INITIAL_CAPACITY: usize = 64;

/// Why a buffer stopped growing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Truncation {
    #[error("output limit of {0} bytes reached")]
    Limit(usize),
    #[error("could not grow buffer: {0}")]
    Alloc(#[from] TryReserveError),
}

#[derive(Debug, Default)]
pub struct SinkBuffer {
    text: String,
    limit: Option<usize>,
    truncation: Option<Truncation>,
}

impl SinkBuffer {
    /// Allocate an empty buffer. `limit` caps the content length in bytes.
    pub fn new(limit: Option<usize>) -> Result<Self, TryReserveError> {
        let mut text = String::new();
        text.try_reserve(INITIAL_CAPACITY)?;
        Ok(Self {
            text,
            limit,
            truncation: None,
        })
    }

    /// Append as much of `s` as fits. Returns false once the buffer is truncated.
    pub fn push_str(&mut self, s: &str) -> bool {
        if self.truncation.is_some() {
            return false;
        }

        let room = match self.limit {
            Some(limit) => limit.saturating_sub(self.text.len()),
            None => s.len(),
        };
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }

        if let Err(e) = self.text.try_reserve(take) {
            self.truncation = Some(e.into());
            return false;
        }
        self.text.push_str(&s[..take]);

        if take < s.len() {
            self.truncation = self.limit.map(Truncation::Limit);
            return false;
        }
        true
    }

    /// Drop a trailing separator, unless the buffer was cut short.
    pub fn trim_separator(&mut self, separator: &str) {
        if self.truncation.is_none() && self.text.ends_with(separator) {
            let len = self.text.len() - separator.len();
            self.text.truncate(len);
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncation.is_some()
    }

    pub fn truncation(&self) -> Option<&Truncation> {
        self.truncation.as_ref()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

impl fmt::Write for SinkBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.push_str(s) {
            Ok(())
        } else {
            Err(fmt::Error)
        }
    }
}
