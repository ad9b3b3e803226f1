//! Context labels announced to the session registry.
//!
//! Wire format: `EXCLUSIVE_<workflow>` or `NORMAL_<workflow>`.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::{Error, Result};

const EXCLUSIVE_PREFIX: &str = "EXCLUSIVE_";
const NORMAL_PREFIX: &str = "NORMAL_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    Exclusive,
    Normal,
}

impl SessionMode {
    fn prefix(self) -> &'static str {
        match self {
            SessionMode::Exclusive => EXCLUSIVE_PREFIX,
            SessionMode::Normal => NORMAL_PREFIX,
        }
    }
}

/// Parsed form of a session's context label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextLabel {
    pub mode: SessionMode,
    pub workflow: String,
}

impl ContextLabel {
    pub fn new(is_exclusive: bool, workflow: &str) -> Self {
        let mode = if is_exclusive {
            SessionMode::Exclusive
        } else {
            SessionMode::Normal
        };
        Self {
            mode,
            workflow: workflow.to_string(),
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.mode == SessionMode::Exclusive
    }

    /// Parse a label, returning `None` for labels this protocol does not own.
    pub fn parse(raw: &str) -> Option<Self> {
        let (mode, rest) = if let Some(rest) = raw.strip_prefix(EXCLUSIVE_PREFIX) {
            (SessionMode::Exclusive, rest)
        } else if let Some(rest) = raw.strip_prefix(NORMAL_PREFIX) {
            (SessionMode::Normal, rest)
        } else {
            return None;
        };
        if rest.is_empty() {
            return None;
        }
        Some(Self {
            mode,
            workflow: rest.to_string(),
        })
    }

    /// Serialize, cutting the result down to `max_len` characters.
    ///
    /// Two workflows sharing a long common prefix can collide after
    /// truncation; the registry then sees them as the same workflow.
    pub fn to_label(&self, max_len: Option<usize>) -> String {
        let full = self.to_string();
        match max_len {
            Some(max) if full.chars().count() > max => {
                let truncated: String = full.chars().take(max).collect();
                warn!(
                    label = %full,
                    truncated = %truncated,
                    max_len = max,
                    "context label exceeds registry limit, truncating"
                );
                truncated
            }
            _ => full,
        }
    }
}

impl fmt::Display for ContextLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.mode.prefix(), self.workflow)
    }
}

impl FromStr for ContextLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::Registry(format!("not a context label: '{}'", s)))
    }
}
