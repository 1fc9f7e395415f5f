//! Cache write strategies.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Governs when the backing store is updated relative to `set` returning.
///
/// | Strategy | Local tier | Backend | `set` returns |
/// |---|---|---|---|
/// | `WriteThrough` | written | written | after backend ack |
/// | `WriteBack` | written | queued | immediately |
/// | `WriteAround` | invalidated | written | after backend ack |
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteStrategy {
    /// Value is durably stored before `set` returns.
    #[default]
    WriteThrough,

    /// Value lands in the local tier; a background flusher writes the backend.
    WriteBack,

    /// Value bypasses the local tier to avoid polluting it with write-once data.
    WriteAround,
}

impl WriteStrategy {
    /// Whether `set` waits for the backing store before returning.
    pub fn is_synchronous(&self) -> bool {
        !matches!(self, WriteStrategy::WriteBack)
    }
}

impl fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteStrategy::WriteThrough => write!(f, "write-through"),
            WriteStrategy::WriteBack => write!(f, "write-back"),
            WriteStrategy::WriteAround => write!(f, "write-around"),
        }
    }
}

impl FromStr for WriteStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "write-through" | "through" => Ok(WriteStrategy::WriteThrough),
            "write-back" | "back" | "write-behind" => Ok(WriteStrategy::WriteBack),
            "write-around" | "around" => Ok(WriteStrategy::WriteAround),
            other => Err(Error::ConfigError(format!(
                "Unknown write strategy: {}",
                other
            ))),
        }
    }
}
