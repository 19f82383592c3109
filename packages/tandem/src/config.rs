//! Construction options for a bridge.
//!
//! All options are optional. They can be built in code, deserialized with
//! serde, or read from the environment:
//!
//! ```ignore
//! let options = BridgeOptions::default()
//!     .with_replay(2)
//!     .with_backing(Backing::Sliding { capacity: 64 });
//!
//! let options: BridgeOptions = serde_json::from_value(json!({
//!     "replay": 2,
//!     "backing": { "strategy": "sliding", "capacity": 64 }
//! }))?;
//!
//! let options = BridgeOptions::from_env()?;
//! ```

use std::env;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TandemError;

/// Buffering policy of the action channel's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum Backing {
    /// Never full.
    #[default]
    Unbounded,
    /// Offers wait for space when full.
    Bounded {
        /// Maximum queued actions.
        capacity: usize,
    },
    /// Offers are discarded when full (drop newest).
    Dropping {
        /// Maximum queued actions.
        capacity: usize,
    },
    /// The oldest queued action is discarded to make room (drop oldest).
    Sliding {
        /// Maximum queued actions.
        capacity: usize,
    },
}

impl Backing {
    /// Capacity for the bounded strategies.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            Backing::Unbounded => None,
            Backing::Bounded { capacity }
            | Backing::Dropping { capacity }
            | Backing::Sliding { capacity } => Some(*capacity),
        }
    }

    /// The strategy name as used in configuration.
    pub fn strategy(&self) -> &'static str {
        match self {
            Backing::Unbounded => "unbounded",
            Backing::Bounded { .. } => "bounded",
            Backing::Dropping { .. } => "dropping",
            Backing::Sliding { .. } => "sliding",
        }
    }

    fn parse(strategy: &str, capacity: Option<usize>) -> Result<Self> {
        let required = || capacity.context("TANDEM_CAPACITY must be set for bounded strategies");
        Ok(match strategy {
            "unbounded" => Backing::Unbounded,
            "bounded" => Backing::Bounded {
                capacity: required()?,
            },
            "dropping" => Backing::Dropping {
                capacity: required()?,
            },
            "sliding" => Backing::Sliding {
                capacity: required()?,
            },
            other => anyhow::bail!("unknown backing strategy: {other}"),
        })
    }
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.capacity() {
            Some(capacity) => write!(f, "{}({})", self.strategy(), capacity),
            None => f.write_str(self.strategy()),
        }
    }
}

/// Options for a bridge instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    /// Number of most recent actions and state changes replayed to late subscribers.
    pub replay: usize,
    /// Action channel buffering policy.
    pub backing: Backing,
    /// How long an interrupted process may keep running to finish cleanup
    /// before it is dropped.
    #[serde(with = "millis", rename = "interrupt_grace_ms")]
    pub interrupt_grace: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            replay: 0,
            backing: Backing::Unbounded,
            interrupt_grace: Duration::ZERO,
        }
    }
}

impl BridgeOptions {
    /// Set the replay window.
    pub fn with_replay(mut self, replay: usize) -> Self {
        self.replay = replay;
        self
    }

    /// Set the action channel backing strategy.
    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }

    /// Set the interrupt grace period.
    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    /// Reject options that cannot be honored.
    pub fn validate(&self) -> Result<(), TandemError> {
        if self.backing.capacity() == Some(0) {
            return Err(TandemError::InvalidOptions {
                message: format!("{} backing requires a capacity above zero", self.backing.strategy()),
            });
        }
        Ok(())
    }

    /// Load options from `TANDEM_*` environment variables.
    ///
    /// Missing variables fall back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load options through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let replay = match lookup("TANDEM_REPLAY") {
            Some(raw) => raw
                .parse()
                .context("TANDEM_REPLAY must be a valid number")?,
            None => defaults.replay,
        };

        let capacity = match lookup("TANDEM_CAPACITY") {
            Some(raw) => Some(
                raw.parse()
                    .context("TANDEM_CAPACITY must be a valid number")?,
            ),
            None => None,
        };

        let backing = match lookup("TANDEM_BACKING") {
            Some(raw) => Backing::parse(&raw.to_ascii_lowercase(), capacity)?,
            None => defaults.backing,
        };

        let interrupt_grace = match lookup("TANDEM_INTERRUPT_GRACE_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse()
                    .context("TANDEM_INTERRUPT_GRACE_MS must be a valid number")?,
            ),
            None => defaults.interrupt_grace,
        };

        let options = Self {
            replay,
            backing,
            interrupt_grace,
        };
        options.validate()?;
        Ok(options)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
