//! Authorization of channel operations.
//!
//! The service never interprets keys itself. It asks an [`Authorizer`] whether
//! a key may perform an [`Action`] on a channel and, if so, which contract the
//! resulting Ssid belongs to.

use crate::ssid::Channel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// An operation that requires authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Subscribe to or unsubscribe from a channel.
    #[serde(rename = "read")]
    Subscribe,
    /// Publish to a channel.
    #[serde(rename = "write")]
    Publish,
    /// Ask for a published message to be retained.
    #[serde(rename = "store")]
    Store,
    /// Replay retained messages on subscribe.
    #[serde(rename = "load")]
    Load,
    /// Query or follow the presence of a channel.
    #[serde(rename = "presence")]
    Presence,
}

/// A successful authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Contract (tenant realm) the channel is encoded under.
    pub contract: u32,
}

/// A refused authorization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct Denied {
    /// Human-readable reason, reported to the caller.
    pub reason: String,
}

impl Denied {
    /// Create a denial with a reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Decides whether a key may act on a channel.
pub trait Authorizer: Send + Sync {
    /// Authorize `action` on `channel` for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Denied`] with the reason if the operation is not allowed.
    fn authorize(&self, key: &str, channel: &Channel, action: Action) -> Result<Grant, Denied>;
}

/// Grants everything under a single contract.
#[derive(Debug, Clone, Copy)]
pub struct AllowAll {
    contract: u32,
}

impl AllowAll {
    /// Create an authorizer that grants every request under `contract`.
    #[must_use]
    pub fn new(contract: u32) -> Self {
        Self { contract }
    }
}

impl Default for AllowAll {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Authorizer for AllowAll {
    fn authorize(&self, _: &str, _: &Channel, _: Action) -> Result<Grant, Denied> {
        Ok(Grant {
            contract: self.contract,
        })
    }
}

/// A configured key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRule {
    /// The secret presented by clients.
    pub key: String,
    /// Contract the key belongs to.
    pub contract: u32,
    /// Channel pattern the key is valid for.
    pub channel: Channel,
    /// Allowed actions.
    pub permissions: Vec<Action>,
}

/// Authorizer over a fixed table of keys.
#[derive(Debug, Clone, Default)]
pub struct StaticKeys {
    keys: HashMap<String, KeyRule>,
}

impl StaticKeys {
    /// Build the table. A later rule for the same key replaces an earlier one.
    #[must_use]
    pub fn new(rules: impl IntoIterator<Item = KeyRule>) -> Self {
        Self {
            keys: rules.into_iter().map(|r| (r.key.clone(), r)).collect(),
        }
    }

    /// Number of configured keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check if no keys are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Authorizer for StaticKeys {
    fn authorize(&self, key: &str, channel: &Channel, action: Action) -> Result<Grant, Denied> {
        let rule = self
            .keys
            .get(key)
            .ok_or_else(|| Denied::new("Unknown key"))?;

        if !rule.permissions.contains(&action) {
            debug!(channel = %channel, ?action, "Key lacks permission");
            return Err(Denied::new(format!("Key does not allow {action:?}")));
        }
        if !rule.channel.matches(channel) {
            debug!(channel = %channel, pattern = %rule.channel, "Key not valid for channel");
            return Err(Denied::new("Key is not valid for this channel"));
        }

        Ok(Grant {
            contract: rule.contract,
        })
    }
}
