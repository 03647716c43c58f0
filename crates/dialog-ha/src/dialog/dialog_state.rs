//! Replicated dialog and subscription states

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DialogState {
    /// Created by a provisional response carrying a To tag
    Early,
    /// Established by a 2xx
    Confirmed,
    /// Ended by BYE, CANCEL or a failure response; absorbing
    Terminated,
}

impl DialogState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogState::Early => "EARLY",
            DialogState::Confirmed => "CONFIRMED",
            DialogState::Terminated => "TERMINATED",
        }
    }

    /// Whether moving from `self` to `next` is allowed
    ///
    /// States only move forward; staying put is allowed.
    pub fn can_transition_to(&self, next: DialogState) -> bool {
        next >= *self
    }

    pub fn is_terminal(&self) -> bool {
        *self == DialogState::Terminated
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DialogState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EARLY" => Ok(DialogState::Early),
            "CONFIRMED" => Ok(DialogState::Confirmed),
            "TERMINATED" => Ok(DialogState::Terminated),
            other => Err(format!("unrecognized dialog state '{}'", other)),
        }
    }
}

/// Subscription state of a dialog created by SUBSCRIBE (RFC 6665)
///
/// INVITE dialogs stay at `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionState {
    #[default]
    None,
    Pending,
    Active,
    Terminated,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::None => "NONE",
            SubscriptionState::Pending => "PENDING",
            SubscriptionState::Active => "ACTIVE",
            SubscriptionState::Terminated => "TERMINATED",
        }
    }

    /// Value for a Subscription-State header
    pub fn header_value(&self) -> &'static str {
        match self {
            SubscriptionState::None => "none",
            SubscriptionState::Pending => "pending",
            SubscriptionState::Active => "active",
            SubscriptionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(SubscriptionState::None),
            "PENDING" => Ok(SubscriptionState::Pending),
            "ACTIVE" => Ok(SubscriptionState::Active),
            "TERMINATED" => Ok(SubscriptionState::Terminated),
            other => Err(format!("unrecognized subscription state '{}'", other)),
        }
    }
}
