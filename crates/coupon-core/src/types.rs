//! Common identifiers and lifecycle states shared across the service.
//!
//! ## Identifiers
//! - [`CampaignId`] / [`RequesterId`]: numeric ids chosen by the caller.
//! - [`RequestId`] / [`CouponId`]: ids minted by the service (see
//!   [`crate::ids::IdMint`]), carried as decimal strings on the wire.
//!
//! ## Lifecycle
//! [`IssuanceState`] models `PENDING → PROCESSING → {ISSUED | SOLD_OUT |
//! FAILED}`. Terminal states never transition again.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(pub u64);

/// Globally unique identifier of one issuance request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

/// Identifier of one issued coupon instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CouponId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(RequestId);
string_id!(CouponId);

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an issuance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuanceState {
    /// Admitted and queued, not yet picked up by a worker.
    Pending,
    /// Dequeued by a worker; the ledger attempt is underway.
    Processing,
    /// A coupon was awarded.
    Issued,
    /// The campaign had no stock left at attempt time.
    SoldOut,
    /// An internal fault occurred. Not retried.
    Failed,
}

impl IssuanceState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Issued | Self::SoldOut | Self::Failed)
    }

    /// Whether a requester holding a ticket in this state must not be handed a
    /// second one for the same campaign.
    pub const fn blocks_readmission(self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Issued)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Issued | Self::SoldOut | Self::Failed => 2,
        }
    }

    /// Transitions only move forward, and never out of a terminal state.
    pub const fn can_advance_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Issued => "ISSUED",
            Self::SoldOut => "SOLD_OUT",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IssuanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milliseconds since the UNIX epoch, the unit of every timestamp on the wire.
pub type Millis = u64;

pub fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_one_way() {
        use IssuanceState::*;

        assert!(Pending.can_advance_to(Processing));
        assert!(Pending.can_advance_to(SoldOut));
        assert!(Processing.can_advance_to(Issued));
        assert!(Processing.can_advance_to(Failed));

        assert!(!Processing.can_advance_to(Pending));
        assert!(!Processing.can_advance_to(Processing));
        for terminal in [Issued, SoldOut, Failed] {
            for next in [Pending, Processing, Issued, SoldOut, Failed] {
                assert!(!terminal.can_advance_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn states_serialize_screaming_snake() {
        let json = serde_json::to_string(&IssuanceState::SoldOut).unwrap();
        assert_eq!(json, "\"SOLD_OUT\"");
        let state: IssuanceState = serde_json::from_str("\"PROCESSING\"").unwrap();
        assert_eq!(state, IssuanceState::Processing);
    }
}
