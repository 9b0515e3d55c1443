//! Invoice status model
//!
//! Flat state machine mirroring the values a payment provider can emit:
//!
//! ```text
//! draft -> open -> { paid | void | uncollectible }
//!            \-> payment_failed -> { paid | void | uncollectible }
//! ```
//!
//! `payment_failed` is a side branch: the provider may retry and still
//! settle the invoice. `paid` and `void` are terminal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
    PaymentFailed,
}

/// Returned when parsing a status string that is not part of the model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown invoice status: {0}")]
pub struct UnknownStatus(pub String);

impl InvoiceStatus {
    pub const ALL: [InvoiceStatus; 6] = [
        InvoiceStatus::Draft,
        InvoiceStatus::Open,
        InvoiceStatus::Paid,
        InvoiceStatus::Void,
        InvoiceStatus::Uncollectible,
        InvoiceStatus::PaymentFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Uncollectible => "uncollectible",
            InvoiceStatus::PaymentFailed => "payment_failed",
        }
    }

    /// No further provider event may move the invoice out of this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Void)
    }

    /// Whether moving from `self` to `next` is a forward (or idempotent) step.
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;

        if *self == next {
            return true;
        }

        match self {
            Draft => matches!(next, Open | Paid | Void | Uncollectible | PaymentFailed),
            Open => matches!(next, Paid | Void | Uncollectible | PaymentFailed),
            PaymentFailed => matches!(next, Open | Paid | Void | Uncollectible),
            Uncollectible => matches!(next, Paid | Void),
            Paid | Void => false,
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "open" => Ok(InvoiceStatus::Open),
            "paid" => Ok(InvoiceStatus::Paid),
            "void" => Ok(InvoiceStatus::Void),
            "uncollectible" => Ok(InvoiceStatus::Uncollectible),
            "payment_failed" => Ok(InvoiceStatus::PaymentFailed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
