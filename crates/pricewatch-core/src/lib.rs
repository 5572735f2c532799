//! Core domain model for pricewatch: tracked items, observed price states and change events.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pricewatch-core";

pub const FREE_TO_PLAY_LABEL: &str = "Free to Play";
pub const NO_PRICE_DATA_LABEL: &str = "No price data";

/// A catalog entry whose price is periodically observed. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl TrackedItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
        }
    }

    /// Name used before the remote catalog has told us the real one.
    pub fn fallback_name(&self) -> String {
        format!("App {}", self.id)
    }
}

/// Observed price state. Amounts are minor currency units (hundredths).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriceState {
    Priced {
        final_minor: i64,
        initial_minor: i64,
        currency: String,
        discount_percent: u8,
    },
    FreeToPlay,
    NoPriceData,
}

impl PriceState {
    /// A regular (not discounted) price.
    pub fn regular(final_minor: i64, currency: impl Into<String>) -> Self {
        PriceState::Priced {
            final_minor,
            initial_minor: final_minor,
            currency: currency.into(),
            discount_percent: 0,
        }
    }

    pub fn on_sale(
        final_minor: i64,
        initial_minor: i64,
        currency: impl Into<String>,
        discount_percent: u8,
    ) -> Self {
        PriceState::Priced {
            final_minor,
            initial_minor,
            currency: currency.into(),
            discount_percent,
        }
    }

    pub fn is_on_sale(&self) -> bool {
        matches!(self, PriceState::Priced { discount_percent, .. } if *discount_percent > 0)
    }

    pub fn final_minor(&self) -> Option<i64> {
        match self {
            PriceState::Priced { final_minor, .. } => Some(*final_minor),
            _ => None,
        }
    }

    /// Equality on the amount a buyer would pay.
    ///
    /// Two priced states are the same when final price and currency match;
    /// the discount framing is ignored.
    pub fn same_payable_price(&self, other: &PriceState) -> bool {
        match (self, other) {
            (
                PriceState::Priced {
                    final_minor: a,
                    currency: ca,
                    ..
                },
                PriceState::Priced {
                    final_minor: b,
                    currency: cb,
                    ..
                },
            ) => a == b && ca == cb,
            (PriceState::FreeToPlay, PriceState::FreeToPlay) => true,
            (PriceState::NoPriceData, PriceState::NoPriceData) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PriceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceState::Priced {
                final_minor,
                currency,
                ..
            } => {
                if currency.is_empty() {
                    write!(f, "{}", format_minor_units(*final_minor))
                } else {
                    write!(f, "{} {}", format_minor_units(*final_minor), currency)
                }
            }
            PriceState::FreeToPlay => f.write_str(FREE_TO_PLAY_LABEL),
            PriceState::NoPriceData => f.write_str(NO_PRICE_DATA_LABEL),
        }
    }
}

/// Formats minor units the way the history log has always written them:
/// `14900 -> "149.0"`, `1990 -> "19.9"`, `1999 -> "19.99"`.
pub fn format_minor_units(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    let units = abs / 100;
    let cents = abs % 100;
    if cents == 0 {
        format!("{sign}{units}.0")
    } else if cents % 10 == 0 {
        format!("{sign}{units}.{}", cents / 10)
    } else {
        format!("{sign}{units}.{cents:02}")
    }
}

/// One fetch result for one item at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub item_id: String,
    pub name: String,
    pub price_state: PriceState,
    pub observed_at: NaiveDateTime,
}

/// Durable form of one past observation, one per history line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub timestamp: NaiveDateTime,
    /// `None` for legacy lines written before records were keyed by id.
    pub item_id: Option<String>,
    pub item_name: String,
    pub price_state: PriceState,
}

impl From<&Observation> for PriceRecord {
    fn from(observation: &Observation) -> Self {
        Self {
            timestamp: observation.observed_at,
            item_id: Some(observation.item_id.clone()),
            item_name: observation.name.clone(),
            price_state: observation.price_state.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    FirstSighting,
    Unchanged,
    NewListing,
    PriceChanged,
    BecameFree,
    LostPriceData,
}

impl ChangeKind {
    pub fn is_notifiable(self) -> bool {
        !matches!(self, ChangeKind::FirstSighting | ChangeKind::Unchanged)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::FirstSighting => "first_sighting",
            ChangeKind::Unchanged => "unchanged",
            ChangeKind::NewListing => "new_listing",
            ChangeKind::PriceChanged => "price_changed",
            ChangeKind::BecameFree => "became_free",
            ChangeKind::LostPriceData => "lost_price_data",
        }
    }
}

/// Direction of a priced-to-priced change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceMovement {
    Drop,
    Rise,
    /// A sale ended.
    WentRegular,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub item: TrackedItem,
    pub item_name: String,
    pub previous: Option<PriceState>,
    pub current: PriceState,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn movement(&self) -> Option<PriceMovement> {
        if self.kind != ChangeKind::PriceChanged {
            return None;
        }
        let previous = self.previous.as_ref()?;
        let (old, new) = (previous.final_minor()?, self.current.final_minor()?);
        if previous.is_on_sale() && !self.current.is_on_sale() {
            return Some(PriceMovement::WentRegular);
        }
        if new < old {
            Some(PriceMovement::Drop)
        } else {
            Some(PriceMovement::Rise)
        }
    }
}
