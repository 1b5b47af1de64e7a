use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};

/// Caller-assigned index of one logical request within a packet.
pub type Serial = u32;

/// Identifier of a registered retriever, unique within one dashboard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RetrieverId(pub u32);

impl fmt::Display for RetrieverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retriever-{}", self.0)
    }
}

/// Identifier of a registered factory: its position in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactoryId(pub u32);

impl fmt::Display for FactoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "factory-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Forecast
// ---------------------------------------------------------------------------

/// Reply classes a retriever might still produce for one serial number.
///
/// A retriever's forecast only ever shrinks: producing a reply clears the
/// bits of its class, and an explicit forecast update may only narrow it.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Forecast(u8);

impl Forecast {
    pub const NONE: Self = Self(0);
    pub const STRONG_BASELINE: Self = Self(1 << 0);
    pub const WEAK_BASELINE: Self = Self(1 << 1);
    pub const SUPPLEMENTARY: Self = Self(1 << 2);
    pub const SYNONYM_UPDATE: Self = Self(1 << 3);
    pub const ERROR: Self = Self(1 << 4);

    /// Either kind of baseline.
    pub const BASELINE: Self = Self(Self::STRONG_BASELINE.0 | Self::WEAK_BASELINE.0);
    /// Anything is still possible.
    pub const ALL: Self = Self(0x1f);

    const NAMES: [(Forecast, &'static str); 5] = [
        (Self::STRONG_BASELINE, "strong"),
        (Self::WEAK_BASELINE, "weak"),
        (Self::SUPPLEMENTARY, "supplementary"),
        (Self::SYNONYM_UPDATE, "synonym"),
        (Self::ERROR, "error"),
    ];

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for Forecast {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Forecast {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Forecast {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for Forecast {
    type Output = Self;
    fn not(self) -> Self {
        Self::from_bits_truncate(!self.0)
    }
}

impl fmt::Debug for Forecast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Forecast({self})")
    }
}

impl fmt::Display for Forecast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

// ---------------------------------------------------------------------------
// Reply kinds and events
// ---------------------------------------------------------------------------

/// The class of a concrete reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    StrongBaseline,
    WeakBaseline,
    Supplementary,
    SynonymUpdate,
    Error,
}

impl ReplyKind {
    /// The forecast bit announcing this kind.
    pub const fn bit(self) -> Forecast {
        match self {
            Self::StrongBaseline => Forecast::STRONG_BASELINE,
            Self::WeakBaseline => Forecast::WEAK_BASELINE,
            Self::Supplementary => Forecast::SUPPLEMENTARY,
            Self::SynonymUpdate => Forecast::SYNONYM_UPDATE,
            Self::Error => Forecast::ERROR,
        }
    }

    /// Forecast bits a reply of this kind resolves for its retriever.
    ///
    /// A baseline or an error settles the retriever's main answer, so it
    /// clears every baseline and error bit at once.
    pub const fn resolves(self) -> Forecast {
        match self {
            Self::StrongBaseline | Self::WeakBaseline | Self::Error => {
                Forecast(Forecast::BASELINE.0 | Forecast::ERROR.0)
            }
            Self::Supplementary => Forecast::SUPPLEMENTARY,
            Self::SynonymUpdate => Forecast::SYNONYM_UPDATE,
        }
    }

    /// Precedence for the main reply slot: a strong baseline beats a weak
    /// one, which beats an error. `None` for kinds that never fill it.
    pub const fn main_rank(self) -> Option<u8> {
        match self {
            Self::Error => Some(0),
            Self::WeakBaseline => Some(1),
            Self::StrongBaseline => Some(2),
            Self::Supplementary | Self::SynonymUpdate => None,
        }
    }
}

/// A status event from a retriever: "for this serial number I might still
/// produce `forecast`".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEvent {
    pub retriever: RetrieverId,
    pub serial: Serial,
    pub forecast: Forecast,
}

impl ReplyEvent {
    pub fn new(retriever: RetrieverId, serial: Serial, forecast: Forecast) -> Self {
        Self {
            retriever,
            serial,
            forecast,
        }
    }

    /// The retriever will produce nothing more for `serial`.
    pub fn withdraw_all(retriever: RetrieverId, serial: Serial) -> Self {
        Self::new(retriever, serial, Forecast::NONE)
    }
}

/// Bitmask returned by [`Dashboard::wait_for_major_event`](crate::Dashboard::wait_for_major_event).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MajorEvents(u8);

impl MajorEvents {
    pub const NONE: Self = Self(0);
    /// The wait ran out.
    pub const TIMEOUT: Self = Self(1 << 0);
    /// At least one registered retriever has not been started yet.
    pub const RETRIEVER_READY: Self = Self(1 << 1);
    /// At least one complete reply can be collected.
    pub const REPLY_AVAILABLE: Self = Self(1 << 2);
    /// Nothing further will arrive without a hard timeout.
    pub const NO_MORE_REPLIES: Self = Self(1 << 3);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MajorEvents {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MajorEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for MajorEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::TIMEOUT, "timeout"),
            (Self::RETRIEVER_READY, "retriever_ready"),
            (Self::REPLY_AVAILABLE, "reply_available"),
            (Self::NO_MORE_REPLIES, "no_more_replies"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "MajorEvents({})", set.join("|"))
    }
}

/// What running out of time means for a wait.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Report the timeout and change nothing.
    #[default]
    Soft,
    /// Settle every open request: synthesize errors where no baseline
    /// arrived and withdraw all outstanding forecasts.
    Hard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_and_error_resolve_together() {
        let resolved = ReplyKind::WeakBaseline.resolves();
        assert!(resolved.contains(Forecast::BASELINE | Forecast::ERROR));
        assert!(!resolved.intersects(Forecast::SUPPLEMENTARY));
        assert_eq!(ReplyKind::Supplementary.resolves(), Forecast::SUPPLEMENTARY);
    }

    #[test]
    fn main_rank_orders_strong_over_weak_over_error() {
        let rank = |k: ReplyKind| k.main_rank().unwrap();
        assert!(rank(ReplyKind::StrongBaseline) > rank(ReplyKind::WeakBaseline));
        assert!(rank(ReplyKind::WeakBaseline) > rank(ReplyKind::Error));
        assert_eq!(ReplyKind::SynonymUpdate.main_rank(), None);
    }

    #[test]
    fn forecast_display() {
        assert_eq!(Forecast::NONE.to_string(), "none");
        assert_eq!(Forecast::BASELINE.to_string(), "strong|weak");
        assert_eq!((!Forecast::BASELINE).to_string(), "supplementary|synonym|error");
    }

    #[test]
    fn major_events_debug() {
        let events = MajorEvents::TIMEOUT | MajorEvents::REPLY_AVAILABLE;
        assert_eq!(format!("{events:?}"), "MajorEvents(timeout|reply_available)");
        assert!(events.contains(MajorEvents::TIMEOUT));
        assert!(!events.contains(MajorEvents::NO_MORE_REPLIES));
    }
}
