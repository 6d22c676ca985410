use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use marketplace_api::{Favorite, Reservation};
use tracing::Level;

use crate::{ItemLists, SnapshotDiff, snapshot_diff};

/// How a timestamp is rounded to the nearest unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundingMode {
    /// Round to nearest, ties up.
    #[default]
    HalfCeil,
    /// Round to nearest, ties down.
    HalfFloor,
    /// Always down.
    Floor,
    /// Always up.
    Ceil,
}

/// Rounding applied to reservation timestamps before comparing them to sold-out times.
///
/// The server appears to store sold-out times at whole-second precision. Ties at exactly
/// half a unit have not been observed, so [`RoundingMode::HalfCeil`] is an assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampRounding {
    /// Rounding granularity.
    pub unit: TimeDelta,
    /// Tie and direction handling.
    pub mode: RoundingMode,
}

impl Default for TimestampRounding {
    fn default() -> Self {
        Self {
            unit: TimeDelta::seconds(1),
            mode: RoundingMode::HalfCeil,
        }
    }
}

impl TimestampRounding {
    /// Rounds `timestamp` to a multiple of the unit.
    /// Timestamps outside the nanosecond range are returned unchanged.
    pub fn round(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let (Some(unit), Some(nanos)) = (self.unit.num_nanoseconds(), timestamp.timestamp_nanos_opt())
        else {
            return timestamp;
        };
        if unit <= 0 {
            return timestamp;
        }

        let remainder = nanos.rem_euclid(unit);
        let floor = nanos - remainder;
        let rounded = match self.mode {
            RoundingMode::HalfCeil if remainder * 2 >= unit => floor + unit,
            RoundingMode::HalfFloor if remainder * 2 > unit => floor + unit,
            RoundingMode::Ceil if remainder > 0 => floor + unit,
            _ => floor,
        };
        DateTime::from_timestamp_nanos(rounded)
    }
}

/// What is known about an item before the new snapshot.
#[derive(Debug, Clone, Copy)]
pub enum Tracking<'a> {
    /// Never seen.
    Untracked,
    /// Tracked, but no snapshot stored yet.
    Unobserved,
    /// Tracked with this last snapshot.
    Observed(&'a Favorite),
}

/// Server replay noise that is dropped without updating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flap {
    /// Sold out to selling again, at exactly a held reservation's quantity.
    ResurfacedAfterReserve,
    /// Sold out again with a sold-out time older than the latest held reservation.
    StaleSoldOutTime,
}

/// Outcome of comparing a new snapshot with the stored one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Equal to the stored snapshot.
    Unchanged,
    /// Replay noise; state stays as it is.
    Suppressed(Flap),
    /// Previously untracked id; start tracking it.
    FirstSighting {
        /// Log level, `None` for silent tracking.
        level: Option<Level>,
        /// Whether the id is on the inactive list.
        inactive: bool,
    },
    /// First snapshot of an id tracked from start-up.
    Observed {
        /// Log level, `None` when the snapshot is not interesting.
        level: Option<Level>,
        /// Whether the id is on the ignore list.
        ignored: bool,
    },
    /// The stored snapshot differs.
    Changed {
        /// Log level.
        level: Level,
        /// Changed fields.
        diff: SnapshotDiff,
        /// Whether the id is on the ignore list.
        ignored: bool,
    },
}

impl Decision {
    /// Whether the new snapshot replaces the stored one.
    pub fn stores_snapshot(&self) -> bool {
        !matches!(self, Decision::Unchanged | Decision::Suppressed(_))
    }

    /// Whether holds and snipes may follow.
    pub fn reacts(&self) -> bool {
        match self {
            Decision::Unchanged | Decision::Suppressed(_) => false,
            Decision::FirstSighting { .. } => true,
            Decision::Observed { ignored, .. } | Decision::Changed { ignored, .. } => !ignored,
        }
    }
}

/// Compares snapshots against what is stored and what the bot itself holds.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    lists: Arc<ItemLists>,
    rounding: TimestampRounding,
}

impl ChangeDetector {
    /// Creates a detector consulting `lists`.
    pub fn new(lists: Arc<ItemLists>, rounding: TimestampRounding) -> Self {
        Self { lists, rounding }
    }

    /// Classifies `new` given the stored state and the reservations held for the item,
    /// oldest first.
    pub fn evaluate(&self, tracking: Tracking<'_>, new: &Favorite, held: &[Reservation]) -> Decision {
        let ignored = self.lists.is_ignored(new.id);

        let old = match tracking {
            Tracking::Untracked => {
                let inactive = self.lists.is_inactive(new.id);
                let level = (!inactive || new.is_interesting()).then_some(Level::WARN);
                return Decision::FirstSighting { level, inactive };
            }
            Tracking::Unobserved => {
                let level = new.is_interesting().then_some(if ignored {
                    Level::DEBUG
                } else {
                    Level::INFO
                });
                return Decision::Observed { level, ignored };
            }
            Tracking::Observed(old) => old,
        };

        if old == new {
            return Decision::Unchanged;
        }
        if let Some(flap) = self.flap(old, new, held) {
            return Decision::Suppressed(flap);
        }

        let level = if ignored || self.is_own_sell_out(old, new, held) {
            Level::DEBUG
        } else {
            Level::INFO
        };
        Decision::Changed {
            level,
            diff: snapshot_diff(old, new),
            ignored,
        }
    }

    fn flap(&self, old: &Favorite, new: &Favorite, held: &[Reservation]) -> Option<Flap> {
        if old.is_sold_out()
            && new.is_selling()
            && held.iter().any(|r| new.num_available == r.quantity)
        {
            return Some(Flap::ResurfacedAfterReserve);
        }

        let sold_out_by_us =
            old.is_sold_out() || held.iter().any(|r| old.num_available == r.quantity);
        if let (true, Some(sold_out_at), Some(latest)) =
            (new.is_sold_out(), new.sold_out_at, held.last())
        {
            if sold_out_by_us && sold_out_at < self.rounding.round(latest.reserved_at) {
                return Some(Flap::StaleSoldOutTime);
            }
        }
        None
    }

    /// A sell-out whose time matches one of the bot's own reservations.
    fn is_own_sell_out(&self, old: &Favorite, new: &Favorite, held: &[Reservation]) -> bool {
        (old.is_check_again_later() || old.is_selling() || old.is_sold_out())
            && new.is_sold_out()
            && held.iter().rev().any(|r| {
                (old.is_sold_out() || old.num_available == r.quantity)
                    && new.sold_out_at == Some(self.rounding.round(r.reserved_at))
            })
    }
}
