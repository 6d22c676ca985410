use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use marketplace_api::{Favorite, ItemId, Reservation};

use crate::Tracking;

#[derive(Debug, Default)]
struct Registries {
    tracked: HashMap<ItemId, Option<Favorite>>,
    held: HashMap<ItemId, VecDeque<Reservation>>,
    snipes: HashMap<ItemId, Option<DateTime<Utc>>>,
}

/// Mutable bot state shared by concurrently processed items.
///
/// Each item task only touches the entries keyed by its own id. Locks are never held
/// across an await.
#[derive(Debug, Default)]
pub struct BotState {
    inner: Mutex<Registries>,
}

/// Owned form of [`Tracking`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedEntry {
    /// Never seen.
    Untracked,
    /// Tracked, no snapshot yet.
    Unobserved,
    /// Last stored snapshot.
    Observed(Favorite),
}

impl TrackedEntry {
    /// Borrows this entry for the change detector.
    pub fn as_tracking(&self) -> Tracking<'_> {
        match self {
            TrackedEntry::Untracked => Tracking::Untracked,
            TrackedEntry::Unobserved => Tracking::Unobserved,
            TrackedEntry::Observed(favorite) => Tracking::Observed(favorite),
        }
    }
}

impl BotState {
    /// Creates state tracking `ids` with no snapshot yet.
    pub fn with_tracked(ids: impl IntoIterator<Item = ItemId>) -> Self {
        let state = Self::default();
        state
            .lock()
            .tracked
            .extend(ids.into_iter().map(|id| (id, None)));
        state
    }

    fn lock(&self) -> MutexGuard<'_, Registries> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// What is known about `id`.
    pub fn tracking(&self, id: ItemId) -> TrackedEntry {
        match self.lock().tracked.get(&id) {
            None => TrackedEntry::Untracked,
            Some(None) => TrackedEntry::Unobserved,
            Some(Some(favorite)) => TrackedEntry::Observed(favorite.clone()),
        }
    }

    /// Stores `favorite` as the latest snapshot of its item.
    pub fn track(&self, favorite: Favorite) {
        self.lock().tracked.insert(favorite.id, Some(favorite));
    }

    /// Stops tracking `id`. Returns whether it was tracked.
    pub fn untrack(&self, id: ItemId) -> bool {
        self.lock().tracked.remove(&id).is_some()
    }

    /// Ids currently tracked, sorted.
    pub fn tracked_ids(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self.lock().tracked.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Reservations held for `id`, oldest first.
    pub fn held(&self, id: ItemId) -> Vec<Reservation> {
        self.lock()
            .held
            .get(&id)
            .map(|held| held.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records a new reservation.
    pub fn push_held(&self, reservation: Reservation) {
        self.lock()
            .held
            .entry(reservation.item_id)
            .or_default()
            .push_back(reservation);
    }

    /// Forgets a reservation. Returns whether it was held.
    pub fn remove_held(&self, reservation: &Reservation) -> bool {
        let mut registries = self.lock();
        let Some(held) = registries.held.get_mut(&reservation.item_id) else {
            return false;
        };
        let Some(index) = held.iter().position(|r| r.id == reservation.id) else {
            return false;
        };
        held.remove(index);
        if held.is_empty() {
            registries.held.remove(&reservation.item_id);
        }
        true
    }

    /// The snipe registry entry for `id`.
    ///
    /// `None` means no snipe is armed. `Some(None)` means the item was checked and no
    /// restock instant was announced.
    pub fn scheduled_snipe(&self, id: ItemId) -> Option<Option<DateTime<Utc>>> {
        self.lock().snipes.get(&id).copied()
    }

    /// Records the restock instant a snipe was armed for.
    pub fn set_scheduled_snipe(&self, id: ItemId, at: Option<DateTime<Utc>>) {
        self.lock().snipes.insert(id, at);
    }

    /// Clears the snipe registry entry for `id`.
    pub fn remove_scheduled_snipe(&self, id: ItemId) -> Option<Option<DateTime<Utc>>> {
        self.lock().snipes.remove(&id)
    }
}

/// Removes a superseded reservation from the held set when dropped.
pub struct HeldGuard<'a> {
    state: &'a BotState,
    reservation: &'a Reservation,
}

impl<'a> HeldGuard<'a> {
    /// Arms the guard for `reservation`.
    pub fn new(state: &'a BotState, reservation: &'a Reservation) -> Self {
        Self { state, reservation }
    }
}

impl Drop for HeldGuard<'_> {
    fn drop(&mut self) {
        self.state.remove_held(self.reservation);
    }
}
