// Optimistic mutation ledger
// Every entity is held as an authoritative `base` plus the ordered list of
// optimistic mutations still waiting for the server. The visible value is
// the base with those mutations replayed on top, so rejecting one mutation
// rolls back exactly that mutation, and an authoritative event arriving
// mid-flight rebases under the pending ones instead of being clobbered by
// them. Entries are always located by identity, never by position.

use log::{debug, warn};
use std::fmt;
use std::sync::Arc;

use crate::models::{Identity, TempId};

/// An entity the ledger can track
pub trait LedgerEntity: Clone {
    type Key: Clone + PartialEq + fmt::Debug;

    fn identity(&self) -> Identity<Self::Key>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Local changes not yet acknowledged
    Pending,
    Confirmed,
    /// Locally created entity the server refused; kept visible for retry
    Failed,
}

/// How a confirmation was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The pending entry took on the authoritative identity and data
    Replaced,
    /// The authoritative copy already existed, so the pending copy was folded into it
    Merged,
    /// The pending mutation became part of the authoritative base
    ConfirmedInPlace,
    /// No pending entry matched; applied as a plain upsert
    Upserted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MarkedFailed,
    RolledBack,
    Unknown,
}

type Mutation<E> = Arc<dyn Fn(&mut E) + Send + Sync>;

struct PendingMutation<E> {
    temp_id: TempId,
    apply: Mutation<E>,
}

struct Entry<E: LedgerEntity> {
    base: E,
    value: E,
    mutations: Vec<PendingMutation<E>>,
    created: Option<TempId>,
    failure: Option<String>,
}

impl<E: LedgerEntity> Entry<E> {
    fn new(base: E, created: Option<TempId>) -> Self {
        Entry {
            value: base.clone(),
            base,
            mutations: Vec::new(),
            created,
            failure: None,
        }
    }

    fn recompute(&mut self) {
        let mut value = self.base.clone();
        for mutation in &self.mutations {
            (mutation.apply)(&mut value);
        }
        self.value = value;
    }

    fn state(&self) -> EntryState {
        if self.failure.is_some() {
            EntryState::Failed
        } else if self.created.is_some() || !self.mutations.is_empty() {
            EntryState::Pending
        } else {
            EntryState::Confirmed
        }
    }
}

enum TempSlot {
    Created(usize),
    Mutation(usize, usize),
}

pub struct Ledger<E: LedgerEntity> {
    entries: Vec<Entry<E>>,
}

impl<E: LedgerEntity> Default for Ledger<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: LedgerEntity> Ledger<E> {
    pub fn new() -> Self {
        Ledger { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, identity: &Identity<E::Key>) -> Option<usize> {
        self.entries.iter().position(|e| e.base.identity() == *identity)
    }

    fn locate_temp(&self, temp_id: TempId) -> Option<TempSlot> {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.created == Some(temp_id) {
                return Some(TempSlot::Created(idx));
            }
            if let Some(m) = entry.mutations.iter().position(|m| m.temp_id == temp_id) {
                return Some(TempSlot::Mutation(idx, m));
            }
        }
        None
    }

    /// Add a locally created entity, visible immediately and pending until confirmed
    pub fn begin_optimistic_insert(&mut self, temp_id: TempId, value: E) -> &E {
        debug!("Optimistic insert {}", temp_id);
        self.entries.push(Entry::new(value, Some(temp_id)));
        let last = self.entries.len() - 1;
        &self.entries[last].value
    }

    /// Apply `mutation` to an existing entity now and remember it until the server answers.
    /// Returns `None` when no entity has that key.
    pub fn begin_optimistic_update<F>(&mut self, temp_id: TempId, key: &E::Key, mutation: F) -> Option<&E>
    where
        F: Fn(&mut E) + Send + Sync + 'static,
    {
        let idx = self.position(&Identity::Server(key.clone()))?;
        let entry = &mut self.entries[idx];
        entry.mutations.push(PendingMutation {
            temp_id,
            apply: Arc::new(mutation),
        });
        entry.recompute();
        debug!("Optimistic update {} on {:?}", temp_id, key);
        Some(&entry.value)
    }

    /// Replace the pending entry for `temp_id` with the authoritative version.
    /// An unknown `temp_id` is applied as an upsert keyed by the authoritative identity.
    pub fn confirm(&mut self, temp_id: TempId, authoritative: E) -> Confirmation {
        match self.locate_temp(temp_id) {
            Some(TempSlot::Created(idx)) => {
                let identity = authoritative.identity();
                let duplicate = self
                    .entries
                    .iter()
                    .enumerate()
                    .any(|(i, e)| i != idx && e.base.identity() == identity);
                if duplicate {
                    // The authoritative copy got here first; drop ours rather than keep two
                    self.entries.remove(idx);
                    self.reconcile_external(authoritative);
                    return Confirmation::Merged;
                }
                let entry = &mut self.entries[idx];
                entry.base = authoritative;
                entry.created = None;
                entry.failure = None;
                entry.recompute();
                Confirmation::Replaced
            }
            Some(TempSlot::Mutation(idx, m)) => {
                let entry = &mut self.entries[idx];
                entry.mutations.remove(m);
                entry.base = authoritative;
                entry.recompute();
                Confirmation::Replaced
            }
            None => {
                debug!("Confirmation for unknown {}, applying as upsert", temp_id);
                self.reconcile_external(authoritative);
                Confirmation::Upserted
            }
        }
    }

    /// Accept the optimistic change as-is: a pending mutation is folded into the
    /// base, a pending insert simply stops being pending.
    pub fn confirm_in_place(&mut self, temp_id: TempId) -> Option<Confirmation> {
        match self.locate_temp(temp_id)? {
            TempSlot::Created(idx) => {
                let entry = &mut self.entries[idx];
                entry.created = None;
                entry.failure = None;
            }
            TempSlot::Mutation(idx, m) => {
                let entry = &mut self.entries[idx];
                let mutation = entry.mutations.remove(m);
                (mutation.apply)(&mut entry.base);
                entry.recompute();
            }
        }
        Some(Confirmation::ConfirmedInPlace)
    }

    /// A pending insert is marked failed and stays visible; a pending mutation is rolled back
    pub fn reject(&mut self, temp_id: TempId, reason: &str) -> Rejection {
        match self.locate_temp(temp_id) {
            Some(TempSlot::Created(idx)) => {
                self.entries[idx].failure = Some(reason.to_string());
                Rejection::MarkedFailed
            }
            Some(TempSlot::Mutation(idx, m)) => {
                let entry = &mut self.entries[idx];
                entry.mutations.remove(m);
                entry.recompute();
                Rejection::RolledBack
            }
            None => {
                warn!("Rejection for unknown {}: {}", temp_id, reason);
                Rejection::Unknown
            }
        }
    }

    /// Put a failed insert back into the pending state
    pub fn retry(&mut self, temp_id: TempId) -> Option<&E> {
        match self.locate_temp(temp_id)? {
            TempSlot::Created(idx) if self.entries[idx].failure.is_some() => {
                let entry = &mut self.entries[idx];
                entry.failure = None;
                Some(&entry.value)
            }
            _ => None,
        }
    }

    /// Upsert an authoritative value that has no local pending counterpart.
    /// Local fields for that identity are overwritten; pending mutations replay on top.
    pub fn reconcile_external(&mut self, authoritative: E) -> &E {
        self.reconcile_external_with(authoritative, |_, incoming| incoming)
    }

    /// Like `reconcile_external`, combining the existing base and the incoming value with `merge`
    pub fn reconcile_external_with<M>(&mut self, authoritative: E, merge: M) -> &E
    where
        M: FnOnce(&E, E) -> E,
    {
        let identity = authoritative.identity();
        let idx = match self.position(&identity) {
            Some(idx) => {
                let entry = &mut self.entries[idx];
                entry.base = merge(&entry.base, authoritative);
                entry.recompute();
                idx
            }
            None => {
                self.entries.push(Entry::new(authoritative, None));
                self.entries.len() - 1
            }
        };
        &self.entries[idx].value
    }

    /// Apply an authoritative partial change to the base of an existing entity
    pub fn update_base<F>(&mut self, identity: &Identity<E::Key>, change: F) -> Option<&E>
    where
        F: FnOnce(&mut E),
    {
        let idx = self.position(identity)?;
        let entry = &mut self.entries[idx];
        change(&mut entry.base);
        entry.recompute();
        Some(&entry.value)
    }

    pub fn remove(&mut self, identity: &Identity<E::Key>) -> Option<E> {
        let idx = self.position(identity)?;
        Some(self.entries.remove(idx).value)
    }

    pub fn get(&self, identity: &Identity<E::Key>) -> Option<&E> {
        self.position(identity).map(|idx| &self.entries[idx].value)
    }

    pub fn get_by_key(&self, key: &E::Key) -> Option<&E> {
        self.get(&Identity::Server(key.clone()))
    }

    /// The value without pending optimistic mutations applied
    pub fn authoritative(&self, key: &E::Key) -> Option<&E> {
        self.position(&Identity::Server(key.clone()))
            .map(|idx| &self.entries[idx].base)
    }

    pub fn state(&self, identity: &Identity<E::Key>) -> Option<EntryState> {
        self.position(identity).map(|idx| self.entries[idx].state())
    }

    pub fn failure(&self, identity: &Identity<E::Key>) -> Option<&str> {
        self.position(identity)
            .and_then(|idx| self.entries[idx].failure.as_deref())
    }

    /// Whether `temp_id` still names a pending insert or mutation
    pub fn is_pending(&self, temp_id: TempId) -> bool {
        self.locate_temp(temp_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&E, EntryState)> {
        self.entries.iter().map(|e| (&e.value, e.state()))
    }

    pub fn values(&self) -> impl Iterator<Item = &E> {
        self.entries.iter().map(|e| &e.value)
    }

    /// Entities the server has acknowledged, excluding pending and failed ones
    pub fn confirmed(&self) -> impl Iterator<Item = &E> {
        self.entries
            .iter()
            .filter(|e| e.state() == EntryState::Confirmed)
            .map(|e| &e.value)
    }

    /// Stable sort of the visible order
    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&E, &E) -> std::cmp::Ordering,
    {
        self.entries.sort_by(|a, b| compare(&a.value, &b.value));
    }
}
