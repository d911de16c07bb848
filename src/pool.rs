//! Generic ranked candidate pool.
//!
//! A [`RankedPool`] holds a set of candidates of one kind (proxies, relay
//! endpoints, bypass strategies) and orders them by observed reliability:
//! success rate first, average latency second. Candidates that keep
//! failing cool down for exponentially growing periods instead of being
//! discarded; candidates that are disabled or cooling down are invisible
//! to [`RankedPool::rank`].
//!
//! Membership sits behind one coarse lock (mutations are rare), while
//! each candidate's counters live behind their own lock — see
//! [`Tracked`].

use std::cmp::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::error::{ErrorKind, Result};
use crate::health::{CooldownPolicy, Resource, ResourceHealth, Tracked};

/// How candidates with identical scores are ordered.
///
/// The default keeps insertion order (stable and deterministic, which
/// tests and operators appreciate). `Shuffle` randomizes within each
/// equal-score run to spread load across near-equal performers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// Stable: equal scores keep registration order
    #[default]
    InsertionOrder,
    /// Equal-score runs are shuffled on every call
    Shuffle,
}

/// A pool of candidates ranked by reliability and latency.
#[derive(Debug)]
pub struct RankedPool<R> {
    entries: RwLock<Vec<Arc<Tracked<R>>>>,
    cooldown: Option<CooldownPolicy>,
    tie_break: TieBreak,
}

impl<R: Resource> Default for RankedPool<R> {
    fn default() -> Self {
        Self::new(CooldownPolicy::default())
    }
}

impl<R: Resource> RankedPool<R> {
    /// Create an empty pool with the given cooldown policy.
    #[must_use]
    pub fn new(cooldown: CooldownPolicy) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            cooldown: Some(cooldown),
            tie_break: TieBreak::default(),
        }
    }

    /// Create a pool that never quarantines its members.
    ///
    /// Used for heuristics: a strategy that fails on one input may still
    /// succeed on the next, so it must not be locked out.
    #[must_use]
    pub fn without_cooldown() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            cooldown: None,
            tie_break: TieBreak::default(),
        }
    }

    /// Set the tie-breaking policy for [`RankedPool::rank`].
    #[must_use]
    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Register a new candidate.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DuplicateResource`] if a candidate with the
    /// same id is already registered.
    pub fn add(&self, descriptor: R) -> Result<()> {
        let mut entries = self.entries.write().expect("pool lock poisoned");
        if entries.iter().any(|e| e.id() == descriptor.id()) {
            return Err(ErrorKind::DuplicateResource(descriptor.id().to_string()));
        }
        log::debug!("registered resource `{}`", descriptor.id());
        entries.push(Arc::new(Tracked::new(descriptor)));
        Ok(())
    }

    /// Remove a candidate. Returns `false` if the id is unknown.
    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.write().expect("pool lock poisoned");
        let before = entries.len();
        entries.retain(|e| e.id() != id);
        let removed = entries.len() != before;
        if removed {
            log::debug!("removed resource `{id}`");
        }
        removed
    }

    /// Allow a candidate to take part in ranking again.
    pub fn enable(&self, id: &str) -> bool {
        self.set_enabled(id, true)
    }

    /// Hide a candidate from ranking without losing its history.
    pub fn disable(&self, id: &str) -> bool {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.get(id) {
            Some(entry) => {
                entry.update(|h| h.enabled = enabled);
                true
            }
            None => false,
        }
    }

    /// Record a successful use of a candidate. Returns `false` if the id
    /// is unknown (e.g. the candidate was removed mid-flight).
    pub fn record_success(&self, id: &str, latency: Duration) -> bool {
        match self.get(id) {
            Some(entry) => {
                entry.update(|h| h.record_success(latency));
                true
            }
            None => false,
        }
    }

    /// Record a failed use of a candidate.
    pub fn record_failure(&self, id: &str) -> bool {
        match self.get(id) {
            Some(entry) => {
                entry.update(|h| h.record_failure(self.cooldown.as_ref()));
                if entry.health().is_in_cooldown() {
                    log::warn!("resource `{id}` entered cooldown");
                }
                true
            }
            None => false,
        }
    }

    /// Clear a candidate's counters and cooldown.
    pub fn reset(&self, id: &str) -> bool {
        match self.get(id) {
            Some(entry) => {
                entry.update(ResourceHealth::reset);
                true
            }
            None => false,
        }
    }

    /// Whether the candidate is currently quarantined.
    #[must_use]
    pub fn is_in_cooldown(&self, id: &str) -> bool {
        self.get(id).is_some_and(|e| e.health().is_in_cooldown())
    }

    /// Look up a candidate by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Tracked<R>>> {
        self.entries
            .read()
            .expect("pool lock poisoned")
            .iter()
            .find(|e| e.id() == id)
            .cloned()
    }

    /// Enabled, non-quarantined candidates ordered by descending success
    /// rate, then ascending average latency.
    ///
    /// The ordering is deterministic for a fixed health state under the
    /// default [`TieBreak::InsertionOrder`] policy.
    #[must_use]
    pub fn rank(&self) -> Vec<Arc<Tracked<R>>> {
        let entries = self.entries.read().expect("pool lock poisoned");
        let mut scored: Vec<(Arc<Tracked<R>>, f64, f64)> = entries
            .iter()
            .filter_map(|entry| {
                let health = entry.health();
                if !health.enabled || health.is_in_cooldown() {
                    return None;
                }
                Some((
                    Arc::clone(entry),
                    health.success_rate(),
                    health.avg_latency_secs(),
                ))
            })
            .collect();
        drop(entries);

        // Stable sort keeps insertion order among equals
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.2.partial_cmp(&b.2).unwrap_or(Ordering::Equal))
        });

        if self.tie_break == TieBreak::Shuffle {
            shuffle_ties(&mut scored);
        }

        scored.into_iter().map(|(entry, _, _)| entry).collect()
    }

    /// All candidates regardless of state, in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Tracked<R>>> {
        self.entries.read().expect("pool lock poisoned").clone()
    }

    /// Number of registered candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("pool lock poisoned").len()
    }

    /// Whether the pool has no candidates at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) const fn cooldown_policy(&self) -> Option<&CooldownPolicy> {
        self.cooldown.as_ref()
    }
}

/// Shuffle each maximal run of equal (rate, latency) scores in place.
fn shuffle_ties<R>(scored: &mut [(Arc<Tracked<R>>, f64, f64)]) {
    let mut rng = rand::thread_rng();
    let mut start = 0;
    while start < scored.len() {
        let mut end = start + 1;
        while end < scored.len()
            && scored[end].1 == scored[start].1
            && scored[end].2 == scored[start].2
        {
            end += 1;
        }
        if end - start > 1 {
            scored[start..end].shuffle(&mut rng);
        }
        start = end;
    }
}
