//! Multi-group concurrency limiter.
//!
//! A [`GroupLimiter`] admits one unit of work across a set of named groups
//! at a time: the acquisition succeeds only if every group in the set has
//! spare capacity, and then all of them are charged atomically. Groups are
//! resolved to a [`GroupRule`] on first use through a caller-supplied
//! callback, tracked while any holder remains, and forgotten once their
//! count returns to zero so that a later limit change is picked up on the
//! next resolution.

use crate::rule::GroupRule;
use chrono::Local;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Maps a group name to its capacity rule.
///
/// Consulted the first time a group is encountered after process start or
/// eviction. Invoked under the limiter's internal lock: it must be fast and
/// must not call back into the limiter.
pub type ResolutionCallback = dyn Fn(&str) -> GroupRule + Send + Sync;

struct GroupState {
    rule: GroupRule,
    current: u32,
    /// Set by `set_limit`; such entries show up in `get_limits`.
    explicit: bool,
}

impl GroupState {
    fn admits(&self, now: chrono::NaiveDateTime) -> bool {
        match self.rule {
            GroupRule::Count(limit) => self.current < limit,
            rule => rule.admissible_at(now),
        }
    }
}

struct Shared {
    callback: Box<ResolutionCallback>,
    groups: Mutex<HashMap<String, GroupState>>,
    /// Broadcast to blocked incrementers whenever capacity may have changed.
    changed: Notify,
}

/// A multi-group, multi-dimensional concurrency limiter.
///
/// Clones share state, so a limiter can be handed to any number of tasks.
///
/// ```rust
/// use tollbooth::{GroupLimiter, GroupRule};
///
/// let limiter = GroupLimiter::new(|name| match name {
///     "cpu" => GroupRule::Count(8),
///     "db" => GroupRule::Count(2),
///     other => GroupRule::from_group_name(other),
/// });
///
/// assert!(limiter.increment(&["cpu", "db"]));
/// limiter.decrement(&["cpu", "db"]);
/// ```
#[derive(Clone)]
pub struct GroupLimiter {
    shared: Arc<Shared>,
}

impl GroupLimiter {
    /// Create a limiter whose group rules come from `callback`.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str) -> GroupRule + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                callback: Box::new(callback),
                groups: Mutex::new(HashMap::new()),
                changed: Notify::new(),
            }),
        }
    }

    /// Try to acquire one unit of concurrency in every named group at once.
    ///
    /// Returns `true` and charges every count group iff all groups admit the
    /// increment; otherwise nothing is charged and `false` is returned.
    /// Duplicate names are counted once, and order is irrelevant. Groups
    /// that resolve to [`GroupRule::Unlimited`] contribute nothing.
    pub fn increment(&self, groups: &[&str]) -> bool {
        let mut live = self.shared.groups.lock().unwrap();
        let names = dedup(groups);
        let now = Local::now().naive_local();

        for name in &names {
            if !live.contains_key(*name) {
                match (self.shared.callback)(name) {
                    GroupRule::Unlimited => {}
                    rule => {
                        live.insert(
                            (*name).to_string(),
                            GroupState { rule, current: 0, explicit: false },
                        );
                    }
                }
            }
        }

        for name in &names {
            if let Some(state) = live.get(*name) {
                if !state.admits(now) {
                    return false;
                }
            }
        }

        for name in &names {
            if let Some(state) = live.get_mut(*name) {
                if state.rule.is_count() {
                    state.current += 1;
                }
            }
        }

        true
    }

    /// Like [`increment`](Self::increment), but block up to `wait` for the
    /// groups to become admissible.
    ///
    /// Woken by any [`decrement`](Self::decrement), [`set_limit`](Self::set_limit)
    /// or [`remove_limit`](Self::remove_limit); each wake-up retries the full
    /// acquisition. Returns `false` once `wait` has elapsed, leaving no
    /// partial state behind.
    pub async fn increment_within(&self, groups: &[&str], wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            // Register before the check so a release between the failed
            // attempt and the await is not lost.
            notified.as_mut().enable();

            if self.increment(groups) {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Return one unit of concurrency to every named group.
    ///
    /// Count groups are decremented (clamped at zero) and evicted when they
    /// reach zero, so their next resolution consults the callback afresh.
    /// Unknown groups are ignored; extra decrements are tolerated.
    pub fn decrement(&self, groups: &[&str]) {
        let mut live = self.shared.groups.lock().unwrap();
        for name in dedup(groups) {
            if let Some(state) = live.get_mut(name) {
                if state.rule.is_count() {
                    state.current = state.current.saturating_sub(1);
                }
                if !state.rule.is_count() || state.current == 0 {
                    tracing::trace!(group = name, "evicting idle group");
                    live.remove(name);
                }
            }
        }
        drop(live);
        self.shared.changed.notify_waiters();
    }

    /// Install `rule` for `name`, overriding what the callback would say.
    ///
    /// Existing holders are untouched: lowering a limit below the current
    /// count merely denies further increments until decrements catch up.
    /// The override lives only as long as the group does — once the group is
    /// evicted, the callback's answer applies again.
    pub fn set_limit(&self, name: &str, rule: GroupRule) {
        let mut live = self.shared.groups.lock().unwrap();
        tracing::debug!(group = name, %rule, "setting limit");
        match live.get_mut(name) {
            Some(state) => {
                state.rule = rule;
                state.explicit = true;
            }
            None => {
                if !rule.is_unlimited() {
                    live.insert(name.to_string(), GroupState { rule, current: 0, explicit: true });
                }
            }
        }
        drop(live);
        self.shared.changed.notify_waiters();
    }

    /// Drop `name` from the live table so its next resolution consults the
    /// callback, discarding any [`set_limit`](Self::set_limit) override.
    pub fn remove_limit(&self, name: &str) {
        let mut live = self.shared.groups.lock().unwrap();
        if live.remove(name).is_some() {
            tracing::debug!(group = name, "removed limit");
        }
        drop(live);
        self.shared.changed.notify_waiters();
    }

    /// The smallest count limit among the named groups, or `None` when no
    /// count rule applies (unlimited).
    pub fn get_lowest_limit(&self, groups: &[&str]) -> Option<u32> {
        let live = self.shared.groups.lock().unwrap();
        dedup(groups)
            .into_iter()
            .filter_map(|name| self.resolve_count(&live, name).map(|(limit, _)| limit))
            .min()
    }

    /// The smallest `limit - current` among the named count groups, or
    /// `None` when no count rule applies (unlimited).
    ///
    /// Zero means at least one group is full.
    pub fn get_remaining_capacity(&self, groups: &[&str]) -> Option<u32> {
        let live = self.shared.groups.lock().unwrap();
        dedup(groups)
            .into_iter()
            .filter_map(|name| {
                self.resolve_count(&live, name)
                    .map(|(limit, current)| limit.saturating_sub(current))
            })
            .min()
    }

    /// Snapshot of the count limits installed via [`set_limit`](Self::set_limit)
    /// that are still live. Callback-resolved groups are not included.
    pub fn get_limits(&self) -> HashMap<String, u32> {
        let live = self.shared.groups.lock().unwrap();
        live.iter()
            .filter(|(_, state)| state.explicit)
            .filter_map(|(name, state)| state.rule.count_limit().map(|limit| (name.clone(), limit)))
            .collect()
    }

    /// The rule currently in force for `name`: the live entry's rule if the
    /// group is materialized, otherwise whatever the callback answers now.
    pub fn get_limit(&self, name: &str) -> GroupRule {
        let live = self.shared.groups.lock().unwrap();
        match live.get(name) {
            Some(state) => state.rule,
            None => (self.shared.callback)(name),
        }
    }

    /// Resolve a name to `(limit, current)` without materializing anything.
    fn resolve_count(&self, live: &HashMap<String, GroupState>, name: &str) -> Option<(u32, u32)> {
        match live.get(name) {
            Some(state) => state.rule.count_limit().map(|limit| (limit, state.current)),
            None => (self.shared.callback)(name).count_limit().map(|limit| (limit, 0)),
        }
    }
}

fn dedup<'a>(groups: &[&'a str]) -> Vec<&'a str> {
    let mut names = groups.to_vec();
    names.sort_unstable();
    names.dedup();
    names
}
