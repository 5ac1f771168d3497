//! Per-resource token dispenser with spacing and liveness timeouts.
//!
//! A [`RateProtector`] guards a delicate resource by handing out up to a
//! fixed number of simultaneous tokens, spacing successive grants by a
//! minimum delay, and clawing tokens back from holders that go quiet for
//! longer than a release timeout. Requests queue FIFO; the head of the
//! queue blocks everything behind it on purpose, so a large request cannot
//! be starved by a stream of small ones.
//!
//! All timing runs on the tokio clock, so tests can pause and step time
//! deterministically.

use crate::error::TollboothError;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use uuid::Uuid;

/// How long an idle scheduler sleeps between looks at the world. Bounds how
/// long an orphaned scheduler task outlives its protector.
const IDLE_TICK: Duration = Duration::from_millis(250);

/// Opaque, unforgeable handle to a token request.
///
/// Receipts are random, so a guessed receipt cannot release someone else's
/// holding; operations on unknown receipts are silent no-ops.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Receipt(String);

impl Receipt {
    fn issue(name: &str) -> Self {
        Receipt(format!("{}:{}", name, Uuid::new_v4()))
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reports how many tokens the protected resource can bear right now.
///
/// Consulted before each grant attempt; the effective capacity is the
/// smaller of its answer and the configured maximum. Invoked under the
/// protector's internal lock: it must be fast and must not call back into
/// the protector.
pub type AvailabilityCallback = dyn Fn() -> u32 + Send + Sync;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ReceiptStatus {
    Pending,
    Granted,
    /// Terminal: released, cancelled, or shut down.
    Denied,
}

#[derive(Clone, Copy)]
enum Phase {
    Pending,
    Granted { granted_at: Instant, last_touch: Instant },
}

struct Request {
    tokens: u32,
    phase: Phase,
    status_tx: watch::Sender<ReceiptStatus>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Receipt>,
    requests: HashMap<Receipt, Request>,
    in_use: u32,
    last_grant_at: Option<Instant>,
    availability: Option<Arc<AvailabilityCallback>>,
    /// While the availability oracle reports the pool too busy, the head is
    /// re-attempted once per scheduling tick, not once per wake-up.
    next_attempt_at: Option<Instant>,
    shut_down: bool,
}

struct Shared {
    name: String,
    delay_between_grants: Duration,
    max_simultaneous: u32,
    release_timeout: Duration,
    state: Mutex<State>,
    /// Wakes the scheduler when the queue or pool changes.
    kick: Arc<Notify>,
}

/// A bounded token pool with minimum inter-grant spacing and auto-release
/// of inactive holders.
///
/// Clones share state. Must be created inside a tokio runtime (a scheduler
/// task is spawned on construction).
///
/// ```rust
/// use std::time::Duration;
/// use tollbooth::RateProtector;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let protector =
///     RateProtector::new("archive", Duration::from_millis(50), 3, Duration::from_secs(1));
///
/// let receipt = protector.request(1).expect("within pool size");
/// assert!(protector.wait_until_granted(&receipt).await);
/// protector.release(&receipt);
/// # }
/// ```
#[derive(Clone)]
pub struct RateProtector {
    shared: Arc<Shared>,
}

impl RateProtector {
    /// Create a protector for the named resource.
    ///
    /// At most `max_simultaneous` tokens are out at once, successive grants
    /// are at least `delay_between_grants` apart, and a granted request that
    /// is neither touched nor released for `release_timeout` is released on
    /// the holder's behalf.
    pub fn new(
        name: impl Into<String>,
        delay_between_grants: Duration,
        max_simultaneous: u32,
        release_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            delay_between_grants,
            max_simultaneous,
            release_timeout,
            state: Mutex::new(State::default()),
            kick: Arc::new(Notify::new()),
        });
        tokio::spawn(run_scheduler(Arc::downgrade(&shared), shared.kick.clone()));
        Self { shared }
    }

    /// The name of the protected resource.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue a request for `tokens` tokens and return its receipt at once.
    ///
    /// The grant itself happens later, in FIFO order; wait for it with
    /// [`wait_until_granted`](Self::wait_until_granted) or poll with
    /// [`granted`](Self::granted).
    pub fn request(&self, tokens: u32) -> Result<Receipt, TollboothError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.shut_down {
            return Err(TollboothError::ShutDown);
        }
        if tokens > self.shared.max_simultaneous {
            return Err(TollboothError::OverMaximumTokens {
                requested: tokens,
                max: self.shared.max_simultaneous,
            });
        }

        let receipt = Receipt::issue(&self.shared.name);
        let (status_tx, _) = watch::channel(ReceiptStatus::Pending);
        state
            .requests
            .insert(receipt.clone(), Request { tokens, phase: Phase::Pending, status_tx });
        state.queue.push_back(receipt.clone());
        drop(state);

        self.shared.kick.notify_one();
        Ok(receipt)
    }

    /// Block until the request is granted.
    ///
    /// Returns `true` while the receipt holds a grant, `false` for unknown,
    /// cancelled, released, or shut-down receipts.
    pub async fn wait_until_granted(&self, receipt: &Receipt) -> bool {
        let mut status_rx = {
            let state = self.shared.state.lock().unwrap();
            match state.requests.get(receipt) {
                Some(request) => request.status_tx.subscribe(),
                None => return false,
            }
        };

        loop {
            match *status_rx.borrow_and_update() {
                ReceiptStatus::Granted => return true,
                ReceiptStatus::Denied => return false,
                ReceiptStatus::Pending => {}
            }
            if status_rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Like [`wait_until_granted`](Self::wait_until_granted), but give up
    /// after `timeout`.
    ///
    /// A request still pending when the timeout fires is removed from the
    /// queue and terminally denied; later waits and polls on the receipt
    /// report `false`.
    pub async fn wait_until_granted_timeout(&self, receipt: &Receipt, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.wait_until_granted(receipt)).await {
            Ok(granted) => granted,
            Err(_) => self.cancel_if_pending(receipt),
        }
    }

    /// Resolve a timed-out wait: cancel the request if it is still pending,
    /// or report a grant that raced the timeout.
    fn cancel_if_pending(&self, receipt: &Receipt) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let pending = match state.requests.get(receipt) {
            Some(request) => matches!(request.phase, Phase::Pending),
            None => return false,
        };
        if !pending {
            // Granted while the timeout was firing; the caller owns it.
            return true;
        }

        state.queue.retain(|queued| queued != receipt);
        let request = state.requests.remove(receipt).unwrap();
        request.status_tx.send_replace(ReceiptStatus::Denied);
        drop(state);

        tracing::debug!(name = %self.shared.name, %receipt, "wait timed out, request cancelled");
        self.shared.kick.notify_one();
        false
    }

    /// Poll the request's state without blocking.
    ///
    /// Returns `(granted, keep_checking)`:
    ///
    /// - `(false, true)` — still pending, poll again later
    /// - `(true, false)` — granted; also refreshes the inactivity timer,
    ///   like [`touch`](Self::touch)
    /// - `(false, false)` — terminally not granted
    pub fn granted(&self, receipt: &Receipt) -> (bool, bool) {
        let mut state = self.shared.state.lock().unwrap();
        match state.requests.get_mut(receipt) {
            Some(request) => match &mut request.phase {
                Phase::Pending => (false, true),
                Phase::Granted { last_touch, .. } => {
                    *last_touch = Instant::now();
                    (true, false)
                }
            },
            None => (false, false),
        }
    }

    /// Refresh the inactivity timer of each granted receipt, deferring its
    /// auto-release. Pending, released, and unknown receipts are ignored.
    pub fn touch(&self, receipts: &[Receipt]) {
        let now = Instant::now();
        let mut state = self.shared.state.lock().unwrap();
        for receipt in receipts {
            if let Some(request) = state.requests.get_mut(receipt) {
                if let Phase::Granted { last_touch, .. } = &mut request.phase {
                    *last_touch = now;
                }
            }
        }
    }

    /// Return a granted receipt's tokens to the pool.
    ///
    /// No-op (and harmless) for pending, already-released, or unknown
    /// receipts.
    pub fn release(&self, receipt: &Receipt) {
        let released = {
            let mut state = self.shared.state.lock().unwrap();
            self.shared.release_locked(&mut state, receipt)
        };
        if released {
            self.shared.kick.notify_one();
        }
    }

    /// Schedule [`release`](Self::release) to run after `delay`.
    ///
    /// If the receipt is released sooner by other means, the scheduled
    /// release is a no-op.
    pub fn release_after(&self, receipt: &Receipt, delay: Duration) {
        let shared = Arc::downgrade(&self.shared);
        let receipt = receipt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                let released = {
                    let mut state = shared.state.lock().unwrap();
                    shared.release_locked(&mut state, &receipt)
                };
                if released {
                    shared.kick.notify_one();
                }
            }
        });
    }

    /// Install an availability oracle consulted before each grant attempt.
    ///
    /// The effective pool size becomes `min(max_simultaneous, callback())`,
    /// re-read on every attempt, so a struggling resource can temporarily
    /// starve the queue.
    pub fn set_availability_callback<F>(&self, callback: F)
    where
        F: Fn() -> u32 + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        state.availability = Some(Arc::new(callback));
        state.next_attempt_at = None;
        drop(state);
        self.shared.kick.notify_one();
    }

    /// Shut the protector down.
    ///
    /// All pending requests are terminally denied, blocked waits return
    /// `false`, held state is dropped, and future [`request`](Self::request)
    /// calls fail with [`TollboothError::ShutDown`]. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.queue.clear();
        for (_, request) in state.requests.drain() {
            request.status_tx.send_replace(ReceiptStatus::Denied);
        }
        state.in_use = 0;
        drop(state);

        tracing::debug!(name = %self.shared.name, "shut down");
        self.shared.kick.notify_one();
    }
}

impl Shared {
    /// Release `receipt` if it currently holds a grant. Caller kicks the
    /// scheduler when this returns true.
    fn release_locked(&self, state: &mut State, receipt: &Receipt) -> bool {
        let held = matches!(
            state.requests.get(receipt).map(|request| &request.phase),
            Some(Phase::Granted { .. })
        );
        if !held {
            return false;
        }

        let request = state.requests.remove(receipt).unwrap();
        if let Phase::Granted { granted_at, .. } = request.phase {
            tracing::debug!(
                name = %self.name,
                %receipt,
                tokens = request.tokens,
                held_for = ?granted_at.elapsed(),
                "released",
            );
        }
        state.in_use -= request.tokens;
        // freed capacity warrants an immediate fresh attempt
        state.next_attempt_at = None;
        request.status_tx.send_replace(ReceiptStatus::Denied);
        true
    }

    fn effective_capacity(&self, state: &State) -> u32 {
        match &state.availability {
            Some(callback) => callback().min(self.max_simultaneous),
            None => self.max_simultaneous,
        }
    }

    /// One scheduler pass: auto-release quiet holders, then grant from the
    /// head of the queue while capacity and spacing allow.
    ///
    /// Returns `(exit, next_deadline)`; `exit` is set once the protector is
    /// shut down.
    fn drive(&self) -> (bool, Option<Instant>) {
        let mut state = self.state.lock().unwrap();
        if state.shut_down {
            return (true, None);
        }

        let now = Instant::now();
        let mut next: Option<Instant> = None;

        let overdue: Vec<Receipt> = state
            .requests
            .iter()
            .filter_map(|(receipt, request)| match request.phase {
                Phase::Granted { last_touch, .. }
                    if now.duration_since(last_touch) >= self.release_timeout =>
                {
                    Some(receipt.clone())
                }
                _ => None,
            })
            .collect();
        for receipt in overdue {
            tracing::debug!(name = %self.name, %receipt, "auto-releasing inactive holder");
            self.release_locked(&mut state, &receipt);
        }

        for request in state.requests.values() {
            if let Phase::Granted { last_touch, .. } = request.phase {
                next = earliest(next, last_touch + self.release_timeout);
            }
        }

        while let Some(head) = state.queue.front().cloned() {
            let Some(tokens) = state.requests.get(&head).map(|request| request.tokens) else {
                state.queue.pop_front();
                continue;
            };

            if state.availability.is_some() {
                if let Some(attempt_at) = state.next_attempt_at {
                    if now < attempt_at {
                        next = earliest(next, attempt_at);
                        break;
                    }
                }
            }

            let capacity = self.effective_capacity(&state);
            if state.in_use + tokens > capacity {
                // Head-of-line blocking: wait for a release, or re-poll the
                // oracle on the next scheduling tick.
                if state.availability.is_some() {
                    state.next_attempt_at = Some(now + self.delay_between_grants);
                    if !self.delay_between_grants.is_zero() {
                        next = earliest(next, now + self.delay_between_grants);
                    }
                }
                break;
            }

            if let Some(last_grant_at) = state.last_grant_at {
                let ready_at = last_grant_at + self.delay_between_grants;
                if now < ready_at {
                    next = earliest(next, ready_at);
                    break;
                }
            }

            state.queue.pop_front();
            state.in_use += tokens;
            state.last_grant_at = Some(now);
            state.next_attempt_at = None;
            let in_use = state.in_use;
            let request = state.requests.get_mut(&head).unwrap();
            request.phase = Phase::Granted { granted_at: now, last_touch: now };
            request.status_tx.send_replace(ReceiptStatus::Granted);
            next = earliest(next, now + self.release_timeout);
            tracing::debug!(name = %self.name, receipt = %head, tokens, in_use, "granted");
        }

        (false, next)
    }
}

fn earliest(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(match current {
        Some(existing) => existing.min(candidate),
        None => candidate,
    })
}

/// The per-protector scheduler: sleeps until the next spacing, auto-release,
/// or oracle-poll deadline, or until a kick, and drives grants. Holds only a
/// weak reference so it dies with the last protector handle.
async fn run_scheduler(shared: Weak<Shared>, kick: Arc<Notify>) {
    loop {
        let next = match shared.upgrade() {
            Some(shared) => {
                let (exit, next) = shared.drive();
                if exit {
                    return;
                }
                next
            }
            None => return,
        };

        let idle_cap = Instant::now() + IDLE_TICK;
        let until = next.map_or(idle_cap, |deadline| deadline.min(idle_cap));
        tokio::select! {
            _ = kick.notified() => {}
            _ = tokio::time::sleep_until(until) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn receipts_are_distinct_and_named() {
        let protector =
            RateProtector::new("irods", Duration::from_millis(10), 2, Duration::from_secs(1));
        let first = protector.request(1).unwrap();
        let second = protector.request(1).unwrap();
        assert_ne!(first, second);
        assert!(first.to_string().starts_with("irods:"));
    }

    #[tokio::test(start_paused = true)]
    async fn request_checks_pool_size_before_queueing() {
        let protector =
            RateProtector::new("small", Duration::ZERO, 2, Duration::from_secs(1));
        let err = protector.request(3).unwrap_err();
        assert_eq!(err, TollboothError::OverMaximumTokens { requested: 3, max: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_receipts_are_ignored() {
        let ours = RateProtector::new("ours", Duration::ZERO, 1, Duration::from_secs(1));
        let theirs = RateProtector::new("theirs", Duration::ZERO, 1, Duration::from_secs(1));

        let stranger = theirs.request(1).unwrap();
        assert!(!ours.wait_until_granted(&stranger).await);
        assert_eq!(ours.granted(&stranger), (false, false));
        ours.touch(std::slice::from_ref(&stranger));
        ours.release(&stranger);

        let receipt = ours.request(1).unwrap();
        assert!(ours.wait_until_granted(&receipt).await);
    }
}
