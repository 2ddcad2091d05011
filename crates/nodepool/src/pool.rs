//! Per-node connection pool.
//!
//! Hands out reusable connections to one node, bounds how many sockets stay
//! open, and never returns a connection that sat idle past the idle timeout.
//!
//! # Borrow path
//!
//! ```text
//! borrow(creation_timeout)
//!   → pop most recently released idle connection
//!     → idle too long / dead → close it, pop the next one
//!     → usable               → track as outstanding → Ok(conn)
//!   → idle container empty
//!     → hard-limit, outstanding + dialing ≥ capacity
//!         → wait once (grace interval) for a release → retry or Err(Exhausted)
//!     → otherwise reserve a dial slot → factory.dial(address, timeout)
//!         → Ok  → track as outstanding → Ok(conn)
//!         → Err → release reservation  → Err(DialFailed)
//!         → creation timeout → Err(DialFailed(Timeout)); the reservation
//!           stays with the dial until the factory returns
//! ```
//!
//! All shared state sits behind one `parking_lot::Mutex` per pool. The lock is
//! never held across an `.await` or across socket I/O: connections to close
//! are collected under the lock and closed after it is released.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant as TokioInstant;

use crate::connection::{Connection, ConnectionFactory, Transport};
use crate::error::{DialError, PoolError, PoolResult};

/// How long an exhausted hard-limit borrow waits for a release before failing.
pub const DEFAULT_EXHAUSTION_GRACE: Duration = Duration::from_millis(1);

/// Tail of a grace wait that is not trusted to the runtime timer.
const TIMER_SLACK: Duration = Duration::from_millis(2);

/// Admission policy for new connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// Idle + outstanding connections never exceed capacity.
    #[default]
    HardLimit,
    /// Capacity bounds only the idle container; borrows always dial when it is empty.
    SoftCache,
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolMode::HardLimit => write!(f, "hard-limit"),
            PoolMode::SoftCache => write!(f, "soft-cache"),
        }
    }
}

/// Configuration for a single node's pool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolPolicy {
    /// Idle-slot bound; in hard-limit mode also the bound on live connections (default: 256).
    pub capacity: usize,
    /// Admission mode (default: hard-limit).
    pub mode: PoolMode,
    /// Connections unused for this long are closed instead of reused (default: 55s).
    pub idle_timeout: Duration,
    /// Single bounded wait when a hard-limit pool is exhausted (default: 1ms).
    pub exhaustion_grace: Duration,
    /// Creation timeout used when a borrow passes a zero timeout (default: 1s).
    pub dial_timeout: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            capacity: 256,
            mode: PoolMode::HardLimit,
            idle_timeout: Duration::from_secs(55),
            exhaustion_grace: DEFAULT_EXHAUSTION_GRACE,
            dial_timeout: Duration::from_secs(1),
        }
    }
}

/// Point-in-time view of a pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub node: String,
    pub mode: PoolMode,
    pub capacity: usize,
    /// Connections currently borrowed.
    pub outstanding: usize,
    /// Connections sitting in the idle container.
    pub idle: usize,
    /// Dials in progress (they hold capacity in hard-limit mode).
    pub dialing: usize,
    pub closed: bool,
    /// Connections dialed since the pool was created.
    pub created: u64,
    /// Borrows satisfied from the idle container.
    pub reused: u64,
    /// Idle connections found expired (or dead) by the borrow path.
    pub expired_on_borrow: u64,
    /// Idle connections closed by the reaper.
    pub reaped: u64,
    pub dial_failures: u64,
    /// Borrows that failed with [`PoolError::Exhausted`].
    pub exhausted: u64,
    /// Released connections closed instead of queued.
    pub discarded: u64,
}

/// Outcome of closing a pool. Closing is best effort: socket failures are
/// collected here rather than aborting the close.
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Idle connections closed cleanly.
    pub closed_idle: usize,
    /// Borrowed connections whose liveness was revoked.
    pub revoked: usize,
    pub failures: Vec<CloseFailure>,
}

#[derive(Debug)]
pub struct CloseFailure {
    pub conn_id: u64,
    pub error: std::io::Error,
}

/// State shared by every borrower, releaser and the reaper.
#[derive(Debug)]
pub(crate) struct PoolState {
    /// Back is the most recently released connection.
    idle: VecDeque<Connection>,
    /// Liveness flags of borrowed connections, keyed by connection id.
    outstanding: HashMap<u64, Arc<AtomicBool>>,
    dialing: usize,
    capacity: usize,
    closed: bool,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    expired_on_borrow: AtomicU64,
    reaped: AtomicU64,
    dial_failures: AtomicU64,
    exhausted: AtomicU64,
    discarded: AtomicU64,
}

impl PoolCounters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

enum Acquire {
    Idle(Connection),
    Dial(DialSlot),
    Full,
}

/// Capacity reserved for an in-progress dial.
///
/// The slot travels with the dial itself, so it is held until the factory
/// call actually returns, even when the borrow that started it has already
/// timed out or been dropped. Dropping it without [`DialSlot::complete`]
/// gives the capacity back.
struct DialSlot {
    state: Arc<Mutex<PoolState>>,
    returned: Arc<Notify>,
    armed: bool,
}

impl DialSlot {
    fn complete(mut self, pool: &ConnectionPool, mut conn: Connection) -> PoolResult<Connection> {
        self.armed = false;

        let closed = {
            let mut state = self.state.lock();
            state.dialing = state.dialing.saturating_sub(1);
            if !state.closed {
                state.outstanding.insert(conn.id(), conn.liveness());
            }
            state.closed
        };

        if closed {
            let _ = conn.close();
            self.returned.notify_waiters();
            return Err(PoolError::Closed {
                node: pool.node.to_string(),
            });
        }

        PoolCounters::bump(&pool.counters.created, 1);
        tracing::debug!(
            node = %pool.node,
            conn_id = conn.id(),
            "created new connection"
        );
        Ok(conn)
    }
}

impl Drop for DialSlot {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.state.lock();
                state.dialing = state.dialing.saturating_sub(1);
            }
            self.returned.notify_waiters();
        }
    }
}

/// Bounded pool of connections to a single node.
pub struct ConnectionPool {
    node: Arc<str>,
    address: String,
    policy: PoolPolicy,
    factory: Arc<dyn ConnectionFactory>,
    pub(crate) state: Arc<Mutex<PoolState>>,
    /// Signalled whenever capacity or an idle connection may have appeared.
    returned: Arc<Notify>,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub fn new(
        node: impl Into<Arc<str>>,
        address: impl Into<String>,
        policy: PoolPolicy,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(policy.capacity.min(1024)),
            outstanding: HashMap::new(),
            dialing: 0,
            capacity: policy.capacity,
            closed: false,
        };
        Self {
            node: node.into(),
            address: address.into(),
            policy,
            factory,
            state: Arc::new(Mutex::new(state)),
            returned: Arc::new(Notify::new()),
            counters: PoolCounters::default(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Current capacity (may differ from the policy after [`resize`](Self::resize)).
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Borrow a connection, dialing a new one if nothing idle is usable.
    ///
    /// A zero `creation_timeout` falls back to the policy's dial timeout.
    /// In hard-limit mode an exhausted pool waits at most one grace interval
    /// for another caller to release a connection before failing.
    pub async fn borrow(&self, creation_timeout: Duration) -> PoolResult<Connection> {
        let mut grace_deadline: Option<TokioInstant> = None;

        loop {
            // Register before inspecting state so a release between the check
            // and the wait still wakes us.
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.acquire()? {
                Acquire::Idle(conn) => {
                    PoolCounters::bump(&self.counters.reused, 1);
                    tracing::debug!(
                        node = %self.node,
                        conn_id = conn.id(),
                        "reused idle connection from pool"
                    );
                    return Ok(conn);
                }
                Acquire::Dial(slot) => return self.dial(slot, creation_timeout).await,
                Acquire::Full => {
                    let deadline = *grace_deadline.get_or_insert_with(|| {
                        TokioInstant::now() + self.policy.exhaustion_grace
                    });
                    if !wait_for_release(notified, deadline).await {
                        PoolCounters::bump(&self.counters.exhausted, 1);
                        let capacity = self.capacity();
                        tracing::warn!(
                            node = %self.node,
                            capacity = capacity,
                            grace = ?self.policy.exhaustion_grace,
                            "connection pool exhausted"
                        );
                        return Err(PoolError::Exhausted {
                            node: self.node.to_string(),
                            capacity,
                            grace: self.policy.exhaustion_grace,
                        });
                    }
                }
            }
        }
    }

    /// Return a borrowed connection to the pool.
    ///
    /// Live connections get their last-used time refreshed and are queued for
    /// reuse. Dead connections, connections this pool did not hand out, and
    /// anything beyond the idle bound are closed instead. Never waits.
    pub fn release(&self, mut conn: Connection) {
        let now = Instant::now();

        let discarded = {
            let mut state = self.state.lock();
            let tracked = state.outstanding.remove(&conn.id()).is_some();
            let reason = if !tracked {
                Some("not borrowed from this pool")
            } else if !conn.is_live() {
                Some("connection is dead")
            } else if state.idle.len() >= state.capacity {
                Some("idle container full")
            } else {
                None
            };

            match reason {
                Some(reason) => Some((conn, reason)),
                None => {
                    conn.mark_used(now);
                    state.idle.push_back(conn);
                    None
                }
            }
        };

        self.returned.notify_waiters();

        match discarded {
            None => {
                tracing::trace!(node = %self.node, "returned connection to pool");
            }
            Some((mut conn, reason)) => {
                PoolCounters::bump(&self.counters.discarded, 1);
                tracing::debug!(
                    node = %self.node,
                    conn_id = conn.id(),
                    reason = reason,
                    "discarding released connection"
                );
                if let Err(e) = conn.close() {
                    tracing::debug!(node = %self.node, error = %e, "close failed on discard");
                }
            }
        }
    }

    /// Close every idle connection unused for at least the idle timeout as of `now`.
    ///
    /// Borrowed connections are never touched. Does not wait for the pool
    /// lock: a contended pool reports [`PoolError::Contended`] and is retried
    /// on the next pass.
    pub fn reap_idle(&self, now: Instant) -> PoolResult<usize> {
        let expired = {
            let mut state = self.state.try_lock().ok_or_else(|| PoolError::Contended {
                node: self.node.to_string(),
            })?;
            if state.closed {
                return Err(PoolError::Closed {
                    node: self.node.to_string(),
                });
            }

            let idle_timeout = self.policy.idle_timeout;
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            for conn in state.idle.drain(..) {
                if conn.is_live() && conn.idle_for(now) < idle_timeout {
                    kept.push_back(conn);
                } else {
                    expired.push(conn);
                }
            }
            state.idle = kept;
            expired
        };

        let reaped = expired.len();
        close_all(&self.node, expired);

        if reaped > 0 {
            PoolCounters::bump(&self.counters.reaped, reaped as u64);
            tracing::info!(
                node = %self.node,
                reaped = reaped,
                "reaped idle connections"
            );
        }
        Ok(reaped)
    }

    /// Change the capacity. Idle connections beyond the new bound are closed,
    /// oldest first. Returns how many were closed.
    pub fn resize(&self, capacity: usize) -> usize {
        let surplus: Vec<Connection> = {
            let mut state = self.state.lock();
            state.capacity = capacity;
            let excess = state.idle.len().saturating_sub(capacity);
            state.idle.drain(..excess).collect()
        };
        self.returned.notify_waiters();

        let closed = surplus.len();
        close_all(&self.node, surplus);
        tracing::info!(
            node = %self.node,
            capacity = capacity,
            closed = closed,
            "pool resized"
        );
        closed
    }

    /// Close the pool: close idle connections, revoke borrowed ones, and fail
    /// every later borrow with [`PoolError::Closed`]. Calling it again is a no-op.
    pub fn close(&self) -> CloseReport {
        let (idle, revoked) = {
            let mut state = self.state.lock();
            if state.closed {
                return CloseReport::default();
            }
            state.closed = true;
            let idle: Vec<Connection> = state.idle.drain(..).collect();
            let revoked: Vec<Arc<AtomicBool>> =
                state.outstanding.drain().map(|(_, live)| live).collect();
            (idle, revoked)
        };
        self.returned.notify_waiters();

        for live in &revoked {
            live.store(false, Ordering::Release);
        }

        let mut report = CloseReport {
            revoked: revoked.len(),
            ..CloseReport::default()
        };
        for mut conn in idle {
            match conn.close() {
                Ok(()) => report.closed_idle += 1,
                Err(error) => report.failures.push(CloseFailure {
                    conn_id: conn.id(),
                    error,
                }),
            }
        }

        tracing::info!(
            node = %self.node,
            closed_idle = report.closed_idle,
            revoked = report.revoked,
            failures = report.failures.len(),
            "connection pool closed"
        );
        report
    }

    pub fn stats(&self) -> PoolStats {
        let (capacity, outstanding, idle, dialing, closed) = {
            let state = self.state.lock();
            (
                state.capacity,
                state.outstanding.len(),
                state.idle.len(),
                state.dialing,
                state.closed,
            )
        };
        let c = &self.counters;
        PoolStats {
            node: self.node.to_string(),
            mode: self.policy.mode,
            capacity,
            outstanding,
            idle,
            dialing,
            closed,
            created: c.created.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            expired_on_borrow: c.expired_on_borrow.load(Ordering::Relaxed),
            reaped: c.reaped.load(Ordering::Relaxed),
            dial_failures: c.dial_failures.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            node = %stats.node,
            mode = %stats.mode,
            capacity = stats.capacity,
            outstanding = stats.outstanding,
            idle = stats.idle,
            dialing = stats.dialing,
            created = stats.created,
            reused = stats.reused,
            exhausted = stats.exhausted,
            "pool statistics"
        );
    }

    /// Take a usable idle connection, or decide whether this borrow may dial.
    fn acquire(&self) -> PoolResult<Acquire> {
        let now = Instant::now();
        let mut expired = Vec::new();

        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Closed {
                    node: self.node.to_string(),
                });
            }

            loop {
                match state.idle.pop_back() {
                    Some(conn) if conn.is_live() && conn.idle_for(now) < self.policy.idle_timeout => {
                        state.outstanding.insert(conn.id(), conn.liveness());
                        break Acquire::Idle(conn);
                    }
                    Some(conn) => expired.push(conn),
                    None => {
                        let in_use = state.outstanding.len() + state.dialing;
                        if self.policy.mode == PoolMode::HardLimit && in_use >= state.capacity {
                            break Acquire::Full;
                        }
                        state.dialing += 1;
                        break Acquire::Dial(DialSlot {
                            state: Arc::clone(&self.state),
                            returned: Arc::clone(&self.returned),
                            armed: true,
                        });
                    }
                }
            }
        };

        if !expired.is_empty() {
            PoolCounters::bump(&self.counters.expired_on_borrow, expired.len() as u64);
            tracing::debug!(
                node = %self.node,
                expired = expired.len(),
                "closed idle-expired connections on borrow"
            );
            close_all(&self.node, expired);
        }
        Ok(outcome)
    }

    async fn dial(&self, slot: DialSlot, creation_timeout: Duration) -> PoolResult<Connection> {
        let timeout = if creation_timeout.is_zero() {
            self.policy.dial_timeout
        } else {
            creation_timeout
        };

        let factory = Arc::clone(&self.factory);
        let address = self.address.clone();
        let node = Arc::clone(&self.node);
        let (tx, mut rx) = oneshot::channel::<(DialSlot, DialOutcome)>();
        tokio::task::spawn_blocking(move || {
            let dialed = factory.dial(&address, timeout);
            if let Err((slot, dialed)) = tx.send((slot, dialed)) {
                discard_late_dial(&node, slot, dialed);
            }
        });

        let waited = tokio::time::timeout(timeout, &mut rx).await;
        let dialed = match waited {
            Ok(Ok((slot, Ok(transport)))) => Ok((slot, transport)),
            Ok(Ok((slot, Err(e)))) => {
                drop(slot);
                Err(e)
            }
            Ok(Err(_)) => Err(DialError::Aborted("dial task ended without a result".to_string())),
            Err(_) => {
                // From here on the dial thread owns the reservation; a result
                // that already arrived is discarded the same way.
                rx.close();
                if let Ok((slot, dialed)) = rx.try_recv() {
                    discard_late_dial(&self.node, slot, dialed);
                }
                Err(DialError::Timeout(timeout))
            }
        };

        match dialed {
            Ok((slot, transport)) => {
                slot.complete(self, Connection::new(Arc::clone(&self.node), transport))
            }
            Err(source) => {
                PoolCounters::bump(&self.counters.dial_failures, 1);
                tracing::warn!(
                    node = %self.node,
                    address = %self.address,
                    error = %source,
                    "failed to dial node"
                );
                Err(PoolError::DialFailed {
                    node: self.node.to_string(),
                    source,
                })
            }
        }
    }
}

type DialOutcome = Result<Box<dyn Transport>, DialError>;

/// Close a transport nobody is waiting for, then give its capacity back.
fn discard_late_dial(node: &str, slot: DialSlot, dialed: DialOutcome) {
    if let Ok(mut transport) = dialed {
        tracing::debug!(node = %node, "closing connection dialed after its borrow gave up");
        if let Err(e) = transport.close() {
            tracing::debug!(node = %node, error = %e, "close failed on late dial");
        }
    }
    drop(slot);
}

/// Wait for a release until `deadline`. Returns false once the deadline passes.
///
/// The runtime timer only fires on whole-millisecond ticks and rounds up, so
/// it is used for the bulk of the wait and the last [`TIMER_SLACK`] is spent
/// yielding and re-checking the clock.
async fn wait_for_release(mut notified: Pin<&mut Notified<'_>>, deadline: TokioInstant) -> bool {
    if let Some(coarse) = deadline.checked_sub(TIMER_SLACK) {
        if coarse > TokioInstant::now()
            && tokio::time::timeout_at(coarse, notified.as_mut()).await.is_ok()
        {
            return true;
        }
    }

    loop {
        if TokioInstant::now() >= deadline {
            return false;
        }
        tokio::select! {
            biased;
            _ = notified.as_mut() => return true,
            _ = tokio::task::yield_now() => {}
        }
    }
}

fn close_all(node: &str, conns: Vec<Connection>) {
    for mut conn in conns {
        if let Err(e) = conn.close() {
            tracing::debug!(node = %node, conn_id = conn.id(), error = %e, "close failed");
        }
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("node", &self.node)
            .field("address", &self.address)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
