use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    address::Address,
    call::CallInner,
    connection::Connection,
    route::Route,
    sync::Mutex,
    task::TaskRunner,
    util::{duration_to_nanos, now_nanos},
};

/// Holds connections between calls so they can be reused.
///
/// Eviction runs on the shared task runner: whenever a connection enters the
/// pool a cleanup pass is scheduled, and each pass reports when the next one
/// is due. Connections whose calls were dropped without closing their
/// response bodies are detected here and logged with the site that acquired
/// them.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolShared>,
}

struct PoolShared {
    max_idle: usize,
    keep_alive: Duration,
    connections: Mutex<VecDeque<Arc<Connection>>>,
    cleanup_running: AtomicBool,
}

impl Default for ConnectionPool {
    fn default() -> ConnectionPool {
        ConnectionPool::new(5, Duration::from_secs(5 * 60))
    }
}

impl ConnectionPool {
    /// A pool keeping at most `max_idle` idle connections, each for at most
    /// `keep_alive`.
    pub fn new(max_idle: usize, keep_alive: Duration) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(PoolShared {
                max_idle,
                keep_alive,
                connections: Mutex::new(VecDeque::new()),
                cleanup_running: AtomicBool::new(false),
            }),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn idle_connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|c| c.in_flight_calls() == 0)
            .count()
    }

    /// Attaches `call` to a pooled connection eligible for `address`,
    /// returning it. `routes` enables cross-hostname coalescing;
    /// `require_multiplexed` restricts the search to HTTP/2 connections.
    pub(crate) fn try_acquire(
        &self,
        address: &Address,
        call: &Arc<CallInner>,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
    ) -> Option<Arc<Connection>> {
        let found = {
            let connections = self.inner.connections.lock();
            connections
                .iter()
                .find(|connection| {
                    if require_multiplexed && !connection.is_multiplexed() {
                        return false;
                    }
                    connection.is_eligible(address, routes)
                })
                .cloned()
        };

        let connection = found?;
        call.acquire_connection(&connection);
        log::trace!("acquired pooled {:?}", connection);
        Some(connection)
    }

    pub(crate) fn put(&self, connection: Arc<Connection>) {
        self.inner.connections.lock().push_back(connection);
        self.schedule_cleanup();
    }

    /// A call just released `connection` and nothing else is using it.
    /// Returns true when the caller must close it instead of pooling it.
    pub(crate) fn connection_became_idle(&self, connection: &Arc<Connection>) -> bool {
        if connection.no_new_exchanges_set() || self.inner.max_idle == 0 {
            let mut connections = self.inner.connections.lock();
            connections.retain(|c| !Arc::ptr_eq(c, connection));
            return true;
        }
        connection.set_idle_at_nanos(now_nanos());
        self.schedule_cleanup();
        false
    }

    /// Closes and removes every connection not carrying a call.
    pub fn evict_all(&self) {
        let mut to_close = Vec::new();
        {
            let mut connections = self.inner.connections.lock();
            connections.retain(|connection| {
                if connection.in_flight_calls() == 0 {
                    connection.no_new_exchanges();
                    to_close.push(connection.clone());
                    false
                } else {
                    true
                }
            });
        }
        for connection in to_close {
            log::debug!("evicting {:?}", connection);
            connection.close();
        }
    }

    fn schedule_cleanup(&self) {
        if self.inner.cleanup_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.clone();
        TaskRunner::global().schedule("pool-cleanup", Duration::ZERO, move || {
            let wait_nanos = pool.cleanup(now_nanos());
            if wait_nanos == -1 {
                pool.inner.cleanup_running.store(false, Ordering::SeqCst);
                None
            } else {
                Some(Duration::from_nanos(wait_nanos as u64))
            }
        });
    }

    /// One maintenance pass: sweep leaked calls, evict the connection most
    /// overdue for it, and report when to run again (`-1` for never, `0` for
    /// immediately).
    pub(crate) fn cleanup(&self, now: u64) -> i64 {
        let keep_alive_nanos = duration_to_nanos(self.inner.keep_alive);

        let mut in_use_count = 0usize;
        let mut idle_count = 0usize;
        let mut longest_idle: Option<Arc<Connection>> = None;
        let mut longest_idle_at = u64::MAX;

        let to_close = {
            let mut connections = self.inner.connections.lock();

            for connection in connections.iter() {
                if self.sweep_leaked_calls(connection, now, keep_alive_nanos) > 0 {
                    in_use_count += 1;
                    continue;
                }
                idle_count += 1;
                let idle_at = connection.idle_at_nanos();
                if idle_at < longest_idle_at {
                    longest_idle_at = idle_at;
                    longest_idle = Some(connection.clone());
                }
            }

            let overdue = longest_idle_at != u64::MAX
                && now.saturating_sub(longest_idle_at) >= keep_alive_nanos;
            if overdue || idle_count > self.inner.max_idle {
                let victim = longest_idle.expect("idle_count > 0 implies a longest-idle victim");
                victim.no_new_exchanges();
                connections.retain(|c| !Arc::ptr_eq(c, &victim));
                Some(victim)
            } else {
                None
            }
        };

        // Sockets close outside the lock.
        if let Some(victim) = to_close {
            log::debug!("evicting idle {:?}", victim);
            victim.close();
            return 0;
        }

        if idle_count > 0 {
            let idle_for = now.saturating_sub(longest_idle_at).min(keep_alive_nanos);
            return (keep_alive_nanos - idle_for) as i64;
        }
        if in_use_count > 0 {
            return keep_alive_nanos as i64;
        }
        -1
    }

    /// Drops call references whose calls were garbage collected without
    /// finishing, logging each as a leak. Returns the live reference count.
    fn sweep_leaked_calls(
        &self,
        connection: &Arc<Connection>,
        now: u64,
        keep_alive_nanos: u64,
    ) -> usize {
        let mut state = connection.state.lock();
        state.calls.retain(|reference| {
            if reference.call.strong_count() > 0 {
                return true;
            }
            log::warn!(
                "a connection to {:?} was leaked; did you forget to close a response body? \
                 acquired at:\n{}",
                connection.route(),
                reference.captured_at
            );
            false
        });

        if state.calls.is_empty() && state.idle_at_nanos == u64::MAX {
            // Everything leaked: make the connection immediately evictable.
            state.idle_at_nanos = now.saturating_sub(keep_alive_nanos);
        }
        state.calls.len()
    }
}
