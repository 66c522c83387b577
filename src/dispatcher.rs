//! Schedules asynchronous calls under a global concurrency limit and a
//! per-host limit.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::{call::CallInner, error::Error, response::Response, sync::Mutex};

type Job = Box<dyn FnOnce() + Send>;
pub(crate) type Callback = Box<dyn FnOnce(crate::Result<Response>) + Send>;

/// How long an idle worker thread lingers before exiting.
const WORKER_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// A cached thread pool: workers are spawned on demand, park on the queue
/// between jobs, and exit after an idle minute. It can always serve as many
/// concurrent jobs as the dispatcher admits.
struct Executor {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    idle_workers: Arc<AtomicUsize>,
    shut_down: AtomicBool,
}

impl Executor {
    fn new() -> Executor {
        let (tx, rx) = unbounded();
        Executor {
            tx,
            rx,
            idle_workers: Arc::new(AtomicUsize::new(0)),
            shut_down: AtomicBool::new(false),
        }
    }

    fn execute(&self, job: Job) -> Result<(), ()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(());
        }
        if self.idle_workers.load(Ordering::SeqCst) == 0 {
            self.spawn_worker();
        }
        self.tx.send(job).map_err(|_| ())
    }

    fn spawn_worker(&self) {
        let rx = self.rx.clone();
        let idle_workers = self.idle_workers.clone();
        let spawned = thread::Builder::new()
            .name("courier-dispatcher".into())
            .spawn(move || loop {
                idle_workers.fetch_add(1, Ordering::SeqCst);
                let job = rx.recv_timeout(WORKER_KEEP_ALIVE);
                idle_workers.fetch_sub(1, Ordering::SeqCst);
                match job {
                    Ok(job) => job(),
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return,
                }
            });
        if let Err(e) = spawned {
            log::warn!("failed to spawn dispatcher worker: {e}");
        }
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// An enqueued call waiting for, or occupying, a dispatcher slot. All async
/// calls to one host share one in-flight counter.
pub(crate) struct AsyncCall {
    pub(crate) call: Arc<CallInner>,
    host: String,
    per_host: Arc<AtomicUsize>,
    callback: Mutex<Option<Callback>>,
}

impl AsyncCall {
    fn deliver(&self, result: crate::Result<Response>) {
        if let Some(callback) = self.callback.lock().take() {
            callback(result);
        }
    }
}

struct State {
    max_requests: usize,
    max_requests_per_host: usize,
    ready: VecDeque<Arc<AsyncCall>>,
    running_async: Vec<Arc<AsyncCall>>,
    running_sync: Vec<Arc<CallInner>>,
    idle_callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

struct DispatcherInner {
    state: Mutex<State>,
    executor: Executor,
}

/// Policy on when asynchronous calls run.
///
/// Admission happens in enqueue order: a host at its limit is skipped (a
/// later call to another host may still start), while a full global budget
/// stops the scan outright.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Default for Dispatcher {
    fn default() -> Dispatcher {
        Dispatcher::new(64, 5)
    }
}

impl Dispatcher {
    pub fn new(max_requests: usize, max_requests_per_host: usize) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(State {
                    max_requests,
                    max_requests_per_host,
                    ready: VecDeque::new(),
                    running_async: Vec::new(),
                    running_sync: Vec::new(),
                    idle_callback: None,
                }),
                executor: Executor::new(),
            }),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.inner.state.lock().max_requests
    }

    pub fn set_max_requests(&self, max: usize) {
        self.inner.state.lock().max_requests = max;
        self.promote_and_execute();
    }

    pub fn max_requests_per_host(&self) -> usize {
        self.inner.state.lock().max_requests_per_host
    }

    pub fn set_max_requests_per_host(&self, max: usize) {
        self.inner.state.lock().max_requests_per_host = max;
        self.promote_and_execute();
    }

    /// Runs whenever the dispatcher goes idle (no calls running).
    pub fn set_idle_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.state.lock().idle_callback = Some(Arc::new(callback));
    }

    /// Calls currently executing, synchronous included.
    pub fn running_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.running_async.len() + state.running_sync.len()
    }

    /// Async calls admitted but not yet running.
    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// Stops accepting work; queued calls still drain, new submissions fail.
    pub fn shutdown(&self) {
        self.inner.executor.shutdown();
    }

    /// Cancels every call, queued or running.
    pub fn cancel_all(&self) {
        let calls: Vec<Arc<CallInner>> = {
            let state = self.inner.state.lock();
            state
                .ready
                .iter()
                .chain(state.running_async.iter())
                .map(|ac| ac.call.clone())
                .chain(state.running_sync.iter().cloned())
                .collect()
        };
        for call in calls {
            call.cancel();
        }
    }

    pub(crate) fn enqueue(&self, call: Arc<CallInner>, callback: Callback) {
        let host = call
            .request()
            .url()
            .host_str()
            .unwrap_or("")
            .to_ascii_lowercase();

        {
            let mut state = self.inner.state.lock();
            // All calls to one host share a counter, whether waiting or
            // running, so the per-host limit sees them all.
            let per_host = state
                .running_async
                .iter()
                .chain(state.ready.iter())
                .find(|other| other.host == host)
                .map(|other| other.per_host.clone())
                .unwrap_or_default();

            state.ready.push_back(Arc::new(AsyncCall {
                call,
                host,
                per_host,
                callback: Mutex::new(Some(callback)),
            }));
        }

        self.promote_and_execute();
    }

    pub(crate) fn executed(&self, call: Arc<CallInner>) {
        self.inner.state.lock().running_sync.push(call);
    }

    pub(crate) fn finished_sync(&self, call: &Arc<CallInner>) {
        {
            let mut state = self.inner.state.lock();
            state.running_sync.retain(|c| !Arc::ptr_eq(c, call));
        }
        self.finished_common();
    }

    fn finished_async(&self, async_call: &Arc<AsyncCall>) {
        {
            let mut state = self.inner.state.lock();
            state
                .running_async
                .retain(|c| !Arc::ptr_eq(c, async_call));
        }
        async_call.per_host.fetch_sub(1, Ordering::SeqCst);
        self.finished_common();
    }

    fn finished_common(&self) {
        let still_running = self.promote_and_execute();
        if !still_running {
            let idle_callback = self.inner.state.lock().idle_callback.clone();
            if let Some(callback) = idle_callback {
                callback();
            }
        }
    }

    /// Moves eligible calls from `ready` to `running_async` and hands them
    /// to the executor. Never runs application code while holding the lock.
    fn promote_and_execute(&self) -> bool {
        let mut executable: Vec<Arc<AsyncCall>> = Vec::new();
        let still_running;
        {
            let mut state = self.inner.state.lock();
            let mut i = 0;
            while i < state.ready.len() {
                // The global limit is order-independent: nothing later can
                // start either.
                if state.running_async.len() >= state.max_requests {
                    break;
                }
                // The per-host limit is not: skip, a later call may target
                // another host.
                if state.ready[i].per_host.load(Ordering::SeqCst)
                    >= state.max_requests_per_host
                {
                    i += 1;
                    continue;
                }
                let admitted = state.ready.remove(i).expect("index is in bounds");
                admitted.per_host.fetch_add(1, Ordering::SeqCst);
                state.running_async.push(admitted.clone());
                executable.push(admitted);
            }
            still_running = !state.running_async.is_empty() || !state.running_sync.is_empty();
        }

        for async_call in executable {
            self.execute_on(async_call);
        }

        still_running
    }

    fn execute_on(&self, async_call: Arc<AsyncCall>) {
        let dispatcher = self.clone();
        let job_call = async_call.clone();
        let job: Job = Box::new(move || {
            let result = CallInner::run(&job_call.call);
            // Free this call's slot before notifying, so a waiting call's
            // promotion is never ordered after the callback.
            dispatcher.finished_async(&job_call);
            job_call.deliver(result);
        });

        if self.inner.executor.execute(job).is_err() {
            log::warn!("executor rejected call to {}", async_call.call.request().url());
            self.finished_async(&async_call);
            async_call.deliver(Err(Error::io("executor rejected the call")));
        }
    }
}
