//! A shared scheduler thread for deferred housekeeping: connection pool
//! cleanup passes and per-call deadlines.
//!
//! Jobs run on the scheduler thread and must not block on I/O or take the
//! pool lock longer than a cleanup pass needs. A job returns the delay until
//! it wants to run again, or `None` when it is done.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;

type Job = Box<dyn FnMut() -> Option<Duration> + Send>;

struct Scheduled {
    name: &'static str,
    at: Instant,
    job: Job,
    canceled: Arc<AtomicBool>,
}

/// Cancels the scheduled job when triggered; safe to call after the job
/// already ran.
pub(crate) struct TaskHandle {
    canceled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }
}

pub(crate) struct TaskRunner {
    tx: Sender<Scheduled>,
}

static GLOBAL: Lazy<TaskRunner> = Lazy::new(TaskRunner::new);

impl TaskRunner {
    pub(crate) fn new() -> TaskRunner {
        let (tx, rx) = unbounded::<Scheduled>();

        thread::Builder::new()
            .name("courier-task-runner".into())
            .spawn(move || {
                let mut tasks: Vec<Scheduled> = Vec::new();
                loop {
                    let now = Instant::now();
                    let next_wake = tasks.iter().map(|t| t.at).min();

                    let received = match next_wake {
                        Some(at) => rx.recv_timeout(at.saturating_duration_since(now)),
                        None => rx
                            .recv()
                            .map_err(|_| RecvTimeoutError::Disconnected),
                    };

                    match received {
                        Ok(task) => tasks.push(task),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return,
                    }

                    let now = Instant::now();
                    let mut due = Vec::new();
                    tasks.retain_mut(|task| {
                        if task.canceled.load(Ordering::Relaxed) {
                            return false;
                        }
                        if task.at <= now {
                            due.push(std::mem::replace(
                                task,
                                Scheduled {
                                    name: "",
                                    at: now,
                                    job: Box::new(|| None),
                                    canceled: Arc::new(AtomicBool::new(true)),
                                },
                            ));
                            return false;
                        }
                        true
                    });

                    for mut task in due {
                        log::trace!("running task {}", task.name);
                        if let Some(delay) = (task.job)() {
                            if !task.canceled.load(Ordering::Relaxed) {
                                task.at = Instant::now() + delay;
                                tasks.push(task);
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn task runner thread");

        TaskRunner { tx }
    }

    /// The process-wide runner shared by all clients.
    pub(crate) fn global() -> &'static TaskRunner {
        &GLOBAL
    }

    /// Runs `job` after `delay`. The job reschedules itself by returning the
    /// next delay.
    pub(crate) fn schedule(
        &self,
        name: &'static str,
        delay: Duration,
        job: impl FnMut() -> Option<Duration> + Send + 'static,
    ) -> TaskHandle {
        let canceled = Arc::new(AtomicBool::new(false));
        let task = Scheduled {
            name,
            at: Instant::now() + delay,
            job: Box::new(job),
            canceled: canceled.clone(),
        };
        // A send can only fail after the runner thread died; jobs are
        // best-effort at that point.
        let _ = self.tx.send(task);
        TaskHandle { canceled }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn runs_scheduled_job() {
        let runner = TaskRunner::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        runner.schedule("test", Duration::from_millis(5), move || {
            flag.store(true, Ordering::SeqCst);
            None
        });
        thread::sleep(Duration::from_millis(100));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_prevents_run() {
        let runner = TaskRunner::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = runner.schedule("test", Duration::from_millis(30), move || {
            flag.store(true, Ordering::SeqCst);
            None
        });
        handle.cancel();
        thread::sleep(Duration::from_millis(100));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn job_reschedules_itself() {
        let runner = TaskRunner::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        runner.schedule("test", Duration::from_millis(1), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Some(Duration::from_millis(1))
            } else {
                None
            }
        });
        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
