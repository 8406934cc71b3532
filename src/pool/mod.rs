//! Bounded work pool shared by every in-flight upload.
//!
//! Tasks pass through a bounded submit queue and are handed to workers one at
//! a time by an admission dispatcher. The dispatcher only moves a task when a
//! signal is available: `Full` mode seeds one signal per worker so everything
//! may run immediately, `SlowStart` seeds a single signal and grows the
//! active set by one on each success, because the remote penalizes sudden
//! parallel bursts. On failure the pool withholds the replacement signal
//! unless the in-flight count has dropped to zero, which would otherwise
//! stall the queue entirely.

mod group;

pub use group::{Task, TaskFuture, TaskGroup};

use crate::uploader::error::{UploadError, UploadResult};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    /// All workers may run from the start
    Full,
    /// One worker at start, one more per completed task up to the limit
    SlowStart,
}

type RecoveryHook = dyn Fn(&str, &Arc<Task>) + Send + Sync;

struct PendingChannels {
    queue_rx: mpsc::Receiver<Arc<Task>>,
    signal_rx: mpsc::Receiver<()>,
}

pub struct WorkPool {
    worker_count: usize,
    mode: AdmissionMode,
    queue_tx: mpsc::Sender<Arc<Task>>,
    signal_tx: mpsc::Sender<()>,
    inflight: AtomicI64,
    token: CancellationToken,
    closed: AtomicBool,
    recovery: RwLock<Option<Box<RecoveryHook>>>,
    pending: Mutex<Option<PendingChannels>>,
}

impl WorkPool {
    pub fn new(worker_count: usize, queue_size: usize, mode: AdmissionMode) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(queue_size.max(1));
        let (signal_tx, signal_rx) = mpsc::channel(1);

        Arc::new(Self {
            worker_count,
            mode,
            queue_tx,
            signal_tx,
            inflight: AtomicI64::new(0),
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            recovery: RwLock::new(None),
            pending: Mutex::new(Some(PendingChannels {
                queue_rx,
                signal_rx,
            })),
        })
    }

    /// Install a hook observing recovered worker panics. Recovered tasks are
    /// treated as failed.
    pub fn set_recovery<F>(&self, hook: F)
    where
        F: Fn(&str, &Arc<Task>) + Send + Sync + 'static,
    {
        *self.recovery.write().expect("recovery hook poisoned") = Some(Box::new(hook));
    }

    #[allow(dead_code)]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    #[allow(dead_code)]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[allow(dead_code)]
    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Launch the workers and the admission dispatcher, then seed the
    /// initial signals for the configured mode.
    pub fn start(self: &Arc<Self>) {
        let Some(channels) = self.pending.lock().expect("pool channels poisoned").take() else {
            return;
        };

        let (tasks_tx, tasks_rx) = mpsc::channel::<Arc<Task>>(1);
        let tasks_rx = Arc::new(tokio::sync::Mutex::new(tasks_rx));

        for _ in 0..self.worker_count {
            let pool = Arc::clone(self);
            let rx = Arc::clone(&tasks_rx);
            tokio::spawn(async move { pool.worker(rx).await });
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.dispatch(channels.signal_rx, channels.queue_rx, tasks_tx)
                .await
        });

        let seed = match self.mode {
            AdmissionMode::Full => self.worker_count,
            AdmissionMode::SlowStart => 1,
        };
        let signal_tx = self.signal_tx.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            for _ in 0..seed {
                tokio::select! {
                    res = signal_tx.send(()) => {
                        if res.is_err() {
                            break;
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });

        info!(
            target: "pool",
            workers = self.worker_count,
            mode = ?self.mode,
            "work pool started"
        );
    }

    /// Enqueue a task, waiting for queue space. Fails with `PoolStopped`
    /// once the pool has been stopped.
    pub async fn submit(&self, task: Arc<Task>) -> UploadResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UploadError::PoolStopped);
        }
        tokio::select! {
            res = self.queue_tx.send(task) => res.map_err(|_| UploadError::PoolStopped),
            _ = self.token.cancelled() => Err(UploadError::PoolStopped),
        }
    }

    /// Stop the pool: cancel its token once and refuse further submits.
    pub fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        info!(target: "pool", "work pool stopped");
    }

    async fn dispatch(
        self: Arc<Self>,
        mut signal_rx: mpsc::Receiver<()>,
        mut queue_rx: mpsc::Receiver<Arc<Task>>,
        tasks_tx: mpsc::Sender<Arc<Task>>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                signal = signal_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    let task = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => break,
                        task = queue_rx.recv() => match task {
                            Some(task) => task,
                            None => break,
                        },
                    };
                    let delivered = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => false,
                        res = tasks_tx.send(task) => res.is_ok(),
                    };
                    if !delivered {
                        break;
                    }
                }
            }
        }
        debug!(target: "pool", "admission dispatcher exited");
    }

    async fn worker(self: Arc<Self>, tasks_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<Task>>>>) {
        loop {
            let task = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                task = async { tasks_rx.lock().await.recv().await } => task,
            };
            let Some(task) = task else { break };
            self.execute(task).await;
        }
    }

    async fn execute(self: &Arc<Self>, task: Arc<Task>) {
        self.inflight.fetch_add(1, Ordering::SeqCst);

        let outcome = if !task.group().before_run(&task) {
            debug!(target: "pool", task = %task.name(), "task vetoed");
            Outcome::Vetoed
        } else {
            match AssertUnwindSafe(task.run()).catch_unwind().await {
                Ok(Ok(())) => {
                    task.group().run_success(&task);
                    Outcome::Succeeded
                }
                Ok(Err(err)) => {
                    task.group()
                        .run_fail(Arc::clone(&task), err, Arc::clone(self))
                        .await;
                    Outcome::Failed
                }
                Err(panic) => {
                    let message = panic_message(panic);
                    error!(target: "pool", task = %task.name(), panic = %message, "worker recovered panic");
                    if let Some(hook) = self.recovery.read().expect("recovery hook poisoned").as_ref()
                    {
                        hook(&message, &task);
                    }
                    task.group()
                        .run_fail(
                            Arc::clone(&task),
                            UploadError::Panicked(message),
                            Arc::clone(self),
                        )
                        .await;
                    Outcome::Failed
                }
            }
        };

        let remaining = self.inflight.fetch_sub(1, Ordering::SeqCst) - 1;
        match (outcome, self.mode) {
            (Outcome::Failed, AdmissionMode::SlowStart) => {
                // Withhold the replacement signal while ramping down, but
                // never let the last failing worker strand the queue.
                if remaining == 0 {
                    self.wake_worker(1);
                }
            }
            _ => self.wake_worker(1),
        }
        if outcome == Outcome::Succeeded && self.mode == AdmissionMode::SlowStart {
            self.wake_worker(1);
        }
    }

    fn wake_worker(&self, count: usize) {
        for _ in 0..count {
            let _ = self.signal_tx.try_send(());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Vetoed,
    Succeeded,
    Failed,
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
