//! Per-file task grouping over the work pool: barrier wait, single-error
//! capture, cancellation propagation and per-task retry accounting.

use crate::pool::WorkPool;
use crate::uploader::error::{UploadError, UploadResult};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type TaskFuture = BoxFuture<'static, UploadResult<()>>;

type BeforeHook = dyn Fn(&Arc<Task>) -> bool + Send + Sync;
type SuccessHook = dyn Fn(&Arc<Task>) + Send + Sync;
type FailHook =
    dyn Fn(Arc<Task>, UploadError, Arc<WorkPool>) -> BoxFuture<'static, ()> + Send + Sync;

/// One unit of work owned by a task group. The run closure is re-invoked on
/// every retry, so the task keeps its identity (and any captured chunk
/// buffer) across attempts.
pub struct Task {
    name: String,
    max_retry: u32,
    retries: AtomicU32,
    group: Arc<TaskGroup>,
    run: Box<dyn Fn(CancellationToken) -> TaskFuture + Send + Sync>,
}

impl Task {
    pub fn new<F>(
        group: &Arc<TaskGroup>,
        name: impl Into<String>,
        max_retry: u32,
        run: F,
    ) -> Arc<Self>
    where
        F: Fn(CancellationToken) -> TaskFuture + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            max_retry,
            retries: AtomicU32::new(0),
            group: Arc::clone(group),
            run: Box::new(run),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_count(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn group(&self) -> &Arc<TaskGroup> {
        &self.group
    }

    /// Resubmit this task, consuming one retry. Errors once the budget is
    /// spent or the pool no longer accepts work.
    pub async fn retry(self: &Arc<Self>, pool: &Arc<WorkPool>) -> UploadResult<()> {
        let attempts = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts > self.max_retry {
            return Err(UploadError::RetryExhausted {
                name: self.name.clone(),
                max_retry: self.max_retry,
            });
        }
        debug!(target: "pool", task = %self.name, attempt = attempts, "resubmitting task");
        pool.submit(Arc::clone(self)).await
    }

    pub(crate) async fn run(&self) -> UploadResult<()> {
        (self.run)(self.group.token()).await
    }
}

#[derive(Default)]
struct Hooks {
    before: Option<Arc<BeforeHook>>,
    success: Option<Arc<SuccessHook>>,
    fail: Option<Arc<FailHook>>,
}

/// Groups the chunk tasks of one file upload. `wait` resolves when every
/// expected task has succeeded, when the first failure is recorded, or when
/// the (inherited) cancellation fires — whichever happens first.
pub struct TaskGroup {
    token: CancellationToken,
    finished: CancellationToken,
    total: u64,
    done: AtomicU64,
    failed: AtomicBool,
    error: Mutex<Option<UploadError>>,
    hooks: RwLock<Hooks>,
}

impl TaskGroup {
    pub fn new(parent: &CancellationToken, total: usize) -> Arc<Self> {
        let finished = CancellationToken::new();
        if total == 0 {
            finished.cancel();
        }
        Arc::new(Self {
            token: parent.child_token(),
            finished,
            total: total as u64,
            done: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
            hooks: RwLock::new(Hooks::default()),
        })
    }

    /// Child token handed to every task in the group.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn done_count(&self) -> u64 {
        self.done.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn on_before<F>(&self, hook: F)
    where
        F: Fn(&Arc<Task>) -> bool + Send + Sync + 'static,
    {
        self.hooks.write().expect("hooks poisoned").before = Some(Arc::new(hook));
    }

    pub fn on_success<F>(&self, hook: F)
    where
        F: Fn(&Arc<Task>) + Send + Sync + 'static,
    {
        self.hooks.write().expect("hooks poisoned").success = Some(Arc::new(hook));
    }

    pub fn on_fail<F>(&self, hook: F)
    where
        F: Fn(Arc<Task>, UploadError, Arc<WorkPool>) -> BoxFuture<'static, ()>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.write().expect("hooks poisoned").fail = Some(Arc::new(hook));
    }

    /// Record the first error, cancel the group and unblock `wait`.
    /// Subsequent calls are no-ops.
    pub fn fail(&self, err: UploadError) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.error.lock().expect("error slot poisoned") = Some(err);
        self.token.cancel();
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Block until all tasks succeed (Ok), one fails (that error), or the
    /// group is cancelled (`Cancelled`).
    pub async fn wait(&self) -> UploadResult<()> {
        tokio::select! {
            biased;
            _ = self.finished.cancelled() => Ok(()),
            _ = self.token.cancelled() => Err(self
                .error
                .lock()
                .expect("error slot poisoned")
                .take()
                .unwrap_or(UploadError::Cancelled)),
        }
    }

    /// Veto hook; a cancelled group refuses to run further tasks.
    pub(crate) fn before_run(&self, task: &Arc<Task>) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let hook = self.hooks.read().expect("hooks poisoned").before.clone();
        hook.map(|h| h(task)).unwrap_or(true)
    }

    pub(crate) fn run_success(&self, task: &Arc<Task>) {
        let new_done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        if new_done == self.total {
            self.finished.cancel();
        }
        let hook = self.hooks.read().expect("hooks poisoned").success.clone();
        if let Some(hook) = hook {
            hook(task);
        }
    }

    pub(crate) async fn run_fail(&self, task: Arc<Task>, err: UploadError, pool: Arc<WorkPool>) {
        let hook = self.hooks.read().expect("hooks poisoned").fail.clone();
        match hook {
            Some(hook) => hook(task, err, pool).await,
            None => self.fail(err),
        }
    }
}
