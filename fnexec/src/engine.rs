//! # Execution Engine
//!
//! The public entry point: one driver, one pool and one scheduler behind a cheaply cloneable
//! handle.
//!
//! ```rust,no_run
//! use fnexec::{EngineConfig, ExecutionEngine, FunctionSpec, InvocationRequest, types::ArtifactRef};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let engine = ExecutionEngine::new(EngineConfig::default())?;
//! engine
//!     .deploy(FunctionSpec::new(
//!         "echo",
//!         ArtifactRef::new("/srv/functions/echo", vec!["cat".into()]),
//!     ))
//!     .await?;
//!
//! let result = engine
//!     .invoke(InvocationRequest::with_timeout("echo", json!({"n": 1}), Duration::from_secs(5)))
//!     .await;
//! println!("{}", serde_json::to_string(&result)?);
//! engine.shutdown(Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigError, EngineConfig};
use crate::driver::{SandboxDriver, build_driver};
use crate::events::{self, EventSink};
use crate::pool::{PoolError, SandboxPool};
use crate::scheduler::Scheduler;
use crate::stats::EngineStats;
use crate::types::{
    FunctionId, FunctionSpec, InvocationRequest, InvocationResult, Outcome, SystemFaultReason,
};
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct EngineInner {
    scheduler: Scheduler,
    pool: SandboxPool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    active: AtomicUsize,
    drained: Notify,
    root: CancellationToken,
}

/// Counts an invocation as in flight for as long as it lives.
struct ActiveGuard<'a> {
    inner: &'a EngineInner,
}

impl<'a> ActiveGuard<'a> {
    fn new(inner: &'a EngineInner) -> Self {
        inner.active.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl EngineInner {
    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Serverless execution engine.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Build an engine with the driver selected by `config.driver` and a logging event sink.
    ///
    /// Must be called within a tokio runtime; the idle sweep starts immediately.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let driver = build_driver(&config.driver);
        Ok(Self::with_driver(config, driver, events::logging_sink()))
    }

    /// Build an engine over an explicit driver and event sink.
    pub fn with_driver(
        config: EngineConfig,
        driver: Arc<dyn SandboxDriver>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        info!(
            "starting execution engine with {} driver (ceiling {} per function, {} concurrent)",
            driver.name(),
            config.pool.max_sandboxes_per_function,
            config.scheduler.max_concurrent_invocations
        );
        let pool = SandboxPool::new(driver, config.pool, events.clone());
        let sweeper = pool.start_background_sweep();
        let scheduler = Scheduler::new(pool.clone(), config.scheduler, events);
        Self {
            inner: Arc::new(EngineInner {
                scheduler,
                pool,
                sweeper: Mutex::new(Some(sweeper)),
                closed: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                drained: Notify::new(),
                root: CancellationToken::new(),
            }),
        }
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.inner.pool
    }

    /// Deploy or redeploy a function; returns its generation.
    pub async fn deploy(&self, spec: FunctionSpec) -> Result<u64, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        self.inner.pool.deploy(spec).await
    }

    pub async fn undeploy(&self, id: &FunctionId) -> Result<(), PoolError> {
        self.inner.pool.undeploy(id).await?;
        self.inner.scheduler.forget(id);
        Ok(())
    }

    /// Deployed functions, sorted by id.
    pub fn functions(&self) -> Vec<Arc<FunctionSpec>> {
        self.inner.pool.specs()
    }

    pub fn function(&self, id: &FunctionId) -> Option<Arc<FunctionSpec>> {
        self.inner.pool.spec(id)
    }

    pub async fn invoke(&self, request: InvocationRequest) -> InvocationResult {
        self.invoke_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Invoke, aborting when `cancel` fires. An aborted invocation reports
    /// `SystemFault(cancelled)` and its sandbox is destroyed.
    pub async fn invoke_with_cancel(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> InvocationResult {
        let _active = ActiveGuard::new(&self.inner);
        if self.is_shutting_down() {
            let outcome = Outcome::system(
                SystemFaultReason::ShuttingDown,
                "execution engine is shutting down",
            );
            self.inner.scheduler.counters().record(&outcome, None);
            return InvocationResult {
                request_id: request.request_id,
                function_id: request.function_id,
                outcome,
                duration: Duration::ZERO,
                finished_at: SystemTime::now(),
                start: None,
                sandbox_id: None,
            };
        }

        let token = self.inner.root.child_token();
        let run = self.inner.scheduler.run(request, token.clone());
        tokio::pin!(run);
        tokio::select! {
            biased;
            result = &mut run => result,
            _ = cancel.cancelled() => {
                token.cancel();
                run.await
            }
        }
    }

    /// Invoke on a separate task.
    pub fn spawn_invoke(&self, request: InvocationRequest) -> JoinHandle<InvocationResult> {
        let engine = self.clone();
        tokio::spawn(async move { engine.invoke(request).await })
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.scheduler.counters().snapshot(
            self.inner.active.load(Ordering::Acquire),
            self.inner.pool.stats(),
        )
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting invocations, give in-flight ones up to `grace` to finish, then cancel
    /// the rest and tear every sandbox down.
    pub async fn shutdown(&self, grace: Duration) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "shutting down execution engine ({} invocations in flight)",
            self.inner.active.load(Ordering::Acquire)
        );

        if tokio::time::timeout(grace, self.inner.wait_drained())
            .await
            .is_err()
        {
            warn!(
                "{} invocations still running after {}ms grace, cancelling",
                self.inner.active.load(Ordering::Acquire),
                grace.as_millis()
            );
            self.inner.scheduler.close();
            self.inner.root.cancel();
            self.inner.wait_drained().await;
        }

        self.inner.scheduler.close();
        self.inner.pool.shutdown().await;

        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper
            && let Err(e) = sweeper.await
        {
            warn!("sandbox sweep task ended abnormally: {}", e);
        }
        info!("execution engine stopped");
    }
}
