use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    sync::{Notify, RwLock},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::config::RefresherConfig;
use crate::engine::FormulaEngine;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefresherError {
    #[error("Invalid refresher config: {message}")]
    InvalidConfig { message: String },
}

pub type RefresherResult<T> = Result<T, RefresherError>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Inactive,
    Active,
    Error {
        message: String,
    },
}

/// Work that runs next to the caller-driven evaluation of an engine.
#[async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &str;

    async fn status(&self) -> TaskStatus;

    /// Runs until `stop` is called. Spawn it rather than awaiting it inline.
    async fn start(&self) -> RefresherResult<()>;

    async fn stop(&self) -> RefresherResult<()>;
}

/// Periodically reads every kept or TTL attribute of one engine, then ticks its state
/// rules. Stopping is cooperative: the flag is checked between attributes and the
/// pauses wake up as soon as `stop` is called.
pub struct Refresher {
    engine: Arc<FormulaEngine>,
    config: RefresherConfig,
    status: Arc<RwLock<TaskStatus>>,
    running: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    cycles: Arc<AtomicU64>,
}

impl Refresher {
    pub fn new(engine: Arc<FormulaEngine>, config: RefresherConfig) -> Self {
        Self {
            engine,
            config,
            status: Arc::new(RwLock::new(TaskStatus::Inactive)),
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Refresher configured from the engine's own config.
    pub fn for_engine(engine: Arc<FormulaEngine>) -> Self {
        let config = engine.config().refresher.clone();
        Self::new(engine, config)
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<RefresherResult<()>> {
        tokio::spawn(async move { self.start().await })
    }

    /// Completed refresh cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn set_status(&self, status: TaskStatus) {
        if *self.status.read().await == status {
            return;
        }
        debug!("refresher status: {:?}", status);
        *self.status.write().await = status;
    }

    /// Sleeps for `duration`; true when woken by `stop` instead.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.stop_signal.notified() => true,
        }
    }

    fn refresh_once(&self) {
        for name in self.engine.refreshable_attributes() {
            if !self.is_running() {
                return;
            }
            if let Err(e) = self.engine.read(&name) {
                debug!("refresh of {} failed: {}", name, e);
            }
        }
    }

    async fn refresh_paced(&self) -> bool {
        for name in self.engine.refreshable_attributes() {
            if !self.is_running() {
                return true;
            }
            if let Err(e) = self.engine.read(&name) {
                debug!("refresh of {} failed: {}", name, e);
            }
            if self.pause(self.config.attribute_delay).await {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl BackgroundTask for Refresher {
    fn name(&self) -> &str {
        "refresher"
    }

    async fn status(&self) -> TaskStatus {
        self.status.read().await.clone()
    }

    async fn start(&self) -> RefresherResult<()> {
        if !self.config.enabled {
            debug!("refresher disabled");
            return Ok(());
        }
        if self.config.cycle_period.is_zero() {
            let message = "cycle period must be greater than 0".to_string();
            warn!("refresher not started: {}", message);
            self.set_status(TaskStatus::Error {
                message: message.clone(),
            })
            .await;
            return Err(RefresherError::InvalidConfig { message });
        }

        debug!("refresher started: {:?}", self.config);
        self.running.store(true, Ordering::SeqCst);
        self.set_status(TaskStatus::Active).await;

        while self.is_running() {
            let interrupted = if self.config.attribute_delay.is_zero() {
                self.refresh_once();
                false
            } else {
                self.refresh_paced().await
            };
            if interrupted || !self.is_running() {
                break;
            }
            if self.config.tick_state {
                self.engine.tick_state();
            }
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.pause(self.config.cycle_period).await {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_status(TaskStatus::Inactive).await;
        Ok(())
    }

    async fn stop(&self) -> RefresherResult<()> {
        debug!("refresher stopping");
        self.running.store(false, Ordering::SeqCst);
        self.stop_signal.notify_one();
        self.set_status(TaskStatus::Inactive).await;
        Ok(())
    }
}
