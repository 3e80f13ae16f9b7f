//! Background maintenance tasks.
//!
//! Each worker is a tokio task driven by `tokio::time::interval`. The first,
//! immediate tick is skipped so nothing runs before the first full period.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheLayer;
use crate::runtime::{CacheRuntime, RuntimeError};
use crate::warming::{WarmingError, WarmingRequest};

/// Handles of the running workers. Dropping the set does not stop them; call
/// [`WorkerSet::shutdown`].
pub struct WorkerSet {
    handles: Vec<(String, JoinHandle<()>)>,
}

impl WorkerSet {
    /// Spawn every worker the runtime's configuration asks for.
    pub fn spawn(runtime: Arc<CacheRuntime>) -> Self {
        let mut handles = Vec::new();

        for layer in runtime.orchestrator().layers() {
            let period = runtime.sweep_interval(layer.name());
            handles.push((
                format!("sweep:{}", layer.name()),
                spawn_sweep(Arc::clone(layer), period),
            ));
        }

        handles.push((
            "propagation".to_string(),
            spawn_propagation(Arc::clone(&runtime)),
        ));
        handles.push((
            "model-refresh".to_string(),
            spawn_model_refresh(Arc::clone(&runtime)),
        ));
        if let Some(period) = runtime.scheduler().config().session_interval() {
            handles.push((
                "warming-sessions".to_string(),
                spawn_sessions(Arc::clone(&runtime), period),
            ));
        }

        let names: Vec<&str> = handles.iter().map(|(name, _)| name.as_str()).collect();
        info!(workers = ?names, "Background workers started");
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.handles.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Abort every worker and wait for the tasks to finish.
    pub async fn shutdown(self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
        for (name, handle) in self.handles {
            let _ = handle.await;
            debug!(worker = %name, "Background worker stopped");
        }
    }
}

fn spawn_sweep(layer: Arc<dyn CacheLayer>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match layer.sweep_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!(layer = layer.name(), removed, "Expired entries swept"),
                Err(err) => warn!(layer = layer.name(), error = %err, "TTL sweep failed"),
            }
        }
    })
}

fn spawn_propagation(runtime: Arc<CacheRuntime>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(runtime.coordinator().config().drain_interval());
        interval.tick().await;
        loop {
            interval.tick().await;
            let derived = runtime.coordinator().process_propagation_queue();
            if derived > 0 {
                debug!(derived, "Propagation queue drained");
            }
            runtime.consumer().consume().await;
        }
    })
}

fn spawn_model_refresh(runtime: Arc<CacheRuntime>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(runtime.scheduler().config().model_refresh_interval());
        interval.tick().await;
        loop {
            interval.tick().await;
            runtime.scheduler().refresh_model();
        }
    })
}

fn spawn_sessions(runtime: Arc<CacheRuntime>, period: Duration) -> JoinHandle<()> {
    let strategy = runtime.scheduler().config().session_strategy;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match runtime.warm(WarmingRequest::new(strategy)).await {
                Ok(session) => debug!(
                    session_id = %session.id,
                    completed = session.completed,
                    "Scheduled warming session finished"
                ),
                Err(RuntimeError::Warming(WarmingError::SessionAlreadyActive { active })) => {
                    debug!(active = %active, "Scheduled warming skipped, session in progress")
                }
                Err(err) => warn!(error = %err, "Scheduled warming session failed"),
            }
        }
    })
}
