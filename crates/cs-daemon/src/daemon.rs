use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use cs_agents::executor::AgentExecutor;
use cs_agents::registry::AgentRegistry;
use cs_agents::scheduler::{SchedulerConfig, TaskScheduler};
use cs_bridge::event_bus::EventBus;
use cs_bridge::log_stream::LogMultiplexer;
use cs_core::config::Config;
use cs_core::store::{JsonFileStore, MemoryStore, TaskStore};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::http_api::{self, ApiState};
use crate::shutdown::ShutdownSignal;

/// How long running tasks get to reach CANCELLED after a shutdown request.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The codescope orchestration daemon.
///
/// Owns the scheduler and the HTTP/WebSocket server. Shuts down gracefully
/// when the `ShutdownSignal` is triggered (ctrl-c or [`Daemon::shutdown`]).
pub struct Daemon {
    config: Config,
    scheduler: TaskScheduler,
    shutdown: ShutdownSignal,
    api_state: Arc<ApiState>,
}

impl Daemon {
    /// Build a daemon from config: agents from `[agents.*]`, a file store
    /// under `data_dir` when `persist` is on.
    pub fn new(config: Config) -> Result<Self> {
        let registry =
            AgentRegistry::from_config(&config.agents).context("failed to build agent registry")?;
        let store: Arc<dyn TaskStore> = if config.daemon.persist {
            let dir = config.daemon.resolved_data_dir();
            info!(data_dir = %dir.display(), "persisting tasks to disk");
            Arc::new(JsonFileStore::new(dir))
        } else {
            info!("persistence disabled, tasks are kept in memory only");
            Arc::new(MemoryStore::new())
        };
        Ok(Self::with_parts(config, registry, store))
    }

    /// Build a daemon around an explicit agent registry and store.
    pub fn with_parts(config: Config, registry: AgentRegistry, store: Arc<dyn TaskStore>) -> Self {
        let orchestrator = &config.orchestrator;
        let executor = AgentExecutor::new(
            Arc::new(registry),
            Duration::from_secs(orchestrator.task_timeout_secs),
        );
        let bus = EventBus::with_queue_cap(orchestrator.subscriber_queue_cap);
        let scheduler = TaskScheduler::new(
            executor,
            LogMultiplexer::with_retention(bus, orchestrator.retained_log_buffers),
            store,
            SchedulerConfig {
                max_concurrent_tasks: orchestrator.max_concurrent_tasks,
                default_agent: orchestrator.default_agent.clone(),
            },
        );
        let api_state = Arc::new(ApiState::new(
            scheduler.clone(),
            Duration::from_secs(orchestrator.heartbeat_secs),
        ));
        Self {
            config,
            scheduler,
            shutdown: ShutdownSignal::new(),
            api_state,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn router(&self) -> Router {
        http_api::api_router(self.api_state.clone())
    }

    /// Resolve tasks left unfinished by a previous process.
    pub fn recover(&self) -> Result<usize> {
        let recovered = self
            .scheduler
            .recover()
            .context("failed to load persisted tasks")?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "marked interrupted tasks as failed");
        }
        Ok(recovered.len())
    }

    /// Run the daemon on a pre-bound listener until shutdown (blocking).
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        self.recover()?;

        let bind_addr = listener.local_addr()?;
        let router = self.router();
        let api_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "API server error");
            }
        });
        info!(%bind_addr, agents = ?self.scheduler.agent_names(), "API server listening");

        self.shutdown.triggered().await;
        info!("shutdown signal received, cancelling running tasks");
        let remaining = self.scheduler.shutdown(SHUTDOWN_GRACE).await;
        if remaining > 0 {
            warn!(remaining, "tasks still running after shutdown grace period");
        }

        api_handle.abort();
        info!("daemon stopped");
        Ok(())
    }

    /// Run the daemon on `daemon.host:daemon.port` until shutdown (blocking).
    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.config.daemon.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Start on `127.0.0.1:0` in the background and return the bound
    /// address. The caller keeps the `Daemon` and calls `shutdown()` to stop.
    pub async fn start_embedded(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = daemon.run_with_listener(listener).await {
                error!(error = %e, "embedded daemon failed");
            }
        });
        info!(%addr, "embedded daemon started");
        Ok(addr)
    }
}
