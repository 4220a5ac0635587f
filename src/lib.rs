//! Release news service.
//!
//! Release events arriving over AMQP are turned into news announcements
//! ([`news::announce`]) and published as CloudEvents; a listener consumes the
//! news and logs it ([`news::log_news`]).

mod amqp;
pub mod bridge;
pub mod conf;
pub mod envelope;
pub mod error;
pub mod health;
pub mod listener;
pub mod logging;
pub mod news;
pub mod transform;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

pub use crate::bridge::MessageBridge;
pub use crate::conf::{Config, Role};
pub use crate::envelope::{Envelope, Headers};
pub use crate::error::Error;
pub use crate::health::{
    Component, HealthState, HealthStatus, Outcome, SharedHealthState, run_health_server,
};
pub use crate::listener::NewsListener;
pub use crate::logging::{LogFormat, init_logging};
pub use crate::news::{NewsItem, ReleaseEvent, announce, log_news};
pub use crate::transform::{AnnouncementTransformer, Message, MessageTransformer};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Run the announcement bridge with automatic reconnection and health status updates.
///
/// # Errors
/// Never returns `Ok`; connection and processing failures are logged and
/// retried after a delay.
pub async fn run_with_recovery(
    config: Config,
    health_state: SharedHealthState,
    transformer: Arc<dyn MessageTransformer>,
) -> Result<()> {
    loop {
        info!(event = "bridge_creating", "Creating message bridge");

        match MessageBridge::new(config.clone(), health_state.clone(), transformer.clone()).await {
            Ok(bridge) => {
                info!(
                    event = "bridge_created",
                    status = "success",
                    "Bridge created successfully, starting message processing"
                );
                log_run_result("bridge", bridge.run().await);
            }
            Err(e) => {
                error!(
                    event = "bridge_creation_failed",
                    error = %e,
                    retry_delay_secs = RECONNECT_DELAY.as_secs(),
                    "Failed to create bridge"
                );
                health_state
                    .write()
                    .await
                    .set_status(Component::Bridge, HealthStatus::Unhealthy);
            }
        }

        time::sleep(RECONNECT_DELAY).await;
        info!(event = "reconnect_attempt", component = "bridge", "Attempting to reconnect");
    }
}

/// Run the news listener with automatic reconnection.
///
/// # Errors
/// Never returns `Ok`; see [`run_with_recovery`].
pub async fn run_listener_with_recovery(
    config: Config,
    health_state: SharedHealthState,
) -> Result<()> {
    loop {
        info!(event = "listener_creating", "Creating news listener");

        match NewsListener::new(&config, health_state.clone()).await {
            Ok(listener) => log_run_result("listener", listener.run().await),
            Err(e) => {
                error!(
                    event = "listener_creation_failed",
                    error = %e,
                    retry_delay_secs = RECONNECT_DELAY.as_secs(),
                    "Failed to create news listener"
                );
                health_state
                    .write()
                    .await
                    .set_status(Component::Listener, HealthStatus::Unhealthy);
            }
        }

        time::sleep(RECONNECT_DELAY).await;
        info!(event = "reconnect_attempt", component = "listener", "Attempting to reconnect");
    }
}

fn log_run_result(component: &'static str, result: Result<()>) {
    match result {
        Ok(()) => {
            warn!(
                event = "component_stopped",
                component,
                reason = "normal",
                "Stopped normally (unexpected)"
            );
        }
        Err(e) => {
            error!(
                event = "component_error",
                component,
                error = %e,
                "Encountered an error"
            );
        }
    }
    info!(
        event = "component_reconnecting",
        component,
        delay_secs = RECONNECT_DELAY.as_secs(),
        "Connection lost or error occurred, will attempt to reconnect"
    );
}

/// Run the health server and the handlers selected by `config.role` until
/// the provided `shutdown` future completes.
///
/// # Errors
/// Returns an error if the health server fails to bind or serve requests.
pub async fn run_until<S>(config: Config, health_state: SharedHealthState, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    info!(
        event = "application_starting",
        role = ?config.role,
        "Starting release news service"
    );

    info!(
        event = "config_loaded",
        source_queue = %config.source_queue,
        target_exchange = %config.target_exchange,
        target_routing_key = %config.target_routing_key,
        news_queue = %config.news_queue,
        health_port = config.health_port,
        "Configuration loaded"
    );

    let health_server = run_health_server(config.health_port, health_state.clone());

    let announcer = {
        let config = config.clone();
        let health_state = health_state.clone();
        async move {
            if config.role.runs_announcer() {
                run_with_recovery(config, health_state, Arc::new(AnnouncementTransformer)).await
            } else {
                std::future::pending().await
            }
        }
    };

    let logger = async move {
        if config.role.runs_logger() {
            run_listener_with_recovery(config, health_state).await
        } else {
            std::future::pending().await
        }
    };

    tokio::pin!(health_server);
    tokio::pin!(announcer);
    tokio::pin!(logger);
    tokio::pin!(shutdown);

    tokio::select! {
        biased;

        () = &mut shutdown => {
            info!(event = "shutdown_signal", "Received shutdown signal, exiting gracefully");
        }
        result = &mut health_server => {
            error!(event = "health_server_failed", error = ?result, "Health server failed");
            result.context("Health server failed")?;
        }
        result = &mut announcer => {
            error!(event = "bridge_failed", error = ?result, "Bridge failed");
            result.context("Bridge failed")?;
        }
        result = &mut logger => {
            error!(event = "listener_failed", error = ?result, "News listener failed");
            result.context("News listener failed")?;
        }
    }

    info!(event = "application_stopped", "Application shutdown complete");

    Ok(())
}

/// Convenience runner that waits for Ctrl-C and then shuts down gracefully.
///
/// # Errors
/// Propagates any errors from [`run_until`].
pub async fn run_with_ctrl_c(config: Config, health_state: SharedHealthState) -> Result<()> {
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    run_until(config, health_state, shutdown).await
}
