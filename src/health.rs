use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::conf::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    /// The worse of two statuses: unhealthy beats starting beats healthy.
    fn worst(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Starting, _) | (_, Starting) => Starting,
            (Healthy, Healthy) => Healthy,
        }
    }
}

/// The consumers that report into [`HealthState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Bridge,
    Listener,
}

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Announced,
    Logged,
    Rejected,
    Requeued,
}

/// Per-component status; `None` means the component is not run by this
/// process and is left out of the combined status.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub bridge: Option<HealthStatus>,
    pub listener: Option<HealthStatus>,
    pub last_message_processed: Option<Instant>,
    pub announced: u64,
    pub logged: u64,
    pub rejected: u64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::for_role(Role::All)
    }
}

impl HealthState {
    pub fn for_role(role: Role) -> Self {
        Self {
            bridge: role.runs_announcer().then_some(HealthStatus::Starting),
            listener: role.runs_logger().then_some(HealthStatus::Starting),
            last_message_processed: None,
            announced: 0,
            logged: 0,
            rejected: 0,
        }
    }

    pub fn set_status(&mut self, component: Component, status: HealthStatus) {
        match component {
            Component::Bridge => self.bridge = Some(status),
            Component::Listener => self.listener = Some(status),
        }
    }

    /// Combined status of every running component.
    pub fn status(&self) -> HealthStatus {
        [self.bridge, self.listener]
            .into_iter()
            .flatten()
            .fold(HealthStatus::Healthy, HealthStatus::worst)
    }

    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Announced => self.announced += 1,
            Outcome::Logged => self.logged += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::Requeued => return,
        }
        self.last_message_processed = Some(Instant::now());
    }
}

pub type SharedHealthState = Arc<RwLock<HealthState>>;

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusReport {
    pub status: HealthStatus,
    pub bridge: Option<HealthStatus>,
    pub listener: Option<HealthStatus>,
    pub announced: u64,
    pub logged: u64,
    pub rejected: u64,
    pub seconds_since_last_message: Option<f64>,
}

impl From<&HealthState> for StatusReport {
    fn from(state: &HealthState) -> Self {
        Self {
            status: state.status(),
            bridge: state.bridge,
            listener: state.listener,
            announced: state.announced,
            logged: state.logged,
            rejected: state.rejected,
            seconds_since_last_message: state
                .last_message_processed
                .map(|at| at.elapsed().as_secs_f64()),
        }
    }
}

async fn liveness(State(health_state): State<SharedHealthState>) -> StatusCode {
    let state = health_state.read().await;

    match state.status() {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Starting => {
            info!(event = "liveness_check", status = "starting");
            StatusCode::OK // Allow pod to start
        }
        HealthStatus::Unhealthy => {
            error!(event = "liveness_check", status = "unhealthy");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn readiness(State(health_state): State<SharedHealthState>) -> StatusCode {
    let state = health_state.read().await;

    match state.status() {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Starting | HealthStatus::Unhealthy => {
            error!(event = "readiness_check", status = "not_ready");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn startup(State(health_state): State<SharedHealthState>) -> StatusCode {
    let state = health_state.read().await;

    match state.status() {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Starting | HealthStatus::Unhealthy => {
            info!(event = "startup_check", status = "not_started");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn status_report(State(health_state): State<SharedHealthState>) -> Json<StatusReport> {
    let state = health_state.read().await;
    Json(StatusReport::from(&*state))
}

pub fn router(health_state: SharedHealthState) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/ready", get(readiness))
        .route("/startup", get(startup))
        .route("/status", get(status_report))
        .with_state(health_state)
}

pub async fn run_health_server(port: u16, health_state: SharedHealthState) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind health server")?;

    info!(event = "health_server_listening", %addr, "Health check server listening");

    axum::serve(listener, router(health_state))
        .await
        .context("Health server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(status: HealthStatus) -> SharedHealthState {
        let mut state = HealthState::default();
        state.set_status(Component::Bridge, status);
        state.set_status(Component::Listener, status);
        Arc::new(RwLock::new(state))
    }

    #[tokio::test]
    async fn starting_is_alive_but_not_ready() {
        let state = shared(HealthStatus::Starting);
        assert_eq!(liveness(State(state.clone())).await, StatusCode::OK);
        assert_eq!(
            readiness(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            startup(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn healthy_passes_every_check() {
        let state = shared(HealthStatus::Healthy);
        assert_eq!(liveness(State(state.clone())).await, StatusCode::OK);
        assert_eq!(readiness(State(state.clone())).await, StatusCode::OK);
        assert_eq!(startup(State(state)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn unhealthy_fails_every_check() {
        let state = shared(HealthStatus::Unhealthy);
        assert_eq!(
            liveness(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            readiness(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            startup(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn healthy_listener_does_not_hide_a_failed_bridge() {
        let state = shared(HealthStatus::Healthy);
        state
            .write()
            .await
            .set_status(Component::Bridge, HealthStatus::Unhealthy);

        assert_eq!(
            readiness(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        // A reconnecting bridge keeps the service out of rotation too.
        state
            .write()
            .await
            .set_status(Component::Bridge, HealthStatus::Starting);
        assert_eq!(
            readiness(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn components_outside_the_role_are_ignored() {
        let mut state = HealthState::for_role(Role::Logger);
        assert_eq!(state.bridge, None);
        assert_eq!(state.status(), HealthStatus::Starting);

        state.set_status(Component::Listener, HealthStatus::Healthy);
        assert_eq!(state.status(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn status_reports_counters() {
        let state = shared(HealthStatus::Healthy);
        {
            let mut s = state.write().await;
            s.record(Outcome::Announced);
            s.record(Outcome::Announced);
            s.record(Outcome::Logged);
            s.record(Outcome::Rejected);
            s.record(Outcome::Requeued);
        }

        let Json(report) = status_report(State(state)).await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.announced, 2);
        assert_eq!(report.logged, 1);
        assert_eq!(report.rejected, 1);
        assert!(report.seconds_since_last_message.is_some());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["bridge"], "healthy");
    }

    #[test]
    fn requeue_is_not_activity() {
        let mut state = HealthState::default();
        state.record(Outcome::Requeued);
        let report = StatusReport::from(&state);
        assert_eq!(report.status, HealthStatus::Starting);
        assert_eq!(report.seconds_since_last_message, None);
        assert_eq!(report.announced + report.logged + report.rejected, 0);
    }
}
