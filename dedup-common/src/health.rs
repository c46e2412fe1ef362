use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Liveness reporting for the long-running loops of the service.
///
/// The dedup worker is only trustworthy while its consumer loop keeps
/// making progress, so the loop must check in with the registry more often
/// than its registered deadline. A component that stops reporting is
/// considered stalled and takes the whole probe down; readiness is a
/// separate concern and gets a separate registry instance if ever needed.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy.
    pub healthy: bool,
    /// Current status of each registered component, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the status code from the overall health status, and prints
    /// each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered.
    Starting,
    /// Recently reported healthy, must report again before the date.
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached.
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report as healthy, returns when the message is queued. Must be
    /// called more frequently than the registered deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Report component status, returns when the message is queued.
    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                }
                // A poisoned lock means the probes will fail and the
                // process will get restarted anyway; nothing to do here.
            }
        });

        registry
    }

    /// Register a new component and get the handle it will report through.
    /// The returned status is Starting until the first report.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Compute the current overall status, downgrading expired
    /// HealthyUntil entries to Stalled.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => return HealthStatus::default(),
        };

        if components.is_empty() {
            // Nothing registered yet: not ready to serve traffic.
            return HealthStatus::default();
        }

        let now = time::OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            healthy: true,
            components: HashMap::with_capacity(components.len()),
        };

        for (component, status) in components.iter() {
            let effective = match status {
                ComponentStatus::HealthyUntil(until) if until.le(&now) => {
                    info!("{} component of {} stalled", component, self.name);
                    ComponentStatus::Stalled
                }
                other => other.clone(),
            };
            if !matches!(effective, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(component.clone(), effective);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::ops::{Add, Sub};

    use super::*;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = time::OffsetDateTime::now_utc().add(Duration::seconds(5));
        while !check() && time::OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn component_starts_then_reports() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("consumer".to_string(), Duration::seconds(30))
            .await;

        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        assert_eq!(
            registry.get_status().components.get("consumer"),
            Some(&ComponentStatus::Starting)
        );
        assert!(!registry.get_status().healthy);

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn stale_report_downgrades_to_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("consumer".to_string(), Duration::seconds(30))
            .await;

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                time::OffsetDateTime::now_utc().sub(Duration::seconds(1)),
            ))
            .await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("consumer"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
