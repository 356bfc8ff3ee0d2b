//! Health reporting for the asynchronous loops of a worker process.
//!
//! A worker is only trustworthy while every loop it runs (queue pollers,
//! cron ticker, dispatcher batches) keeps making progress. Each loop
//! registers itself with a [`HealthRegistry`] and receives a
//! [`HealthHandle`] it must ping more often than its deadline. The process
//! is healthy iff every registered component pinged recently; a component
//! that goes quiet is reported as stalled and fails the liveness probe.
//!
//! Liveness and readiness are deliberately not merged into one state:
//! give each probe its own registry instance.

use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::warn;

pub mod heartbeat;

pub use heartbeat::HeartbeatFile;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set at registration, before the component's first report.
    Starting,
    /// The component reported healthy and has until the deadline to report again.
    HealthyUntil(OffsetDateTime),
    /// The component reported itself broken.
    Unhealthy,
    /// The component missed its reporting deadline.
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True iff every registered component is within its deadline.
    pub healthy: bool,
    /// Per-component status, for probe output.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

/// A per-component reporting handle. Cheap to clone; pass one into each loop.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the deadline
    /// this handle was registered with.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Poisoned lock: the probe will fail and the process restart.
            Err(_) => warn!("poisoned health registry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component. The returned handle must be handed to the
    /// component so it can report within `deadline`.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Compute the overall process status. Usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(map) => map,
            Err(_) => {
                warn!("poisoned health registry lock");
                return HealthStatus::default();
            }
        };

        let now = OffsetDateTime::now_utc();
        // Unhealthy until at least one component has registered.
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: Default::default(),
        };

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    result.healthy = false;
                    result.components.insert(name.clone(), status.clone());
                }
            }
        }

        if !result.healthy {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;

    #[test]
    fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn one_component() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry.register("worker", Duration::seconds(30));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Unhealthy);
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[test]
    fn stalled_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker", Duration::seconds(30));

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().sub(Duration::seconds(1)),
        ));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn all_components_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let one = registry.register("one", Duration::seconds(30));
        let two = registry.register("two", Duration::seconds(30));

        one.report_healthy();
        assert!(!registry.get_status().healthy);

        two.report_healthy();
        assert!(registry.get_status().healthy);

        one.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);

        one.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn into_response() {
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
