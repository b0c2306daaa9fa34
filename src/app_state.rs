use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::services::{
    encryption::EncryptionService, endpoint::EndpointCaller, evaluator::Evaluator,
    queue::JobQueue,
};

/// Pipeline tunables shared by processors and dispatch handlers.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Minimum interval between per-item dispatches.
    pub dispatch_interval: Duration,
    /// Fan-in wait budget per dispatched item.
    pub fan_in_per_item: Duration,
    /// Minimum fan-in wait regardless of item count.
    pub fan_in_floor: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            dispatch_interval: Duration::from_millis(config.dispatch_interval_ms),
            fan_in_per_item: Duration::from_secs(config.fan_in_timeout_secs_per_item),
            fan_in_floor: Duration::from_secs(config.fan_in_timeout_floor_secs),
        }
    }

    /// Fan-in wait scaled to the phase's item count.
    pub fn fan_in_timeout(&self, item_count: usize) -> Duration {
        let scaled = self.fan_in_per_item * item_count.max(1) as u32;
        scaled.max(self.fan_in_floor)
    }
}

/// Shared application state passed to route handlers and the worker.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<JobQueue>,
    pub encryption: Arc<EncryptionService>,
    pub endpoint: Arc<EndpointCaller>,
    pub evaluator: Arc<Evaluator>,
    pub pipeline: PipelineSettings,
}

impl AppState {
    pub fn new(
        db: PgPool,
        queue: JobQueue,
        encryption: EncryptionService,
        endpoint: EndpointCaller,
        evaluator: Evaluator,
        pipeline: PipelineSettings,
    ) -> Self {
        Self {
            db,
            queue: Arc::new(queue),
            encryption: Arc::new(encryption),
            endpoint: Arc::new(endpoint),
            evaluator: Arc::new(evaluator),
            pipeline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_in_timeout_scales_with_items() {
        let settings = PipelineSettings {
            dispatch_interval: Duration::from_millis(1000),
            fan_in_per_item: Duration::from_secs(60),
            fan_in_floor: Duration::from_secs(120),
        };
        // Floor applies for tiny jobs.
        assert_eq!(settings.fan_in_timeout(0), Duration::from_secs(120));
        assert_eq!(settings.fan_in_timeout(1), Duration::from_secs(120));
        // Larger jobs scale linearly.
        assert_eq!(settings.fan_in_timeout(10), Duration::from_secs(600));
    }
}
