use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use strum::Display;

const JOB_QUEUE_KEY: &str = "fairlens:jobs";
const JOB_PROCESSING_KEY: &str = "fairlens:jobs:processing";
const DISPATCH_QUEUE_KEY: &str = "fairlens:dispatches";
const DISPATCH_PROCESSING_KEY: &str = "fairlens:dispatches:processing";

/// Job-creation event serialized into Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: String,
}

/// Which fan-out phase a dispatch belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DispatchPhase {
    Collection,
    Evaluation,
}

/// Per-item dispatch event. Carries the identifying fields (job id, item
/// index) directly so completion handling never reconstructs them from a
/// wrapping envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDispatch {
    pub job_id: String,
    pub index: u32,
    pub category: String,
    pub prompt: String,
    pub phase: DispatchPhase,
}

/// Redis-backed at-least-once queues for job events, per-item dispatches
/// and fan-in signals.
pub struct JobQueue {
    client: redis::Client,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    fn fan_in_key(job_id: &str, phase: DispatchPhase) -> String {
        format!("fairlens:fanin:{job_id}:{phase}")
    }

    /// Enqueue a job-creation event.
    pub async fn enqueue_job(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(JOB_QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Dequeue a job event (pop with move to processing list).
    pub async fn dequeue_job(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let result: Option<String> = conn
            .rpoplpush(JOB_QUEUE_KEY, JOB_PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let job: QueuedJob =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Mark a job event complete (remove from processing list).
    pub async fn complete_job(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(JOB_PROCESSING_KEY, 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Enqueue a per-item dispatch event.
    pub async fn enqueue_dispatch(&self, dispatch: &ItemDispatch) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(dispatch).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(DISPATCH_QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Dequeue a dispatch event (pop with move to processing list).
    pub async fn dequeue_dispatch(&self) -> Result<Option<ItemDispatch>, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let result: Option<String> = conn
            .rpoplpush(DISPATCH_QUEUE_KEY, DISPATCH_PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let dispatch: ItemDispatch =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(dispatch))
            }
            None => Ok(None),
        }
    }

    /// Mark a dispatch event complete (remove from processing list).
    pub async fn complete_dispatch(&self, dispatch: &ItemDispatch) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(dispatch).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(DISPATCH_PROCESSING_KEY, 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Signal that every item of the given phase has reported in.
    pub async fn signal_fan_in(
        &self,
        job_id: &str,
        phase: DispatchPhase,
    ) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        conn.lpush::<_, _, ()>(Self::fan_in_key(job_id, phase), "done")
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Block until the fan-in signal for the given phase arrives, or the
    /// timeout expires. Returns true when signaled.
    pub async fn wait_fan_in(
        &self,
        job_id: &str,
        phase: DispatchPhase,
        timeout: std::time::Duration,
    ) -> Result<bool, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let result: Option<(String, String)> = conn
            .brpop(Self::fan_in_key(job_id, phase), timeout.as_secs_f64())
            .await
            .map_err(QueueError::Redis)?;
        Ok(result.is_some())
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Current depth of the dispatch queue (for the queue-depth gauge).
    pub async fn dispatch_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let depth: u64 = conn
            .llen(DISPATCH_QUEUE_KEY)
            .await
            .map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_round_trips_through_json() {
        let dispatch = ItemDispatch {
            job_id: "job-42".into(),
            index: 3,
            category: "race".into(),
            prompt: "Describe a software engineer.".into(),
            phase: DispatchPhase::Collection,
        };
        let json = serde_json::to_string(&dispatch).unwrap();
        let parsed: ItemDispatch = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.job_id, "job-42");
        assert_eq!(parsed.index, 3);
        assert_eq!(parsed.phase, DispatchPhase::Collection);
    }

    #[test]
    fn test_fan_in_keys_are_phase_scoped() {
        let collection = JobQueue::fan_in_key("job-1", DispatchPhase::Collection);
        let evaluation = JobQueue::fan_in_key("job-1", DispatchPhase::Evaluation);
        assert_ne!(collection, evaluation);
        assert!(collection.ends_with("collection"));
    }
}
