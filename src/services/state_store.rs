use redis::AsyncCommands;

use crate::models::state::JobState;

const STATE_KEY: &str = "imagine_batch:state";

/// Redis persistence for the job-state blob.
///
/// The whole record is written as one JSON value after every mutation, so an
/// interrupted process restores the queue, statuses and counters on startup.
pub struct StateStore {
    client: redis::Client,
}

impl StateStore {
    pub fn new(redis_url: &str) -> Result<Self, StateStoreError> {
        let client = redis::Client::open(redis_url).map_err(StateStoreError::Redis)?;
        Ok(Self { client })
    }

    pub async fn save(&self, state: &JobState) -> Result<(), StateStoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StateStoreError::Redis)?;
        let payload = serde_json::to_string(state).map_err(StateStoreError::Serialize)?;
        conn.set::<_, _, ()>(STATE_KEY, payload)
            .await
            .map_err(StateStoreError::Redis)?;
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<JobState>, StateStoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StateStoreError::Redis)?;
        let raw: Option<String> = conn.get(STATE_KEY).await.map_err(StateStoreError::Redis)?;
        match raw {
            Some(payload) => {
                let state = serde_json::from_str(&payload).map_err(StateStoreError::Serialize)?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub async fn clear(&self) -> Result<(), StateStoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StateStoreError::Redis)?;
        conn.del::<_, ()>(STATE_KEY)
            .await
            .map_err(StateStoreError::Redis)?;
        Ok(())
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), StateStoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StateStoreError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(StateStoreError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
