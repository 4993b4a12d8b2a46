//! Bounded ready buffer feeding the workers.
//!
//! A Redis list with a hard cap: the capacity check and the push are one Lua
//! script, so the cap holds under concurrent admits. Workers consume with
//! BLPOP so an idle worker costs nothing between jobs.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::warn;

use crate::error::EngineError;
use crate::keys::KeyBuilder;
use crate::scripts::Scripts;

#[derive(Clone)]
pub struct ReadyQueue {
    redis: ConnectionManager,
    keys: KeyBuilder,
    scripts: Arc<Scripts>,
    max_size: u64,
}

impl ReadyQueue {
    pub fn new(
        redis: ConnectionManager,
        keys: KeyBuilder,
        scripts: Arc<Scripts>,
        max_size: u64,
    ) -> Self {
        Self {
            redis,
            keys,
            scripts,
            max_size,
        }
    }

    /// Appends a job id unless the buffer is at capacity. Returns false when
    /// full; the caller decides where the job goes instead.
    pub async fn push(&self, job_id: &str) -> Result<bool, EngineError> {
        let mut conn = self.redis.clone();

        let pushed: i64 = self
            .scripts
            .ready_queue_push
            .key(self.keys.ready_queue())
            .arg(job_id)
            .arg(self.max_size)
            .invoke_async(&mut conn)
            .await?;

        if pushed == 0 {
            warn!(max_size = self.max_size, "Ready queue full");
            return Ok(false);
        }

        Ok(true)
    }

    /// Non-blocking pop of the head job id.
    pub async fn pop(&self) -> Result<Option<String>, EngineError> {
        let mut conn = self.redis.clone();
        let job_id: Option<String> = conn.lpop(self.keys.ready_queue(), None).await?;
        Ok(job_id)
    }

    /// Blocks up to `timeout_sec` for a job id; `None` on timeout.
    ///
    /// BLPOP parks the whole connection, so a worker must call this on a
    /// connection it owns, never on one shared with other commands.
    pub async fn blocking_pop(&self, timeout_sec: u64) -> Result<Option<String>, EngineError> {
        let mut conn = self.redis.clone();

        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(self.keys.ready_queue())
            .arg(timeout_sec)
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|(_, job_id)| job_id))
    }

    pub async fn size(&self) -> Result<u64, EngineError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.llen(self.keys.ready_queue()).await?;
        Ok(len)
    }

    pub async fn has_capacity(&self) -> Result<bool, EngineError> {
        Ok(self.size().await? < self.max_size)
    }

    /// Free slots right now; the dispatcher caps its batch with this.
    pub async fn capacity_remaining(&self) -> Result<u64, EngineError> {
        Ok(self.max_size.saturating_sub(self.size().await?))
    }
}
