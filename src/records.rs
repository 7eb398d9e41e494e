// intercom-signaling-service/src/records.rs

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::call::state::CallSession;
use crate::error::RecordError;

const RECORD_LIST_KEY: &str = "intercom:call_records";
const RECORD_LIST_MAX: isize = 10_000;
const RECORD_TTL_SECS: u64 = 86_400;

/// Finalized history entry for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_seconds: i64,
    pub result: String,
}

impl CallRecord {
    pub fn from_session(session: &CallSession) -> Self {
        Self {
            call_id: session.call_id.clone(),
            caller_id: session.caller_id.clone(),
            callee_id: session.callee_id.clone(),
            start: session.start_time,
            end: session.end_time.unwrap_or(session.last_activity),
            duration_seconds: session.duration_seconds(),
            result: session.end_reason.clone().unwrap_or_default(),
        }
    }
}

/// Where finalized call records go.
#[async_trait]
pub trait CallRecordSink: Send + Sync {
    async fn save_call_record(&self, record: &CallRecord) -> Result<(), RecordError>;
}

/// Keeps call history in Redis: a capped list of all records plus one
/// expiring key per call.
#[derive(Clone)]
pub struct RedisCallRecordSink {
    redis: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

impl RedisCallRecordSink {
    pub async fn new(redis_url: &str) -> Result<Self, RecordError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(event = "REDIS_CONNECTED", "Call record store connected");
        Ok(Self {
            redis: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl CallRecordSink for RedisCallRecordSink {
    async fn save_call_record(&self, record: &CallRecord) -> Result<(), RecordError> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.redis.lock().await;

        conn.lpush::<_, _, ()>(RECORD_LIST_KEY, &json).await?;
        conn.ltrim::<_, ()>(RECORD_LIST_KEY, 0, RECORD_LIST_MAX - 1).await?;
        let key = format!("intercom:call:{}", record.call_id);
        conn.set_ex::<_, _, ()>(&key, &json, RECORD_TTL_SECS).await?;

        debug!(call_id = %record.call_id, "💾 Call record persisted to Redis");
        Ok(())
    }
}

/// Used when no Redis is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCallRecordSink;

#[async_trait]
impl CallRecordSink for LogCallRecordSink {
    async fn save_call_record(&self, record: &CallRecord) -> Result<(), RecordError> {
        info!(
            event = "CALL_RECORD",
            call_id = %record.call_id,
            caller_id = %record.caller_id,
            callee_id = %record.callee_id,
            duration_seconds = record.duration_seconds,
            result = %record.result,
            "📝 Call record"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCallRecordSink {
    records: SyncMutex<Vec<CallRecord>>,
}

impl MemoryCallRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl CallRecordSink for MemoryCallRecordSink {
    async fn save_call_record(&self, record: &CallRecord) -> Result<(), RecordError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
