//! Redis adapter for [`JobCache`].
//!
//! Each job is a hash at `job:{job_id}` with a TTL, plus a member of the
//! `jobs:index` sorted set scored by creation time (milliseconds) for
//! listing. Index members whose hash has expired are pruned while listing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::debug;

use super::cache::JobCache;
use super::job::{JobPatch, JobRecord, JobStatus};
use super::TrackerError;

/// Sorted set of job ids by creation time.
pub const JOB_INDEX_KEY: &str = "jobs:index";

const LIST_PAGE: isize = 100;

/// Writes a job hash unless the key already exists.
/// KEYS[2] = index, ARGV[1] = ttl seconds, ARGV[2] = index score,
/// ARGV[3] = job id, ARGV[4..] = field/value pairs. Returns 1 when written.
const PUT_IF_ABSENT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
for i = 4, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('EXPIRE', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

/// Merges field/value pairs into an existing hash and refreshes its TTL.
/// ARGV[1] = ttl seconds, ARGV[2] = started_at (set only if absent, may be
/// empty), ARGV[3..] = field/value pairs. Returns the status held before
/// the merge, or nil when the key is missing.
const MERGE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
if ARGV[2] ~= '' then
    redis.call('HSETNX', KEYS[1], 'started_at', ARGV[2])
end
local current = redis.call('HGET', KEYS[1], 'status')
local settled = current == 'completed' or current == 'failed' or current == 'cancelled'
for i = 3, #ARGV, 2 do
    if not (settled and (ARGV[i] == 'status' or ARGV[i] == 'completed_at')) then
        redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
    end
end
redis.call('EXPIRE', KEYS[1], ARGV[1])
return current
"#;

/// Increments `tasks_processed` unless it already equals `tasks_total`.
/// Returns the resulting count, or -1 when the key is missing.
const INCREMENT_SCRIPT: &str = r#"
local total = redis.call('HGET', KEYS[1], 'tasks_total')
if not total then
    return -1
end
local done = tonumber(redis.call('HGET', KEYS[1], 'tasks_processed') or '0')
if done < tonumber(total) then
    done = redis.call('HINCRBY', KEYS[1], 'tasks_processed', 1)
end
redis.call('EXPIRE', KEYS[1], ARGV[1])
return done
"#;

pub fn job_key(job_id: &str) -> String {
    format!("job:{}", job_id)
}

/// Job cache backed by Redis hashes.
pub struct RedisJobCache {
    redis: ConnectionManager,
    put_if_absent_script: Script,
    merge_script: Script,
    increment_script: Script,
}

impl RedisJobCache {
    /// Connects to Redis.
    pub async fn connect(redis_url: &str) -> Result<Self, TrackerError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| TrackerError::Cache(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| TrackerError::Cache(e.to_string()))?;
        Ok(Self::from_connection(redis))
    }

    /// Creates a cache from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            put_if_absent_script: Script::new(PUT_IF_ABSENT_SCRIPT),
            merge_script: Script::new(MERGE_SCRIPT),
            increment_script: Script::new(INCREMENT_SCRIPT),
        }
    }
}

#[async_trait]
impl JobCache for RedisJobCache {
    async fn put(&self, record: &JobRecord, ttl: Duration) -> Result<(), TrackerError> {
        let key = job_key(&record.job_id);
        let fields = encode(record)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&key)
            .hset_multiple(&key, &fields)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl_secs(ttl))
            .zadd(
                JOB_INDEX_KEY,
                &record.job_id,
                record.created_at.timestamp_millis(),
            );
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        record: &JobRecord,
        ttl: Duration,
    ) -> Result<bool, TrackerError> {
        let mut invocation = self.put_if_absent_script.key(job_key(&record.job_id));
        invocation
            .key(JOB_INDEX_KEY)
            .arg(ttl_secs(ttl))
            .arg(record.created_at.timestamp_millis())
            .arg(&record.job_id);
        for (field, value) in encode(record)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.redis.clone();
        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }

    async fn merge(
        &self,
        job_id: &str,
        patch: &JobPatch,
        ttl: Duration,
    ) -> Result<Option<JobStatus>, TrackerError> {
        let mut invocation = self.merge_script.key(job_key(job_id));
        invocation
            .arg(ttl_secs(ttl))
            .arg(patch.started_at.map(|t| t.to_rfc3339()).unwrap_or_default());

        if let Some(status) = patch.status {
            invocation.arg("status").arg(status.as_str());
        }
        if let Some(ref error) = patch.error {
            invocation.arg("error_message").arg(error);
        }
        if let Some(completed_at) = patch.completed_at {
            invocation.arg("completed_at").arg(completed_at.to_rfc3339());
        }

        let mut conn = self.redis.clone();
        let previous: Option<String> = invocation.invoke_async(&mut conn).await?;
        previous.map(|status| status.parse()).transpose()
    }

    async fn increment_processed(
        &self,
        job_id: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, TrackerError> {
        let mut conn = self.redis.clone();
        let count: i64 = self
            .increment_script
            .key(job_key(job_id))
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok((count >= 0).then_some(count as u64))
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, TrackerError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(job_key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode(job_id, &fields).map(Some)
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, TrackerError> {
        let mut conn = self.redis.clone();
        let mut records = Vec::new();
        let mut start: isize = 0;

        while records.len() < limit {
            let ids: Vec<String> = conn
                .zrevrange(JOB_INDEX_KEY, start, start + LIST_PAGE - 1)
                .await?;
            if ids.is_empty() {
                break;
            }
            start += LIST_PAGE;

            let mut pipe = redis::pipe();
            for id in &ids {
                pipe.hgetall(job_key(id));
            }
            let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

            let mut expired = Vec::new();
            for (id, fields) in ids.iter().zip(hashes) {
                if fields.is_empty() {
                    expired.push(id.clone());
                    continue;
                }
                let record = decode(id, &fields)?;
                if status.map_or(true, |s| record.status == s) && records.len() < limit {
                    records.push(record);
                }
            }

            if !expired.is_empty() {
                debug!(count = expired.len(), "Pruning expired jobs from index");
                conn.zrem::<_, _, ()>(JOB_INDEX_KEY, &expired).await?;
                start -= expired.len() as isize;
            }
        }

        Ok(records)
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn encode(record: &JobRecord) -> Result<Vec<(&'static str, String)>, TrackerError> {
    let mut fields = vec![
        ("job_id", record.job_id.clone()),
        ("job_type", record.job_type.clone()),
        ("status", record.status.as_str().to_string()),
        ("tasks_total", record.tasks_total.to_string()),
        ("tasks_processed", record.tasks_processed.to_string()),
        ("created_at", record.created_at.to_rfc3339()),
        ("metadata", serde_json::to_string(&record.metadata)?),
    ];
    if let Some(started_at) = record.started_at {
        fields.push(("started_at", started_at.to_rfc3339()));
    }
    if let Some(completed_at) = record.completed_at {
        fields.push(("completed_at", completed_at.to_rfc3339()));
    }
    if let Some(ref error) = record.error {
        fields.push(("error_message", error.clone()));
    }
    Ok(fields)
}

fn decode(job_id: &str, fields: &HashMap<String, String>) -> Result<JobRecord, TrackerError> {
    let corrupt = |reason: String| TrackerError::Corrupt {
        job_id: job_id.to_string(),
        reason,
    };
    let number = |name: &str| -> Result<u64, TrackerError> {
        fields
            .get(name)
            .ok_or_else(|| corrupt(format!("missing {}", name)))?
            .parse()
            .map_err(|_| corrupt(format!("invalid {}", name)))
    };
    let timestamp = |name: &str| -> Option<DateTime<Utc>> {
        fields
            .get(name)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    };

    Ok(JobRecord {
        job_id: job_id.to_string(),
        job_type: fields.get("job_type").cloned().unwrap_or_default(),
        status: fields
            .get("status")
            .ok_or_else(|| corrupt("missing status".to_string()))?
            .parse()?,
        tasks_total: number("tasks_total")?,
        tasks_processed: number("tasks_processed")?,
        created_at: timestamp("created_at").ok_or_else(|| corrupt("missing created_at".to_string()))?,
        started_at: timestamp("started_at"),
        completed_at: timestamp("completed_at"),
        error: fields.get("error_message").cloned(),
        metadata: match fields.get("metadata") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Default::default(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn as_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_job_key() {
        assert_eq!(job_key("abc"), "job:abc");
    }

    #[test]
    fn test_ttl_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(3600)), 3600);
    }

    #[test]
    fn test_encode_decode_hash() {
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), json!("upload"));
        let mut record = JobRecord::new("j-1", "lightrag_ingestion", 4, metadata);
        record.tasks_processed = 3;
        record.error = Some("partial".to_string());

        let fields = as_map(encode(&record).unwrap());
        assert!(!fields.contains_key("started_at"));

        let decoded = decode("j-1", &fields).unwrap();
        assert_eq!(decoded.tasks_processed, 3);
        assert_eq!(decoded.error.as_deref(), Some("partial"));
        assert_eq!(decoded.metadata["source"], "upload");
        assert_eq!(
            decoded.created_at.timestamp_millis(),
            record.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_decode_rejects_bad_counts() {
        let record = JobRecord::new("j-1", "lightrag_ingestion", 4, Map::new());
        let mut fields = as_map(encode(&record).unwrap());
        fields.insert("tasks_total".to_string(), "many".to_string());

        let err = decode("j-1", &fields).unwrap_err();
        assert!(matches!(err, TrackerError::Corrupt { .. }));
    }
}
