//! Redis-backed job store.
//!
//! Key layout under `{prefix}`:
//! - `{prefix}:job:{id}` hash with `record` (JSON) and, while active, `lease`
//! - `{prefix}:queue:{name}:waiting` list, pushed left and claimed from the right
//! - `{prefix}:queue:{name}:active` list
//! - `{prefix}:queue:{name}:heartbeats` sorted set scored by last beat (ms)
//! - `{prefix}:queue:{name}:delayed` sorted set scored by due time (ms)
//! - `{prefix}:queue:{name}:completed` / `failed` sorted sets scored by finish time
//! - `{prefix}:queue:{name}:dead` list of dead-letter JSON, newest first
//!
//! Requires Redis 6.2 or newer for `BLMOVE` and `LPOS`.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DeadLetter, JobStore, StallReport, Transition};
use crate::config::{RetentionPolicy, StoreConfig};
use crate::job::{JobId, JobRecord, JobState, QueueName};
use crate::lease::JobLease;
use crate::queue::QueueStats;

/// Shared by the terminal transitions: records the job in its terminal set,
/// prunes the oldest members beyond `keep`, appends a dead letter.
const SETTLE_FN: &str = r#"
local function settle(target, id, score, keep, prefix, dead_key, dead_entry, keep_dead)
  redis.call('ZADD', target, score, id)
  local pruned = 0
  if keep >= 0 then
    local excess = redis.call('ZCARD', target) - keep
    if excess > 0 then
      local old = redis.call('ZRANGE', target, 0, excess - 1)
      for _, old_id in ipairs(old) do
        redis.call('DEL', prefix .. old_id)
      end
      redis.call('ZREMRANGEBYRANK', target, 0, excess - 1)
      pruned = excess
    end
  end
  if dead_entry ~= '' and keep_dead > 0 then
    redis.call('LPUSH', dead_key, dead_entry)
    redis.call('LTRIM', dead_key, 0, keep_dead - 1)
  end
  return pruned
end
"#;

/// Refuses ids that stall recovery already took back from `active`, and ids
/// another claimer has since activated.
const ACTIVATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('LREM', KEYS[3], 0, ARGV[4])
  return 0
end
if not redis.call('LPOS', KEYS[3], ARGV[4]) then return 0 end
if redis.call('HEXISTS', KEYS[1], 'lease') == 1 then return 0 end
redis.call('HSET', KEYS[1], 'record', ARGV[2], 'lease', ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
return 1
"#;

const HEARTBEAT: &str = r#"
if redis.call('HGET', KEYS[1], 'lease') ~= ARGV[1] then return 0 end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

const FINISH: &str = r#"
if redis.call('HGET', KEYS[1], 'lease') ~= ARGV[1] then return -1 end
redis.call('HSET', KEYS[1], 'record', ARGV[2])
redis.call('HDEL', KEYS[1], 'lease')
redis.call('LREM', KEYS[2], 0, ARGV[3])
redis.call('ZREM', KEYS[3], ARGV[3])
return settle(KEYS[4], ARGV[3], ARGV[4], tonumber(ARGV[5]), ARGV[6], KEYS[5], ARGV[7], tonumber(ARGV[8]))
"#;

const STALL: &str = r#"
local current = redis.call('HGET', KEYS[1], 'lease') or ''
if current ~= ARGV[1] then return -1 end
local beat = redis.call('ZSCORE', KEYS[3], ARGV[3])
if (not beat) or tonumber(beat) >= tonumber(ARGV[2]) then return -1 end
redis.call('HSET', KEYS[1], 'record', ARGV[4])
redis.call('HDEL', KEYS[1], 'lease')
redis.call('LREM', KEYS[2], 0, ARGV[3])
redis.call('ZREM', KEYS[3], ARGV[3])
if ARGV[5] == 'requeue' then
  redis.call('LPUSH', KEYS[4], ARGV[3])
  return 0
end
return settle(KEYS[5], ARGV[3], ARGV[6], tonumber(ARGV[7]), ARGV[8], KEYS[6], ARGV[9], tonumber(ARGV[10]))
"#;

const PROMOTE: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HSET', KEYS[3], 'record', ARGV[2])
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

const REPLAY: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then return 0 end
redis.call('HSET', KEYS[2], 'record', ARGV[2])
redis.call('LPUSH', KEYS[3], ARGV[3])
return 1
"#;

struct Scripts {
    activate: Script,
    heartbeat: Script,
    finish: Script,
    stall: Script,
    promote: Script,
    replay: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            activate: Script::new(ACTIVATE),
            heartbeat: Script::new(HEARTBEAT),
            finish: Script::new(&format!("{SETTLE_FN}{FINISH}")),
            stall: Script::new(&format!("{SETTLE_FN}{STALL}")),
            promote: Script::new(PROMOTE),
            replay: Script::new(REPLAY),
        }
    }
}

#[derive(Clone, Debug)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job(&self, id: JobId) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    fn queue(&self, queue: QueueName, part: &str) -> String {
        format!("{}:queue:{queue}:{part}", self.prefix)
    }
}

/// Where a terminal transition lands.
struct Settle<'a> {
    target: &'static str,
    score: i64,
    /// `None` disables pruning.
    keep: Option<usize>,
    dead: Option<(&'a DeadLetter, usize)>,
}

/// Durable store on Redis.
///
/// Blocking claims run on one dedicated connection per worker so a parked
/// `BLMOVE` never holds up commands multiplexed on the shared connection.
pub struct RedisJobStore {
    client: redis::Client,
    conn: ConnectionManager,
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
    keys: Keys,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("prefix", &self.keys.prefix)
            .finish()
    }
}

impl RedisJobStore {
    pub async fn connect(config: &StoreConfig) -> anyhow::Result<Self> {
        let url = config
            .redis_url
            .as_deref()
            .context("redis url is not configured")?;
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("connecting to redis")?;
        debug!(prefix = %config.key_prefix, "redis job store connected");

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(HashMap::new()),
            keys: Keys {
                prefix: config.key_prefix.clone(),
            },
            scripts: Scripts::new(),
        })
    }

    async fn blocking_connection(&self, worker_id: &str) -> anyhow::Result<MultiplexedConnection> {
        let mut pool = self.blocking.lock().await;
        if let Some(conn) = pool.get(worker_id) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("opening claim connection")?;
        pool.insert(worker_id.to_string(), conn.clone());
        Ok(conn)
    }

    async fn drop_blocking_connection(&self, worker_id: &str) {
        self.blocking.lock().await.remove(worker_id);
    }

    async fn pop_waiting(
        &self,
        queue: QueueName,
        worker_id: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<String>> {
        let waiting = self.keys.queue(queue, "waiting");
        let active = self.keys.queue(queue, "active");

        // a BLMOVE timeout of 0 blocks forever
        if wait.is_zero() {
            let mut conn = self.conn.clone();
            let popped: Option<String> = redis::cmd("LMOVE")
                .arg(&waiting)
                .arg(&active)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            return Ok(popped);
        }

        let mut conn = self.blocking_connection(worker_id).await?;
        let popped: redis::RedisResult<Option<String>> = redis::cmd("BLMOVE")
            .arg(&waiting)
            .arg(&active)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await;
        match popped {
            Ok(popped) => Ok(popped),
            Err(err) => {
                self.drop_blocking_connection(worker_id).await;
                Err(err).context("BLMOVE failed")
            }
        }
    }

    /// Turns an id already moved to `active` into a lease. `None` when the
    /// record is gone or stall recovery reclaimed the id first.
    async fn activate(
        &self,
        queue: QueueName,
        raw_id: &str,
        worker_id: &str,
    ) -> anyhow::Result<Option<JobLease>> {
        let id: JobId = raw_id.parse().context("malformed job id in waiting list")?;

        let Some(mut record) = self.load(id).await? else {
            warn!(job_id = %id, queue = %queue, "claimed id has no job record, dropping");
            let mut conn = self.conn.clone();
            conn.lrem::<_, _, ()>(self.keys.queue(queue, "active"), 0, raw_id)
                .await?;
            return Ok(None);
        };

        let now = Utc::now();
        record.activate(now);
        let lease = JobLease::new(record, worker_id);

        let mut conn = self.conn.clone();
        let activated: i64 = self
            .scripts
            .activate
            .key(self.keys.job(id))
            .key(self.keys.queue(queue, "heartbeats"))
            .key(self.keys.queue(queue, "active"))
            .arg(lease.lease_id.to_string())
            .arg(serde_json::to_string(&lease.job)?)
            .arg(now.timestamp_millis())
            .arg(raw_id)
            .invoke_async(&mut conn)
            .await
            .context("activating claimed job")?;

        Ok((activated == 1).then_some(lease))
    }

    async fn load(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(self.keys.job(id), "record").await?;
        raw.map(|raw| serde_json::from_str(&raw).with_context(|| format!("decoding job {id}")))
            .transpose()
    }

    async fn finish(
        &self,
        lease: &JobLease,
        record: &JobRecord,
        settle: Settle<'_>,
    ) -> anyhow::Result<Transition> {
        let queue = lease.queue();
        let id = lease.job_id();
        let dead_entry = match settle.dead {
            Some((dead, _)) => serde_json::to_string(dead)?,
            None => String::new(),
        };
        let keep_dead = settle.dead.map(|(_, keep)| keep).unwrap_or(0);

        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .scripts
            .finish
            .key(self.keys.job(id))
            .key(self.keys.queue(queue, "active"))
            .key(self.keys.queue(queue, "heartbeats"))
            .key(self.keys.queue(queue, settle.target))
            .key(self.keys.queue(queue, "dead"))
            .arg(lease.lease_id.to_string())
            .arg(serde_json::to_string(record)?)
            .arg(id.to_string())
            .arg(settle.score)
            .arg(keep_arg(settle.keep))
            .arg(self.keys.job_prefix())
            .arg(dead_entry)
            .arg(keep_dead)
            .invoke_async(&mut conn)
            .await
            .context("running finish script")?;

        Ok(transition(outcome))
    }

    /// Active ids with no heartbeat were popped by a claimer that died before
    /// activating them; give them a heartbeat so the normal sweep picks them up.
    async fn adopt_orphans(&self, queue: QueueName) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let active: Vec<String> = conn.lrange(self.keys.queue(queue, "active"), 0, -1).await?;
        if active.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let heartbeats = self.keys.queue(queue, "heartbeats");
        let mut pipe = redis::pipe();
        for id in &active {
            pipe.cmd("ZADD")
                .arg(&heartbeats)
                .arg("NX")
                .arg(now)
                .arg(id)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

fn keep_arg(keep: Option<usize>) -> i64 {
    keep.map(|keep| keep.min(i64::MAX as usize) as i64).unwrap_or(-1)
}

fn transition(outcome: i64) -> Transition {
    if outcome < 0 {
        Transition::LeaseLost
    } else {
        Transition::Applied {
            pruned: outcome as usize,
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, record: JobRecord) -> anyhow::Result<()> {
        let json = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(self.keys.job(record.id), "record", json)
            .ignore()
            .lpush(self.keys.queue(record.queue, "waiting"), record.id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .context("inserting job")?;
        Ok(())
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<JobLease>> {
        let Some(raw_id) = self.pop_waiting(queue, worker_id, wait).await? else {
            return Ok(None);
        };
        self.activate(queue, &raw_id, worker_id).await
    }

    async fn heartbeat(&self, lease: &JobLease) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = self
            .scripts
            .heartbeat
            .key(self.keys.job(lease.job_id()))
            .key(self.keys.queue(lease.queue(), "heartbeats"))
            .arg(lease.lease_id.to_string())
            .arg(Utc::now().timestamp_millis())
            .arg(lease.job_id().to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn complete(
        &self,
        lease: &JobLease,
        result: serde_json::Value,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<Transition> {
        let now = Utc::now();
        let mut record = lease.job.clone();
        record.mark_completed(result, now);
        self.finish(
            lease,
            &record,
            Settle {
                target: "completed",
                score: now.timestamp_millis(),
                keep: Some(retention.keep_completed),
                dead: None,
            },
        )
        .await
    }

    async fn retry(
        &self,
        lease: &JobLease,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> anyhow::Result<Transition> {
        let mut record = lease.job.clone();
        record.mark_delayed(error, next_attempt_at);
        self.finish(
            lease,
            &record,
            Settle {
                target: "delayed",
                score: next_attempt_at.timestamp_millis(),
                keep: None,
                dead: None,
            },
        )
        .await
    }

    async fn fail(
        &self,
        lease: &JobLease,
        error: &str,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<Transition> {
        let now = Utc::now();
        let mut record = lease.job.clone();
        record.mark_failed(error, now);
        let dead = DeadLetter::from_failed(&record);
        self.finish(
            lease,
            &record,
            Settle {
                target: "failed",
                score: now.timestamp_millis(),
                keep: Some(retention.keep_failed),
                dead: Some((&dead, retention.keep_dead_letters)),
            },
        )
        .await
    }

    async fn promote_delayed(&self, queue: QueueName, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let delayed = self.keys.queue(queue, "delayed");
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(&delayed, "-inf", now.timestamp_millis())
            .await?;

        let mut promoted = 0;
        for raw_id in due {
            let id: JobId = raw_id.parse().context("malformed job id in delayed set")?;
            let Some(mut record) = self.load(id).await? else {
                conn.zrem::<_, _, ()>(&delayed, &raw_id).await?;
                continue;
            };
            record.promote();
            let moved: i64 = self
                .scripts
                .promote
                .key(&delayed)
                .key(self.keys.queue(queue, "waiting"))
                .key(self.keys.job(id))
                .arg(&raw_id)
                .arg(serde_json::to_string(&record)?)
                .invoke_async(&mut conn)
                .await?;
            promoted += moved as u64;
        }
        Ok(promoted)
    }

    async fn recover_stalled(
        &self,
        queue: QueueName,
        stalled_before: DateTime<Utc>,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<StallReport> {
        self.adopt_orphans(queue).await?;

        let heartbeats = self.keys.queue(queue, "heartbeats");
        let cutoff = stalled_before.timestamp_millis();
        let mut conn = self.conn.clone();
        let stalled: Vec<String> = conn
            .zrangebyscore(&heartbeats, "-inf", format!("({cutoff}"))
            .await?;

        let mut report = StallReport::default();
        for raw_id in stalled {
            let id: JobId = raw_id.parse().context("malformed job id in heartbeat set")?;
            let (raw_record, lease): (Option<String>, Option<String>) = conn
                .hget(self.keys.job(id), &["record", "lease"])
                .await?;
            let Some(raw_record) = raw_record else {
                redis::pipe()
                    .lrem(self.keys.queue(queue, "active"), 0, &raw_id)
                    .ignore()
                    .zrem(&heartbeats, &raw_id)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                continue;
            };

            let now = Utc::now();
            let mut record: JobRecord = serde_json::from_str(&raw_record)
                .with_context(|| format!("decoding job {id}"))?;
            let state = record.recover_from_stall(now);
            let (mode, dead_entry) = if state == JobState::Failed {
                ("fail", serde_json::to_string(&DeadLetter::from_failed(&record))?)
            } else {
                ("requeue", String::new())
            };

            let outcome: i64 = self
                .scripts
                .stall
                .key(self.keys.job(id))
                .key(self.keys.queue(queue, "active"))
                .key(&heartbeats)
                .key(self.keys.queue(queue, "waiting"))
                .key(self.keys.queue(queue, "failed"))
                .key(self.keys.queue(queue, "dead"))
                .arg(lease.unwrap_or_default())
                .arg(cutoff)
                .arg(&raw_id)
                .arg(serde_json::to_string(&record)?)
                .arg(mode)
                .arg(now.timestamp_millis())
                .arg(keep_arg(Some(retention.keep_failed)))
                .arg(self.keys.job_prefix())
                .arg(dead_entry)
                .arg(retention.keep_dead_letters)
                .invoke_async(&mut conn)
                .await
                .context("running stall recovery script")?;

            if outcome < 0 {
                continue;
            }
            if state == JobState::Failed {
                report.failed.push(id);
            } else {
                report.requeued.push(id);
            }
        }
        Ok(report)
    }

    async fn counts(&self, queue: QueueName) -> anyhow::Result<QueueStats> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .llen(self.keys.queue(queue, "waiting"))
                .llen(self.keys.queue(queue, "active"))
                .zcard(self.keys.queue(queue, "delayed"))
                .zcard(self.keys.queue(queue, "completed"))
                .zcard(self.keys.queue(queue, "failed"))
                .query_async(&mut conn)
                .await
                .context("reading queue counters")?;

        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        self.load(id).await
    }

    async fn dead_letters(&self, queue: QueueName, limit: usize) -> anyhow::Result<Vec<DeadLetter>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = limit.min(isize::MAX as usize) as isize - 1;
        let raw: Vec<String> = conn.lrange(self.keys.queue(queue, "dead"), 0, stop).await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).context("decoding dead letter"))
            .collect()
    }

    async fn dead_letter(&self, queue: QueueName, id: JobId) -> anyhow::Result<Option<DeadLetter>> {
        Ok(self.find_dead_letter(queue, id).await?.map(|(_, dead)| dead))
    }

    async fn replay_dead_letter(
        &self,
        queue: QueueName,
        id: JobId,
        replacement: JobRecord,
    ) -> anyhow::Result<bool> {
        let Some((raw, _)) = self.find_dead_letter(queue, id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let replayed: i64 = self
            .scripts
            .replay
            .key(self.keys.queue(queue, "dead"))
            .key(self.keys.job(replacement.id))
            .key(self.keys.queue(queue, "waiting"))
            .arg(raw)
            .arg(serde_json::to_string(&replacement)?)
            .arg(replacement.id.to_string())
            .invoke_async(&mut conn)
            .await
            .context("running replay script")?;
        Ok(replayed == 1)
    }

    async fn release_worker(&self, worker_id: &str) {
        self.drop_blocking_connection(worker_id).await;
    }
}

impl RedisJobStore {
    /// The raw list entry is needed to remove it with `LREM`.
    async fn find_dead_letter(
        &self,
        queue: QueueName,
        id: JobId,
    ) -> anyhow::Result<Option<(String, DeadLetter)>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(self.keys.queue(queue, "dead"), 0, -1).await?;
        for entry in raw {
            let dead: DeadLetter =
                serde_json::from_str(&entry).context("decoding dead letter")?;
            if dead.job.id == id {
                return Ok(Some((entry, dead)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CleanupJob, JobPayload};
    use crate::retry::BackoffPolicy;

    /// Set `CONVEYOR_TEST_REDIS_URL` and pass `--ignored` to run these.
    async fn connect() -> Option<RedisJobStore> {
        let url = std::env::var("CONVEYOR_TEST_REDIS_URL").ok()?;
        let config = StoreConfig {
            redis_url: Some(url),
            key_prefix: format!("conveyor-unit:{}", uuid::Uuid::now_v7().simple()),
        };
        Some(RedisJobStore::connect(&config).await.unwrap())
    }

    fn record() -> JobRecord {
        JobRecord::new(
            QueueName::Cleanup,
            "purge",
            JobPayload::Cleanup(CleanupJob {
                tenant_id: "acme".into(),
                older_than_days: 30,
            }),
            3,
            BackoffPolicy::fixed(10),
        )
    }

    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn test_activation_after_stall_recovery_is_refused() {
        let Some(store) = connect().await else { return };
        let job = record();
        store.insert(job.clone()).await.unwrap();

        // the claimer pops the id, then pauses past the stall threshold
        let raw_id = store
            .pop_waiting(QueueName::Cleanup, "w0", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let report = store
            .recover_stalled(
                QueueName::Cleanup,
                Utc::now() + chrono::Duration::seconds(1),
                &RetentionPolicy::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.requeued, vec![job.id]);

        let late = store.activate(QueueName::Cleanup, &raw_id, "w0").await.unwrap();
        assert!(late.is_none());

        let stored = store.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobState::Waiting);
        assert_eq!(stored.attempts_made, 1);
        let stats = store.counts(QueueName::Cleanup).await.unwrap();
        assert_eq!((stats.waiting, stats.active), (1, 0));

        let lease = store
            .claim(QueueName::Cleanup, "w1", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.job_id(), job.id);
        assert_eq!(lease.attempt(), 2);
    }

    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn test_released_worker_drops_claim_connection() {
        let Some(store) = connect().await else { return };
        let claimed = store
            .claim(QueueName::Cleanup, "w0", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(claimed.is_none());
        assert!(store.blocking.lock().await.contains_key("w0"));

        store.release_worker("w0").await;
        assert!(store.blocking.lock().await.is_empty());
    }

    #[test]
    fn test_key_layout() {
        let keys = Keys {
            prefix: "conveyor".into(),
        };
        let id: JobId = "01890a5d-ac96-774b-bcce-b302099a8057".parse().unwrap();
        assert_eq!(
            keys.job(id),
            "conveyor:job:01890a5d-ac96-774b-bcce-b302099a8057"
        );
        assert_eq!(
            keys.queue(QueueName::Webhook, "waiting"),
            "conveyor:queue:webhook:waiting"
        );
        assert!(keys.job(id).starts_with(&keys.job_prefix()));
    }

    #[test]
    fn test_script_outcomes() {
        assert_eq!(transition(-1), Transition::LeaseLost);
        assert_eq!(transition(3), Transition::Applied { pruned: 3 });
        assert_eq!(keep_arg(None), -1);
        assert_eq!(keep_arg(Some(10)), 10);
    }
}
