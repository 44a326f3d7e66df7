/// Submission Store - durable submission records and their lifecycle.
///
/// **Lifecycle:** `pending -> (running) -> accepted | rejected | error`
///
/// **Guarantees:**
/// - A terminal record is never overwritten (`AlreadyTerminal`)
/// - Only the holder of the record's current lease may write the verdict
///   (`LeaseMismatch`), so a stale worker can never score twice
/// - Reads are safe at any time and never block on judging
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Diagnostic, StoreError};
use crate::redis::{submission_key, user_submissions_key};
use crate::types::{Lease, Submission, SubmissionStatus, Verdict};

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Persist a new pending submission
    async fn create(&self, submission: &Submission) -> Result<Uuid, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Submission, StoreError>;

    /// A user's submissions, newest first
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Submission>, StoreError>;

    /// Attach a dispatch lease and move the record to `running`
    async fn mark_running(&self, id: Uuid, lease: &Lease) -> Result<Submission, StoreError>;

    /// Write the verdict; compare-and-swap on status and lease token
    async fn update_terminal(
        &self,
        id: Uuid,
        lease_token: Uuid,
        verdict: &Verdict,
    ) -> Result<Submission, StoreError>;

    /// Turn a still-pending submission into a cancelled `error`
    async fn cancel(&self, id: Uuid) -> Result<Submission, StoreError>;

    /// Remove a pending record that was never accepted by the queue
    async fn discard(&self, id: Uuid) -> Result<(), StoreError>;
}

fn apply_verdict(record: &mut Submission, verdict: &Verdict) {
    record.status = verdict.status;
    record.score = verdict.score;
    record.max_score = verdict.max_score;
    record.error = verdict.error.clone();
    record.tests = verdict.tests.clone();
    record.test_count = verdict.test_count;
    record.testset_digest = verdict.testset_digest.clone();
    record.finished_at = Some(Utc::now());
}

/// In-process store used by tests and single-process tooling
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Uuid, Submission>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn create(&self, submission: &Submission) -> Result<Uuid, StoreError> {
        let mut records = self.records.write().await;
        records.insert(submission.id, submission.clone());
        Ok(submission.id)
    }

    async fn get(&self, id: Uuid) -> Result<Submission, StoreError> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Submission>, StoreError> {
        let records = self.records.read().await;
        let mut mine: Vec<Submission> = records
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(mine)
    }

    async fn mark_running(&self, id: Uuid, lease: &Lease) -> Result<Submission, StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.status.is_terminal() {
            return Err(StoreError::AlreadyTerminal(id));
        }
        record.status = SubmissionStatus::Running;
        record.lease = Some(lease.token);
        record.attempts = lease.attempt;
        record.started_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn update_terminal(
        &self,
        id: Uuid,
        lease_token: Uuid,
        verdict: &Verdict,
    ) -> Result<Submission, StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.status.is_terminal() {
            return Err(StoreError::AlreadyTerminal(id));
        }
        if record.lease != Some(lease_token) {
            return Err(StoreError::LeaseMismatch(id));
        }
        apply_verdict(record, verdict);
        Ok(record.clone())
    }

    async fn cancel(&self, id: Uuid) -> Result<Submission, StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        match record.status {
            SubmissionStatus::Pending => {
                apply_verdict(record, &Verdict::error(Diagnostic::Cancelled.to_string()));
                Ok(record.clone())
            }
            SubmissionStatus::Running => Err(StoreError::NotPending(id)),
            _ => Err(StoreError::AlreadyTerminal(id)),
        }
    }

    async fn discard(&self, id: Uuid) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        match records.get(&id) {
            None => Err(StoreError::NotFound(id)),
            Some(record) if record.status != SubmissionStatus::Pending => {
                Err(StoreError::NotPending(id))
            }
            Some(_) => {
                records.remove(&id);
                Ok(())
            }
        }
    }
}

const MARK_RUNNING_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return 'missing' end
if status == 'accepted' or status == 'rejected' or status == 'error' then return 'terminal' end
redis.call('HSET', KEYS[1], 'status', 'running', 'lease', ARGV[1], 'attempts', ARGV[2], 'started_at', ARGV[3])
return 'ok'
"#;

const UPDATE_TERMINAL_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return 'missing' end
if status == 'accepted' or status == 'rejected' or status == 'error' then return 'terminal' end
if redis.call('HGET', KEYS[1], 'lease') ~= ARGV[1] then return 'lease' end
redis.call('HSET', KEYS[1],
  'status', ARGV[2], 'score', ARGV[3], 'max_score', ARGV[4], 'error', ARGV[5],
  'tests', ARGV[6], 'test_count', ARGV[7], 'testset_digest', ARGV[8], 'finished_at', ARGV[9])
return 'ok'
"#;

const CANCEL_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return 'missing' end
if status == 'running' then return 'not_pending' end
if status ~= 'pending' then return 'terminal' end
redis.call('HSET', KEYS[1], 'status', 'error', 'error', ARGV[1], 'finished_at', ARGV[2])
return 'ok'
"#;

const DISCARD_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return 'missing' end
if status ~= 'pending' then return 'not_pending' end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 'ok'
"#;

/// Redis-backed store: one hash per submission plus a per-user index.
/// State transitions run as Lua scripts so each check-and-set is atomic.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn check_outcome(id: Uuid, outcome: &str) -> Result<(), StoreError> {
        match outcome {
            "ok" => Ok(()),
            "missing" => Err(StoreError::NotFound(id)),
            "terminal" => Err(StoreError::AlreadyTerminal(id)),
            "lease" => Err(StoreError::LeaseMismatch(id)),
            "not_pending" => Err(StoreError::NotPending(id)),
            other => Err(StoreError::Backend(format!("unexpected script reply '{}'", other))),
        }
    }
}

fn format_time(t: &Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_default()
}

fn to_fields(s: &Submission) -> Result<Vec<(&'static str, String)>, StoreError> {
    Ok(vec![
        ("id", s.id.to_string()),
        ("user_id", s.user_id.clone()),
        ("problem_id", s.problem_id.clone()),
        ("language", s.language.to_string()),
        ("source_code", s.source_code.clone()),
        ("status", s.status.to_string()),
        ("score", s.score.to_string()),
        ("max_score", s.max_score.to_string()),
        ("error", s.error.clone().unwrap_or_default()),
        ("tests", serde_json::to_string(&s.tests)?),
        ("test_count", s.test_count.to_string()),
        ("testset_digest", s.testset_digest.clone().unwrap_or_default()),
        ("lease", s.lease.map(|l| l.to_string()).unwrap_or_default()),
        ("attempts", s.attempts.to_string()),
        ("created_at", s.created_at.to_rfc3339()),
        ("started_at", format_time(&s.started_at)),
        ("finished_at", format_time(&s.finished_at)),
    ])
}

fn from_fields(key: &str, mut fields: HashMap<String, String>) -> Result<Submission, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };

    let mut take = |name: &str| fields.remove(name).unwrap_or_default();
    let optional = |value: String| if value.is_empty() { None } else { Some(value) };
    let parse_time = |value: String| -> Result<Option<DateTime<Utc>>, StoreError> {
        if value.is_empty() {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(&value)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| corrupt(format!("bad timestamp '{}': {}", value, e)))
    };

    let id = take("id");
    let language = take("language");
    let status = take("status");
    let lease = take("lease");
    let tests = take("tests");
    let created_at = take("created_at");

    Ok(Submission {
        id: Uuid::parse_str(&id).map_err(|e| corrupt(format!("bad id: {}", e)))?,
        user_id: take("user_id"),
        problem_id: take("problem_id"),
        language: language.parse().map_err(|e| corrupt(format!("{}", e)))?,
        source_code: take("source_code"),
        status: status.parse().map_err(corrupt)?,
        score: take("score").parse().unwrap_or(0),
        max_score: take("max_score").parse().unwrap_or(0),
        error: optional(take("error")),
        tests: if tests.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&tests).map_err(|e| corrupt(format!("bad tests: {}", e)))?
        },
        test_count: take("test_count").parse().unwrap_or(0),
        testset_digest: optional(take("testset_digest")),
        lease: if lease.is_empty() {
            None
        } else {
            Some(Uuid::parse_str(&lease).map_err(|e| corrupt(format!("bad lease: {}", e)))?)
        },
        attempts: take("attempts").parse().unwrap_or(0),
        created_at: parse_time(created_at)?
            .ok_or_else(|| corrupt("missing created_at".to_string()))?,
        started_at: parse_time(take("started_at"))?,
        finished_at: parse_time(take("finished_at"))?,
    })
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn create(&self, submission: &Submission) -> Result<Uuid, StoreError> {
        let mut conn = self.conn.clone();
        let fields = to_fields(submission)?;
        let score = submission.created_at.timestamp_millis();

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(submission_key(&submission.id), &fields[..])
            .ignore()
            .zadd(
                user_submissions_key(&submission.user_id),
                submission.id.to_string(),
                score,
            )
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(submission.id)
    }

    async fn get(&self, id: Uuid) -> Result<Submission, StoreError> {
        let mut conn = self.conn.clone();
        let key = submission_key(&id);
        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            return Err(StoreError::NotFound(id));
        }
        from_fields(&key, fields)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Submission>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrevrange(user_submissions_key(user_id), 0, -1).await?;

        let keys: Vec<String> = ids
            .iter()
            .filter_map(|raw| Uuid::parse_str(raw).ok())
            .map(|id| submission_key(&id))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        keys.iter()
            .zip(rows)
            .filter(|(_, fields)| !fields.is_empty())
            .map(|(key, fields)| from_fields(key, fields))
            .collect()
    }

    async fn mark_running(&self, id: Uuid, lease: &Lease) -> Result<Submission, StoreError> {
        let mut conn = self.conn.clone();
        let outcome: String = redis::Script::new(MARK_RUNNING_SCRIPT)
            .key(submission_key(&id))
            .arg(lease.token.to_string())
            .arg(lease.attempt)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Self::check_outcome(id, &outcome)?;
        self.get(id).await
    }

    async fn update_terminal(
        &self,
        id: Uuid,
        lease_token: Uuid,
        verdict: &Verdict,
    ) -> Result<Submission, StoreError> {
        let mut conn = self.conn.clone();
        let outcome: String = redis::Script::new(UPDATE_TERMINAL_SCRIPT)
            .key(submission_key(&id))
            .arg(lease_token.to_string())
            .arg(verdict.status.to_string())
            .arg(verdict.score)
            .arg(verdict.max_score)
            .arg(verdict.error.clone().unwrap_or_default())
            .arg(serde_json::to_string(&verdict.tests)?)
            .arg(verdict.test_count)
            .arg(verdict.testset_digest.clone().unwrap_or_default())
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Self::check_outcome(id, &outcome)?;
        self.get(id).await
    }

    async fn cancel(&self, id: Uuid) -> Result<Submission, StoreError> {
        let mut conn = self.conn.clone();
        let outcome: String = redis::Script::new(CANCEL_SCRIPT)
            .key(submission_key(&id))
            .arg(Diagnostic::Cancelled.to_string())
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Self::check_outcome(id, &outcome)?;
        self.get(id).await
    }

    async fn discard(&self, id: Uuid) -> Result<(), StoreError> {
        let record = self.get(id).await?;
        let mut conn = self.conn.clone();
        let outcome: String = redis::Script::new(DISCARD_SCRIPT)
            .key(submission_key(&id))
            .key(user_submissions_key(&record.user_id))
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Self::check_outcome(id, &outcome)
    }
}
