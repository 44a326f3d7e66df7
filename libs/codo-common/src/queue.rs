/// Submission Queue - ordered, leased dispatch of pending submissions.
///
/// **Dispatch state per submission:** `pending -> dispatched -> completed`
///
/// **Rules:**
/// - FIFO by enqueue order; a requeued submission goes back to the head
/// - Every dispatch hands out a [`Lease`]; only its holder may renew,
///   complete or release it
/// - A released (crashed) lease is requeued while attempts remain, then
///   reported as exhausted so the caller can record an infrastructure failure
/// - Enqueue fails fast with `QueueFull` once the pending ceiling is reached
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::QueueError;
use crate::redis::{ATTEMPTS_KEY, INFLIGHT_KEY, PENDING_QUEUE, PROCESSING_QUEUE};
use crate::types::Lease;

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Maximum number of pending submissions before enqueue is refused
    pub ceiling: usize,
    /// Dispatches allowed per submission (first run plus retries)
    pub max_attempts: u32,
    /// How long a lease stays valid without renewal
    pub lease_ttl: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            ceiling: 1000,
            max_attempts: 2,
            lease_ttl: Duration::from_secs(30),
        }
    }
}

/// What happened to a lease handed back after a failed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Back at the head of the pending queue for another attempt
    Requeued,
    /// No attempts left; the lease stays held until the caller completes it
    Exhausted,
}

#[async_trait]
pub trait SubmissionQueue: Send + Sync {
    /// Append a submission id; returns the new pending length
    async fn enqueue(&self, id: Uuid) -> Result<usize, QueueError>;

    /// Wait up to `wait` for the next submission and lease it
    async fn dequeue(&self, wait: Duration) -> Result<Option<Lease>, QueueError>;

    /// Push the lease expiry forward (worker heartbeat)
    async fn renew(&self, lease: &Lease) -> Result<Lease, QueueError>;

    /// Drop all dispatch state once the verdict is stored
    async fn complete(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Hand back a lease whose execution crashed
    async fn release(&self, lease: &Lease) -> Result<Release, QueueError>;

    /// Remove a submission that has not been dispatched yet
    async fn cancel(&self, id: Uuid) -> Result<bool, QueueError>;

    async fn pending_len(&self) -> Result<usize, QueueError>;

    /// Every lease currently held
    async fn in_flight(&self) -> Result<Vec<Lease>, QueueError>;

    /// Restore state left behind by a dead process and return its leases
    async fn recover(&self) -> Result<Vec<Lease>, QueueError>;
}

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<Uuid>,
    in_flight: HashMap<Uuid, Lease>,
    attempts: HashMap<Uuid, u32>,
}

impl MemoryState {
    fn holds(&self, lease: &Lease) -> bool {
        self.in_flight
            .get(&lease.submission_id)
            .map(|held| held.token == lease.token)
            .unwrap_or(false)
    }
}

/// In-process queue: a deque guarded by a mutex plus a `Notify` so idle
/// workers wait without spinning.
pub struct MemoryQueue {
    settings: QueueSettings,
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(MemoryState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Backend("queue state poisoned".to_string()))
    }

    fn try_claim(&self) -> Result<Option<Lease>, QueueError> {
        let mut state = self.lock()?;
        let Some(id) = state.pending.pop_front() else {
            return Ok(None);
        };
        let attempt = {
            let counter = state.attempts.entry(id).or_insert(0);
            *counter += 1;
            *counter
        };
        let lease = Lease {
            submission_id: id,
            token: Uuid::new_v4(),
            attempt,
            expires_at: expiry_after(self.settings.lease_ttl),
        };
        state.in_flight.insert(id, lease.clone());
        Ok(Some(lease))
    }
}

#[async_trait]
impl SubmissionQueue for MemoryQueue {
    async fn enqueue(&self, id: Uuid) -> Result<usize, QueueError> {
        let len = {
            let mut state = self.lock()?;
            if state.pending.len() >= self.settings.ceiling {
                return Err(QueueError::QueueFull {
                    pending: state.pending.len(),
                    ceiling: self.settings.ceiling,
                });
            }
            state.pending.push_back(id);
            state.pending.len()
        };
        self.notify.notify_one();
        Ok(len)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Lease>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_claim()? {
                return Ok(Some(lease));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease, QueueError> {
        let mut state = self.lock()?;
        if !state.holds(lease) {
            return Err(QueueError::LeaseLost(lease.submission_id));
        }
        let renewed = Lease {
            expires_at: expiry_after(self.settings.lease_ttl),
            ..lease.clone()
        };
        state.in_flight.insert(lease.submission_id, renewed.clone());
        Ok(renewed)
    }

    async fn complete(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if !state.holds(lease) {
            return Err(QueueError::LeaseLost(lease.submission_id));
        }
        state.in_flight.remove(&lease.submission_id);
        state.attempts.remove(&lease.submission_id);
        Ok(())
    }

    async fn release(&self, lease: &Lease) -> Result<Release, QueueError> {
        let outcome = {
            let mut state = self.lock()?;
            if !state.holds(lease) {
                return Err(QueueError::LeaseLost(lease.submission_id));
            }
            let attempts = state
                .attempts
                .get(&lease.submission_id)
                .copied()
                .unwrap_or(0);
            if attempts < self.settings.max_attempts {
                state.in_flight.remove(&lease.submission_id);
                state.pending.push_front(lease.submission_id);
                Release::Requeued
            } else {
                Release::Exhausted
            }
        };
        if outcome == Release::Requeued {
            self.notify.notify_one();
        }
        Ok(outcome)
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut state = self.lock()?;
        let before = state.pending.len();
        state.pending.retain(|queued| *queued != id);
        Ok(state.pending.len() != before)
    }

    async fn pending_len(&self) -> Result<usize, QueueError> {
        Ok(self.lock()?.pending.len())
    }

    async fn in_flight(&self) -> Result<Vec<Lease>, QueueError> {
        Ok(self.lock()?.in_flight.values().cloned().collect())
    }

    async fn recover(&self) -> Result<Vec<Lease>, QueueError> {
        self.in_flight().await
    }
}

const ENQUEUE_SCRIPT: &str = r#"
local n = redis.call('LLEN', KEYS[1])
if n >= tonumber(ARGV[2]) then return -n - 1 end
return redis.call('RPUSH', KEYS[1], ARGV[1])
"#;

const CLAIM_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then return -1 end
local attempt = redis.call('HINCRBY', KEYS[3], ARGV[1], 1)
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2] .. '|' .. attempt .. '|' .. ARGV[3])
return attempt
"#;

const RENEW_SCRIPT: &str = r#"
local held = redis.call('HGET', KEYS[1], ARGV[1])
if not held or string.sub(held, 1, string.len(ARGV[2])) ~= ARGV[2] then return -1 end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
return 1
"#;

const COMPLETE_SCRIPT: &str = r#"
local held = redis.call('HGET', KEYS[1], ARGV[1])
if not held or string.sub(held, 1, string.len(ARGV[2])) ~= ARGV[2] then return -1 end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
local held = redis.call('HGET', KEYS[2], ARGV[1])
if not held or string.sub(held, 1, string.len(ARGV[2])) ~= ARGV[2] then return -1 end
local attempts = tonumber(redis.call('HGET', KEYS[3], ARGV[1]) or '0')
if attempts < tonumber(ARGV[3]) then
  redis.call('HDEL', KEYS[2], ARGV[1])
  redis.call('LPUSH', KEYS[1], ARGV[1])
  return 1
end
return 0
"#;

fn encode_lease(lease: &Lease) -> String {
    format!(
        "{}|{}|{}",
        lease.token,
        lease.attempt,
        lease.expires_at.timestamp_millis()
    )
}

fn decode_lease(id: &str, value: &str) -> Option<Lease> {
    let mut parts = value.split('|');
    let token = Uuid::parse_str(parts.next()?).ok()?;
    let attempt = parts.next()?.parse().ok()?;
    let expires_ms: i64 = parts.next()?.parse().ok()?;
    Some(Lease {
        submission_id: Uuid::parse_str(id).ok()?,
        token,
        attempt,
        expires_at: Utc.timestamp_millis_opt(expires_ms).single()?,
    })
}

/// Redis-backed queue.
///
/// Dequeue is `BLMOVE pending -> processing` followed by an atomic claim that
/// moves the id into the in-flight hash, so an id is always somewhere durable
/// even if the process dies between the two steps.
pub struct RedisQueue {
    settings: QueueSettings,
    conn: ConnectionManager,
    /// Blocking commands get their own connection so they never stall
    /// requests multiplexed on `conn`
    blocking: tokio::sync::Mutex<ConnectionManager>,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let conn = crate::redis::connect(redis_url).await?;
        let blocking = crate::redis::connect(redis_url).await?;
        Ok(Self {
            settings,
            conn,
            blocking: tokio::sync::Mutex::new(blocking),
        })
    }

    async fn claim(&self, id: &str) -> Result<Option<Lease>, QueueError> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4();
        let expires_at = expiry_after(self.settings.lease_ttl);
        let attempt: i64 = redis::Script::new(CLAIM_SCRIPT)
            .key(PROCESSING_QUEUE)
            .key(INFLIGHT_KEY)
            .key(ATTEMPTS_KEY)
            .arg(id)
            .arg(token.to_string())
            .arg(expires_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        if attempt < 0 {
            return Ok(None);
        }
        let submission_id = Uuid::parse_str(id)
            .map_err(|e| QueueError::Backend(format!("bad queued id '{}': {}", id, e)))?;
        Ok(Some(Lease {
            submission_id,
            token,
            attempt: attempt as u32,
            expires_at,
        }))
    }
}

#[async_trait]
impl SubmissionQueue for RedisQueue {
    async fn enqueue(&self, id: Uuid) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let reply: i64 = redis::Script::new(ENQUEUE_SCRIPT)
            .key(PENDING_QUEUE)
            .arg(id.to_string())
            .arg(self.settings.ceiling)
            .invoke_async(&mut conn)
            .await?;
        if reply < 0 {
            return Err(QueueError::QueueFull {
                pending: (-reply - 1) as usize,
                ceiling: self.settings.ceiling,
            });
        }
        Ok(reply as usize)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Lease>, QueueError> {
        let moved: Option<String> = {
            let mut conn = self.blocking.lock().await;
            redis::cmd("BLMOVE")
                .arg(PENDING_QUEUE)
                .arg(PROCESSING_QUEUE)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(wait.as_secs_f64())
                .query_async(&mut *conn)
                .await?
        };
        match moved {
            Some(id) => self.claim(&id).await,
            None => Ok(None),
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease, QueueError> {
        let mut conn = self.conn.clone();
        let renewed = Lease {
            expires_at: expiry_after(self.settings.lease_ttl),
            ..lease.clone()
        };
        let reply: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(INFLIGHT_KEY)
            .arg(lease.submission_id.to_string())
            .arg(lease.token.to_string())
            .arg(encode_lease(&renewed))
            .invoke_async(&mut conn)
            .await?;
        if reply < 0 {
            return Err(QueueError::LeaseLost(lease.submission_id));
        }
        Ok(renewed)
    }

    async fn complete(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let reply: i64 = redis::Script::new(COMPLETE_SCRIPT)
            .key(INFLIGHT_KEY)
            .key(ATTEMPTS_KEY)
            .arg(lease.submission_id.to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await?;
        if reply < 0 {
            return Err(QueueError::LeaseLost(lease.submission_id));
        }
        Ok(())
    }

    async fn release(&self, lease: &Lease) -> Result<Release, QueueError> {
        let mut conn = self.conn.clone();
        let reply: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(PENDING_QUEUE)
            .key(INFLIGHT_KEY)
            .key(ATTEMPTS_KEY)
            .arg(lease.submission_id.to_string())
            .arg(lease.token.to_string())
            .arg(self.settings.max_attempts)
            .invoke_async(&mut conn)
            .await?;
        match reply {
            1 => Ok(Release::Requeued),
            0 => Ok(Release::Exhausted),
            _ => Err(QueueError::LeaseLost(lease.submission_id)),
        }
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(PENDING_QUEUE, 1, id.to_string()).await?;
        Ok(removed > 0)
    }

    async fn pending_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(PENDING_QUEUE).await?;
        Ok(len)
    }

    async fn in_flight(&self) -> Result<Vec<Lease>, QueueError> {
        let mut conn = self.conn.clone();
        let held: HashMap<String, String> = conn.hgetall(INFLIGHT_KEY).await?;
        let mut leases = Vec::with_capacity(held.len());
        for (id, value) in held {
            match decode_lease(&id, &value) {
                Some(lease) => leases.push(lease),
                None => tracing::warn!(submission_id = %id, value = %value, "Skipping malformed lease"),
            }
        }
        Ok(leases)
    }

    async fn recover(&self) -> Result<Vec<Lease>, QueueError> {
        let mut conn = self.conn.clone();
        // Newest unclaimed id first, pushed to the head, so the oldest ends up in front
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(PROCESSING_QUEUE)
                .arg(PENDING_QUEUE)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            match moved {
                Some(id) => tracing::warn!(submission_id = %id, "Returned unclaimed submission to queue"),
                None => break,
            }
        }
        self.in_flight().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue(ceiling: usize, max_attempts: u32) -> MemoryQueue {
        MemoryQueue::new(QueueSettings {
            ceiling,
            max_attempts,
            lease_ttl: Duration::from_secs(30),
        })
    }

    #[tokio::test]
    async fn test_fifo_dispatch() {
        let q = queue(10, 2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            q.enqueue(*id).await.unwrap();
        }

        for id in &ids {
            let lease = q.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
            assert_eq!(lease.submission_id, *id);
            assert_eq!(lease.attempt, 1);
        }
        assert!(q.dequeue(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backpressure_at_ceiling() {
        let q = queue(2, 2);
        q.enqueue(Uuid::new_v4()).await.unwrap();
        q.enqueue(Uuid::new_v4()).await.unwrap();

        let err = q.enqueue(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { pending: 2, ceiling: 2 }));

        // Dispatching frees a pending slot
        q.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(q.enqueue(Uuid::new_v4()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_release_requeues_once_then_exhausts() {
        let q = queue(10, 2);
        let id = Uuid::new_v4();
        let later = Uuid::new_v4();
        q.enqueue(id).await.unwrap();
        q.enqueue(later).await.unwrap();

        let first = q.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(q.release(&first).await.unwrap(), Release::Requeued);

        // Requeued at the head, ahead of later submissions
        let second = q.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.submission_id, id);
        assert_eq!(second.attempt, 2);
        assert_ne!(second.token, first.token);

        assert_eq!(q.release(&second).await.unwrap(), Release::Exhausted);
        assert_eq!(q.in_flight().await.unwrap().len(), 1);
        q.complete(&second).await.unwrap();
        assert!(q.in_flight().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_lease_is_rejected() {
        let q = queue(10, 2);
        let id = Uuid::new_v4();
        q.enqueue(id).await.unwrap();
        let first = q.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        q.release(&first).await.unwrap();
        let _second = q.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();

        assert!(matches!(q.complete(&first).await, Err(QueueError::LeaseLost(_))));
        assert!(matches!(q.renew(&first).await, Err(QueueError::LeaseLost(_))));
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let q = queue(10, 2);
        q.enqueue(Uuid::new_v4()).await.unwrap();
        let lease = q.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let renewed = q.renew(&lease).await.unwrap();
        assert!(renewed.expires_at > lease.expires_at);
        assert_eq!(renewed.token, lease.token);
    }

    #[tokio::test]
    async fn test_cancel_removes_pending_only() {
        let q = queue(10, 2);
        let keep = Uuid::new_v4();
        let withdrawn = Uuid::new_v4();
        q.enqueue(keep).await.unwrap();
        q.enqueue(withdrawn).await.unwrap();

        assert!(q.cancel(withdrawn).await.unwrap());
        assert!(!q.cancel(withdrawn).await.unwrap());
        assert_eq!(q.pending_len().await.unwrap(), 1);

        let lease = q.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(!q.cancel(lease.submission_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_waiting_worker_wakes_on_enqueue() {
        let q = Arc::new(queue(10, 2));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = Uuid::new_v4();
        q.enqueue(id).await.unwrap();

        let lease = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(lease.submission_id, id);
    }

    #[test]
    fn test_lease_encoding() {
        let lease = Lease {
            submission_id: Uuid::new_v4(),
            token: Uuid::new_v4(),
            attempt: 2,
            expires_at: Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap(),
        };
        let decoded = decode_lease(&lease.submission_id.to_string(), &encode_lease(&lease)).unwrap();
        assert_eq!(decoded, lease);
        assert!(decode_lease("x", "garbage").is_none());
    }

    /// Requires a running Redis instance
    #[tokio::test]
    #[ignore]
    async fn test_redis_queue_dispatch() {
        let q = RedisQueue::connect("redis://127.0.0.1:6379", QueueSettings::default())
            .await
            .unwrap();
        let id = Uuid::new_v4();
        q.enqueue(id).await.unwrap();
        let lease = q.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(lease.submission_id, id);
        assert_eq!(q.release(&lease).await.unwrap(), Release::Requeued);
        let again = q.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        q.complete(&again).await.unwrap();
    }
}
