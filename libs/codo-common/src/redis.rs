/// Redis key layout - defines only naming, not runtime logic.
/// Keeps api, worker and cli agreeing on where every piece of state lives.
use redis::aio::ConnectionManager;
use redis::RedisResult;
use uuid::Uuid;

pub const KEY_PREFIX: &str = "codo";

/// FIFO list of submission ids waiting for a worker
pub const PENDING_QUEUE: &str = "codo:queue:pending";

/// Ids moved off the pending list but not yet claimed under a lease
pub const PROCESSING_QUEUE: &str = "codo:queue:processing";

/// Hash: submission id -> "token|attempt|expires_ms"
pub const INFLIGHT_KEY: &str = "codo:queue:inflight";

/// Hash: submission id -> number of dispatches so far
pub const ATTEMPTS_KEY: &str = "codo:queue:attempts";

/// Hash holding one submission record
pub fn submission_key(id: &Uuid) -> String {
    format!("{}:submission:{}", KEY_PREFIX, id)
}

/// Sorted set of a user's submission ids, scored by creation time
pub fn user_submissions_key(user_id: &str) -> String {
    format!("{}:user:{}:submissions", KEY_PREFIX, user_id)
}

/// JSON problem metadata (without test cases)
pub fn problem_key(problem_id: &str) -> String {
    format!("{}:problem:{}", KEY_PREFIX, problem_id)
}

/// Append-only list of JSON test cases in creation order
pub fn problem_tests_key(problem_id: &str) -> String {
    format!("{}:problem:{}:tests", KEY_PREFIX, problem_id)
}

/// Open a managed connection to Redis
pub async fn connect(redis_url: &str) -> RedisResult<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    ConnectionManager::new(client).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_key_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(submission_key(&id), submission_key(&id));
        assert!(submission_key(&id).starts_with("codo:submission:"));
        assert!(submission_key(&id).contains(&id.to_string()));
    }

    #[test]
    fn test_problem_keys() {
        assert_eq!(problem_key("abc"), "codo:problem:abc");
        assert_eq!(problem_tests_key("abc"), "codo:problem:abc:tests");
    }

    #[test]
    fn test_user_index_key() {
        assert_eq!(user_submissions_key("u1"), "codo:user:u1:submissions");
    }

    #[test]
    fn test_queue_keys_share_prefix() {
        for key in [PENDING_QUEUE, PROCESSING_QUEUE, INFLIGHT_KEY, ATTEMPTS_KEY] {
            assert!(key.starts_with("codo:queue:"));
        }
    }
}
