// Read access to problems and their test cases.
// Authoring belongs to the external CRUD layer; the engine only needs to
// read a problem by id. Test cases are append-only.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::redis::{problem_key, problem_tests_key};
use crate::types::{Problem, TestCase};

#[async_trait]
pub trait ProblemStore: Send + Sync {
    async fn get(&self, problem_id: &str) -> Result<Option<Problem>, StoreError>;

    /// Store a new problem; returns false when the id is already taken
    async fn create(&self, problem: &Problem) -> Result<bool, StoreError>;

    /// Append a test case; returns the new test-case count
    async fn add_test_case(&self, problem_id: &str, test_case: &TestCase)
        -> Result<usize, StoreError>;
}

#[derive(Default)]
pub struct MemoryProblemStore {
    problems: RwLock<HashMap<String, Problem>>,
}

impl MemoryProblemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProblemStore for MemoryProblemStore {
    async fn get(&self, problem_id: &str) -> Result<Option<Problem>, StoreError> {
        Ok(self.problems.read().await.get(problem_id).cloned())
    }

    async fn create(&self, problem: &Problem) -> Result<bool, StoreError> {
        let mut problems = self.problems.write().await;
        if problems.contains_key(&problem.id) {
            return Ok(false);
        }
        problems.insert(problem.id.clone(), problem.clone());
        Ok(true)
    }

    async fn add_test_case(
        &self,
        problem_id: &str,
        test_case: &TestCase,
    ) -> Result<usize, StoreError> {
        let mut problems = self.problems.write().await;
        let problem = problems
            .get_mut(problem_id)
            .ok_or_else(|| StoreError::ProblemNotFound(problem_id.to_string()))?;
        problem.test_cases.push(test_case.clone());
        Ok(problem.test_cases.len())
    }
}

/// Problems as JSON under `codo:problem:{id}`, test cases as a Redis list
/// under `codo:problem:{id}:tests` so appends never rewrite earlier cases.
#[derive(Clone)]
pub struct RedisProblemStore {
    conn: ConnectionManager,
}

impl RedisProblemStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ProblemStore for RedisProblemStore {
    async fn get(&self, problem_id: &str) -> Result<Option<Problem>, StoreError> {
        let mut conn = self.conn.clone();
        let (meta, tests): (Option<String>, Vec<String>) = redis::pipe()
            .get(problem_key(problem_id))
            .lrange(problem_tests_key(problem_id), 0, -1)
            .query_async(&mut conn)
            .await?;

        let Some(meta) = meta else {
            return Ok(None);
        };

        let mut problem: Problem = serde_json::from_str(&meta).map_err(|e| StoreError::Corrupt {
            key: problem_key(problem_id),
            reason: e.to_string(),
        })?;
        problem.test_cases = tests
            .iter()
            .map(|raw| serde_json::from_str::<TestCase>(raw))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Corrupt {
                key: problem_tests_key(problem_id),
                reason: e.to_string(),
            })?;
        Ok(Some(problem))
    }

    async fn create(&self, problem: &Problem) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let meta = Problem {
            test_cases: Vec::new(),
            ..problem.clone()
        };
        let created: bool = conn
            .set_nx(problem_key(&problem.id), serde_json::to_string(&meta)?)
            .await?;
        if !created {
            return Ok(false);
        }

        if !problem.test_cases.is_empty() {
            let encoded = problem
                .test_cases
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;
            let _: () = conn.rpush(problem_tests_key(&problem.id), encoded).await?;
        }
        Ok(true)
    }

    async fn add_test_case(
        &self,
        problem_id: &str,
        test_case: &TestCase,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(problem_key(problem_id)).await?;
        if !exists {
            return Err(StoreError::ProblemNotFound(problem_id.to_string()));
        }
        let len: usize = conn
            .rpush(problem_tests_key(problem_id), serde_json::to_string(test_case)?)
            .await?;
        Ok(len)
    }
}
