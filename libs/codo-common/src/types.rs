use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::UnsupportedLanguage;

/// Languages a submission may be written in.
///
/// The per-language compile/run strategy lives in the worker's language
/// registry; this enum is only the tag carried by submissions and queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Cpp,
    Javascript,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::Java,
        Language::Cpp,
        Language::Javascript,
    ];

    /// Compiled languages run a compile phase before every execution
    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::Java | Language::Cpp)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Javascript => "javascript",
        };
        f.write_str(name)
    }
}

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            other => Err(UnsupportedLanguage(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// Marks awarded for every matched test case
    pub fn marks_per_test_case(&self) -> u32 {
        match self {
            Difficulty::Easy => 5,
            Difficulty::Medium => 10,
            Difficulty::Hard => 15,
        }
    }
}

/// How actual output is matched against expected output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ComparisonMode {
    Exact,
    Trimmed,
    NumericTolerance {
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
}

fn default_epsilon() -> f64 {
    1e-6
}

impl Default for ComparisonMode {
    fn default() -> Self {
        ComparisonMode::Trimmed
    }
}

/// Largest accepted submission source, enforced at submit time and again
/// by every sandbox
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;
/// Largest stdin fed to one execution
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Resource limits applied to a single sandboxed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_mb: u64,
    pub output_limit_bytes: usize,
    pub compile_time_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            cpu_time_ms: 2_000,
            wall_time_ms: 5_000,
            memory_mb: 256,
            output_limit_bytes: 1024 * 1024,
            compile_time_ms: 15_000,
        }
    }
}

/// Test input is either raw stdin text or structured JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestInput {
    Text(String),
    Args(serde_json::Value),
}

impl TestInput {
    /// Render the input as the bytes fed to the program's stdin.
    ///
    /// Structured arguments become one compact JSON value per line; a bare
    /// string argument is written without quotes.
    pub fn to_stdin(&self) -> String {
        match self {
            TestInput::Text(text) => text.clone(),
            TestInput::Args(serde_json::Value::Array(args)) => {
                let mut out = String::new();
                for arg in args {
                    match arg {
                        serde_json::Value::String(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                    out.push('\n');
                }
                out
            }
            TestInput::Args(value) => format!("{}\n", value),
        }
    }
}

impl From<&str> for TestInput {
    fn from(value: &str) -> Self {
        TestInput::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: TestInput,
    pub expected_output: String,
    #[serde(default)]
    pub is_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub statement: String,
    #[serde(default)]
    pub input_format: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub constraints: Option<String>,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub comparison: ComparisonMode,
    #[serde(default)]
    pub limits: Option<Limits>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl Problem {
    pub fn marks_per_test_case(&self) -> u32 {
        self.difficulty.marks_per_test_case()
    }

    pub fn max_score(&self) -> u32 {
        self.marks_per_test_case() * self.test_cases.len() as u32
    }

    /// SHA-256 over the ordered test-case set, recorded with each verdict so
    /// a score can always be traced to the exact tests it was computed from.
    pub fn testset_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for tc in &self.test_cases {
            let input = tc.input.to_stdin();
            hasher.update((input.len() as u64).to_le_bytes());
            hasher.update(input.as_bytes());
            hasher.update((tc.expected_output.len() as u64).to_le_bytes());
            hasher.update(tc.expected_output.as_bytes());
            hasher.update([tc.is_hidden as u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Accepted,
    Rejected,
    Error,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Accepted | SubmissionStatus::Rejected | SubmissionStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Accepted => "accepted",
            SubmissionStatus::Rejected => "rejected",
            SubmissionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubmissionStatus::Pending),
            "running" => Ok(SubmissionStatus::Running),
            "accepted" => Ok(SubmissionStatus::Accepted),
            "rejected" => Ok(SubmissionStatus::Rejected),
            "error" => Ok(SubmissionStatus::Error),
            other => Err(format!("unknown submission status '{}'", other)),
        }
    }
}

/// Outcome of one test case inside a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    WrongAnswer,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    NotAttempted,
}

/// Per-test summary stored with the verdict. Never carries program output,
/// so hidden test data cannot leak through polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub index: usize,
    pub hidden: bool,
    pub outcome: TestOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: Uuid,
    pub user_id: String,
    pub problem_id: String,
    pub language: Language,
    pub source_code: String,
    pub status: SubmissionStatus,
    pub score: u32,
    #[serde(default)]
    pub max_score: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tests: Vec<TestSummary>,
    #[serde(default)]
    pub test_count: usize,
    #[serde(default)]
    pub testset_digest: Option<String>,
    #[serde(default)]
    pub lease: Option<Uuid>,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Submission {
    /// A fresh pending submission as created by the submit call
    pub fn new(
        user_id: impl Into<String>,
        problem_id: impl Into<String>,
        language: Language,
        source_code: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            problem_id: problem_id.into(),
            language,
            source_code: source_code.into(),
            status: SubmissionStatus::Pending,
            score: 0,
            max_score: 0,
            error: None,
            tests: Vec::new(),
            test_count: 0,
            testset_digest: None,
            lease: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Terminal judgment written back to the store exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub status: SubmissionStatus,
    pub score: u32,
    pub max_score: u32,
    pub error: Option<String>,
    pub tests: Vec<TestSummary>,
    pub test_count: usize,
    pub testset_digest: Option<String>,
}

impl Verdict {
    /// Verdict for a submission that could not be judged at all
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SubmissionStatus::Error,
            score: 0,
            max_score: 0,
            error: Some(message.into()),
            tests: Vec::new(),
            test_count: 0,
            testset_digest: None,
        }
    }
}

/// Dispatch ownership of one submission, handed to exactly one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub submission_id: Uuid,
    pub token: Uuid,
    pub attempt: u32,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
