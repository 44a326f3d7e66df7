/// Execution Engine - Sandbox abstraction for untrusted code
///
/// **Core Responsibility:**
/// Run one submission against one stdin under resource limits and hand back
/// the raw result.
///
/// **Architectural Boundary:**
/// - A sandbox knows HOW to execute (container, confined process)
/// - A sandbox does NOT compare output or assign marks
/// - Every execute starts from a fresh scratch area; nothing leaks between calls
/// - Infrastructure faults are errors, participant faults are outcomes
///
/// Backends: `DockerSandbox` (docker.rs) and `ProcessSandbox` (process.rs).
use async_trait::async_trait;
use codo_common::error::UnsupportedLanguage;
use codo_common::types::{Language, Limits, MAX_SOURCE_CODE_BYTES, MAX_TEST_INPUT_BYTES};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Diagnostics (stderr, compiler output) are kept short in verdicts
pub const DIAGNOSTIC_LIMIT_BYTES: usize = 64 * 1024;

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Compile (when the language needs it) and run `source_code` with
    /// `stdin`, enforcing `limits`.
    async fn execute(
        &self,
        language: Language,
        source_code: &str,
        stdin: &str,
        limits: &Limits,
    ) -> Result<SandboxOutcome, SandboxError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    /// The compile step rejected the source; nothing was run
    CompileError { diagnostic: String },
    /// The program ran (possibly into a limit)
    Completed(RunOutput),
}

/// Raw result of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    /// Terminating signal, when the program was killed
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub output_exceeded: bool,
    pub duration_ms: u64,
}

impl RunOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
            && self.signal.is_none()
            && !self.timed_out
            && !self.memory_exceeded
            && !self.output_exceeded
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    UnsupportedLanguage(#[from] UnsupportedLanguage),

    /// The request itself is unacceptable (oversized source or input)
    #[error("{0}")]
    Rejected(String),

    /// The sandbox could not do its job; the attempt may be retried
    #[error("sandbox infrastructure error: {0}")]
    Infrastructure(String),
}

impl SandboxError {
    pub fn infra(err: impl std::fmt::Display) -> Self {
        SandboxError::Infrastructure(err.to_string())
    }
}

/// GUARDRAIL: reject oversized payloads before any backend work
pub fn validate_payload(source_code: &str, stdin: &str) -> Result<(), SandboxError> {
    if source_code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(SandboxError::Rejected(format!(
            "source code exceeds maximum size of {} bytes",
            MAX_SOURCE_CODE_BYTES
        )));
    }
    if stdin.len() > MAX_TEST_INPUT_BYTES {
        return Err(SandboxError::Rejected(format!(
            "test input exceeds maximum size of {} bytes",
            MAX_TEST_INPUT_BYTES
        )));
    }
    Ok(())
}

/// Byte sink that stops growing at `cap` and remembers that it overflowed.
#[derive(Debug)]
pub struct CappedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    overflowed: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            overflowed: false,
        }
    }

    /// Append a chunk; returns false once the cap has been crossed
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.overflowed = true;
            return false;
        }
        self.bytes.extend_from_slice(chunk);
        true
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Drain a reader into a `CappedBuffer`. Stops reading at the cap, which
/// closes the pipe and lets a runaway writer die on SIGPIPE.
pub async fn read_capped<R>(mut reader: R, cap: usize) -> std::io::Result<CappedBuffer>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = CappedBuffer::new(cap);
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 || !buffer.push(&chunk[..n]) {
            break;
        }
    }
    Ok(buffer)
}

/// Runtime messages that mean the program ran out of memory even though it
/// was not killed by the kernel.
pub fn looks_like_oom(stderr: &str) -> bool {
    const MARKERS: [&str; 5] = [
        "MemoryError",
        "java.lang.OutOfMemoryError",
        "JavaScript heap out of memory",
        "std::bad_alloc",
        "Cannot allocate memory",
    ];
    MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Keep the end of a diagnostic; the last lines usually carry the error.
pub fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
