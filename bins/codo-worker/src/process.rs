/// Process sandbox - confined host processes for hosts without Docker
///
/// **Isolation:**
/// - Fresh temporary scratch directory per execute, removed afterwards
/// - Empty environment apart from PATH, HOME and LANG
/// - Own session and process group; the whole group is killed on exit or timeout
/// - rlimits: CPU seconds, address space (per language), file size, no core dumps
/// - Best-effort user + network namespaces (no network when available)
///
/// Memory enforcement without cgroups relies on RLIMIT_AS and runtime flags,
/// so memory verdicts are detected from the runtime's own failure messages.
use async_trait::async_trait;
use codo_common::types::{Language, Limits};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::LanguageConfigManager;
use crate::engine::{
    looks_like_oom, read_capped, tail, validate_payload, RunOutput, Sandbox, SandboxError,
    SandboxOutcome, DIAGNOSTIC_LIMIT_BYTES,
};

/// Largest file a submission may write into its scratch directory
const FILE_SIZE_LIMIT: u64 = 64 * 1024 * 1024;

const MIB: u64 = 1024 * 1024;

pub struct ProcessSandbox {
    languages: LanguageConfigManager,
    search_path: String,
    network_isolated: bool,
}

impl ProcessSandbox {
    pub fn new(languages: LanguageConfigManager) -> Self {
        let search_path =
            std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());
        Self {
            languages,
            search_path,
            network_isolated: network_isolation_available(),
        }
    }

    /// Whether submissions run without network access on this host
    pub fn network_isolated(&self) -> bool {
        self.network_isolated
    }
}

/// Check once whether a child may enter fresh user and network namespaces.
/// `confine` cannot report the failure itself: it runs between fork and exec.
fn network_isolation_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let mut check = std::process::Command::new("true");
        check
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: the hook performs a single syscall
        unsafe {
            check.pre_exec(|| {
                unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)
                    .map_err(std::io::Error::from)
            });
        }
        let available = check.status().map(|status| status.success()).unwrap_or(false);
        if !available {
            warn!(
                "Unprivileged network namespaces are unavailable: process sandbox submissions keep host network access and see the host filesystem outside their scratch directory"
            );
        }
        available
    })
}

/// One confined process invocation
struct ProcessSpec<'a> {
    argv: &'a [String],
    dir: &'a Path,
    search_path: &'a str,
    stdin: Option<&'a str>,
    wall_time: Duration,
    cpu_seconds: u64,
    address_space: Option<u64>,
    stdout_limit: usize,
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(
        &self,
        language: Language,
        source_code: &str,
        stdin: &str,
        limits: &Limits,
    ) -> Result<SandboxOutcome, SandboxError> {
        validate_payload(source_code, stdin)?;
        let config = self.languages.get_config(&language)?;

        let scratch = tempfile::Builder::new()
            .prefix("codo-")
            .tempdir()
            .map_err(SandboxError::infra)?;
        tokio::fs::write(scratch.path().join(&config.source_file), source_code)
            .await
            .map_err(SandboxError::infra)?;

        if let Some(compile) = config.compile_command(limits.memory_mb) {
            let spec = ProcessSpec {
                argv: &compile,
                dir: scratch.path(),
                search_path: &self.search_path,
                stdin: None,
                wall_time: Duration::from_millis(limits.compile_time_ms),
                cpu_seconds: limits.compile_time_ms.div_ceil(1000),
                address_space: None,
                stdout_limit: DIAGNOSTIC_LIMIT_BYTES,
            };
            let compiled = run_confined(&spec).await?;
            if compiled.timed_out {
                return Ok(SandboxOutcome::CompileError {
                    diagnostic: format!(
                        "compilation timed out after {} ms",
                        limits.compile_time_ms
                    ),
                });
            }
            if !compiled.succeeded() {
                debug!(language = %language, exit_code = ?compiled.exit_code, "Compilation failed");
                return Ok(SandboxOutcome::CompileError {
                    diagnostic: compiler_diagnostic(&compiled),
                });
            }
        }

        let run = config.run_command(limits.memory_mb);
        let spec = ProcessSpec {
            argv: &run,
            dir: scratch.path(),
            search_path: &self.search_path,
            stdin: Some(stdin),
            wall_time: Duration::from_millis(limits.wall_time_ms),
            cpu_seconds: limits.cpu_time_ms.div_ceil(1000).max(1),
            address_space: config
                .limit_address_space
                .then(|| config.memory_ceiling_mb(limits.memory_mb) * MIB),
            stdout_limit: limits.output_limit_bytes,
        };
        let mut output = run_confined(&spec).await?;
        if !output.timed_out && looks_like_oom(&output.stderr) {
            output.memory_exceeded = true;
        }

        // scratch is removed when it drops here
        Ok(SandboxOutcome::Completed(output))
    }
}

fn compiler_diagnostic(output: &RunOutput) -> String {
    let text = match (output.stderr.trim(), output.stdout.trim()) {
        ("", "") => format!("compiler exited with {:?}", output.exit_code),
        ("", out) => out.to_string(),
        (err, _) => err.to_string(),
    };
    tail(&text, DIAGNOSTIC_LIMIT_BYTES)
}

/// Kills the whole process group when dropped, so grandchildren forked by a
/// submission cannot outlive the execute call.
struct ProcessGroupGuard {
    pgid: Pid,
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        // ESRCH just means everything already exited
        let _ = killpg(self.pgid, Signal::SIGKILL);
    }
}

/// Applied in the forked child right before exec
fn confine(cpu_seconds: u64, address_space: Option<u64>) -> std::io::Result<()> {
    setsid()?;
    setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds + 1)?;
    if let Some(bytes) = address_space {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    setrlimit(Resource::RLIMIT_FSIZE, FILE_SIZE_LIMIT, FILE_SIZE_LIMIT)?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    // Availability is checked and reported once by `network_isolation_available`
    let _ = unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET);
    Ok(())
}

async fn run_confined(spec: &ProcessSpec<'_>) -> Result<RunOutput, SandboxError> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| SandboxError::infra("empty command"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(spec.dir)
        .env_clear()
        .env("PATH", spec.search_path)
        .env("HOME", spec.dir)
        .env("LANG", "C.UTF-8")
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let cpu_seconds = spec.cpu_seconds;
    let address_space = spec.address_space;
    // SAFETY: confine only performs async-signal-safe syscalls
    unsafe {
        command.pre_exec(move || confine(cpu_seconds, address_space));
    }

    let started = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::infra(format!("failed to spawn {}: {}", program, e)))?;
    let _group = child.id().map(|pid| ProcessGroupGuard {
        pgid: Pid::from_raw(pid as i32),
    });

    if let (Some(mut sink), Some(input)) = (child.stdin.take(), spec.stdin) {
        let bytes = input.as_bytes().to_vec();
        tokio::spawn(async move {
            // The program may exit without reading its input
            let _ = sink.write_all(&bytes).await;
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::infra("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::infra("stderr was not captured"))?;

    let collect = async {
        let (out, err, status) = tokio::join!(
            read_capped(stdout, spec.stdout_limit),
            read_capped(stderr, DIAGNOSTIC_LIMIT_BYTES),
            child.wait()
        );
        (out, err, status)
    };

    match tokio::time::timeout(spec.wall_time, collect).await {
        Ok((out, err, status)) => {
            let out = out.map_err(SandboxError::infra)?;
            let err = err.map_err(SandboxError::infra)?;
            let status = status.map_err(SandboxError::infra)?;
            let signal = status.signal();
            let output_exceeded = out.overflowed();
            Ok(RunOutput {
                stdout: out.into_string(),
                stderr: err.into_string(),
                exit_code: status.code().map(i64::from),
                signal,
                timed_out: signal == Some(Signal::SIGXCPU as i32),
                memory_exceeded: false,
                output_exceeded,
                duration_ms: started.elapsed().as_millis() as u64,
            })
        }
        Err(_) => {
            warn!(
                program = %program,
                wall_time_ms = spec.wall_time.as_millis() as u64,
                "Execution timed out - killing process group"
            );
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Child already gone");
            }
            let _ = child.wait().await;
            Ok(RunOutput {
                timed_out: true,
                duration_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn spec<'a>(argv: &'a [String], dir: &'a Path, stdin: Option<&'a str>) -> ProcessSpec<'a> {
        ProcessSpec {
            argv,
            dir,
            search_path: "/usr/local/bin:/usr/bin:/bin",
            stdin,
            wall_time: Duration::from_secs(5),
            cpu_seconds: 5,
            address_space: None,
            stdout_limit: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn test_stdin_is_piped_to_program() {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("echo hello; cat");
        let output = run_confined(&spec(&argv, dir.path(), Some("abc")))
            .await
            .unwrap();
        assert!(output.succeeded());
        assert_eq!(output.stdout, "hello\nabc");
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("echo oops >&2; exit 3");
        let output = run_confined(&spec(&argv, dir.path(), None)).await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_wall_time_limit_kills_program() {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("sleep 30");
        let mut limited = spec(&argv, dir.path(), None);
        limited.wall_time = Duration::from_millis(300);

        let started = Instant::now();
        let output = run_confined(&limited).await.unwrap();
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cpu_limit_reports_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("while :; do :; done");
        let mut limited = spec(&argv, dir.path(), None);
        limited.cpu_seconds = 1;
        limited.wall_time = Duration::from_secs(10);

        let output = run_confined(&limited).await.unwrap();
        assert!(output.timed_out);
    }

    #[tokio::test]
    async fn test_output_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("yes");
        let mut limited = spec(&argv, dir.path(), None);
        limited.stdout_limit = 1024;

        let output = run_confined(&limited).await.unwrap();
        assert!(output.output_exceeded);
        assert_eq!(output.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("CODO_SECRET_FOR_TEST", "leak");
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("echo \"[$CODO_SECRET_FOR_TEST]\"");
        let output = run_confined(&spec(&argv, dir.path(), None)).await.unwrap();
        assert_eq!(output.stdout.trim(), "[]");
    }

    /// Shell-backed language entries so the full compile + run path runs
    /// without real toolchains installed.
    fn shell_languages() -> LanguageConfigManager {
        LanguageConfigManager::from_json(
            r#"{"languages":[
                {"name":"python","version":"sh","image":"-","source_file":"main.py",
                 "run":["sh","main.py"]},
                {"name":"cpp","version":"sh","image":"-","source_file":"main.cpp",
                 "compile":["sh","-c","grep -q BROKEN main.cpp && { echo 'main.cpp:1: error: expected ;' >&2; exit 1; }; cp main.cpp prog"],
                 "run":["sh","prog"]}
            ]}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_runs_and_compiles() {
        let sandbox = ProcessSandbox::new(shell_languages());
        let limits = Limits::default();

        let outcome = sandbox
            .execute(Language::Python, "read x; echo $((x * 2))", "21\n", &limits)
            .await
            .unwrap();
        match outcome {
            SandboxOutcome::Completed(run) => assert_eq!(run.stdout.trim(), "42"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let outcome = sandbox
            .execute(Language::Cpp, "echo compiled", "", &limits)
            .await
            .unwrap();
        assert!(matches!(outcome, SandboxOutcome::Completed(ref run) if run.stdout == "compiled\n"));

        let outcome = sandbox
            .execute(Language::Cpp, "BROKEN", "", &limits)
            .await
            .unwrap();
        match outcome {
            SandboxOutcome::CompileError { diagnostic } => {
                assert!(diagnostic.contains("expected ;"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_executions_do_not_share_scratch() {
        let sandbox = ProcessSandbox::new(shell_languages());
        let limits = Limits::default();

        sandbox
            .execute(Language::Python, "echo secret > leftover.txt", "", &limits)
            .await
            .unwrap();
        let outcome = sandbox
            .execute(Language::Python, "cat leftover.txt 2>/dev/null || echo clean", "", &limits)
            .await
            .unwrap();
        assert!(matches!(outcome, SandboxOutcome::Completed(ref run) if run.stdout == "clean\n"));
    }

    #[tokio::test]
    async fn test_concurrent_executions_do_not_share_scratch() {
        let sandbox = ProcessSandbox::new(shell_languages());
        let limits = Limits::default();

        let (first, second) = tokio::join!(
            sandbox.execute(Language::Python, "echo a > a.txt; sleep 0.3; ls", "", &limits),
            sandbox.execute(Language::Python, "echo b > b.txt; sleep 0.3; ls", "", &limits),
        );
        match (first.unwrap(), second.unwrap()) {
            (SandboxOutcome::Completed(a), SandboxOutcome::Completed(b)) => {
                assert_eq!(a.stdout, "a.txt\nmain.py\n");
                assert_eq!(b.stdout, "b.txt\nmain.py\n");
            }
            other => panic!("unexpected outcomes: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_network_namespace_when_available() {
        let sandbox = ProcessSandbox::new(shell_languages());
        if !sandbox.network_isolated() {
            // Host forbids unprivileged namespaces; nothing to check
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        // A fresh network namespace holds only the loopback interface
        let argv = sh("grep -c : /proc/self/net/dev");
        let output = run_confined(&spec(&argv, dir.path(), None)).await.unwrap();
        assert_eq!(output.stdout.trim(), "1");
    }

    #[tokio::test]
    async fn test_unconfigured_language_is_unsupported() {
        let sandbox = ProcessSandbox::new(shell_languages());
        let err = sandbox
            .execute(Language::Java, "class Main {}", "", &Limits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
    }
}
