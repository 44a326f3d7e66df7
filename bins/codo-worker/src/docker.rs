/// Docker sandbox - one throwaway container per execute
///
/// **Docker Execution Rules:**
/// 1. Pulls the language image if not present
/// 2. Creates a container that only idles, with security constraints:
///    - Network disabled
///    - Memory (no swap), CPU and pid limits
///    - Read-only root filesystem, scratch space on tmpfs
///    - All capabilities dropped, no-new-privileges, unprivileged user
/// 3. Uploads the source through an exec's stdin
/// 4. Compiles (if needed) and runs via exec, streaming stdin in and capping output
/// 5. Kills the container on timeout and always removes it afterwards
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use codo_common::types::{Language, Limits};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::engine::{
    looks_like_oom, tail, validate_payload, CappedBuffer, RunOutput, Sandbox, SandboxError,
    SandboxOutcome, DIAGNOSTIC_LIMIT_BYTES,
};

const WORKDIR: &str = "/sandbox";
const SANDBOX_USER: &str = "65534:65534";
const PIDS_LIMIT: i64 = 64;

/// Exit status of a process killed by SIGKILL (OOM killer or the hard CPU cap)
const EXIT_SIGKILL: i64 = 128 + 9;
/// Exit status of a process stopped by SIGXCPU at the soft CPU cap
const EXIT_SIGXCPU: i64 = 128 + 24;

/// Container cleanup guard - guarantees container removal on drop,
/// including when the execute future is cancelled or panics.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let container_id = std::mem::take(&mut self.container_id);
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker
                .remove_container(&container_id, Some(remove_options))
                .await
            {
                warn!(container_id = %container_id, error = %e, "Failed to cleanup container");
            }
        });
    }
}

pub struct DockerSandbox {
    docker: Docker,
    languages: LanguageConfigManager,
}

impl DockerSandbox {
    pub fn new(languages: LanguageConfigManager) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker, languages })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss - pulling now");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::infra(format!("failed to pull {}: {}", image, e)))?;
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    async fn create_container(
        &self,
        config: &LanguageConfig,
        limits: &Limits,
    ) -> Result<ContainerGuard, SandboxError> {
        let memory = (config.memory_ceiling_mb(limits.memory_mb) * 1024 * 1024) as i64;
        let tmpfs = HashMap::from([
            (WORKDIR.to_string(), "rw,exec,nosuid,size=64m,mode=1777".to_string()),
            ("/tmp".to_string(), "rw,exec,nosuid,size=64m,mode=1777".to_string()),
        ]);

        let container_config = Config {
            image: Some(config.image.clone()),
            entrypoint: Some(vec!["sleep".to_string()]),
            cmd: Some(vec!["infinity".to_string()]),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(WORKDIR.to_string()),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some((config.cpu_limit * 1_000_000_000.0) as i64),
                pids_limit: Some(PIDS_LIMIT),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = format!("codo-{}", uuid::Uuid::new_v4());
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| SandboxError::infra(format!("failed to create container: {}", e)))?;

        let guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: created.id,
        };

        self.docker
            .start_container(&guard.container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::infra(format!("failed to start container: {}", e)))?;

        Ok(guard)
    }

    /// Run a shell command inside the container, feeding `stdin` and
    /// collecting capped output. Returns `None` when `timeout` elapsed.
    async fn exec(
        &self,
        container_id: &str,
        script: String,
        stdin: &[u8],
        stdout_limit: usize,
        timeout: Duration,
    ) -> Result<Option<ExecOutput>, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(WORKDIR.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::infra(format!("failed to create exec: {}", e)))?;

        let started = Instant::now();
        let execution = async {
            let StartExecResults::Attached {
                mut output,
                mut input,
            } = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| SandboxError::infra(format!("failed to start exec: {}", e)))?
            else {
                return Err(SandboxError::infra("exec started detached"));
            };

            let feed = async move {
                // A program may exit before reading all of its input
                let _ = input.write_all(stdin).await;
                let _ = input.shutdown().await;
            };

            let collect = async {
                let mut stdout = CappedBuffer::new(stdout_limit);
                let mut stderr = CappedBuffer::new(DIAGNOSTIC_LIMIT_BYTES);
                while let Some(frame) = output.next().await {
                    match frame {
                        Ok(LogOutput::StdOut { message }) => {
                            if !stdout.push(&message) {
                                break;
                            }
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push(&message);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(SandboxError::infra(format!("exec stream failed: {}", e)))
                        }
                    }
                }
                Ok((stdout, stderr))
            };

            let ((), collected) = tokio::join!(feed, collect);
            let (stdout, stderr) = collected?;
            Ok::<_, SandboxError>((stdout, stderr))
        };

        let (stdout, stderr) = match tokio::time::timeout(timeout, execution).await {
            Ok(result) => result?,
            Err(_) => return Ok(None),
        };

        let output_exceeded = stdout.overflowed();
        let exit_code = if output_exceeded {
            None
        } else {
            self.docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| SandboxError::infra(format!("failed to inspect exec: {}", e)))?
                .exit_code
        };

        Ok(Some(ExecOutput {
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code,
            output_exceeded,
            duration_ms: started.elapsed().as_millis() as u64,
        }))
    }

    async fn oom_killed(&self, container_id: &str) -> bool {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                debug!(container_id, error = %e, "Container inspect failed");
                false
            }
        }
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id, error = %e, "Failed to kill timed-out container");
        }
    }
}

struct ExecOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    output_exceeded: bool,
    duration_ms: u64,
}

/// Quote one argument for `sh -c`
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Soft CPU cap raises SIGXCPU; the hard cap one second later is the SIGKILL
/// backstop. The soft limit goes first so it never exceeds the hard one.
fn shell_command(argv: &[String], cpu_seconds: u64) -> String {
    let quoted: Vec<String> = argv.iter().map(|arg| shell_quote(arg)).collect();
    format!(
        "ulimit -S -t {} && ulimit -H -t {} && exec {}",
        cpu_seconds,
        cpu_seconds + 1,
        quoted.join(" ")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitClassification {
    timed_out: bool,
    memory_exceeded: bool,
    signal: Option<i32>,
}

/// Map an exec exit status onto limit violations.
///
/// Memory is only reported when the kernel or the runtime says so; a bare
/// SIGKILL past the CPU budget is the hard CPU cap firing.
fn classify_exit(
    exit_code: Option<i64>,
    oom_killed: bool,
    stderr: &str,
    duration_ms: u64,
    cpu_limit_ms: u64,
) -> ExitClassification {
    let memory_exceeded = oom_killed || looks_like_oom(stderr);
    let timed_out = !memory_exceeded
        && match exit_code {
            Some(EXIT_SIGXCPU) => true,
            Some(EXIT_SIGKILL) => duration_ms >= cpu_limit_ms,
            _ => false,
        };
    let signal = match exit_code {
        Some(code) if code > 128 && !memory_exceeded && !timed_out => Some((code - 128) as i32),
        _ => None,
    };
    ExitClassification {
        timed_out,
        memory_exceeded,
        signal,
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    #[tracing::instrument(skip(self, source_code, stdin, limits), fields(language = %language))]
    async fn execute(
        &self,
        language: Language,
        source_code: &str,
        stdin: &str,
        limits: &Limits,
    ) -> Result<SandboxOutcome, SandboxError> {
        validate_payload(source_code, stdin)?;
        let config = self.languages.get_config(&language)?;

        self.ensure_image(&config.image).await?;
        let container = self.create_container(config, limits).await?;
        let container_id = container.container_id.as_str();

        // Upload the source base64-encoded so arbitrary bytes survive the shell
        let upload = format!("base64 -d > {}", shell_quote(&config.source_file));
        let encoded = general_purpose::STANDARD.encode(source_code);
        match self
            .exec(container_id, upload, encoded.as_bytes(), DIAGNOSTIC_LIMIT_BYTES, Duration::from_secs(30))
            .await?
        {
            Some(out) if out.exit_code == Some(0) => {}
            Some(out) => {
                return Err(SandboxError::infra(format!(
                    "failed to upload source: {}",
                    out.stderr.trim()
                )))
            }
            None => return Err(SandboxError::infra("timed out uploading source")),
        }

        if let Some(compile) = config.compile_command(limits.memory_mb) {
            let script = shell_command(&compile, limits.compile_time_ms.div_ceil(1000));
            let compile_timeout = Duration::from_millis(limits.compile_time_ms);
            match self
                .exec(container_id, script, &[], DIAGNOSTIC_LIMIT_BYTES, compile_timeout)
                .await?
            {
                None => {
                    return Ok(SandboxOutcome::CompileError {
                        diagnostic: format!(
                            "compilation timed out after {} ms",
                            limits.compile_time_ms
                        ),
                    })
                }
                Some(out) if out.exit_code != Some(0) => {
                    let text = if out.stderr.trim().is_empty() {
                        out.stdout
                    } else {
                        out.stderr
                    };
                    return Ok(SandboxOutcome::CompileError {
                        diagnostic: tail(text.trim(), DIAGNOSTIC_LIMIT_BYTES),
                    });
                }
                Some(out) => {
                    debug!(duration_ms = out.duration_ms, "Compilation succeeded");
                }
            }
        }

        let run = config.run_command(limits.memory_mb);
        let cpu_seconds = limits.cpu_time_ms.div_ceil(1000).max(1);
        let script = shell_command(&run, cpu_seconds);
        let wall_time = Duration::from_millis(limits.wall_time_ms);
        let started = Instant::now();

        let Some(out) = self
            .exec(container_id, script, stdin.as_bytes(), limits.output_limit_bytes, wall_time)
            .await?
        else {
            warn!(wall_time_ms = limits.wall_time_ms, "Execution timed out - killing container");
            self.kill(container_id).await;
            return Ok(SandboxOutcome::Completed(RunOutput {
                timed_out: true,
                duration_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            }));
        };

        let oom_killed = self.oom_killed(container_id).await;
        let ExitClassification {
            timed_out,
            memory_exceeded,
            signal,
        } = classify_exit(
            out.exit_code,
            oom_killed,
            &out.stderr,
            out.duration_ms,
            cpu_seconds * 1000,
        );

        // Container is removed when `container` drops
        Ok(SandboxOutcome::Completed(RunOutput {
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: out.exit_code,
            signal,
            timed_out,
            memory_exceeded,
            output_exceeded: out.output_exceeded,
            duration_ms: out.duration_ms,
        }))
    }
}
