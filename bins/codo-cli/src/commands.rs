// CLI commands for operating Codo
use anyhow::{bail, Context, Result};
use codo_common::problems::ProblemStore;
use codo_common::queue::SubmissionQueue;
use codo_common::store::SubmissionStore;
use codo_common::types::{
    Language, Problem, Submission, TestCase, TestInput, TestOutcome, MAX_SOURCE_CODE_BYTES,
};
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::generator::TemplateGenerator;

/// Interval between status polls, matching the legacy web client
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Initialize a new Codo project
pub async fn init_project(path: &str, force: bool) -> Result<()> {
    println!("🚀 Initializing Codo project at: {}", path);

    let config_dir = Path::new(path).join("config");
    let languages_path = config_dir.join("languages.json");
    if languages_path.exists() && !force {
        bail!(
            "{} already exists (pass --force to overwrite)",
            languages_path.display()
        );
    }

    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;
    let content = TemplateGenerator::new()
        .render_languages(&Language::ALL)
        .context("Failed to render languages.json")?;
    fs::write(&languages_path, content)
        .with_context(|| format!("Failed to write {}", languages_path.display()))?;

    println!("📝 Wrote {}", languages_path.display());
    println!("\n📋 Next steps:");
    println!("  1. Start Redis: docker run -d -p 6379:6379 redis:7");
    println!("  2. Seed a problem: codo-cli problem create --file problem.json");
    println!("  3. Start the worker and API: cargo run -p codo-worker / cargo run -p codo-api");

    Ok(())
}

/// Create a problem from a JSON file
pub async fn create_problem(problems: &dyn ProblemStore, file: &Path) -> Result<()> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let problem: Problem = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse problem in {}", file.display()))?;

    if problem.id.trim().is_empty() {
        bail!("Problem id cannot be empty");
    }
    if !problems.create(&problem).await? {
        bail!("Problem '{}' already exists", problem.id);
    }

    println!(
        "✅ Problem '{}' created ({:?}, {} marks per test, {} test case(s))",
        problem.id,
        problem.difficulty,
        problem.marks_per_test_case(),
        problem.test_cases.len()
    );
    Ok(())
}

/// Append a test case to an existing problem
pub async fn add_test_case(
    problems: &dyn ProblemStore,
    problem_id: &str,
    input: &Path,
    expected: &Path,
    hidden: bool,
) -> Result<usize> {
    let input = fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let expected_output = fs::read_to_string(expected)
        .with_context(|| format!("Failed to read {}", expected.display()))?;

    let count = problems
        .add_test_case(
            problem_id,
            &TestCase {
                input: TestInput::Text(input),
                expected_output,
                is_hidden: hidden,
            },
        )
        .await?;

    println!(
        "✅ Added {} test case to '{}' ({} total)",
        if hidden { "hidden" } else { "visible" },
        problem_id,
        count
    );
    Ok(count)
}

/// Infer the submission language from a source file extension
pub fn language_for_path(path: &Path) -> Result<Language> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    let language = match ext.as_str() {
        "py" => Language::Python,
        "java" => Language::Java,
        "cpp" | "cc" | "cxx" => Language::Cpp,
        "js" | "mjs" => Language::Javascript,
        _ => bail!(
            "Cannot infer language from '{}'; pass --language",
            path.display()
        ),
    };
    Ok(language)
}

/// Create a pending submission and hand it to the queue
pub async fn submit(
    store: &dyn SubmissionStore,
    queue: &dyn SubmissionQueue,
    problems: &dyn ProblemStore,
    user: &str,
    problem_id: &str,
    language: Language,
    source_code: String,
) -> Result<Uuid> {
    if source_code.trim().is_empty() {
        bail!("Source file is empty");
    }
    if source_code.len() > MAX_SOURCE_CODE_BYTES {
        bail!(
            "Source file exceeds maximum size of {} bytes",
            MAX_SOURCE_CODE_BYTES
        );
    }
    if problems.get(problem_id).await?.is_none() {
        bail!("Problem '{}' not found", problem_id);
    }

    let submission = Submission::new(user, problem_id, language, source_code);
    let id = store.create(&submission).await?;
    if let Err(e) = queue.enqueue(id).await {
        store
            .discard(id)
            .await
            .context("Failed to discard unqueued submission")?;
        return Err(e).context("Submission was not accepted");
    }

    println!("📨 Submitted {} ({}) as {}", problem_id, language, id);
    Ok(id)
}

/// Poll until the submission reaches a terminal state
pub async fn wait_for_verdict(
    store: &dyn SubmissionStore,
    id: Uuid,
    interval: Duration,
    timeout: Duration,
) -> Result<Submission> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let submission = store.get(id).await?;
        if submission.status.is_terminal() {
            return Ok(submission);
        }
        if tokio::time::Instant::now() + interval > deadline {
            bail!(
                "Submission {} still {} after {}s",
                id,
                submission.status,
                timeout.as_secs()
            );
        }
        tokio::time::sleep(interval).await;
    }
}

/// Print a submission in a human-readable form
pub fn print_submission(submission: &Submission) {
    println!("📋 Submission {}\n", submission.id);
    println!("{:<10} {}", "Problem", submission.problem_id);
    println!("{:<10} {}", "Language", submission.language);
    println!("{:<10} {}", "Status", submission.status);
    println!("{:<10} {}/{}", "Score", submission.score, submission.max_score);
    if let Some(error) = &submission.error {
        println!("{:<10} {}", "Error", error);
    }

    if !submission.tests.is_empty() {
        println!("\n{:<6} {:<8} {:<24} {:>8}", "Test", "Hidden", "Outcome", "Time");
        println!("{}", "─".repeat(50));
        for test in &submission.tests {
            let marker = match test.outcome {
                TestOutcome::Passed => "✅",
                TestOutcome::NotAttempted => "⏭️",
                _ => "❌",
            };
            println!(
                "{:<6} {:<8} {} {:<21} {:>6}ms",
                test.index + 1,
                test.hidden,
                marker,
                format!("{:?}", test.outcome),
                test.duration_ms
            );
        }
    }
}

/// Show one submission
pub async fn show_status(store: &dyn SubmissionStore, id: Uuid) -> Result<()> {
    let submission = store.get(id).await?;
    print_submission(&submission);
    Ok(())
}

/// Cancel a submission that has not started judging
pub async fn cancel(
    store: &dyn SubmissionStore,
    queue: &dyn SubmissionQueue,
    id: Uuid,
) -> Result<Submission> {
    let cancelled = store
        .cancel(id)
        .await
        .with_context(|| format!("Cannot cancel {}", id))?;
    let dropped = queue.cancel(id).await?;
    println!(
        "🛑 Cancelled {}{}",
        id,
        if dropped { "" } else { " (was not queued)" }
    );
    Ok(cancelled)
}

/// List a user's submissions, newest first
pub async fn list_submissions(store: &dyn SubmissionStore, user: &str) -> Result<()> {
    let submissions = store.list_by_user(user).await?;
    if submissions.is_empty() {
        println!("No submissions for '{}'.", user);
        return Ok(());
    }

    println!(
        "{:<38} {:<16} {:<12} {:<10} {:>7}",
        "ID", "Problem", "Language", "Status", "Score"
    );
    println!("{}", "─".repeat(86));
    for s in &submissions {
        println!(
            "{:<38} {:<16} {:<12} {:<10} {:>3}/{:<3}",
            s.id.to_string(),
            s.problem_id,
            s.language.to_string(),
            s.status.to_string(),
            s.score,
            s.max_score
        );
    }
    println!("\n✅ Total: {} submission(s)", submissions.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codo_common::problems::MemoryProblemStore;
    use codo_common::queue::{MemoryQueue, QueueSettings};
    use codo_common::store::MemoryStore;
    use codo_common::types::{Difficulty, SubmissionStatus, Verdict};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn problem_json() -> serde_json::Value {
        serde_json::json!({
            "id": "echo",
            "title": "Echo",
            "statement": "Print the input",
            "difficulty": "medium",
            "testCases": [
                {"input": "hi\n", "expectedOutput": "hi\n"}
            ]
        })
    }

    async fn seeded() -> MemoryProblemStore {
        let problems = MemoryProblemStore::new();
        let problem: Problem = serde_json::from_value(problem_json()).unwrap();
        problems.create(&problem).await.unwrap();
        problems
    }

    #[test]
    fn test_language_for_path() {
        assert_eq!(
            language_for_path(&PathBuf::from("a/Main.java")).unwrap(),
            Language::Java
        );
        assert_eq!(
            language_for_path(&PathBuf::from("sol.CPP")).unwrap(),
            Language::Cpp
        );
        assert_eq!(
            language_for_path(&PathBuf::from("x.py")).unwrap(),
            Language::Python
        );
        assert!(language_for_path(&PathBuf::from("notes.txt")).is_err());
        assert!(language_for_path(&PathBuf::from("Makefile")).is_err());
    }

    #[tokio::test]
    async fn test_create_problem_and_add_tests() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("echo.json");
        fs::write(&file, problem_json().to_string()).unwrap();
        let input = dir.path().join("2.in");
        let expected = dir.path().join("2.out");
        fs::write(&input, "bye\n").unwrap();
        fs::write(&expected, "bye\n").unwrap();

        let problems = MemoryProblemStore::new();
        create_problem(&problems, &file).await.unwrap();
        assert!(create_problem(&problems, &file).await.is_err());

        let count = add_test_case(&problems, "echo", &input, &expected, true)
            .await
            .unwrap();
        assert_eq!(count, 2);

        let problem = problems.get("echo").await.unwrap().unwrap();
        assert_eq!(problem.difficulty, Difficulty::Medium);
        assert!(problem.test_cases[1].is_hidden);

        assert!(add_test_case(&problems, "missing", &input, &expected, false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_submit_then_poll_until_judged() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(QueueSettings::default()));
        let problems = seeded().await;

        let id = submit(
            store.as_ref(),
            queue.as_ref(),
            &problems,
            "alice",
            "echo",
            Language::Python,
            "print(input())".to_string(),
        )
        .await
        .unwrap();

        // Stand-in worker: claim, run, write back
        let judge = {
            let store = store.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                let lease = queue
                    .dequeue(Duration::from_secs(1))
                    .await
                    .unwrap()
                    .unwrap();
                store.mark_running(lease.submission_id, &lease).await.unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
                let verdict = Verdict {
                    status: SubmissionStatus::Accepted,
                    score: 10,
                    max_score: 10,
                    error: None,
                    tests: Vec::new(),
                    test_count: 1,
                    testset_digest: None,
                };
                store
                    .update_terminal(lease.submission_id, lease.token, &verdict)
                    .await
                    .unwrap();
                queue.complete(&lease).await.unwrap();
            })
        };

        let judged = wait_for_verdict(
            store.as_ref(),
            id,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        judge.await.unwrap();

        assert_eq!(judged.status, SubmissionStatus::Accepted);
        assert_eq!(judged.score, 10);
    }

    #[tokio::test]
    async fn test_wait_times_out_while_pending() {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new(QueueSettings::default());
        let problems = seeded().await;
        let id = submit(
            &store,
            &queue,
            &problems,
            "alice",
            "echo",
            Language::Python,
            "print(1)".to_string(),
        )
        .await
        .unwrap();

        let err = wait_for_verdict(
            &store,
            id,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("still pending"));
    }

    #[tokio::test]
    async fn test_submit_refused_leaves_no_record() {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new(QueueSettings {
            ceiling: 0,
            ..QueueSettings::default()
        });
        let problems = seeded().await;

        let result = submit(
            &store,
            &queue,
            &problems,
            "alice",
            "echo",
            Language::Python,
            "print(1)".to_string(),
        )
        .await;
        assert!(result.is_err());
        assert!(store.list_by_user("alice").await.unwrap().is_empty());

        assert!(submit(
            &store,
            &queue,
            &problems,
            "alice",
            "nope",
            Language::Python,
            "print(1)".to_string(),
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_cancel_pending_submission() {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new(QueueSettings::default());
        let problems = seeded().await;
        let id = submit(
            &store,
            &queue,
            &problems,
            "alice",
            "echo",
            Language::Python,
            "print(1)".to_string(),
        )
        .await
        .unwrap();

        let cancelled = cancel(&store, &queue, id).await.unwrap();
        assert_eq!(cancelled.status, SubmissionStatus::Error);
        assert_eq!(queue.pending_len().await.unwrap(), 0);
        assert!(cancel(&store, &queue, id).await.is_err());
    }
}
