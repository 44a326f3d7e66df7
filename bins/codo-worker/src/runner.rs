/// Test-Case Runner - judges one submission against its problem
///
/// Runs test cases in their stored order through a `Sandbox`, stops at the
/// first compile error, runtime error or limit violation, and aggregates
/// marks into a `Verdict`.
///
/// **Scoring:**
/// - every test case is worth the problem's marks-per-test-case
/// - score = marks * passed tests; max_score = marks * test count
/// - accepted iff every test case passed; error iff judging stopped early
///
/// Infrastructure failures are returned as errors so the caller can retry;
/// everything the participant caused ends up inside the verdict.
use codo_common::error::Diagnostic;
use codo_common::types::{Limits, Problem, Submission, SubmissionStatus, TestOutcome, TestSummary, Verdict};
use tracing::{debug, info};

use crate::engine::{Sandbox, SandboxError, SandboxOutcome};
use crate::evaluator::evaluate_run;

pub struct TestRunner<'a> {
    sandbox: &'a dyn Sandbox,
}

impl<'a> TestRunner<'a> {
    pub fn new(sandbox: &'a dyn Sandbox) -> Self {
        Self { sandbox }
    }

    #[tracing::instrument(
        skip(self, submission, problem, limits),
        fields(submission_id = %submission.id, problem_id = %problem.id, language = %submission.language)
    )]
    pub async fn run(
        &self,
        submission: &Submission,
        problem: &Problem,
        limits: &Limits,
    ) -> Result<Verdict, SandboxError> {
        if problem.test_cases.is_empty() {
            return Ok(Verdict::error(Diagnostic::NoTestCases.to_string()));
        }

        let marks = problem.marks_per_test_case();
        let test_count = problem.test_cases.len();
        let mut tests = Vec::with_capacity(test_count);
        let mut score = 0u32;
        let mut all_passed = true;
        let mut failure: Option<Diagnostic> = None;

        for (index, test_case) in problem.test_cases.iter().enumerate() {
            if failure.is_some() {
                tests.push(TestSummary {
                    index,
                    hidden: test_case.is_hidden,
                    outcome: TestOutcome::NotAttempted,
                    duration_ms: 0,
                });
                continue;
            }

            let stdin = test_case.input.to_stdin();
            let outcome = match self
                .sandbox
                .execute(submission.language, &submission.source_code, &stdin, limits)
                .await
            {
                Ok(outcome) => outcome,
                Err(SandboxError::UnsupportedLanguage(e)) => {
                    return Ok(Verdict::error(Diagnostic::UnsupportedLanguage(e.0).to_string()));
                }
                Err(SandboxError::Rejected(reason)) => {
                    return Ok(Verdict::error(reason));
                }
                Err(e @ SandboxError::Infrastructure(_)) => return Err(e),
            };

            let (outcome, duration_ms) = match outcome {
                SandboxOutcome::CompileError { diagnostic } => {
                    failure = Some(Diagnostic::CompileError(diagnostic));
                    (TestOutcome::CompileError, 0)
                }
                SandboxOutcome::Completed(run) => {
                    let evaluation =
                        evaluate_run(&run, &test_case.expected_output, problem.comparison, limits);
                    if let Some(diagnostic) = evaluation.diagnostic {
                        failure = Some(diagnostic);
                    }
                    (evaluation.outcome, run.duration_ms)
                }
            };

            match outcome {
                TestOutcome::Passed => score += marks,
                _ => all_passed = false,
            }
            debug!(test = index + 1, outcome = ?outcome, duration_ms, "Test case judged");

            tests.push(TestSummary {
                index,
                hidden: test_case.is_hidden,
                outcome,
                duration_ms,
            });
        }

        let status = match (&failure, all_passed) {
            (Some(_), _) => SubmissionStatus::Error,
            (None, true) => SubmissionStatus::Accepted,
            (None, false) => SubmissionStatus::Rejected,
        };

        info!(
            status = %status,
            score,
            max_score = problem.max_score(),
            "Judging finished"
        );

        Ok(Verdict {
            status,
            score,
            max_score: problem.max_score(),
            error: failure.map(|d| d.to_string()),
            tests,
            test_count,
            testset_digest: Some(problem.testset_digest()),
        })
    }
}
