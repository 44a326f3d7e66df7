/// Output Evaluator - Language-Agnostic Judgement of a Single Run
///
/// **Core Responsibility:**
/// Turn one raw `RunOutput` into a test outcome by applying limit checks
/// first and the problem's comparison mode second.
///
/// **Critical Properties:**
/// - Knows nothing about Docker, processes or Redis
/// - Pure function: (run output, expected output, mode) -> outcome
///
/// **Precedence:**
/// 1. Timeout
/// 2. Memory limit
/// 3. Output limit
/// 4. Crash (signal) / non-zero exit
/// 5. Output comparison
///
/// **Comparison Modes:**
/// - `exact`: byte equality, ignoring one trailing newline
/// - `trimmed` (default): leading and trailing whitespace on each line and
///   trailing blank lines ignored, `\r\n` treated as `\n`
/// - `numeric-tolerance`: whitespace-separated tokens; numbers compare within
///   `epsilon * max(1, |expected|)`, everything else exactly
use codo_common::error::Diagnostic;
use codo_common::types::{ComparisonMode, Limits, TestOutcome};

use crate::engine::{tail, RunOutput};

/// stderr excerpt carried in runtime-error diagnostics
const STDERR_EXCERPT_BYTES: usize = 4096;

/// Result of judging one run
#[derive(Debug, Clone, PartialEq)]
pub struct TestEvaluation {
    pub outcome: TestOutcome,
    /// Set when the run failed in a way that stops judging the submission
    pub diagnostic: Option<Diagnostic>,
}

impl TestEvaluation {
    fn verdict(outcome: TestOutcome) -> Self {
        Self {
            outcome,
            diagnostic: None,
        }
    }

    fn failure(outcome: TestOutcome, diagnostic: Diagnostic) -> Self {
        Self {
            outcome,
            diagnostic: Some(diagnostic),
        }
    }
}

/// Evaluate a single test run
pub fn evaluate_run(
    run: &RunOutput,
    expected: &str,
    mode: ComparisonMode,
    limits: &Limits,
) -> TestEvaluation {
    if run.timed_out {
        return TestEvaluation::failure(
            TestOutcome::TimeLimitExceeded,
            Diagnostic::Timeout {
                limit_ms: limits.cpu_time_ms.min(limits.wall_time_ms),
            },
        );
    }
    if run.memory_exceeded {
        return TestEvaluation::failure(
            TestOutcome::MemoryLimitExceeded,
            Diagnostic::MemoryExceeded {
                limit_mb: limits.memory_mb,
            },
        );
    }
    if run.output_exceeded {
        return TestEvaluation::failure(
            TestOutcome::OutputLimitExceeded,
            Diagnostic::OutputLimitExceeded {
                limit_bytes: limits.output_limit_bytes,
            },
        );
    }
    if let Some(signal) = run.signal {
        return TestEvaluation::failure(
            TestOutcome::RuntimeError,
            Diagnostic::Crash {
                signal,
                stderr: tail(run.stderr.trim_end(), STDERR_EXCERPT_BYTES),
            },
        );
    }
    match run.exit_code {
        Some(0) => {}
        code => {
            return TestEvaluation::failure(
                TestOutcome::RuntimeError,
                Diagnostic::RuntimeError {
                    exit_code: code.unwrap_or(-1),
                    stderr: tail(run.stderr.trim_end(), STDERR_EXCERPT_BYTES),
                },
            );
        }
    }

    if outputs_match(&run.stdout, expected, mode) {
        TestEvaluation::verdict(TestOutcome::Passed)
    } else {
        TestEvaluation::verdict(TestOutcome::WrongAnswer)
    }
}

/// Compare program output against the expected output
pub fn outputs_match(actual: &str, expected: &str, mode: ComparisonMode) -> bool {
    match mode {
        ComparisonMode::Exact => strip_final_newline(actual) == strip_final_newline(expected),
        ComparisonMode::Trimmed => trimmed_lines(actual).eq(trimmed_lines(expected)),
        ComparisonMode::NumericTolerance { epsilon } => numeric_match(actual, expected, epsilon),
    }
}

fn strip_final_newline(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}

/// Lines with surrounding whitespace removed and trailing blank lines dropped.
/// `str::lines` already treats `\r\n` as a line break.
fn trimmed_lines(text: &str) -> impl Iterator<Item = &str> {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let keep = lines
        .iter()
        .rposition(|line| !line.is_empty())
        .map_or(0, |last| last + 1);
    lines.into_iter().take(keep)
}

fn numeric_match(actual: &str, expected: &str, epsilon: f64) -> bool {
    let mut actual_tokens = actual.split_whitespace();
    let mut expected_tokens = expected.split_whitespace();
    loop {
        match (actual_tokens.next(), expected_tokens.next()) {
            (None, None) => return true,
            (Some(a), Some(e)) => {
                if !tokens_match(a, e, epsilon) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

fn tokens_match(actual: &str, expected: &str, epsilon: f64) -> bool {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(e)) if a.is_finite() && e.is_finite() => {
            (a - e).abs() <= epsilon * e.abs().max(1.0)
        }
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_run(stdout: &str) -> RunOutput {
        RunOutput {
            stdout: stdout.to_string(),
            exit_code: Some(0),
            duration_ms: 12,
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_mode() {
        assert!(outputs_match("42\n", "42", ComparisonMode::Exact));
        assert!(outputs_match("42\r\n", "42\n", ComparisonMode::Exact));
        assert!(!outputs_match("42 \n", "42", ComparisonMode::Exact));
        assert!(!outputs_match("42\n\n", "42", ComparisonMode::Exact));
        assert!(!outputs_match("Hello", "hello", ComparisonMode::Exact));
    }

    #[test]
    fn test_trimmed_mode() {
        let mode = ComparisonMode::Trimmed;
        assert!(outputs_match("1 2  \r\n3\n\n\n", "1 2\n3", mode));
        assert!(outputs_match("", "\n", mode));
        assert!(outputs_match("  3", "3", mode));
        assert!(outputs_match("\t1 2\n   3  \n", "1 2\n3", mode));
        // Interior spacing and blank lines still count
        assert!(!outputs_match("1  2", "1 2", mode));
        assert!(!outputs_match("1\n\n2", "1\n2", mode));
        assert!(!outputs_match("1\n2", "1\n2\n3", mode));
    }

    #[test]
    fn test_numeric_tolerance_mode() {
        let mode = ComparisonMode::NumericTolerance { epsilon: 1e-6 };
        assert!(outputs_match("0.3333333", "0.33333333333", mode));
        assert!(outputs_match("1000000.0000001", "1000000", mode));
        assert!(!outputs_match("0.334", "0.333", mode));
        // Non-numeric tokens compare exactly
        assert!(outputs_match("YES 1.0", "YES 1", mode));
        assert!(!outputs_match("yes 1.0", "YES 1", mode));
        // Token count must match
        assert!(!outputs_match("1 2", "1 2 3", mode));
    }

    #[test]
    fn test_passed_and_wrong_answer() {
        let limits = Limits::default();
        let passed = evaluate_run(&ok_run("5\n"), "5", ComparisonMode::Trimmed, &limits);
        assert_eq!(passed.outcome, TestOutcome::Passed);
        assert!(passed.diagnostic.is_none());

        let wrong = evaluate_run(&ok_run("6\n"), "5", ComparisonMode::Trimmed, &limits);
        assert_eq!(wrong.outcome, TestOutcome::WrongAnswer);
        assert!(wrong.diagnostic.is_none());
    }

    #[test]
    fn test_timeout_takes_precedence() {
        let limits = Limits::default();
        let run = RunOutput {
            timed_out: true,
            signal: Some(9),
            memory_exceeded: true,
            ..Default::default()
        };
        let eval = evaluate_run(&run, "", ComparisonMode::Trimmed, &limits);
        assert_eq!(eval.outcome, TestOutcome::TimeLimitExceeded);
        let message = eval.diagnostic.unwrap().to_string();
        assert!(message.starts_with("timeout"));
    }

    #[test]
    fn test_memory_and_output_limits() {
        let limits = Limits::default();
        let oom = RunOutput {
            memory_exceeded: true,
            exit_code: Some(1),
            ..Default::default()
        };
        let eval = evaluate_run(&oom, "", ComparisonMode::Trimmed, &limits);
        assert_eq!(eval.outcome, TestOutcome::MemoryLimitExceeded);
        assert_eq!(
            eval.diagnostic,
            Some(Diagnostic::MemoryExceeded { limit_mb: 256 })
        );

        let flood = RunOutput {
            output_exceeded: true,
            exit_code: Some(0),
            ..Default::default()
        };
        let eval = evaluate_run(&flood, "", ComparisonMode::Trimmed, &limits);
        assert_eq!(eval.outcome, TestOutcome::OutputLimitExceeded);
    }

    #[test]
    fn test_runtime_error_and_crash() {
        let limits = Limits::default();
        let failed = RunOutput {
            exit_code: Some(1),
            stderr: "Traceback (most recent call last):\nZeroDivisionError\n".to_string(),
            ..Default::default()
        };
        let eval = evaluate_run(&failed, "", ComparisonMode::Trimmed, &limits);
        assert_eq!(eval.outcome, TestOutcome::RuntimeError);
        match eval.diagnostic {
            Some(Diagnostic::RuntimeError { exit_code, stderr }) => {
                assert_eq!(exit_code, 1);
                assert!(stderr.ends_with("ZeroDivisionError"));
            }
            other => panic!("unexpected diagnostic: {:?}", other),
        }

        let crashed = RunOutput {
            signal: Some(11),
            ..Default::default()
        };
        let eval = evaluate_run(&crashed, "", ComparisonMode::Trimmed, &limits);
        assert!(matches!(
            eval.diagnostic,
            Some(Diagnostic::Crash { signal: 11, .. })
        ));
    }

    #[test]
    fn test_nonzero_exit_with_correct_output_is_still_an_error() {
        let limits = Limits::default();
        let run = RunOutput {
            stdout: "5\n".to_string(),
            exit_code: Some(2),
            ..Default::default()
        };
        let eval = evaluate_run(&run, "5", ComparisonMode::Trimmed, &limits);
        assert_eq!(eval.outcome, TestOutcome::RuntimeError);
    }
}
