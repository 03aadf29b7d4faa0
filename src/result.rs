use serde::{Deserialize, Serialize};

// The executor never got as far as an exit code.
pub const EXIT_EXEC_FAILED: i32 = -1;
// The job was cancelled; any later completion from a worker is discarded.
pub const EXIT_CANCELLED: i32 = -2;

// How much of a job's stdout is embedded in the synchronous result. Retained
// logs are always full, this only shapes the per-call response.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// stdout omitted, stderr preserved.
    #[default]
    Minimal,
    /// Last 50 lines of stdout, stderr preserved.
    Normal,
    /// Both preserved untouched.
    Full,
}

// How many trailing stdout lines survive Verbosity::Normal.
const NORMAL_TAIL_LINES: usize = 50;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_secs: f64,
    /// stdout ++ stderr after verbosity filtering. Kept for callers that
    /// predate the split fields.
    pub output: String,
}

impl JobResult {
    // Compose a result from raw captured streams, applying the verbosity
    // policy. The inputs are untouched, filtering only shapes the copy that
    // lands in the result.
    pub fn filtered(
        job_id: impl Into<String>,
        exit_code: i32,
        duration_secs: f64,
        stdout: &str,
        stderr: &str,
        verbosity: Verbosity,
    ) -> Self {
        let stdout = filter_stdout(stdout, verbosity);
        Self {
            job_id: job_id.into(),
            exit_code,
            output: format!("{stdout}{stderr}"),
            stdout,
            stderr: stderr.to_owned(),
            duration_secs,
        }
    }

    pub fn cancelled(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            exit_code: EXIT_CANCELLED,
            stdout: String::new(),
            stderr: String::new(),
            duration_secs: 0.0,
            output: "Job cancelled".to_owned(),
        }
    }

    // Pre-start failure: the message goes into both stderr and output so it
    // survives every verbosity level.
    pub fn exec_failed(job_id: impl Into<String>, message: &str, duration_secs: f64) -> Self {
        Self {
            job_id: job_id.into(),
            exit_code: EXIT_EXEC_FAILED,
            stdout: String::new(),
            stderr: message.to_owned(),
            duration_secs,
            output: message.to_owned(),
        }
    }
}

pub fn filter_stdout(stdout: &str, verbosity: Verbosity) -> String {
    match verbosity {
        Verbosity::Minimal => String::new(),
        Verbosity::Normal => last_lines(stdout, NORMAL_TAIL_LINES),
        Verbosity::Full => stdout.to_owned(),
    }
}

fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.split_inclusive('\n').collect();
    if lines.len() <= n {
        return s.to_owned();
    }
    lines[lines.len() - n..].concat()
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn numbered_lines(range: std::ops::RangeInclusive<usize>) -> String {
        range.map(|i| format!("line {i}\n")).collect()
    }

    #[test_case(Verbosity::Minimal)]
    #[test_case(Verbosity::Normal)]
    #[test_case(Verbosity::Full)]
    fn filtering_is_idempotent(verbosity: Verbosity) {
        let stdout = numbered_lines(1..=60);
        let once = filter_stdout(&stdout, verbosity);
        let twice = filter_stdout(&once, verbosity);
        assert_eq!(once, twice);
    }

    #[test_case(Verbosity::Minimal)]
    #[test_case(Verbosity::Normal)]
    #[test_case(Verbosity::Full)]
    fn stderr_is_always_preserved(verbosity: Verbosity) {
        let result = JobResult::filtered("job-1", 0, 0.1, "A\n", "B\n", verbosity);
        assert_eq!(result.stderr, "B\n");
    }

    #[googletest::test]
    fn minimal_omits_stdout() {
        let result = JobResult::filtered("job-1", 0, 0.1, "A\n", "B\n", Verbosity::Minimal);
        assert_eq!(result.stdout, "");
        expect_that!(result.output, not(contains_substring("A")));
        expect_that!(result.output, contains_substring("B"));
    }

    #[googletest::test]
    fn normal_keeps_the_last_50_lines() {
        let stdout = numbered_lines(1..=60);
        let filtered = filter_stdout(&stdout, Verbosity::Normal);
        assert_eq!(filtered.lines().count(), 50);
        assert_eq!(filtered.lines().next(), Some("line 11"));
        assert_eq!(filtered.lines().last(), Some("line 60"));
    }

    #[googletest::test]
    fn normal_passes_short_output_through() {
        let stdout = numbered_lines(1..=3);
        assert_eq!(filter_stdout(&stdout, Verbosity::Normal), stdout);
    }

    #[googletest::test]
    fn full_is_untouched() {
        let stdout = numbered_lines(1..=60);
        let result = JobResult::filtered("job-1", 42, 1.0, &stdout, "oops\n", Verbosity::Full);
        assert_eq!(result.stdout, stdout);
        assert_eq!(result.output, format!("{stdout}oops\n"));
    }

    #[googletest::test]
    fn exec_failure_message_survives_minimal() {
        let result = JobResult::exec_failed("job-1", "worktree setup failed", 0.0);
        assert_eq!(result.exit_code, EXIT_EXEC_FAILED);
        expect_that!(result.output, contains_substring("worktree setup failed"));
        expect_that!(result.stderr, contains_substring("worktree setup failed"));
    }
}
