//! Utilities for running external commands such as `iptables` and `tc`.

use std::{io, process::Stdio};

use async_trait::async_trait;

/// Failure to run a command to a successful exit.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The program could not be started or waited on.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The program exited unsuccessfully.
    #[error("non-zero exit status ({}): {}", .0.status_str(), .0.stderr.trim())]
    NonZero(Output),
}

/// Result of running a command.
pub type Result<T> = std::result::Result<T, Error>;

/// The captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

impl Output {
    /// A successful, silent output.
    pub const fn ok() -> Self {
        Self { status: Some(0), stdout: String::new(), stderr: String::new() }
    }

    /// A failed output with the given exit code and standard error.
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self { status: Some(status), stdout: String::new(), stderr: stderr.into() }
    }

    /// Whether the process exited with status zero.
    pub const fn success(&self) -> bool {
        matches!(self.status, Some(0))
    }

    fn status_str(&self) -> String {
        self.status.map_or_else(|| "signal".to_owned(), |code| code.to_string())
    }
}

impl From<std::process::Output> for Output {
    fn from(value: std::process::Output) -> Self {
        Self {
            status: value.status.code(),
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

/// Something that can run a program to completion.
///
/// The shaping backend issues every kernel and firewall change through an executor, which keeps
/// the command lines observable in tests.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Runs `program` with `args` and captures its output, whatever the exit status.
    async fn output(&self, program: &str, args: &[String]) -> io::Result<Output>;

    /// Runs `program` with `args`, failing on a non-zero exit status.
    async fn run(&self, program: &str, args: &[String]) -> Result<Output> {
        tracing::debug!(program, ?args, "running command");

        let output = self.output(program, args).await?;

        if !output.success() {
            tracing::debug!(
                ?output.stderr,
                ?output.status,
                program,
                ?args,
                "command returned non-zero status"
            );
            return Err(Error::NonZero(output));
        }

        Ok(output)
    }
}

/// Spawns real processes on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    async fn output(&self, program: &str, args: &[String]) -> io::Result<Output> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(output.into())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Records every command line and answers with scripted outputs.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
        scripted: Mutex<Vec<(String, Output)>>,
    }

    impl RecordingExecutor {
        /// Answer commands whose line starts with `prefix` with `output`.
        pub(crate) fn respond(&self, prefix: &str, output: Output) {
            self.scripted.lock().push((prefix.to_owned(), output));
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub(crate) fn clear(&self) {
            self.calls.lock().clear();
        }
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn output(&self, program: &str, args: &[String]) -> io::Result<Output> {
            let line = std::iter::once(program)
                .chain(args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            self.calls.lock().push(line.clone());

            let scripted = self.scripted.lock();
            let output = scripted
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map_or_else(Output::ok, |(_, output)| output.clone());

            Ok(output)
        }
    }

    #[tokio::test]
    async fn run_fails_on_non_zero_status() {
        let executor = RecordingExecutor::default();
        executor.respond("tc qdisc del", Output::failed(2, "RTNETLINK answers: No such file"));

        let args = vec!["qdisc".to_owned(), "del".to_owned()];
        let err = executor.run("tc", &args).await.unwrap_err();
        assert!(matches!(err, Error::NonZero(ref out) if out.status == Some(2)));
        assert_eq!(err.to_string(), "non-zero exit status (2): RTNETLINK answers: No such file");

        assert!(executor.run("tc", &["show".to_owned()]).await.is_ok());
        assert_eq!(executor.calls(), vec!["tc qdisc del", "tc show"]);
    }

    #[tokio::test]
    async fn system_executor_captures_output() {
        let out = SystemExecutor.run("echo", &["hello".to_owned()]).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");

        let err = SystemExecutor.run("false", &[]).await.unwrap_err();
        assert!(matches!(err, Error::NonZero(ref out) if out.status == Some(1)));
    }
}
