//! Execution wrapper for invoking external disk tooling.
//!
//! The goal is to keep shell integration isolated so pipeline logic stays
//! testable (fake runners, deterministic stdout parsing).

use std::io::{self, Read};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Captured result of a finished external command.
#[derive(Debug, Clone)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefer stderr for diagnostics, falling back to stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else {
            self.stdout.trim().to_string()
        }
    }
}

/// Failure modes of the command layer itself.
///
/// Components translate these into exactly one `ExportError` variant at
/// their own boundary; no `CommandError` escapes the disk crate.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("{program} exited with code {code}: {diagnostic}")]
    Failed {
        program: String,
        code: i32,
        diagnostic: String,
    },

    #[error("i/o failure while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Seam for running non-interactive commands so tests can script outputs.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<Output, CommandError>;

    /// Run and require a zero exit status.
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<Output, CommandError> {
        let out = self.run(program, args)?;
        if out.success() {
            Ok(out)
        } else {
            Err(CommandError::Failed {
                program: program.to_string(),
                code: out.status,
                diagnostic: out.diagnostic(),
            })
        }
    }
}

/// Runs commands on the host with piped output and a bounded wait.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn wait_with_timeout(
        &self,
        program: &str,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> Result<Output, CommandError> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_status = Some(status);
                    break;
                }
                Ok(None) => thread::sleep(Duration::from_millis(25)),
                Err(err) => {
                    return Err(CommandError::Io {
                        program: program.to_string(),
                        source: err,
                    });
                }
            }
        }

        let Some(status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CommandError::TimedOut {
                program: program.to_string(),
                timeout: self.timeout,
            });
        };

        let stdout = join_output_reader(program, stdout_handle)?;
        let stderr = join_output_reader(program, stderr_handle)?;

        Ok(Output {
            stdout,
            stderr,
            status: status.code().unwrap_or(-1),
        })
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<Output, CommandError> {
        let mut command = Command::new(program);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| CommandError::Spawn {
            program: program.to_string(),
            source: err,
        })?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(program, child, stdout_pipe, stderr_pipe)
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> io::Result<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

fn join_output_reader(
    program: &str,
    handle: thread::JoinHandle<io::Result<String>>,
) -> Result<String, CommandError> {
    handle
        .join()
        .map_err(|_| CommandError::Io {
            program: program.to_string(),
            source: io::Error::other("output reader thread panicked"),
        })?
        .map_err(|err| CommandError::Io {
            program: program.to_string(),
            source: err,
        })
}
