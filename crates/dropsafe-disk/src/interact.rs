//! Interactive process sessions: spawn, expect, send.
//!
//! The unlock/mount orchestration needs to hold a conversation with
//! `udisksctl` (wait for a passphrase prompt, answer it, match one of several
//! result messages). This module keeps that protocol behind a small trait so
//! pattern tables can be exercised against scripted fake sessions.

use crate::command::CommandError;
use log::{debug, warn};
use regex::Regex;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

/// Result of waiting on a session: either one of the supplied patterns
/// matched, or the stream ended, or the deadline passed. EOF and timeout are
/// ordinary outcomes for the caller to classify, not transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectOutcome {
    Matched {
        /// Index into the pattern list that matched first.
        index: usize,
        /// Capture groups 1..n of the matched pattern, empty string when a
        /// group did not participate.
        captures: Vec<String>,
    },
    Eof,
    Timeout,
}

/// An in-flight interactive child process.
pub trait PromptSession {
    /// Wait until one of `patterns` matches the accumulated output.
    ///
    /// Patterns are tried in list order against everything received so far;
    /// consumed output up to the end of a match is discarded.
    fn expect(
        &mut self,
        patterns: &[Regex],
        timeout: Duration,
    ) -> Result<ExpectOutcome, CommandError>;

    /// Send one line (a trailing newline is appended) to the child's stdin.
    fn send_line(&mut self, line: &str) -> Result<(), CommandError>;

    /// Terminate the session and return the exit code, when one exists.
    fn close(&mut self) -> Option<i32>;
}

/// Factory seam so orchestration logic can run against scripted sessions.
pub trait SessionSpawner {
    fn spawn(&self, program: &str, args: &[&str]) -> Result<Box<dyn PromptSession>, CommandError>;
}

/// Spawns real children with piped stdio.
#[derive(Debug, Clone, Default)]
pub struct PipeSpawner;

impl SessionSpawner for PipeSpawner {
    fn spawn(&self, program: &str, args: &[&str]) -> Result<Box<dyn PromptSession>, CommandError> {
        PipeSession::spawn(program, args).map(|session| Box::new(session) as Box<dyn PromptSession>)
    }
}

/// Child process with stdout and stderr merged into one ordered byte stream.
pub struct PipeSession {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    receiver: Receiver<Vec<u8>>,
    buffer: String,
    eof: bool,
}

impl PipeSession {
    pub fn spawn(program: &str, args: &[&str]) -> Result<Self, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| CommandError::Spawn {
                program: program.to_string(),
                source: err,
            })?;

        let stdin = child.stdin.take();
        let (sender, receiver) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_stream_reader(stdout, sender.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_stream_reader(stderr, sender);
        }

        Ok(Self {
            program: program.to_string(),
            child,
            stdin,
            receiver,
            buffer: String::new(),
            eof: false,
        })
    }

    /// Try each pattern in order against the buffered output.
    fn try_match(&mut self, patterns: &[Regex]) -> Option<ExpectOutcome> {
        match_buffer(&mut self.buffer, patterns)
    }
}

impl PromptSession for PipeSession {
    fn expect(
        &mut self,
        patterns: &[Regex],
        timeout: Duration,
    ) -> Result<ExpectOutcome, CommandError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(outcome) = self.try_match(patterns) {
                return Ok(outcome);
            }
            if self.eof {
                return Ok(ExpectOutcome::Eof);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ExpectOutcome::Timeout);
            }

            match self.receiver.recv_timeout(remaining) {
                Ok(chunk) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                Err(RecvTimeoutError::Timeout) => return Ok(ExpectOutcome::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    // Both pipes closed; one final match attempt on the loop.
                    self.eof = true;
                }
            }
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), CommandError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| CommandError::Io {
            program: self.program.clone(),
            source: io::Error::other("session stdin already closed"),
        })?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.flush())
            .map_err(|err| CommandError::Io {
                program: self.program.clone(),
                source: err,
            })
    }

    fn close(&mut self) -> Option<i32> {
        // Closing stdin lets well-behaved children finish on their own.
        drop(self.stdin.take());

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) => thread::sleep(Duration::from_millis(25)),
                Err(err) => {
                    warn!("waiting on {} failed: {err}", self.program);
                    return None;
                }
            }
        }

        debug!("{} still running at close; killing", self.program);
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    }
}

impl Drop for PipeSession {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Shared match routine: first pattern (in list order) that matches wins and
/// the buffer is advanced past the match.
pub(crate) fn match_buffer(buffer: &mut String, patterns: &[Regex]) -> Option<ExpectOutcome> {
    for (index, pattern) in patterns.iter().enumerate() {
        if let Some(found) = pattern.captures(buffer) {
            let captures = found
                .iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect();
            let end = found.get(0).map(|m| m.end()).unwrap_or(0);
            buffer.drain(..end);
            return Some(ExpectOutcome::Matched { index, captures });
        }
    }
    None
}

fn spawn_stream_reader<R>(mut stream: R, sender: Sender<Vec<u8>>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sender.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}
