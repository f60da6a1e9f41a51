//! Host subprocess execution.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::{Error, ExecOutput, Result};

/// A host command line, built up and then run with captured output.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    stdin: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bytes written to the child's stdin.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Human-readable command line (program file name plus arguments).
    pub fn display(&self) -> String {
        let name = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string());
        std::iter::once(name)
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion and capture output; a non-zero exit is not an error.
    pub async fn output(&self) -> Result<ExecOutput> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| Error::Command {
            command: self.display(),
            code: None,
            stderr: format!("failed to spawn: {e}"),
        })?;
        if let (Some(data), Some(mut stdin)) = (&self.stdin, child.stdin.take()) {
            stdin.write_all(data).await?;
            drop(stdin);
        }
        let out = child.wait_with_output().await?;

        let output = ExecOutput::new(out.stdout, out.stderr, out.status.code().unwrap_or(-1));
        debug!(
            command = %self.display(),
            exit_code = output.exit_code,
            stdout = %output.stdout_str().trim_end(),
            stderr = %output.stderr_str().trim_end(),
            "> command finished"
        );
        Ok(output)
    }

    /// Run and fail with [`Error::Command`] on a non-zero exit.
    pub async fn run(&self) -> Result<ExecOutput> {
        let output = self.output().await?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::Command {
                command: self.display(),
                code: Some(output.exit_code),
                stderr: output.stderr_str().trim().to_string(),
            })
        }
    }

    /// Run and return stdout as a string.
    pub async fn read(&self) -> Result<String> {
        Ok(self.run().await?.stdout_str())
    }

    /// Start a long-running child with stdout piped and stderr discarded.
    /// The child is killed when the handle is dropped.
    pub fn spawn(&self) -> Result<Child> {
        debug!(command = %self.display(), "> spawning");
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Command {
                command: self.display(),
                code: None,
                stderr: format!("failed to spawn: {e}"),
            })
    }
}
