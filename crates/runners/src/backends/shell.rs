//! How CLI-driven backends reach their scheduler: a local process or `ssh`
//! to a submit host.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::RunnerParams;
use crate::error::{Result, RunnerError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[async_trait]
pub trait CommandShell: Send + Sync {
    /// Run `argv` and capture its output. A non-zero exit is not an error.
    async fn run(&self, argv: &[String], stdin: Option<&str>) -> Result<ShellOutput>;
}

/// Build a shell from runner params: `ssh_host` (and optional `ssh_user`,
/// `ssh_port`) selects [`SshShell`], otherwise [`LocalShell`].
pub fn from_params(params: &RunnerParams) -> Box<dyn CommandShell> {
    match params.get("ssh_host").filter(|h| !h.trim().is_empty()) {
        Some(host) => Box::new(SshShell {
            host: host.trim().to_string(),
            user: params.get("ssh_user").cloned(),
            port: params.get("ssh_port").and_then(|p| p.trim().parse().ok()),
        }),
        None => Box::new(LocalShell),
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalShell;

#[async_trait]
impl CommandShell for LocalShell {
    async fn run(&self, argv: &[String], stdin: Option<&str>) -> Result<ShellOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RunnerError::Configuration("empty command".into()))?;
        spawn(Command::new(program).args(args), stdin).await
    }
}

/// Runs commands on a remote host through the system `ssh` client. Key-based
/// authentication is assumed (`BatchMode=yes`).
#[derive(Debug, Clone)]
pub struct SshShell {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

impl SshShell {
    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn ssh_args(&self, argv: &[String]) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.destination());
        args.push(
            argv.iter()
                .map(|a| sh_escape(a))
                .collect::<Vec<_>>()
                .join(" "),
        );
        args
    }
}

#[async_trait]
impl CommandShell for SshShell {
    async fn run(&self, argv: &[String], stdin: Option<&str>) -> Result<ShellOutput> {
        if argv.is_empty() {
            return Err(RunnerError::Configuration("empty command".into()));
        }
        let output = spawn(Command::new("ssh").args(self.ssh_args(argv)), stdin).await?;
        // ssh reserves 255 for its own failures.
        if output.status == 255 {
            return Err(RunnerError::Communication(format!(
                "ssh to {} failed: {}",
                self.host,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }
}

async fn spawn(command: &mut Command, stdin: Option<&str>) -> Result<ShellOutput> {
    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    let result = ShellOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        status: output.status.code().unwrap_or(-1),
    };
    debug!(status = result.status, "shell command finished");
    Ok(result)
}

/// Single-quote `s` for a POSIX shell.
pub fn sh_escape(s: &str) -> String {
    let mut out = String::from("'");
    out.push_str(&s.replace('\'', r"'\''"));
    out.push('\'');
    out
}
