/// Command execution utilities for kubectl calls
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Result from command execution with captured output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Create from tokio Command output
    fn from_output(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code(),
            success: output.status.success(),
        }
    }

    /// Build a successful output, used by in-memory cluster fakes
    #[cfg(test)]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            code: Some(0),
            success: true,
        }
    }

    /// Build a failed output, used by in-memory cluster fakes
    #[cfg(test)]
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            code: Some(1),
            success: false,
        }
    }

    /// Trimmed stdout on success, trimmed stderr (or the exit code) on failure
    pub fn message(&self) -> String {
        if self.success {
            return self.stdout.trim().to_string();
        }
        match (self.stderr.trim(), self.code) {
            ("", Some(code)) => format!("exited with code {}", code),
            ("", None) => "terminated by signal".to_string(),
            (stderr, _) => stderr.to_string(),
        }
    }
}

/// Builder for executing external commands with common patterns
pub struct CommandBuilder {
    command: Command,
    display: String,
    context_msg: Option<String>,
    timeout: Option<Duration>,
}

impl CommandBuilder {
    /// Create a new command builder
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let display = program.as_ref().to_string_lossy().to_string();
        let mut command = Command::new(program);
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: a terminal Ctrl-C must not reach kubectl mid-call
        #[cfg(unix)]
        command.process_group(0);
        Self {
            command,
            display,
            context_msg: None,
            timeout: None,
        }
    }

    /// Add a single argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.display.push(' ');
        self.display.push_str(&arg.as_ref().to_string_lossy());
        self.command.arg(arg);
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        args.into_iter().fold(self, |builder, arg| builder.arg(arg))
    }

    /// Set an environment variable
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.command.env(key, val);
        self
    }

    /// Set KUBECONFIG environment variable when a path is configured
    pub fn kubeconfig(self, path: Option<&Path>) -> Self {
        match path {
            Some(path) => self.env("KUBECONFIG", path),
            None => self,
        }
    }

    /// Scope the command to a namespace
    pub fn namespace(self, namespace: &str) -> Self {
        self.args(["-n", namespace])
    }

    /// Bound the command's runtime; the child is killed when it expires
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set context message for error reporting
    pub fn context<S: Into<String>>(mut self, msg: S) -> Self {
        self.context_msg = Some(msg.into());
        self
    }

    /// Execute and return raw output
    pub async fn output(mut self) -> Result<CommandOutput> {
        debug!("Running: {}", self.display);

        let ctx = self
            .context_msg
            .clone()
            .unwrap_or_else(|| format!("Failed to execute {}", self.display));

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.command.output())
                .await
                .map_err(|_| {
                    anyhow::anyhow!("{} timed out after {} seconds", self.display, limit.as_secs())
                })
                .context(ctx.clone())?
                .context(ctx)?,
            None => self.command.output().await.context(ctx)?,
        };

        Ok(CommandOutput::from_output(output))
    }
}

/// Check if a command-line tool is installed
pub async fn check_tool_installed(
    tool_name: &str,
    version_args: &[&str],
    install_url: &str,
) -> Result<()> {
    let output = CommandBuilder::new(tool_name)
        .args(version_args)
        .timeout(Duration::from_secs(10))
        .output()
        .await;

    match output {
        Ok(out) if out.success => Ok(()),
        _ => anyhow::bail!(
            "{} is not installed or not in PATH. Please install from {}",
            tool_name,
            install_url
        ),
    }
}
