//! Command execution on a local or SSH-accessible host.
//!
//! One [`Executor`] value hides the distinction between spawning a local
//! subprocess and running the command on a remote host. Remote execution
//! uses an `openssh` control-master session when authentication goes
//! through the agent or a key file, and falls back to an `sshpass`-wrapped
//! `ssh` subprocess when a password is configured: the password is handed
//! over in the `SSHPASS` environment variable so it never shows up in
//! process arguments.

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{event, Level};

/// Quote a string for safe interpolation into a `sh -c` command line.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "_-./=".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Host-key verification policy for SSH targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept whatever key the host presents. Matches the historical
    /// behavior; unsuitable for hostile networks.
    #[default]
    Accept,
    /// Require the host key to be present in known_hosts.
    Strict,
}

/// Authentication inputs for an SSH target.
///
/// With everything unset the system ssh tries the agent first, then the
/// default key files (`~/.ssh/id_rsa`, `id_ed25519`, `id_ecdsa`).
#[derive(Debug, Clone, Default)]
pub struct SshAuth {
    pub password: Option<String>,
    pub keyfile: Option<std::path::PathBuf>,
    pub agent: bool,
}

/// Result of a buffered [`Executor::run`].
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_utf8(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_utf8(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

enum Target {
    Local,
    Session {
        session: std::sync::Arc<openssh::Session>,
    },
    PasswordSsh {
        destination: String,
        password: String,
        policy: HostKeyPolicy,
    },
}

/// Runs shell commands on one host, local or remote.
pub struct Executor {
    target: Target,
    label: String,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").field("host", &self.label).finish()
    }
}

impl Executor {
    /// Executor for the local host.
    pub fn local() -> Self {
        Self {
            target: Target::Local,
            label: "localhost".to_string(),
        }
    }

    /// Connect to a remote host.
    pub async fn connect(
        user: Option<&str>,
        host: &str,
        auth: &SshAuth,
        policy: HostKeyPolicy,
    ) -> Result<Self> {
        let label = match user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        };
        if let Some(password) = &auth.password {
            event!(Level::DEBUG, "using password auth for {}", label);
            return Ok(Self {
                target: Target::PasswordSsh {
                    destination: label.clone(),
                    password: password.clone(),
                    policy,
                },
                label,
            });
        }
        event!(Level::DEBUG, "connecting SSH session to {}", label);
        let mut builder = openssh::SessionBuilder::default();
        builder.known_hosts_check(match policy {
            HostKeyPolicy::Accept => openssh::KnownHosts::Accept,
            HostKeyPolicy::Strict => openssh::KnownHosts::Strict,
        });
        if let Some(user) = user {
            builder.user(user.to_string());
        }
        if let Some(keyfile) = &auth.keyfile {
            builder.keyfile(keyfile);
        }
        let session = builder
            .connect(host)
            .await
            .with_context(|| format!("failed to establish SSH connection to {}", label))?;
        Ok(Self {
            target: Target::Session {
                session: std::sync::Arc::new(session),
            },
            label,
        })
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self.target, Target::Local)
    }

    pub fn host(&self) -> &str {
        &self.label
    }

    fn password_command(
        destination: &str,
        password: &str,
        policy: HostKeyPolicy,
        cmd: &str,
    ) -> tokio::process::Command {
        let mut command = tokio::process::Command::new("sshpass");
        command
            .arg("-e")
            .arg("ssh")
            .arg("-o")
            .arg(match policy {
                HostKeyPolicy::Accept => "StrictHostKeyChecking=no",
                HostKeyPolicy::Strict => "StrictHostKeyChecking=yes",
            })
            .arg(destination)
            .arg(cmd)
            .env("SSHPASS", password);
        command
    }

    /// Run a command to completion with buffered stdout/stderr.
    pub async fn run(&self, cmd: &str) -> Result<CommandOutput> {
        event!(Level::DEBUG, "run on {}: {}", self.label, cmd);
        match &self.target {
            Target::Local => {
                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(cmd)
                    .output()
                    .await
                    .with_context(|| format!("failed to spawn local command: {}", cmd))?;
                Ok(CommandOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.status.code().unwrap_or(-1),
                })
            }
            Target::Session { session } => {
                let output = session
                    .clone()
                    .arc_command("sh")
                    .arg("-c")
                    .arg(cmd)
                    .output()
                    .await
                    .with_context(|| format!("failed to run command on {}: {}", self.label, cmd))?;
                Ok(CommandOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.status.code().unwrap_or(-1),
                })
            }
            Target::PasswordSsh {
                destination,
                password,
                policy,
            } => {
                let output = Self::password_command(destination, password, *policy, cmd)
                    .output()
                    .await
                    .with_context(|| format!("failed to spawn ssh to {}: {}", self.label, cmd))?;
                Ok(CommandOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.status.code().unwrap_or(-1),
                })
            }
        }
    }

    /// Start a command and expose its stdout as a stream; stderr is
    /// captured for diagnostics. Waiting on the returned handle reaps the
    /// child.
    pub async fn stream_read(&self, cmd: &str) -> Result<StreamedCommand> {
        self.spawn(cmd, false, true).await
    }

    /// Start a command and expose its stdin as a stream; stdout and stderr
    /// are drained so the child never blocks.
    pub async fn stream_write(&self, cmd: &str) -> Result<StreamedCommand> {
        self.spawn(cmd, true, false).await
    }

    /// Start a command with both stdin and stdout piped, for pipelines
    /// that feed input and consume output.
    pub async fn stream(&self, cmd: &str) -> Result<StreamedCommand> {
        self.spawn(cmd, true, true).await
    }

    async fn spawn(&self, cmd: &str, pipe_stdin: bool, pipe_stdout: bool) -> Result<StreamedCommand> {
        event!(Level::DEBUG, "stream on {}: {}", self.label, cmd);
        match &self.target {
            Target::Local => {
                let mut child = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(cmd)
                    .stdin(if pipe_stdin {
                        std::process::Stdio::piped()
                    } else {
                        std::process::Stdio::null()
                    })
                    .stdout(if pipe_stdout {
                        std::process::Stdio::piped()
                    } else {
                        std::process::Stdio::null()
                    })
                    .stderr(std::process::Stdio::piped())
                    .spawn()
                    .with_context(|| format!("failed to spawn local command: {}", cmd))?;
                let stdin = child
                    .stdin
                    .take()
                    .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>);
                let stdout = child
                    .stdout
                    .take()
                    .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
                let stderr_task = child.stderr.take().map(drain_stderr);
                Ok(StreamedCommand {
                    stdin,
                    stdout,
                    stderr_task,
                    child: ChildHandle::Local(child),
                    cmd: cmd.to_string(),
                    host: self.label.clone(),
                })
            }
            Target::Session { session } => {
                let mut child = session
                    .clone()
                    .arc_command("sh")
                    .arg("-c")
                    .arg(cmd)
                    .stdin(if pipe_stdin {
                        openssh::Stdio::piped()
                    } else {
                        openssh::Stdio::null()
                    })
                    .stdout(if pipe_stdout {
                        openssh::Stdio::piped()
                    } else {
                        openssh::Stdio::null()
                    })
                    .stderr(openssh::Stdio::piped())
                    .spawn()
                    .await
                    .with_context(|| {
                        format!("failed to spawn command on {}: {}", self.label, cmd)
                    })?;
                let stdin = child
                    .stdin()
                    .take()
                    .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>);
                let stdout = child
                    .stdout()
                    .take()
                    .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
                let stderr_task = child.stderr().take().map(drain_stderr);
                Ok(StreamedCommand {
                    stdin,
                    stdout,
                    stderr_task,
                    child: ChildHandle::Remote(child),
                    cmd: cmd.to_string(),
                    host: self.label.clone(),
                })
            }
            Target::PasswordSsh {
                destination,
                password,
                policy,
            } => {
                let mut child = Self::password_command(destination, password, *policy, cmd)
                    .stdin(if pipe_stdin {
                        std::process::Stdio::piped()
                    } else {
                        std::process::Stdio::null()
                    })
                    .stdout(if pipe_stdout {
                        std::process::Stdio::piped()
                    } else {
                        std::process::Stdio::null()
                    })
                    .stderr(std::process::Stdio::piped())
                    .spawn()
                    .with_context(|| format!("failed to spawn ssh to {}: {}", self.label, cmd))?;
                let stdin = child
                    .stdin
                    .take()
                    .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>);
                let stdout = child
                    .stdout
                    .take()
                    .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
                let stderr_task = child.stderr.take().map(drain_stderr);
                Ok(StreamedCommand {
                    stdin,
                    stdout,
                    stderr_task,
                    child: ChildHandle::Local(child),
                    cmd: cmd.to_string(),
                    host: self.label.clone(),
                })
            }
        }
    }
}

fn drain_stderr<R>(stderr: R) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut stderr = stderr;
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    })
}

enum ChildHandle {
    Local(tokio::process::Child),
    Remote(openssh::Child<std::sync::Arc<openssh::Session>>),
}

/// A spawned command with whichever stdio ends were requested.
///
/// Untaken ends are closed (stdin) or drained (stdout) when the command is
/// finished, so the child can never deadlock on a full pipe.
pub struct StreamedCommand {
    stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    stderr_task: Option<tokio::task::JoinHandle<Vec<u8>>>,
    child: ChildHandle,
    cmd: String,
    host: String,
}

impl StreamedCommand {
    pub fn take_stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stdout.take()
    }

    /// Wait for the child to exit and release its resources. Returns an
    /// error carrying the captured stderr when the exit status is
    /// non-zero.
    pub async fn finish(mut self) -> Result<()> {
        // closing our end of stdin delivers EOF to the child
        drop(self.stdin.take());
        if let Some(mut stdout) = self.stdout.take() {
            let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
        }
        let exit_code = match self.child {
            ChildHandle::Local(mut child) => child
                .wait()
                .await
                .with_context(|| format!("failed to wait for command: {}", self.cmd))?
                .code()
                .unwrap_or(-1),
            ChildHandle::Remote(child) => child
                .wait()
                .await
                .with_context(|| format!("failed to wait for command on {}: {}", self.host, self.cmd))?
                .code()
                .unwrap_or(-1),
        };
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if exit_code != 0 {
            return Err(anyhow!(
                "command failed on {} with exit code {}: {}\nstderr: {}",
                self.host,
                exit_code,
                self.cmd,
                String::from_utf8_lossy(&stderr),
            ));
        }
        Ok(())
    }
}
