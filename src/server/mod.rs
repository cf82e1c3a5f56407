//! Dev server supervision.
//!
//! The interpreter is started on port 0 so the OS picks a free port; the
//! supervisor learns which one by watching the process output. Lifecycle:
//!
//! ```text
//! Starting -> Listening(port)    port announced before the timeout
//!          -> Exited(code)       process ended before announcing a port
//!          -> Failed(reason)     spawn error, or timeout (process is stopped)
//! ```

pub mod announce;

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::fsops::FsMutator;
use crate::processes;
use crate::runtime::RuntimeRoot;

pub use announce::{LoopbackPortPattern, PortAnnouncement};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to start interpreter {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("interpreter did not announce a port within {after:?}; it has been killed")]
    Timeout { after: Duration },

    #[error("interpreter exited before announcing a port (exit code {code:?})")]
    ExitedEarly { code: Option<i32> },

    #[error("failed to wait for interpreter: {0}")]
    Wait(#[source] io::Error),

    #[error("dev server is already running")]
    AlreadyRunning,

    #[error("dev server is not running")]
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Starting,
    Listening { port: u16 },
    Exited { code: Option<i32> },
    Failed(String),
}

/// How to launch the interpreter
#[derive(Debug, Clone)]
pub struct InterpreterCommand {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl InterpreterCommand {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// `php -S <host>:0 -t <docroot> [-c <ini>]`, run from the document root
    pub fn php_builtin(executable: &Path, host: &str, docroot: &Path, ini: Option<&Path>) -> Self {
        let mut cmd = Self::new(executable)
            .arg("-S")
            .arg(format!("{}:0", host))
            .arg("-t")
            .arg(docroot.to_string_lossy())
            .current_dir(docroot);
        if let Some(ini) = ini {
            cmd = cmd.arg("-c").arg(ini.to_string_lossy());
        }
        cmd
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Owns one interpreter process from spawn to shutdown
pub struct DevServer {
    command: InterpreterCommand,
    config: ServerConfig,
    detector: Arc<dyn PortAnnouncement>,
    runtime_root: Option<RuntimeRoot>,
    mutator: FsMutator,
    child: Option<Child>,
    /// Children seen when the port was announced; killed even if re-parented
    spawned: Vec<u32>,
    state: ServerState,
}

impl DevServer {
    pub fn new(command: InterpreterCommand, config: ServerConfig) -> Self {
        Self {
            command,
            config,
            detector: Arc::new(LoopbackPortPattern),
            runtime_root: None,
            mutator: FsMutator::default(),
            child: None,
            spawned: Vec::new(),
            state: ServerState::Idle,
        }
    }

    /// Replace the output scanner used for port discovery
    pub fn with_detector(mut self, detector: Arc<dyn PortAnnouncement>) -> Self {
        self.detector = detector;
        self
    }

    /// Runtime root served by this process; ephemeral roots are deleted on
    /// shutdown or when the start fails
    pub fn with_runtime_root(mut self, root: RuntimeRoot, mutator: FsMutator) -> Self {
        self.runtime_root = Some(root);
        self.mutator = mutator;
        self
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn port(&self) -> Option<u16> {
        match self.state {
            ServerState::Listening { port } => Some(port),
            _ => None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// `http://<host>:<port>/` once listening
    pub fn url(&self) -> Option<String> {
        self.port()
            .map(|port| format!("http://{}:{}/", self.config.bind_host, port))
    }

    /// URL of an entry document such as `index.php`
    pub fn entry_url(&self, entry: &str) -> Option<String> {
        self.url()
            .map(|base| format!("{}{}", base, entry.trim_start_matches('/')))
    }

    /// Spawn the interpreter and wait until it announces its port.
    #[instrument(skip_all, fields(executable = %self.command.executable.display()))]
    pub async fn start(&mut self) -> Result<u16, ServerError> {
        if self.child.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        self.state = ServerState::Starting;

        let mut cmd = Command::new(&self.command.executable);
        cmd.args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.state = ServerState::Failed(source.to_string());
                self.release_runtime_root().await;
                return Err(ServerError::Spawn {
                    path: self.command.executable.clone(),
                    source,
                });
            }
        };
        let pid = child.id();
        debug!(pid = ?pid, args = ?self.command.args, "Interpreter spawned");

        let (port_tx, mut port_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(watch_output(
                stdout,
                OutputStream::Stdout,
                Arc::clone(&self.detector),
                port_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(watch_output(
                stderr,
                OutputStream::Stderr,
                Arc::clone(&self.detector),
                port_tx.clone(),
            ));
        }
        drop(port_tx);

        let timeout = Duration::from_millis(self.config.port_timeout_ms);
        let outcome = tokio::select! {
            biased;
            Some(port) = port_rx.recv() => Ok(port),
            status = child.wait() => Err(match status {
                Ok(status) => ServerError::ExitedEarly { code: status.code() },
                Err(e) => ServerError::Wait(e),
            }),
            () = tokio::time::sleep(timeout) => Err(ServerError::Timeout { after: timeout }),
        };

        match outcome {
            Ok(port) => {
                info!(port, pid = ?pid, "Dev server listening");
                self.state = ServerState::Listening { port };
                self.spawned = pid.map(processes::descendants).unwrap_or_default();
                self.child = Some(child);
                Ok(port)
            }
            Err(ServerError::ExitedEarly { code }) => {
                warn!(code = ?code, "Interpreter exited before announcing a port");
                self.state = ServerState::Exited { code };
                self.release_runtime_root().await;
                Err(ServerError::ExitedEarly { code })
            }
            Err(e) => {
                warn!(error = %e, "Dev server failed to start, stopping interpreter");
                self.stop_tree(&mut child, Vec::new()).await;
                self.state = ServerState::Failed(e.to_string());
                self.release_runtime_root().await;
                Err(e)
            }
        }
    }

    /// Stop the interpreter: soft signal, grace period, then a forced tree kill.
    ///
    /// Children that outlive the interpreter are killed too, since they would
    /// keep files in the runtime root locked. An ephemeral root is handed to
    /// background deletion afterwards.
    #[instrument(skip_all)]
    pub async fn shutdown(&mut self) -> Result<(), ServerError> {
        let Some(mut child) = self.child.take() else {
            return Err(ServerError::NotRunning);
        };

        let spawned = std::mem::take(&mut self.spawned);
        let code = self.stop_tree(&mut child, spawned).await;

        info!(code = ?code, "Dev server stopped");
        self.state = ServerState::Exited { code };
        self.release_runtime_root().await;
        Ok(())
    }

    /// Stop `child` if it is still running, then kill every known descendant
    async fn stop_tree(&self, child: &mut Child, mut spawned: Vec<u32>) -> Option<i32> {
        let code = match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Interpreter had already exited");
                status.code()
            }
            _ => {
                if let Some(pid) = child.id() {
                    spawned.extend(processes::descendants(pid));
                }
                self.stop_child(child).await
            }
        };

        spawned.sort_unstable();
        spawned.dedup();
        let stragglers = processes::kill_all(&spawned);
        if stragglers > 0 {
            info!(count = stragglers, "Killed leftover interpreter children");
        }
        code
    }

    async fn stop_child(&self, child: &mut Child) -> Option<i32> {
        let pid = child.id();
        if let Some(pid) = pid {
            processes::request_stop(pid);
        }

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        let status = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to wait for interpreter");
                None
            }
            Err(_) => {
                warn!(grace_ms = self.config.shutdown_grace_ms, "Interpreter ignored stop request, forcing");
                if let Some(pid) = pid {
                    processes::terminate_tree(pid);
                }
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Interpreter already gone");
                }
                child.wait().await.ok()
            }
        };
        status.and_then(|s| s.code())
    }

    async fn release_runtime_root(&self) {
        if let Some(root) = &self.runtime_root {
            root.cleanup(&self.mutator).await;
        }
    }
}

/// Forward one output stream to tracing and report the first announced port
async fn watch_output<R>(
    reader: R,
    stream: OutputStream,
    detector: Arc<dyn PortAnnouncement>,
    port_tx: mpsc::UnboundedSender<u16>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut announced = false;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Interpreter output stream closed");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        match stream {
            OutputStream::Stdout => info!(target: "dev_server", "{}", line),
            OutputStream::Stderr => warn!(target: "dev_server", "{}", line),
        }

        if !announced {
            if let Some(port) = detector.detect(line) {
                announced = true;
                let _ = port_tx.send(port);
            }
        }
    }
}
