use std::{path::PathBuf, process::Stdio, time::Duration};

use slnet_process::SessionId;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{console::LineSplitter, error::SupervisorError};

// Prompts are written without a trailing newline; flush them once output stalls.
const PARTIAL_LINE_FLUSH: Duration = Duration::from_millis(250);
// Grandchildren may keep a pipe open after the server itself exits.
const READER_DRAIN: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Stdout(String),
    Stderr(String),
    /// Sent exactly once, after both output streams have drained.
    Exited(Option<i32>),
}

/// Handle to one running server process.
///
/// Output arrives on a single ordered channel that closes after
/// [`SessionOutput::Exited`]. Dropping the handle kills the process.
#[derive(Debug)]
pub struct ServerSession {
    id: SessionId,
    pid: Option<u32>,
    stdin: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<()>>,
    output: mpsc::UnboundedReceiver<SessionOutput>,
}

impl ServerSession {
    pub fn from_parts(
        pid: Option<u32>,
        stdin: mpsc::UnboundedSender<String>,
        kill: oneshot::Sender<()>,
        output: mpsc::UnboundedReceiver<SessionOutput>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            pid,
            stdin,
            kill: Some(kill),
            output,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queues one line for stdin. Does nothing once the process is gone.
    pub fn write_line(&self, text: &str) {
        let _ = self.stdin.send(text.to_string());
    }

    pub fn kill(&mut self) {
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }

    pub async fn next_output(&mut self) -> Option<SessionOutput> {
        self.output.recv().await
    }
}

pub trait Launcher: Send + Sync + 'static {
    fn spawn(&self, spec: &LaunchSpec) -> Result<ServerSession, SupervisorError>;
}

/// Spawns the dedicated server with piped stdio and supervises it until exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSupervisor;

impl Launcher for ProcessSupervisor {
    fn spawn(&self, spec: &LaunchSpec) -> Result<ServerSession, SupervisorError> {
        if !spec.executable.is_file() {
            return Err(SupervisorError::Spawn {
                path: spec.executable.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "executable does not exist",
                ),
            });
        }

        let mut cmd = Command::new(&spec.executable);
        cmd.current_dir(&spec.working_dir)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            path: spec.executable.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(
            pid = pid.unwrap_or_default(),
            exe = %spec.executable.display(),
            "server process spawned"
        );

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump(out, out_tx.clone(), SessionOutput::Stdout)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump(err, out_tx.clone(), SessionOutput::Stderr)));
        }

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    let mut data = line.into_bytes();
                    data.push(b'\n');
                    if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        tokio::spawn(async move {
            // A dropped session handle counts as a kill request.
            let waited = tokio::select! {
                res = child.wait() => Some(res),
                _ = &mut kill_rx => None,
            };
            let status = match waited {
                Some(res) => res,
                None => {
                    if let Some(pid) = pid {
                        kill_group(pid);
                    }
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(error = %e, "waiting for server process failed");
                    None
                }
            };

            let deadline = tokio::time::Instant::now() + READER_DRAIN;
            for mut reader in readers {
                if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                    reader.abort();
                }
            }

            tracing::info!(pid = pid.unwrap_or_default(), ?code, "server process exited");
            let _ = out_tx.send(SessionOutput::Exited(code));
        });

        Ok(ServerSession::from_parts(pid, stdin_tx, kill_tx, out_rx))
    }
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::UnboundedSender<SessionOutput>,
    wrap: fn(String) -> SessionOutput,
) {
    let mut splitter = LineSplitter::default();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = if splitter.has_partial() {
            match tokio::time::timeout(PARTIAL_LINE_FLUSH, reader.read(&mut buf)).await {
                Ok(res) => res,
                Err(_) => {
                    if let Some(line) = splitter.finish()
                        && tx.send(wrap(line)).is_err()
                    {
                        return;
                    }
                    continue;
                }
            }
        } else {
            reader.read(&mut buf).await
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.send(wrap(line)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "server output stream closed");
                break;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        let _ = tx.send(wrap(line));
    }
}

fn kill_group(pid: u32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // The server must not outlive the agent.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
