use std::process::ExitStatus;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    sync::mpsc,
};
use tracing::{info, warn};

use super::launch::LaunchSpec;

/// Handle to a running plugin process. `generation` is unique per spawn and
/// tells a watcher whether the instance still belongs to its process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    generation: u64,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the watcher has seen the process exit.
    pub fn has_exited(&self) -> bool {
        self.kill_tx.is_closed()
    }

    /// Ask the watcher to kill the process. Returns false when the watcher
    /// has already seen it exit.
    pub fn kill(&self) -> bool {
        self.kill_tx.send(()).is_ok()
    }
}

/// Owns the child until it exits.
pub struct Watcher {
    child: Child,
    kill_rx: mpsc::UnboundedReceiver<()>,
}

impl Watcher {
    pub async fn wait(mut self) -> std::io::Result<ExitStatus> {
        loop {
            tokio::select! {
                status = self.child.wait() => return status,
                req = self.kill_rx.recv() => match req {
                    Some(()) => {
                        if let Err(err) = self.child.start_kill() {
                            warn!("could not kill plugin process: {err}");
                        }
                    }
                    None => return self.child.wait().await,
                },
            }
        }
    }
}

/// Start the process described by `spec` and forward its output lines into
/// the log under target `portable::plugin`.
pub fn spawn(spec: &LaunchSpec, name: &str, generation: u64) -> std::io::Result<(ProcessHandle, Watcher)> {
    let mut child = spec.command().spawn()?;
    let pid = child.id();

    if let Some(stdout) = child.stdout.take() {
        forward_output(stdout, name.to_string(), pid, false);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(stderr, name.to_string(), pid, true);
    }

    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    Ok((
        ProcessHandle {
            pid,
            generation,
            kill_tx,
        },
        Watcher { child, kill_rx },
    ))
}

fn forward_output<R>(stream: R, plugin: String, pid: Option<u32>, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let pid = pid.unwrap_or_default();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_stderr => warn!(target: "portable::plugin", %plugin, pid, "{line}"),
                Ok(Some(line)) => info!(target: "portable::plugin", %plugin, pid, "{line}"),
                Ok(None) => break,
                Err(err) => {
                    warn!(target: "portable::plugin", %plugin, pid, "output stream failed: {err}");
                    break;
                }
            }
        }
    });
}
