use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use portable_plugin::{Command, Control, Meta};
use tracing::{debug, info};

use super::{audit::AuditLog, process::ProcessHandle};
use crate::{
    control::ControlChannel,
    error::{ChannelError, PortableError},
};

#[derive(Default)]
struct InsState {
    ctrl_chan: Option<Arc<dyn ControlChannel>>,
    commands: AuditLog,
    process: Option<ProcessHandle>,
}

/// Host-side handle of one named plugin. Outlives process restarts so the
/// active symbols can be restored on the next process.
pub struct PluginIns {
    name: String,
    state: RwLock<InsState>,
}

impl std::fmt::Debug for PluginIns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginIns")
            .field("name", &self.name)
            .field("pid", &self.pid())
            .field("active_symbols", &self.read().commands.len())
            .finish()
    }
}

impl PluginIns {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(InsState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, InsState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InsState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.read().process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.read().process.as_ref().and_then(ProcessHandle::pid)
    }

    /// Keys of the symbols that are started, in start order.
    pub fn active_symbols(&self) -> Vec<Meta> {
        self.read().commands.keys()
    }

    #[tracing::instrument(name = "portable_start_symbol", skip(self, ctrl), fields(plugin = %self.name, meta = %ctrl.meta))]
    pub async fn start_symbol(&self, ctrl: &Control) -> Result<(), PortableError> {
        let payload = serde_json::to_vec(&Command::start(ctrl)?)?;
        self.send_cmd(&payload).await?;
        self.write().commands.record(ctrl.meta.clone(), payload);
        info!("started symbol {}", ctrl.symbol_name);
        Ok(())
    }

    #[tracing::instrument(name = "portable_stop_symbol", skip(self, ctrl), fields(plugin = %self.name, meta = %ctrl.meta))]
    pub async fn stop_symbol(&self, ctrl: &Control) -> Result<(), PortableError> {
        let payload = serde_json::to_vec(&Command::stop(ctrl)?)?;
        self.send_cmd(&payload).await?;
        self.write().commands.remove(&ctrl.meta);
        info!("stopped symbol {}", ctrl.symbol_name);
        Ok(())
    }

    /// Request the attached process to be killed. Without a process this is
    /// a no-op.
    pub fn stop(&self) {
        match &self.read().process {
            Some(handle) => {
                info!(plugin = %self.name, pid = handle.pid(), "killing plugin process");
                if !handle.kill() {
                    debug!(plugin = %self.name, "process already exited");
                }
            }
            None => debug!(plugin = %self.name, "no process attached, nothing to stop"),
        }
    }

    async fn send_cmd(&self, payload: &[u8]) -> Result<(), PortableError> {
        let chan = self.channel();
        let result = match chan {
            Some(chan) => chan.send_cmd(payload).await,
            None => Err(ChannelError::NotConnected),
        };
        result.map_err(|source| {
            if self.is_running() {
                PortableError::Send {
                    name: self.name.clone(),
                    source,
                }
            } else {
                PortableError::NotRunning {
                    name: self.name.clone(),
                }
            }
        })
    }

    pub(crate) fn channel(&self) -> Option<Arc<dyn ControlChannel>> {
        self.read().ctrl_chan.clone()
    }

    pub(crate) fn set_channel(&self, chan: Arc<dyn ControlChannel>) {
        self.write().ctrl_chan = Some(chan);
    }

    pub(crate) fn take_channel(&self) -> Option<Arc<dyn ControlChannel>> {
        self.write().ctrl_chan.take()
    }

    pub(crate) fn has_process_and_channel(&self) -> bool {
        let state = self.read();
        state.process.is_some() && state.ctrl_chan.is_some()
    }

    /// Attach `handle` unless its process is already gone. The check runs
    /// under the write lock, so a watcher that saw the exit either finds the
    /// handle attached or the handle is refused.
    pub(crate) fn attach_process(&self, handle: ProcessHandle) -> bool {
        let mut state = self.write();
        if handle.has_exited() {
            return false;
        }
        state.process = Some(handle);
        true
    }

    /// Clear the process handle if it still belongs to `generation`.
    pub(crate) fn detach_process(&self, generation: u64) -> Option<ProcessHandle> {
        let mut state = self.write();
        match &state.process {
            Some(handle) if handle.generation() == generation => state.process.take(),
            _ => None,
        }
    }

    pub(crate) fn replay_log(&self) -> Vec<(Meta, Vec<u8>)> {
        self.read().commands.entries().to_vec()
    }
}
