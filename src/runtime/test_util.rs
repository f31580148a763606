use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use portable_plugin::Command;

use super::meta::{Language, PluginMeta};
use crate::{
    config::{CrashPolicy, PortableSettings},
    control::{ControlChannel, ControlChannelFactory},
    error::ChannelError,
};

/// In-memory channel: records every payload, handshakes instantly.
#[derive(Default)]
pub(crate) struct MockChannel {
    sent: Mutex<Vec<Vec<u8>>>,
    handshakes: AtomicUsize,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    fail_handshake: AtomicBool,
    handshake_delay_ms: AtomicU64,
}

impl MockChannel {
    pub(crate) fn fail_sends(&self, on: bool) {
        self.fail_sends.store(on, Ordering::SeqCst);
    }

    pub(crate) fn fail_handshake(&self, on: bool) {
        self.fail_handshake.store(on, Ordering::SeqCst);
    }

    pub(crate) fn slow_handshake(&self, delay: Duration) {
        self.handshake_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn sent_commands(&self) -> Vec<Command> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_slice(raw).unwrap())
            .collect()
    }

    pub(crate) fn sent_raw(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlChannel for MockChannel {
    async fn send_cmd(&self, payload: &[u8]) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::Timeout(10));
        }
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn handshake(&self) -> Result<(), ChannelError> {
        let delay = self.handshake_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_handshake.load(Ordering::SeqCst) {
            return Err(ChannelError::Timeout(10));
        }
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockFactory {
    channels: DashMap<String, Arc<MockChannel>>,
    created: AtomicUsize,
    fail_create: AtomicBool,
    fail_handshake: AtomicBool,
    handshake_delay_ms: AtomicU64,
}

impl MockFactory {
    pub(crate) fn channel(&self, name: &str) -> Arc<MockChannel> {
        self.channels.get(name).map(|c| c.clone()).unwrap()
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_create(&self, on: bool) {
        self.fail_create.store(on, Ordering::SeqCst);
    }

    /// Channels created from now on refuse the handshake.
    pub(crate) fn fail_handshake(&self, on: bool) {
        self.fail_handshake.store(on, Ordering::SeqCst);
    }

    /// Channels created from now on take `delay` to handshake.
    pub(crate) fn slow_handshake(&self, delay: Duration) {
        self.handshake_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl ControlChannelFactory for MockFactory {
    async fn create(&self, name: &str) -> Result<Arc<dyn ControlChannel>, ChannelError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ChannelError::Io(std::io::Error::other("address in use")));
        }
        let chan = Arc::new(MockChannel::default());
        chan.fail_handshake(self.fail_handshake.load(Ordering::SeqCst));
        chan.slow_handshake(Duration::from_millis(self.handshake_delay_ms.load(Ordering::SeqCst)));
        self.channels.insert(name.to_string(), chan.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        let chan: Arc<dyn ControlChannel> = chan;
        Ok(chan)
    }
}

/// Settings that launch "python" plugins through `sh`, so any shell script
/// stands in for a plugin.
pub(crate) fn settings(dir: &Path, crash_policy: CrashPolicy) -> PortableSettings {
    PortableSettings {
        python_bin: "sh".to_string(),
        socket_dir: dir.to_path_buf(),
        send_timeout_ms: 500,
        handshake_timeout_ms: 500,
        crash_policy,
    }
}

/// Descriptor of a plugin that just sleeps until it is killed.
pub(crate) fn sleeper(dir: &Path, name: &str) -> PluginMeta {
    let script = dir.join(format!("{name}.sh"));
    std::fs::write(&script, "exec sleep 30\n").unwrap();
    PluginMeta::new(name, Language::Python, script)
}

/// Descriptor of a plugin that exits as soon as it starts.
pub(crate) fn quitter(dir: &Path, name: &str) -> PluginMeta {
    let script = dir.join(format!("{name}.sh"));
    std::fs::write(&script, "exit 0\n").unwrap();
    PluginMeta::new(name, Language::Python, script)
}

pub(crate) async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting until {what}");
}

/// Kill a process behind the manager's back.
pub(crate) async fn crash(pid: u32) {
    let status = tokio::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .await
        .unwrap();
    assert!(status.success());
}
