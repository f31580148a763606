#![allow(dead_code)]

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::bail;
use async_trait::async_trait;
use portable::{Language, PluginMeta};
use portable_plugin::{Command, Control, Meta, PluginRuntime, PluginType, PortableConfig, RuntimeError, SymbolHandler};
use tokio::task::JoinHandle;

/// Plugin handler that remembers every call and refuses the symbol `broken`.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SymbolHandler for Recorder {
    async fn start_symbol(&self, ctrl: Control) -> anyhow::Result<()> {
        if ctrl.symbol_name == "broken" {
            bail!("symbol broken is not registered");
        }
        self.calls.lock().unwrap().push(format!("start {}", ctrl.symbol_name));
        Ok(())
    }

    async fn stop_symbol(&self, ctrl: Control) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("stop {}", ctrl.symbol_name));
        Ok(())
    }
}

/// Serve as plugin `name` from inside the test process.
pub fn spawn_plugin(name: &str, handler: Recorder, conf: PortableConfig) -> JoinHandle<Result<(), RuntimeError>> {
    let runtime = PluginRuntime::new(name, handler);
    tokio::spawn(async move { runtime.run(&conf).await })
}

pub fn ctrl(symbol: &str, op: &str) -> Control {
    Control::new(symbol, Meta::new("rule1", op, 0), PluginType::Func)
}

pub fn start_payload(symbol: &str, op: &str) -> Vec<u8> {
    serde_json::to_vec(&Command::start(&ctrl(symbol, op)).unwrap()).unwrap()
}

pub fn stop_payload(symbol: &str, op: &str) -> Vec<u8> {
    serde_json::to_vec(&Command::stop(&ctrl(symbol, op)).unwrap()).unwrap()
}

/// A "python" plugin that only sleeps; run it with `sh` as interpreter.
pub fn sleeper(dir: &Path, name: &str) -> PluginMeta {
    let script = dir.join(format!("{name}.sh"));
    std::fs::write(&script, "exec sleep 30\n").unwrap();
    PluginMeta::new(name, Language::Python, script)
}

pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting until {what}");
}

pub async fn crash(pid: u32) {
    let status = tokio::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .await
        .unwrap();
    assert!(status.success());
}
