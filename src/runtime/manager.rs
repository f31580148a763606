//! Registry and supervisor of plugin processes.
//!
//! [`PluginInsManager::get_or_start_process`] is the only place a process is
//! spawned. It runs under one manager-wide lock, so a plugin never has more
//! than one process and a restart cannot race another restart. The lock is
//! held across the handshake and the replay of the audit log.
//!
//! Every spawn gets a fresh generation number. The exit watcher of a process
//! only cleans up an instance whose handle still carries its generation, so a
//! late exit of an old process never tears down its replacement. Exit
//! handling takes the same lock as a start, so the crash policy never runs
//! while a new process of the same plugin is being started.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    instance::PluginIns,
    launch::LaunchSpec,
    meta::PluginMeta,
    process::{self, Watcher},
};
use crate::{
    config::{CrashPolicy, PortableSettings},
    control::{ControlChannel, ControlChannelFactory},
    error::PortableError,
    metrics::ProcessMetrics,
};

pub struct PluginInsManager {
    settings: PortableSettings,
    factory: Arc<dyn ControlChannelFactory>,
    instances: Arc<DashMap<String, Arc<PluginIns>>>,
    spawn_lock: Arc<Mutex<()>>,
    generation: AtomicU64,
    metrics: ProcessMetrics,
}

impl PluginInsManager {
    pub fn new(settings: PortableSettings, factory: Arc<dyn ControlChannelFactory>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            factory,
            instances: Arc::new(DashMap::new()),
            spawn_lock: Arc::new(Mutex::new(())),
            generation: AtomicU64::new(0),
            metrics: ProcessMetrics::new(),
        })
    }

    pub fn settings(&self) -> &PortableSettings {
        &self.settings
    }

    /// Make sure `meta.name` has a live process. With `is_init` the start is
    /// moved to a background task and this returns at once; failures are
    /// only logged.
    pub async fn create_ins(self: &Arc<Self>, meta: PluginMeta, is_init: bool) -> Result<(), PortableError> {
        if is_init {
            let mgr = Arc::clone(self);
            tokio::spawn(async move {
                let _ = mgr.create_and_log(&meta).await;
            });
            return Ok(());
        }
        self.create_and_log(&meta).await.map(|_| ())
    }

    async fn create_and_log(&self, meta: &PluginMeta) -> Result<Arc<PluginIns>, PortableError> {
        match self.get_or_start_process(meta).await {
            Ok(ins) => {
                info!(plugin = %meta.name, pid = ins.pid(), "plugin instance is running");
                Ok(ins)
            }
            Err(err) => {
                error!(plugin = %meta.name, "plugin instance failed to start: {err}");
                Err(err)
            }
        }
    }

    #[tracing::instrument(name = "portable_get_or_start_process", skip(self, meta), fields(plugin = %meta.name))]
    pub async fn get_or_start_process(&self, meta: &PluginMeta) -> Result<Arc<PluginIns>, PortableError> {
        let _guard = self.spawn_lock.lock().await;

        let ins = Arc::clone(
            self.instances
                .entry(meta.name.clone())
                .or_insert_with(|| Arc::new(PluginIns::new(&meta.name)))
                .value(),
        );
        if ins.has_process_and_channel() {
            debug!("process already running");
            return Ok(ins);
        }

        let config = serde_json::to_string(&self.settings.portable_config())
            .map_err(|err| PortableError::config(format!("cannot encode portable config: {err}")))?;
        let spec = LaunchSpec::build(meta, &self.settings.python_bin, &config)?;

        let (channel, fresh_channel) = match ins.channel() {
            Some(channel) => (channel, false),
            None => {
                let channel = self
                    .factory
                    .create(&meta.name)
                    .await
                    .map_err(|source| PortableError::ChannelCreation {
                        name: meta.name.clone(),
                        source,
                    })?;
                ins.set_channel(Arc::clone(&channel));
                (channel, true)
            }
        };

        match self.start_process(&ins, meta, &spec, channel.as_ref()).await {
            Ok(()) => Ok(ins),
            Err(err) => {
                self.metrics.spawn_failed(&meta.name);
                if fresh_channel {
                    ins.take_channel();
                    if let Err(close_err) = channel.close().await {
                        warn!("could not close control channel: {close_err}");
                    }
                }
                Err(err)
            }
        }
    }

    /// Spawn, handshake, attach and replay. On failure after the spawn the
    /// process is detached again and killed.
    async fn start_process(
        &self,
        ins: &Arc<PluginIns>,
        meta: &PluginMeta,
        spec: &LaunchSpec,
        channel: &dyn ControlChannel,
    ) -> Result<(), PortableError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (handle, watcher) =
            process::spawn(spec, &meta.name, generation).map_err(|source| PortableError::ProcessStart {
                name: meta.name.clone(),
                executable: meta.executable.clone(),
                source,
            })?;
        self.metrics.spawned(&meta.name);
        info!(pid = handle.pid(), generation, "plugin process started");
        self.watch(Arc::clone(ins), watcher, generation);

        if let Err(source) = channel.handshake().await {
            handle.kill();
            return Err(PortableError::Handshake {
                name: meta.name.clone(),
                source,
            });
        }
        if !ins.attach_process(handle.clone()) {
            warn!(pid = handle.pid(), generation, "plugin process exited during the handshake");
            return Err(PortableError::ProcessExited {
                name: meta.name.clone(),
            });
        }

        let replay = ins.replay_log();
        for (key, payload) in &replay {
            if let Err(source) = channel.send_cmd(payload).await {
                ins.detach_process(generation);
                handle.kill();
                return Err(PortableError::CommandReplay {
                    name: meta.name.clone(),
                    key: key.clone(),
                    source,
                });
            }
        }
        if !replay.is_empty() {
            info!(count = replay.len(), "restored active symbols");
        }
        self.metrics.replayed(&meta.name, replay.len() as u64);
        Ok(())
    }

    fn watch(&self, ins: Arc<PluginIns>, watcher: Watcher, generation: u64) {
        let instances = Arc::clone(&self.instances);
        let spawn_lock = Arc::clone(&self.spawn_lock);
        let policy = self.settings.crash_policy;
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let name = ins.name().to_string();
            match watcher.wait().await {
                Ok(status) => info!(plugin = %name, generation, "plugin process exited: {status}"),
                Err(err) => warn!(plugin = %name, generation, "lost track of plugin process: {err}"),
            }
            metrics.exited(&name);

            let _guard = spawn_lock.lock().await;
            if ins.detach_process(generation).is_none() {
                debug!(plugin = %name, generation, "instance no longer owned by this process");
                return;
            }
            match policy {
                CrashPolicy::Preserve => {
                    info!(
                        plugin = %name,
                        "process handle cleared, keeping channel and {} active symbol(s)",
                        ins.active_symbols().len()
                    );
                }
                CrashPolicy::Discard => {
                    if let Some(channel) = ins.take_channel() {
                        if let Err(err) = channel.close().await {
                            warn!(plugin = %name, "could not close control channel: {err}");
                        }
                    }
                    instances.remove_if(&name, |_, current| Arc::ptr_eq(current, &ins));
                    info!(plugin = %name, "plugin instance discarded after exit");
                }
            }
        });
    }

    pub fn get_plugin_ins(&self, name: &str) -> Option<Arc<PluginIns>> {
        self.instances.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `name` from the registry. Its process and channel are left
    /// alone; kill it first if needed.
    pub fn delete_plugin_ins(&self, name: &str) -> Option<Arc<PluginIns>> {
        self.instances.remove(name).map(|(_, ins)| ins)
    }

    pub fn kill(&self, name: &str) {
        match self.get_plugin_ins(name) {
            Some(ins) => ins.stop(),
            None => info!(plugin = %name, "no plugin instance to kill"),
        }
    }

    pub fn kill_all(&self) {
        for ins in self.all() {
            ins.stop();
        }
    }

    /// Kill every process, close every channel and empty the registry.
    pub async fn shutdown(&self) {
        let _guard = self.spawn_lock.lock().await;
        let all = self.all();
        self.instances.clear();
        for ins in all {
            ins.stop();
            if let Some(channel) = ins.take_channel() {
                if let Err(err) = channel.close().await {
                    warn!(plugin = %ins.name(), "could not close control channel: {err}");
                }
            }
        }
        info!("portable plugin manager shut down");
    }

    /// Registered plugin names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<Arc<PluginIns>> {
        self.instances.iter().map(|e| Arc::clone(e.value())).collect()
    }
}
