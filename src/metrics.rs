use opentelemetry::{KeyValue, global, metrics::Counter};

/// Process lifecycle counters, labelled by plugin name.
#[derive(Clone)]
pub struct ProcessMetrics {
    spawned: Counter<u64>,
    exited: Counter<u64>,
    spawn_failures: Counter<u64>,
    replayed: Counter<u64>,
}

impl ProcessMetrics {
    pub fn new() -> Self {
        let meter = global::meter("portable");
        Self {
            spawned: meter
                .u64_counter("portable_processes_spawned")
                .with_description("Plugin processes started")
                .build(),
            exited: meter
                .u64_counter("portable_processes_exited")
                .with_description("Plugin processes that exited, for any reason")
                .build(),
            spawn_failures: meter
                .u64_counter("portable_spawn_failures")
                .with_description("Failed attempts to bring a plugin process up")
                .build(),
            replayed: meter
                .u64_counter("portable_commands_replayed")
                .with_description("Audit-log commands resent after a restart")
                .build(),
        }
    }

    pub fn spawned(&self, plugin: &str) {
        self.spawned.add(1, &labels(plugin));
    }

    pub fn exited(&self, plugin: &str) {
        self.exited.add(1, &labels(plugin));
    }

    pub fn spawn_failed(&self, plugin: &str) {
        self.spawn_failures.add(1, &labels(plugin));
    }

    pub fn replayed(&self, plugin: &str, count: u64) {
        if count > 0 {
            self.replayed.add(count, &labels(plugin));
        }
    }
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn labels(plugin: &str) -> [KeyValue; 1] {
    [KeyValue::new("plugin", plugin.to_string())]
}
