pub mod config;
pub mod control;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod runtime;

pub use config::{ConfigManager, CrashPolicy, EnvConfigManager, MapConfigManager, PortableSettings};
pub use control::{ControlChannel, ControlChannelFactory};
#[cfg(unix)]
pub use control::ipc::{IpcChannelFactory, IpcControlChannel};
pub use error::{ChannelError, PortableError};
pub use runtime::{
    instance::PluginIns,
    manager::PluginInsManager,
    meta::{Language, PluginMeta, VirtualEnvType},
};
