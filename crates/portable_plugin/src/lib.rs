pub mod codec;
pub mod message;
pub mod plugin_runtime;

pub use message::{Ack, Command, CommandKind, Control, Handshake, Meta, PluginType, PortableConfig};
pub use plugin_runtime::{PluginRuntime, RuntimeError, SymbolHandler};
