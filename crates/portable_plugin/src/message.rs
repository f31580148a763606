use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// Identifies one running symbol (operator instance) inside a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub rule_id: String,
    pub op_id: String,
    pub instance_id: i32,
}

impl Meta {
    pub fn new(rule_id: impl Into<String>, op_id: impl Into<String>, instance_id: i32) -> Self {
        Self {
            rule_id: rule_id.into(),
            op_id: op_id.into(),
            instance_id,
        }
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.rule_id, self.op_id, self.instance_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PluginType {
    Source,
    Sink,
    #[default]
    Func,
}

/// Payload of a start/stop command: which symbol, and how it is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Control {
    pub symbol_name: String,
    pub meta: Meta,
    pub plugin_type: PluginType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, Value>,
}

impl Control {
    pub fn new(symbol_name: impl Into<String>, meta: Meta, plugin_type: PluginType) -> Self {
        Self {
            symbol_name: symbol_name.into(),
            meta,
            plugin_type,
            data_source: None,
            config: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandKind {
    Start,
    Stop,
}

/// Wire envelope sent from host to plugin. `arg` carries the JSON encoded
/// [`Control`], or an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Command {
    pub cmd: CommandKind,
    #[serde(default)]
    pub arg: String,
}

impl Command {
    pub fn start(ctrl: &Control) -> serde_json::Result<Self> {
        Ok(Self {
            cmd: CommandKind::Start,
            arg: serde_json::to_string(ctrl)?,
        })
    }

    pub fn stop(ctrl: &Control) -> serde_json::Result<Self> {
        Ok(Self {
            cmd: CommandKind::Stop,
            arg: serde_json::to_string(ctrl)?,
        })
    }

    /// Decode the embedded control payload.
    pub fn control(&self) -> serde_json::Result<Control> {
        serde_json::from_str(&self.arg)
    }
}

/// First frame a plugin sends after connecting to its control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Handshake {
    pub name: String,
    pub pid: u32,
}

/// Reply to a handshake or a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Handed to every plugin process as its single command line argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortableConfig {
    /// Milliseconds either side waits for an acknowledgement.
    pub send_timeout: u64,
    pub socket_dir: PathBuf,
}

impl Default for PortableConfig {
    fn default() -> Self {
        Self {
            send_timeout: 1000,
            socket_dir: std::env::temp_dir(),
        }
    }
}

impl PortableConfig {
    pub fn socket_path(&self, name: &str) -> PathBuf {
        control_socket_path(&self.socket_dir, name)
    }
}

/// Where the control socket for plugin `name` lives. Host and plugin both
/// derive it from the same directory, so the name is the only rendezvous.
pub fn control_socket_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("plugin_{name}.sock"))
}
