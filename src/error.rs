use std::path::PathBuf;

use portable_plugin::{Meta, codec::CodecError};
use thiserror::Error;

/// Failures of a control channel transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("control channel is closed")]
    Closed,

    #[error("no plugin is connected to the control channel")]
    NotConnected,

    #[error("plugin rejected the command: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for ChannelError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => ChannelError::Io(e),
            CodecError::Json(e) => ChannelError::Json(e),
            other => ChannelError::Protocol(other.to_string()),
        }
    }
}

/// Errors surfaced by the instance manager and plugin instances.
#[derive(Debug, Error)]
pub enum PortableError {
    #[error("invalid portable config: {0}")]
    Config(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("unsupported virtual type: {0}")]
    UnsupportedVirtualEnv(String),

    #[error("plugin {name} can't create new control channel: {source}")]
    ChannelCreation {
        name: String,
        #[source]
        source: ChannelError,
    },

    #[error("plugin {name} executable {} failed to start: {source}", .executable.display())]
    ProcessStart {
        name: String,
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin {name} exited before it was ready")]
    ProcessExited { name: String },

    #[error("plugin {name} control handshake error: {source}")]
    Handshake {
        name: String,
        #[source]
        source: ChannelError,
    },

    #[error("plugin {name} failed to restore command {key}: {source}")]
    CommandReplay {
        name: String,
        key: Meta,
        #[source]
        source: ChannelError,
    },

    #[error("plugin {name} failed to send command: {source}")]
    Send {
        name: String,
        #[source]
        source: ChannelError,
    },

    #[error("plugin {name} is not running successfully, please make sure it is valid")]
    NotRunning { name: String },

    #[error("cannot encode command: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PortableError {
    pub fn config(msg: impl Into<String>) -> Self {
        PortableError::Config(msg.into())
    }
}
