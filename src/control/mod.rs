//! Per-plugin control channel used by the host to drive a plugin process.
//!
//! A channel is created once per plugin name through a
//! [`ControlChannelFactory`] and survives process restarts: every freshly
//! spawned process handshakes on the same channel before it receives
//! commands.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ChannelError;

#[cfg(unix)]
pub mod ipc;

#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Deliver one encoded command and wait until the plugin acknowledged it.
    async fn send_cmd(&self, payload: &[u8]) -> Result<(), ChannelError>;

    /// Wait until a freshly started process has connected and reported ready.
    async fn handshake(&self) -> Result<(), ChannelError>;

    /// Release the endpoint. Calling it again is a no-op.
    async fn close(&self) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait ControlChannelFactory: Send + Sync {
    async fn create(&self, name: &str) -> Result<Arc<dyn ControlChannel>, ChannelError>;
}
