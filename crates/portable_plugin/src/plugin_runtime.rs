//! Plugin-side runtime: connects a plugin executable to its host.
//!
//! The host hands every plugin a JSON encoded [`PortableConfig`] as its only
//! argument. The runtime derives the control socket from it, announces itself
//! with a [`Handshake`] and then serves start/stop commands until the host
//! hangs up.
//!
//! Usage:
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = PluginRuntime::new("mirror", MyHandler::default());
//!     runtime.run_from_args().await?;
//!     Ok(())
//! }
//! ```

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::{
    codec::{CodecError, FrameReader, write_frame},
    message::{Ack, Command, CommandKind, Control, Handshake, PortableConfig},
};

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Implement this in the plugin to run and stop symbols.
#[async_trait]
pub trait SymbolHandler: Send + Sync + 'static {
    async fn start_symbol(&self, ctrl: Control) -> anyhow::Result<()>;
    async fn stop_symbol(&self, ctrl: Control) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("missing portable config argument")]
    MissingConfig,

    #[error("invalid portable config: {0}")]
    InvalidConfig(#[source] serde_json::Error),

    #[error("could not connect to control socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("host closed the connection during handshake")]
    HandshakeClosed,

    #[error("host rejected handshake: {0}")]
    HandshakeRejected(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub struct PluginRuntime<H> {
    name: String,
    handler: H,
}

impl<H: SymbolHandler> PluginRuntime<H> {
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Read the config from `argv[1]`, as the host passes it, and serve.
    #[cfg(unix)]
    pub async fn run_from_args(&self) -> Result<(), RuntimeError> {
        let arg = std::env::args().nth(1).ok_or(RuntimeError::MissingConfig)?;
        let conf: PortableConfig = serde_json::from_str(&arg).map_err(RuntimeError::InvalidConfig)?;
        self.run(&conf).await
    }

    #[cfg(unix)]
    pub async fn run(&self, conf: &PortableConfig) -> Result<(), RuntimeError> {
        let path = conf.socket_path(&self.name);
        let stream = connect(path).await?;
        self.serve(stream).await
    }

    /// Handshake on `stream`, then answer commands until EOF.
    pub async fn serve<S>(&self, stream: S) -> Result<(), RuntimeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (rd, mut wr) = tokio::io::split(stream);
        let mut reader = FrameReader::new(rd);

        let hello = Handshake {
            name: self.name.clone(),
            pid: std::process::id(),
        };
        write_frame(&mut wr, &hello).await?;
        match reader.read::<Ack>().await? {
            None => return Err(RuntimeError::HandshakeClosed),
            Some(ack) if !ack.ok => {
                return Err(RuntimeError::HandshakeRejected(ack.error.unwrap_or_default()));
            }
            Some(_) => info!(plugin = %self.name, "handshake accepted by host"),
        }

        while let Some(line) = reader.next_line().await? {
            let ack = self.dispatch(&line).await;
            write_frame(&mut wr, &ack).await?;
        }
        info!(plugin = %self.name, "host closed the control connection");
        Ok(())
    }

    async fn dispatch(&self, line: &str) -> Ack {
        let cmd: Command = match serde_json::from_str(line) {
            Ok(cmd) => cmd,
            Err(err) => return Ack::fail(format!("invalid command: {err}")),
        };
        let ctrl = match cmd.control() {
            Ok(ctrl) => ctrl,
            Err(err) => return Ack::fail(format!("invalid {} argument: {err}", cmd.cmd)),
        };
        debug!(plugin = %self.name, cmd = %cmd.cmd, symbol = %ctrl.symbol_name, meta = %ctrl.meta, "command received");

        let symbol = ctrl.symbol_name.clone();
        let result = match cmd.cmd {
            CommandKind::Start => self.handler.start_symbol(ctrl).await,
            CommandKind::Stop => self.handler.stop_symbol(ctrl).await,
        };
        match result {
            Ok(()) => Ack::ok(),
            Err(err) => {
                warn!(plugin = %self.name, %symbol, "{} failed: {err:#}", cmd.cmd);
                Ack::fail(format!("{err:#}"))
            }
        }
    }
}

#[cfg(unix)]
async fn connect(path: PathBuf) -> Result<tokio::net::UnixStream, RuntimeError> {
    let mut attempt = 1;
    loop {
        match tokio::net::UnixStream::connect(&path).await {
            Ok(stream) => return Ok(stream),
            Err(err) if attempt >= CONNECT_ATTEMPTS => {
                return Err(RuntimeError::Connect { path, source: err });
            }
            Err(err) => {
                debug!("control socket {} not ready ({err}), retrying", path.display());
                attempt += 1;
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::write_raw,
        message::{Meta, PluginType},
    };
    use anyhow::bail;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
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

    fn encoded(cmd: &Command) -> Vec<u8> {
        serde_json::to_vec(cmd).unwrap()
    }

    #[tokio::test]
    async fn serves_commands_after_handshake() {
        let (host, plugin) = tokio::io::duplex(4096);
        let recorder = Recorder::default();
        let runtime = PluginRuntime::new("p1", recorder.clone());
        let task = tokio::spawn(async move { runtime.serve(plugin).await });

        let (rd, mut wr) = tokio::io::split(host);
        let mut reader = FrameReader::new(rd);
        let hello: Handshake = reader.read().await.unwrap().unwrap();
        assert_eq!(hello.name, "p1");
        write_frame(&mut wr, &Ack::ok()).await.unwrap();

        let ctrl = Control::new("agg", Meta::new("r1", "o1", 0), PluginType::Func);
        write_raw(&mut wr, &encoded(&Command::start(&ctrl).unwrap())).await.unwrap();
        let ack: Ack = reader.read().await.unwrap().unwrap();
        assert!(ack.ok);

        let broken = Control::new("broken", Meta::new("r1", "o2", 0), PluginType::Func);
        write_raw(&mut wr, &encoded(&Command::start(&broken).unwrap())).await.unwrap();
        let ack: Ack = reader.read().await.unwrap().unwrap();
        assert!(!ack.ok);
        assert!(ack.error.unwrap().contains("not registered"));

        write_raw(&mut wr, &encoded(&Command::stop(&ctrl).unwrap())).await.unwrap();
        let ack: Ack = reader.read().await.unwrap().unwrap();
        assert!(ack.ok);

        drop(wr);
        drop(reader);
        task.await.unwrap().unwrap();
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["start agg", "stop agg"]);
    }

    #[tokio::test]
    async fn garbage_command_gets_negative_ack() {
        let (host, plugin) = tokio::io::duplex(1024);
        let runtime = PluginRuntime::new("p1", Recorder::default());
        let task = tokio::spawn(async move { runtime.serve(plugin).await });

        let (rd, mut wr) = tokio::io::split(host);
        let mut reader = FrameReader::new(rd);
        let _: Handshake = reader.read().await.unwrap().unwrap();
        write_frame(&mut wr, &Ack::ok()).await.unwrap();

        write_raw(&mut wr, br#"{"cmd":"start","arg":"not json"}"#).await.unwrap();
        let ack: Ack = reader.read().await.unwrap().unwrap();
        assert!(!ack.ok);
        assert!(ack.error.unwrap().starts_with("invalid start argument"));

        drop(wr);
        drop(reader);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejected_handshake_is_an_error() {
        let (host, plugin) = tokio::io::duplex(1024);
        let runtime = PluginRuntime::new("p1", Recorder::default());
        let task = tokio::spawn(async move { runtime.serve(plugin).await });

        let (rd, mut wr) = tokio::io::split(host);
        let mut reader = FrameReader::new(rd);
        let _: Handshake = reader.read().await.unwrap().unwrap();
        write_frame(&mut wr, &Ack::fail("expected plugin p2")).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::HandshakeRejected(msg) if msg == "expected plugin p2"));
    }
}
