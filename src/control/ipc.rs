//! Unix-domain socket transport.
//!
//! The host listens at `<socket_dir>/plugin_<name>.sock`. A plugin process
//! connects, sends a [`Handshake`] and is acknowledged; afterwards the host
//! writes one command per line and reads one [`Ack`] per command. A restarted
//! process connects to the same listener and replaces the stale connection.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use portable_plugin::{
    Ack, Handshake,
    codec::{FrameReader, write_frame, write_raw},
    message::control_socket_path,
};
use tokio::{
    net::{
        UnixListener,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::{debug, info, warn};

use super::{ControlChannel, ControlChannelFactory};
use crate::{config::PortableSettings, error::ChannelError};

struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    pid: u32,
}

impl Connection {
    async fn exchange(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        write_raw(&mut self.writer, payload).await?;
        match self.reader.read::<Ack>().await? {
            Some(ack) if ack.ok => Ok(()),
            Some(ack) => Err(ChannelError::Rejected(ack.error.unwrap_or_default())),
            None => Err(ChannelError::Protocol("plugin hung up before acknowledging".into())),
        }
    }
}

pub struct IpcControlChannel {
    name: String,
    path: PathBuf,
    send_timeout: Duration,
    handshake_timeout: Duration,
    listener: Mutex<Option<UnixListener>>,
    conn: Mutex<Option<Connection>>,
    closed: watch::Sender<bool>,
}

impl IpcControlChannel {
    /// Bind the listener for `name`, replacing a stale socket file.
    pub fn bind(
        name: &str,
        socket_dir: &Path,
        send_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(ChannelError::Protocol(format!("`{name}` is not a valid plugin name")));
        }
        std::fs::create_dir_all(socket_dir)?;
        let path = control_socket_path(socket_dir, name);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(plugin = %name, "removed stale socket {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(&path)?;
        info!(plugin = %name, "control channel listening on {}", path.display());

        let (closed, _) = watch::channel(false);
        Ok(Self {
            name: name.to_string(),
            path,
            send_timeout,
            handshake_timeout,
            listener: Mutex::new(Some(listener)),
            conn: Mutex::new(None),
            closed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Pid the currently connected plugin reported in its handshake.
    pub async fn peer_pid(&self) -> Option<u32> {
        self.conn.lock().await.as_ref().map(|c| c.pid)
    }

    async fn accept(&self, listener: &UnixListener) -> Result<Connection, ChannelError> {
        let (stream, _) = listener.accept().await?;
        let (rd, mut writer) = stream.into_split();
        let mut reader = FrameReader::new(rd);

        let hello: Handshake = reader
            .read()
            .await?
            .ok_or_else(|| ChannelError::Protocol("plugin hung up before its handshake".into()))?;
        if hello.name != self.name {
            let reason = format!("expected plugin {}, got {}", self.name, hello.name);
            write_frame(&mut writer, &Ack::fail(reason.clone())).await?;
            return Err(ChannelError::Protocol(reason));
        }
        write_frame(&mut writer, &Ack::ok()).await?;
        Ok(Connection {
            reader,
            writer,
            pid: hello.pid,
        })
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().try_into().unwrap_or(u64::MAX)
}

#[async_trait]
impl ControlChannel for IpcControlChannel {
    async fn send_cmd(&self, payload: &[u8]) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(ChannelError::NotConnected)?;
        match timeout(self.send_timeout, conn.exchange(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err @ ChannelError::Rejected(_))) => Err(err),
            Ok(Err(err)) => {
                // the stream is out of sync; the next process reconnects
                guard.take();
                Err(err)
            }
            Err(_) => {
                guard.take();
                Err(ChannelError::Timeout(millis(self.send_timeout)))
            }
        }
    }

    async fn handshake(&self) -> Result<(), ChannelError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(ChannelError::Closed);
        }
        let listener = self.listener.lock().await;
        let listener = listener.as_ref().ok_or(ChannelError::Closed)?;

        let conn = tokio::select! {
            res = timeout(self.handshake_timeout, self.accept(listener)) => {
                res.map_err(|_| ChannelError::Timeout(millis(self.handshake_timeout)))??
            }
            _ = wait_closed(&mut closed) => return Err(ChannelError::Closed),
        };
        let pid = conn.pid;
        if self.conn.lock().await.replace(conn).is_some() {
            debug!(plugin = %self.name, "replaced stale plugin connection");
        }
        info!(plugin = %self.name, pid, "plugin handshake completed");
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.conn.lock().await.take();
        self.listener.lock().await.take();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(plugin = %self.name, "could not remove {}: {err}", self.path.display());
                return Err(err.into());
            }
        }
        info!(plugin = %self.name, "control channel closed");
        Ok(())
    }
}

/// Creates one [`IpcControlChannel`] per plugin under the configured socket
/// directory.
#[derive(Debug, Clone)]
pub struct IpcChannelFactory {
    socket_dir: PathBuf,
    send_timeout: Duration,
    handshake_timeout: Duration,
}

impl IpcChannelFactory {
    pub fn new(settings: &PortableSettings) -> Self {
        Self {
            socket_dir: settings.socket_dir.clone(),
            send_timeout: settings.send_timeout(),
            handshake_timeout: settings.handshake_timeout(),
        }
    }
}

#[async_trait]
impl ControlChannelFactory for IpcChannelFactory {
    async fn create(&self, name: &str) -> Result<Arc<dyn ControlChannel>, ChannelError> {
        let channel = IpcControlChannel::bind(name, &self.socket_dir, self.send_timeout, self.handshake_timeout)?;
        Ok(Arc::new(channel))
    }
}
