use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use tokio::{fs, io::AsyncWriteExt, net::UdpSocket, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::protocol::{UDP_LOG_MAX_DATAGRAM, UDP_LOG_PORT};

/// Passive listener for the plain-text log datagrams TCPGecko broadcasts,
/// appending each one to a per-session file.
pub struct UdpLogListener {
    bind_addr: SocketAddr,
    log_dir: PathBuf,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    log_path: PathBuf,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl UdpLogListener {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self::with_bind_addr(
            log_dir,
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, UDP_LOG_PORT)),
        )
    }

    pub fn with_bind_addr(log_dir: impl Into<PathBuf>, bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            log_dir: log_dir.into(),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.running.as_ref().map(|r| r.log_path.as_path())
    }

    /// Bind and start listening. Calling this while already listening returns
    /// the existing local address.
    pub async fn start(&mut self) -> io::Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        fs::create_dir_all(&self.log_dir).await?;
        let socket = UdpSocket::bind(self.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let log_path = self.log_dir.join(format!(
            "tcpgecko_udp_{}.log",
            crate::tracker::unix_timestamp().as_secs()
        ));
        tracing::info!(%local_addr, path = %log_path.display(), "starting UDP log listener");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(receive_loop(socket, log_path.clone(), cancel.clone()));
        self.running = Some(Running {
            local_addr,
            log_path,
            cancel,
            handle,
        });
        Ok(local_addr)
    }

    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            tracing::warn!(error = %e, "UDP log listener did not exit cleanly");
        }
        tracing::info!("UDP log listener stopped");
    }
}

impl Drop for UdpLogListener {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

async fn receive_loop(socket: UdpSocket, log_path: PathBuf, cancel: CancellationToken) {
    let mut buf = vec![0u8; UDP_LOG_MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "UDP log receive failed");
                    continue;
                }
            },
        };

        let message = String::from_utf8_lossy(&buf[..len]);
        let message = message.trim_end();
        tracing::info!(%peer, %message, "console log");

        let entry = format!(
            "{:.3} @ {peer}: {message}\n\n",
            crate::tracker::unix_timestamp().as_secs_f64()
        );
        if let Err(e) = append(&log_path, entry.as_bytes()).await {
            tracing::warn!(path = %log_path.display(), error = %e, "failed to append UDP log");
        }
    }
}

async fn append(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await
}
