//! SSH port forwarding with russh
//!
//! [`SshTunnel::start`] opens an SSH session with password authentication
//! and binds a loopback listener on an ephemeral port. Every connection
//! accepted there is forwarded through its own `direct-tcpip` channel to
//! `remote_bind_address:remote_bind_port` on the SSH server's side.

use crate::error::{redact_secrets, TunnelError};
use crate::transport::{Tunnel, TunnelProvider, TunnelTarget, TUNNEL_LOCAL_ADDRESS};
use crate::tunnel_span;
use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

/// Builds [`SshTunnel`]s
#[derive(Debug, Default, Clone)]
pub struct SshTunnelProvider;

impl TunnelProvider for SshTunnelProvider {
    fn create(&self, target: &TunnelTarget) -> Arc<dyn Tunnel> {
        Arc::new(SshTunnel::new(target.clone()))
    }
}

/// Host keys are not pinned; the tunnel trusts the configured host
struct TunnelClientHandler;

#[async_trait]
impl client::Handler for TunnelClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct RunningTunnel {
    session: Arc<client::Handle<TunnelClientHandler>>,
    accept_task: JoinHandle<()>,
}

pub struct SshTunnel {
    target: TunnelTarget,
    running: Mutex<Option<RunningTunnel>>,
    active: Arc<AtomicBool>,
    local_port: AtomicU16,
}

impl SshTunnel {
    pub fn new(target: TunnelTarget) -> Self {
        Self {
            target,
            running: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            local_port: AtomicU16::new(0),
        }
    }

    /// Connect and authenticate, bounded as a whole by `connect_timeout`
    async fn open_session(&self) -> Result<client::Handle<TunnelClientHandler>, TunnelError> {
        let limit = self.target.connect_timeout;
        tokio::time::timeout(limit, self.handshake())
            .await
            .map_err(|_| TunnelError::Timeout(limit))?
    }

    async fn handshake(&self) -> Result<client::Handle<TunnelClientHandler>, TunnelError> {
        let target = &self.target;
        let config = Arc::new(client::Config::default());
        let address = (target.ssh_host.as_str(), target.ssh_port);
        let connect_error = |e: russh::Error| TunnelError::Connect {
            host: target.ssh_host.clone(),
            port: target.ssh_port,
            message: redact_secrets(&e.to_string()),
        };

        let mut session = client::connect(config, address, TunnelClientHandler)
            .await
            .map_err(connect_error)?;
        let authenticated = session
            .authenticate_password(target.username.clone(), target.password.clone())
            .await
            .map_err(connect_error)?;
        if !authenticated {
            return Err(TunnelError::Authentication {
                username: target.username.clone(),
            });
        }

        Ok(session)
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    async fn start(&self) -> Result<(), TunnelError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let span = tunnel_span!(host = %self.target.ssh_host, port = self.target.ssh_port);
        let session = Arc::new(self.open_session().instrument(span).await?);
        let listener = TcpListener::bind((TUNNEL_LOCAL_ADDRESS, 0))
            .await
            .map_err(TunnelError::Bind)?;
        let local_port = listener.local_addr().map_err(TunnelError::Bind)?.port();

        self.local_port.store(local_port, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            session.clone(),
            self.target.remote_bind_address.clone(),
            self.target.remote_bind_port,
            self.active.clone(),
        ));

        debug!(
            target: "ssh_tunnel",
            local_port,
            remote = %format!("{}:{}", self.target.remote_bind_address, self.target.remote_bind_port),
            "SSH tunnel listening"
        );
        *running = Some(RunningTunnel {
            session,
            accept_task,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        self.active.store(false, Ordering::SeqCst);
        if let Some(running) = self.running.lock().await.as_ref() {
            running.accept_task.abort();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.active.store(false, Ordering::SeqCst);
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.accept_task.abort();
        running
            .session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| TunnelError::Channel {
                message: e.to_string(),
            })
    }

    fn is_active(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        // a held lock means start/stop/close is in flight; report the flag
        match self.running.try_lock() {
            Ok(running) => running
                .as_ref()
                .map(|r| !r.session.is_closed() && !r.accept_task.is_finished())
                .unwrap_or(false),
            Err(_) => true,
        }
    }

    fn local_bind_port(&self) -> Option<u16> {
        if self.is_active() {
            Some(self.local_port.load(Ordering::SeqCst))
        } else {
            None
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<client::Handle<TunnelClientHandler>>,
    remote_host: String,
    remote_port: u16,
    active: Arc<AtomicBool>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(target: "ssh_tunnel", "Tunnel listener failed: {}", e);
                break;
            }
        };
        debug!(target: "ssh_tunnel", %peer, "Forwarding connection");
        tokio::spawn(forward_connection(
            socket,
            peer.port(),
            session.clone(),
            remote_host.clone(),
            remote_port,
        ));
    }
    active.store(false, Ordering::SeqCst);
}

async fn forward_connection(
    mut socket: TcpStream,
    originator_port: u16,
    session: Arc<client::Handle<TunnelClientHandler>>,
    remote_host: String,
    remote_port: u16,
) {
    let channel = match session
        .channel_open_direct_tcpip(
            remote_host,
            u32::from(remote_port),
            TUNNEL_LOCAL_ADDRESS,
            u32::from(originator_port),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!(target: "ssh_tunnel", "Opening direct-tcpip channel failed: {}", e);
            return;
        }
    };

    let mut stream = channel.into_stream();
    if let Err(e) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
        debug!(target: "ssh_tunnel", "Forwarded connection closed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unreachable_target() -> TunnelTarget {
        // bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        TunnelTarget {
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: port,
            username: "pi".to_string(),
            password: "raspberry".to_string(),
            remote_bind_address: "127.0.0.1".to_string(),
            remote_bind_port: 1883,
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_new_tunnel_is_inactive() {
        let tunnel = SshTunnelProvider.create(&unreachable_target());
        assert!(!tunnel.is_active());
        assert_eq!(tunnel.local_bind_port(), None);
    }

    #[tokio::test]
    async fn test_start_against_closed_port_fails() {
        let tunnel = SshTunnel::new(unreachable_target());
        let result = tunnel.start().await;
        assert!(matches!(result, Err(TunnelError::Connect { .. })));
        assert!(!tunnel.is_active());
    }

    #[tokio::test]
    async fn test_teardown_of_unstarted_tunnel_is_ok() {
        let tunnel = SshTunnel::new(unreachable_target());
        assert!(tunnel.stop().await.is_ok());
        assert!(tunnel.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // accepts the TCP connection and never speaks SSH
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let mut target = unreachable_target();
        target.ssh_port = port;
        target.connect_timeout = Duration::from_millis(200);
        let tunnel = SshTunnel::new(target);

        let result = tokio::time::timeout(Duration::from_secs(2), tunnel.start()).await;
        assert!(matches!(result, Ok(Err(TunnelError::Timeout(_)))));
        assert!(!tunnel.is_active());
        server.abort();
    }

    #[test]
    fn test_target_debug_hides_password() {
        let rendered = format!("{:?}", unreachable_target());
        assert!(!rendered.contains("raspberry"));
    }
}
