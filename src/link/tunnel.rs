//! Ownership of at most one live tunnel

use crate::error::TunnelError;
use crate::transport::{Tunnel, TunnelProvider, TunnelTarget};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

type TunnelSlot = Arc<RwLock<Option<Arc<dyn Tunnel>>>>;

/// Holds the current tunnel for the connection manager
///
/// Opening a new tunnel always tears down the previous one first, so two
/// tunnels never coexist.
#[derive(Default)]
pub struct TunnelHandle {
    slot: TunnelSlot,
}

impl TunnelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tear down any existing tunnel, then build and start a new one
    ///
    /// The tunnel is stored before it starts so a half-started tunnel is
    /// still reached by the next teardown.
    pub async fn open(
        &self,
        provider: &dyn TunnelProvider,
        target: &TunnelTarget,
    ) -> Result<(), TunnelError> {
        self.teardown().await;

        let tunnel = provider.create(target);
        self.replace(Some(tunnel.clone()));
        tunnel.start().await?;

        if !tunnel.is_active() {
            return Err(TunnelError::NotActive);
        }
        Ok(())
    }

    /// Stop and close the current tunnel, if any; errors are swallowed
    pub async fn teardown(&self) {
        let Some(tunnel) = self.replace(None) else {
            return;
        };
        if let Err(e) = tunnel.stop().await {
            debug!(target: "ssh_tunnel", "Ignoring tunnel stop error: {}", e);
        }
        if let Err(e) = tunnel.close().await {
            debug!(target: "ssh_tunnel", "Ignoring tunnel close error: {}", e);
        }
    }

    pub fn is_present(&self) -> bool {
        self.current().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.probe().is_active()
    }

    pub fn local_bind_port(&self) -> Option<u16> {
        self.current().and_then(|tunnel| tunnel.local_bind_port())
    }

    /// Read-only view for other tasks
    pub fn probe(&self) -> TunnelProbe {
        TunnelProbe {
            slot: self.slot.clone(),
        }
    }

    fn current(&self) -> Option<Arc<dyn Tunnel>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, tunnel: Option<Arc<dyn Tunnel>>) -> Option<Arc<dyn Tunnel>> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, tunnel)
    }
}

/// Liveness view of a [`TunnelHandle`], safe to query from any thread
#[derive(Clone)]
pub struct TunnelProbe {
    slot: TunnelSlot,
}

impl TunnelProbe {
    /// True when a tunnel exists and reports itself active
    ///
    /// An unreadable slot reads as not active.
    pub fn is_active(&self) -> bool {
        match self.slot.read() {
            Ok(slot) => slot.as_ref().map(|t| t.is_active()).unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTunnelProvider;
    use std::time::Duration;

    fn target() -> TunnelTarget {
        TunnelTarget {
            ssh_host: "gateway.local".to_string(),
            ssh_port: 22,
            username: "pi".to_string(),
            password: "secret".to_string(),
            remote_bind_address: "127.0.0.1".to_string(),
            remote_bind_port: 1883,
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_open_starts_tunnel() {
        let provider = MockTunnelProvider::new();
        let handle = TunnelHandle::new();

        handle.open(&provider, &target()).await.unwrap();

        assert!(handle.is_active());
        assert!(handle.probe().is_active());
        assert_eq!(handle.local_bind_port(), Some(provider.local_port()));
        assert_eq!(provider.last_target(), Some(target()));
    }

    #[tokio::test]
    async fn test_reopen_tears_down_previous() {
        let provider = MockTunnelProvider::new();
        let handle = TunnelHandle::new();

        handle.open(&provider, &target()).await.unwrap();
        handle.open(&provider, &target()).await.unwrap();

        let tunnels = provider.tunnels();
        assert_eq!(tunnels.len(), 2);
        assert_eq!(tunnels[0].stop_calls(), 1);
        assert_eq!(tunnels[0].close_calls(), 1);
        assert!(!tunnels[0].is_active());
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn test_failed_start_keeps_tunnel_for_teardown() {
        let provider = MockTunnelProvider::new();
        provider.set_fail_start(true);
        let handle = TunnelHandle::new();

        let result = handle.open(&provider, &target()).await;
        assert!(result.is_err());
        assert!(handle.is_present());
        assert!(!handle.is_active());

        handle.teardown().await;
        assert!(!handle.is_present());
        assert_eq!(provider.tunnels()[0].close_calls(), 1);
    }

    #[tokio::test]
    async fn test_teardown_swallows_errors() {
        let provider = MockTunnelProvider::new();
        provider.set_fail_teardown(true);
        let handle = TunnelHandle::new();

        handle.open(&provider, &target()).await.unwrap();
        handle.teardown().await;

        assert!(!handle.is_present());
        assert!(!handle.probe().is_active());
    }

    #[tokio::test]
    async fn test_teardown_without_tunnel_is_noop() {
        let handle = TunnelHandle::new();
        handle.teardown().await;
        assert!(!handle.is_active());
        assert_eq!(handle.local_bind_port(), None);
    }

    #[tokio::test]
    async fn test_probe_sees_dead_tunnel() {
        let provider = MockTunnelProvider::new();
        let handle = TunnelHandle::new();
        let probe = handle.probe();

        handle.open(&provider, &target()).await.unwrap();
        assert!(probe.is_active());

        provider.tunnels()[0].kill();
        assert!(!probe.is_active());
        assert_eq!(handle.local_bind_port(), None);
    }
}
