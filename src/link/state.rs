//! Lifecycle states of the connection manager

use std::fmt;

/// Connection manager state
///
/// Exactly one is active at a time. The manager is the only writer; readers
/// observe it through a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Tear down leftovers and decide whether a tunnel is needed
    #[default]
    Initial,
    /// Building the SSH tunnel
    CreatingTunnel,
    /// Cooling down after a failed tunnel attempt
    Waiting,
    /// Creating a broker client and connecting it
    ConnectingBroker,
    /// Broker session established; pumping I/O
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Initial => "initial",
            ConnectionState::CreatingTunnel => "creating_tunnel",
            ConnectionState::Waiting => "waiting",
            ConnectionState::ConnectingBroker => "connecting_broker",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_initial() {
        assert_eq!(ConnectionState::default(), ConnectionState::Initial);
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::CreatingTunnel.to_string(), "creating_tunnel");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
