use std::time::Instant;

use uuid::Uuid;

/// Identity of an upstream endpoint a connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    /// Derive the host key from a base URL.
    pub fn from_url(url: &url::Url) -> Option<Self> {
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;

        Some(Self {
            scheme: url.scheme().to_string(),
            host,
            port,
        })
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Connection lifecycle states.
///
/// Transitions form a DAG: connecting → {connected | error};
/// connected ↔ idle ↔ busy; any → {closing → closed} | error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Idle,
    Busy,
    Closing,
    Closed,
    Error,
}

/// A pooled upstream connection slot.
///
/// Exclusively owned by the pool; borrowed (state `Busy`) by at most one
/// provider-client call at a time.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub key: HostKey,
    pub state: ConnectionState,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub usage_count: u64,
}

impl Connection {
    pub(crate) fn new(key: HostKey) -> Self {
        let now = Instant::now();

        Self {
            id: Uuid::new_v4(),
            key,
            state: ConnectionState::Connecting,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
        }
    }

    /// Whether the connection can be handed out again.
    pub(crate) fn reusable(&self) -> bool {
        matches!(self.state, ConnectionState::Idle)
    }
}

/// Priority class for connection acquisition.
///
/// Ordering is significant: waiters are released highest priority first,
/// FIFO within the same priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AcquirePriority {
    High,
    Normal,
    Low,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_from_url_uses_known_default_ports() {
        let url: url::Url = "https://api.openai.com".parse().unwrap();
        let key = HostKey::from_url(&url).unwrap();

        assert_eq!(key.scheme, "https");
        assert_eq!(key.host, "api.openai.com");
        assert_eq!(key.port, 443);

        let url: url::Url = "http://127.0.0.1:1234".parse().unwrap();
        let key = HostKey::from_url(&url).unwrap();
        assert_eq!(key.port, 1234);
    }

    #[test]
    fn priority_orders_high_first() {
        let mut priorities = vec![AcquirePriority::Low, AcquirePriority::High, AcquirePriority::Normal];
        priorities.sort();

        assert_eq!(
            priorities,
            vec![AcquirePriority::High, AcquirePriority::Normal, AcquirePriority::Low]
        );
    }
}
