//! One server endpoint: its socket pool and its health. Health moves
//! between Alive and Dead; a dead node keeps its slot in the cluster (so
//! indices stay stable) but is excluded from locator rebuilds until a
//! revival probe succeeds.

use std::sync::Mutex;
use std::time::Instant;

use crate::auth::AuthConfig;
use crate::connection::Connection;
use crate::pool::{SocketPool, SocketPoolConfig};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Health {
    Alive,
    Dead { since: Instant, retry_at: Instant },
}

pub(crate) struct Node<C: Connection> {
    pub(crate) pool: SocketPool<C>,
    health: Mutex<Health>,
}

impl<C: Connection> Node<C> {
    pub(crate) fn new(endpoint: String, auth: Option<AuthConfig>, cfg: SocketPoolConfig) -> Self {
        Self {
            pool: SocketPool::new(endpoint, auth, cfg),
            health: Mutex::new(Health::Alive),
        }
    }

    pub(crate) fn endpoint(&self) -> &str {
        self.pool.endpoint()
    }

    pub(crate) fn is_alive(&self) -> bool {
        matches!(*self.health.lock().expect("health mutex poisoned"), Health::Alive)
    }

    /// Transition to Dead and drain the idle sockets. Returns false when
    /// the node was already dead, so concurrent failures trigger a single
    /// ring rebuild.
    pub(crate) fn mark_dead(&self) -> bool {
        {
            let mut health = self.health.lock().expect("health mutex poisoned");
            if let Health::Dead { .. } = *health {
                return false;
            }
            let now = Instant::now();
            *health = Health::Dead {
                since: now,
                retry_at: now + self.pool.cfg.dead_timeout,
            };
        }
        tracing::warn!(endpoint = %self.endpoint(), "node marked dead");
        self.pool.drain();
        true
    }

    pub(crate) fn mark_alive(&self) {
        let mut health = self.health.lock().expect("health mutex poisoned");
        if let Health::Dead { since, .. } = *health {
            tracing::info!(
                endpoint = %self.endpoint(),
                dead_for = ?since.elapsed(),
                "node revived"
            );
        }
        *health = Health::Alive;
    }

    /// Whether a revival probe is due.
    pub(crate) fn revival_due(&self, now: Instant) -> bool {
        match *self.health.lock().expect("health mutex poisoned") {
            Health::Alive => false,
            Health::Dead { retry_at, .. } => now >= retry_at,
        }
    }

    /// Push the next revival attempt out by another dead interval.
    pub(crate) fn defer_revival(&self) {
        let mut health = self.health.lock().expect("health mutex poisoned");
        if let Health::Dead { since, .. } = *health {
            *health = Health::Dead {
                since,
                retry_at: Instant::now() + self.pool.cfg.dead_timeout,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoConn;

    #[async_trait]
    impl Connection for NoConn {
        async fn connect(_endpoint: &str) -> Result<Self, Error> {
            Err(Error::ConnectTimeout)
        }
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Error> {
            Ok(0)
        }
        async fn write(&mut self, _data: &[u8]) -> Result<(), Error> {
            Ok(())
        }
    }

    fn node(dead_timeout: Duration) -> Node<NoConn> {
        let cfg = SocketPoolConfig {
            dead_timeout,
            ..Default::default()
        };
        Node::new("localhost:11211".into(), None, cfg)
    }

    #[test]
    fn death_is_reported_once() {
        let node = node(Duration::from_secs(10));
        assert!(node.is_alive());
        assert!(node.mark_dead());
        assert!(!node.mark_dead());
        assert!(!node.is_alive());
    }

    #[test]
    fn revival_waits_for_the_deadline() {
        let node = node(Duration::from_secs(10));
        node.mark_dead();
        let now = Instant::now();
        assert!(!node.revival_due(now));
        assert!(node.revival_due(now + Duration::from_secs(11)));

        node.mark_alive();
        assert!(node.is_alive());
        assert!(!node.revival_due(now + Duration::from_secs(60)));
    }

    #[test]
    fn deferral_pushes_the_deadline() {
        let node = node(Duration::from_secs(10));
        node.mark_dead();
        let later = Instant::now() + Duration::from_secs(11);
        assert!(node.revival_due(later));
        node.defer_revival();
        assert!(!node.revival_due(later));
    }
}
