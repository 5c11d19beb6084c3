//! The server pool: owns every node, routes single-key operations through
//! the locator, fans multi-get pipelines out across nodes, and keeps the
//! locator in sync with node health.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::auth::AuthConfig;
use crate::connection::Connection;
use crate::error::Error;
use crate::locator::{LocatorKind, NodeLocator, RingNode};
use crate::node::Node;
use crate::pool::{Socket, SocketPoolConfig};
use crate::protocol::{Opcode, Operation, ProtocolCodec, ProtocolError, Response};

struct Shared<C: Connection> {
    nodes: Vec<Node<C>>,
    ring: RwLock<Arc<dyn NodeLocator>>,
    locator: LocatorKind,
    codec: Arc<dyn ProtocolCodec>,
}

impl<C: Connection> Shared<C> {
    fn live_view(&self) -> Vec<RingNode> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_alive())
            .map(|(index, node)| RingNode {
                index,
                endpoint: node.endpoint().to_string(),
            })
            .collect()
    }

    fn rebuild_ring(&self) {
        let view = self.live_view();
        let locator = self.locator.build(&view);
        *self.ring.write().expect("ring lock poisoned") = locator;
        tracing::debug!(nodes = view.len(), "locator rebuilt");
    }
}

/// Aborts the revival ticker when the last cluster handle drops.
struct Reviver {
    handle: JoinHandle<()>,
}

impl Drop for Reviver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(crate) struct Cluster<C: Connection> {
    shared: Arc<Shared<C>>,
    _reviver: Arc<Reviver>,
}

impl<C: Connection> Clone for Cluster<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _reviver: Arc::clone(&self._reviver),
        }
    }
}

impl<C: Connection> Cluster<C> {
    /// Stand up nodes for every endpoint, open their minimum socket
    /// complements, build the first ring, and start the revival ticker.
    ///
    /// An endpoint that cannot be reached starts out dead rather than
    /// failing the whole cluster; the ticker will keep probing it.
    pub(crate) async fn connect(
        endpoints: Vec<String>,
        auth: Option<AuthConfig>,
        pool_cfg: SocketPoolConfig,
        locator: LocatorKind,
        codec: Arc<dyn ProtocolCodec>,
    ) -> Result<Self, Error> {
        if endpoints.is_empty() {
            return Err(Error::NoAvailableNode);
        }
        let dead_timeout = pool_cfg.dead_timeout;
        let nodes: Vec<Node<C>> = endpoints
            .into_iter()
            .map(|endpoint| Node::new(endpoint, auth.clone(), pool_cfg.clone()))
            .collect();
        let shared = Arc::new(Shared {
            nodes,
            ring: RwLock::new(locator.build(&[])),
            locator,
            codec,
        });

        for node in &shared.nodes {
            if let Err(err) = node.pool.prefill(shared.codec.as_ref()).await {
                tracing::warn!(
                    endpoint = %node.endpoint(),
                    error = %err,
                    "could not reach node at startup"
                );
                // Auth refusals leave the node alive: the server is up,
                // and each operation will surface the failure itself.
                if err.is_node_fault() {
                    node.mark_dead();
                }
            }
        }
        shared.rebuild_ring();

        let reviver = Reviver {
            handle: spawn_reviver(Arc::downgrade(&shared), dead_timeout),
        };
        Ok(Self {
            shared,
            _reviver: Arc::new(reviver),
        })
    }

    fn snapshot(&self) -> Arc<dyn NodeLocator> {
        self.shared.ring.read().expect("ring lock poisoned").clone()
    }

    /// Route one operation to the node owning `key` and run it.
    pub(crate) async fn execute(&self, key: &[u8], op: Operation) -> Result<Response, Error> {
        let index = self.snapshot().locate(key).ok_or(Error::NoAvailableNode)?;
        self.execute_on(index, op).await
    }

    async fn execute_on(&self, index: usize, op: Operation) -> Result<Response, Error> {
        let node = &self.shared.nodes[index];
        let receive_timeout = node.pool.cfg.receive_timeout;
        let codec = self.shared.codec.as_ref();
        let mut lease = match node.pool.acquire(codec).await {
            Ok(lease) => lease,
            Err(err) => {
                self.note_failure(index, &err);
                return Err(err);
            }
        };
        match lease.socket().roundtrip(codec, &op, receive_timeout).await {
            Ok(response) => Ok(response),
            Err(err) => {
                lease.poison();
                drop(lease);
                self.note_failure(index, &err);
                Err(err)
            }
        }
    }

    fn note_failure(&self, index: usize, err: &Error) {
        if err.is_node_fault() && self.shared.nodes[index].mark_dead() {
            self.shared.rebuild_ring();
        }
    }

    /// Fetch many keys at once. Keys are partitioned by owning node and
    /// each node runs an independent GetKQ pipeline terminated by a Noop.
    /// Returns hits only; a node that fails mid-pipeline contributes
    /// nothing, so its keys read as misses.
    pub(crate) async fn multi_get(&self, keys: Vec<Vec<u8>>) -> HashMap<Vec<u8>, Response> {
        let snapshot = self.snapshot();
        let mut per_node: HashMap<usize, Vec<Vec<u8>>> = HashMap::new();
        for key in keys {
            if let Some(index) = snapshot.locate(&key) {
                per_node.entry(index).or_default().push(key);
            }
        }

        let pipelines = per_node
            .into_iter()
            .map(|(index, keys)| self.node_multi_get(index, keys));
        let mut merged = HashMap::new();
        for hits in join_all(pipelines).await {
            merged.extend(hits);
        }
        merged
    }

    async fn node_multi_get(
        &self,
        index: usize,
        keys: Vec<Vec<u8>>,
    ) -> HashMap<Vec<u8>, Response> {
        match self.try_node_multi_get(index, &keys).await {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(
                    endpoint = %self.shared.nodes[index].endpoint(),
                    keys = keys.len(),
                    error = %err,
                    "multi-get pipeline failed; treating its keys as misses"
                );
                self.note_failure(index, &err);
                HashMap::new()
            }
        }
    }

    async fn try_node_multi_get(
        &self,
        index: usize,
        keys: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, Response>, Error> {
        let node = &self.shared.nodes[index];
        let receive_timeout = node.pool.cfg.receive_timeout;
        let codec = self.shared.codec.as_ref();
        let mut lease = node.pool.acquire(codec).await?;
        match getkq_pipeline(lease.socket(), codec, keys, receive_timeout).await {
            Ok(hits) => Ok(hits),
            Err(err) => {
                if err.is_node_fault() {
                    lease.poison();
                }
                Err(err)
            }
        }
    }

    /// Run one operation on every alive node, returning per-endpoint
    /// results.
    pub(crate) async fn broadcast(
        &self,
        op: Operation,
    ) -> Vec<(String, Result<Response, Error>)> {
        let tasks = self.alive_indices().into_iter().map(|index| {
            let op = op.clone();
            async move {
                let endpoint = self.shared.nodes[index].endpoint().to_string();
                (endpoint, self.execute_on(index, op).await)
            }
        });
        join_all(tasks).await
    }

    /// Collect the stat stream from every alive node.
    pub(crate) async fn stats(
        &self,
    ) -> Vec<(String, Result<HashMap<String, String>, Error>)> {
        let tasks = self.alive_indices().into_iter().map(|index| async move {
            let endpoint = self.shared.nodes[index].endpoint().to_string();
            (endpoint, self.node_stats(index).await)
        });
        join_all(tasks).await
    }

    async fn node_stats(&self, index: usize) -> Result<HashMap<String, String>, Error> {
        let node = &self.shared.nodes[index];
        let receive_timeout = node.pool.cfg.receive_timeout;
        let codec = self.shared.codec.as_ref();
        let mut lease = match node.pool.acquire(codec).await {
            Ok(lease) => lease,
            Err(err) => {
                self.note_failure(index, &err);
                return Err(err);
            }
        };
        match stat_pipeline(lease.socket(), codec, receive_timeout).await {
            Ok(stats) => Ok(stats),
            Err(err) => {
                if err.is_node_fault() {
                    lease.poison();
                }
                drop(lease);
                self.note_failure(index, &err);
                Err(err)
            }
        }
    }

    /// Version-ping every alive node; succeeds only when all respond.
    pub(crate) async fn ping(&self) -> Result<(), Error> {
        let results = self.broadcast(Operation::version()).await;
        if results.is_empty() {
            return Err(Error::NoAvailableNode);
        }
        for (_, result) in results {
            let response = result?;
            response.error_for_status().map_err(Error::Status)?;
        }
        Ok(())
    }

    fn alive_indices(&self) -> Vec<usize> {
        self.shared
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_alive())
            .map(|(index, _)| index)
            .collect()
    }
}

/// Write quiet gets for every key plus one Noop, then read until the Noop
/// reply. Present keys answer with their key in the key field; misses stay
/// silent, which is why the Noop terminator is what ends the read loop.
async fn getkq_pipeline<C: Connection>(
    socket: &mut Socket<C>,
    codec: &dyn ProtocolCodec,
    keys: &[Vec<u8>],
    receive_timeout: Duration,
) -> Result<HashMap<Vec<u8>, Response>, Error> {
    for key in keys {
        socket.enqueue(codec, &Operation::getkq(key.clone()));
    }
    let noop_opaque = socket.enqueue(codec, &Operation::noop());
    socket.flush().await?;

    let mut hits = HashMap::new();
    loop {
        let response = socket.read_frame(codec, receive_timeout).await?;
        if response.opcode == Opcode::Noop {
            if response.opaque != noop_opaque {
                return Err(ProtocolError::OpaqueMismatch {
                    sent: noop_opaque,
                    received: response.opaque,
                }
                .into());
            }
            return Ok(hits);
        }
        if response.status.is_ok() {
            hits.insert(response.key.clone(), response);
        }
    }
}

/// Stat replies stream one frame per statistic and end with an empty key.
async fn stat_pipeline<C: Connection>(
    socket: &mut Socket<C>,
    codec: &dyn ProtocolCodec,
    receive_timeout: Duration,
) -> Result<HashMap<String, String>, Error> {
    socket.enqueue(codec, &Operation::stat());
    socket.flush().await?;

    let mut stats = HashMap::new();
    loop {
        let response = socket.read_frame(codec, receive_timeout).await?;
        response.error_for_status().map_err(Error::Status)?;
        if response.key.is_empty() {
            return Ok(stats);
        }
        stats.insert(
            String::from_utf8_lossy(&response.key).into_owned(),
            String::from_utf8_lossy(&response.value).into_owned(),
        );
    }
}

fn spawn_reviver<C: Connection>(shared: Weak<Shared<C>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else { break };
            revive_due_nodes(shared.as_ref()).await;
        }
    })
}

async fn revive_due_nodes<C: Connection>(shared: &Shared<C>) {
    let now = Instant::now();
    for node in &shared.nodes {
        if !node.revival_due(now) {
            continue;
        }
        match probe(node, shared.codec.as_ref()).await {
            Ok(()) => {
                node.mark_alive();
                if let Err(err) = node.pool.prefill(shared.codec.as_ref()).await {
                    tracing::debug!(
                        endpoint = %node.endpoint(),
                        error = %err,
                        "prefill after revival failed"
                    );
                }
                shared.rebuild_ring();
            }
            Err(err) => {
                tracing::debug!(
                    endpoint = %node.endpoint(),
                    error = %err,
                    "revival probe failed"
                );
                node.defer_revival();
            }
        }
    }
}

/// One throwaway socket and a Version round-trip decide whether a dead
/// node is back.
async fn probe<C: Connection>(node: &Node<C>, codec: &dyn ProtocolCodec) -> Result<(), Error> {
    let mut socket = node.pool.open_socket(codec).await?;
    let response = socket
        .roundtrip(codec, &Operation::version(), node.pool.cfg.receive_timeout)
        .await?;
    response.error_for_status().map_err(Error::Status)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BinaryCodec;
    use async_trait::async_trait;

    struct UnreachableConn;

    #[async_trait]
    impl Connection for UnreachableConn {
        async fn connect(_endpoint: &str) -> Result<Self, Error> {
            Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )))
        }
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Error> {
            Ok(0)
        }
        async fn write(&mut self, _data: &[u8]) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn unreachable_nodes_start_dead() {
        tokio_test::block_on(async {
            let cluster: Cluster<UnreachableConn> = Cluster::connect(
                vec!["a:11211".into(), "b:11211".into()],
                None,
                SocketPoolConfig::default(),
                LocatorKind::ConsistentHash,
                Arc::new(BinaryCodec),
            )
            .await
            .unwrap();

            let err = cluster.execute(b"key", Operation::get(b"key".to_vec())).await;
            assert!(matches!(err, Err(Error::NoAvailableNode)));
            assert!(cluster.multi_get(vec![b"key".to_vec()]).await.is_empty());
        });
    }

    #[test]
    fn no_endpoints_is_an_error() {
        tokio_test::block_on(async {
            let result: Result<Cluster<UnreachableConn>, _> = Cluster::connect(
                vec![],
                None,
                SocketPoolConfig::default(),
                LocatorKind::ConsistentHash,
                Arc::new(BinaryCodec),
            )
            .await;
            assert!(matches!(result, Err(Error::NoAvailableNode)));
        });
    }
}
