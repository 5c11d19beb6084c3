//! The high-level client used to communicate with a memcached cluster.
//! Regardless of the transport underneath, every operation follows the
//! same path: transform the key, pick a node, borrow a pooled socket, run
//! one protocol exchange, and shape the reply into a [`CacheResult`].

use async_trait::async_trait;
use deadpool::managed::{self, RecycleError, RecycleResult};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::{Duration, SystemTime};

use crate::cluster::Cluster;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::Error;
use crate::keys::KeyTransform;
use crate::protocol::{Opcode, Operation, Response, Status};
use crate::transcode::{DefaultTranscoder, Payload, Transcoder};

/// Durations at or under thirty days travel as relative seconds; anything
/// longer must be sent as an absolute unix timestamp.
const RELATIVE_LIMIT_SECS: u64 = 60 * 60 * 24 * 30;

/// When to expire a stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// Keep the item until the server evicts it.
    #[default]
    Never,
    /// Expire after a duration. Must be at least one second.
    Relative(Duration),
    /// Expire at an absolute time. Must be in the future.
    At(SystemTime),
}

impl Expiration {
    pub fn seconds(secs: u32) -> Self {
        Expiration::Relative(Duration::from_secs(secs as u64))
    }

    /// Convert to the wire encoding: 0 for never, relative seconds within
    /// the thirty-day window, epoch seconds beyond it.
    pub(crate) fn normalize(self, now: SystemTime) -> Result<u32, Error> {
        match self {
            Expiration::Never => Ok(0),
            Expiration::Relative(duration) => {
                let secs = duration.as_secs();
                if secs == 0 {
                    return Err(Error::InvalidExpiration);
                }
                if secs <= RELATIVE_LIMIT_SECS {
                    Ok(secs as u32)
                } else {
                    let at = now
                        .checked_add(duration)
                        .ok_or(Error::InvalidExpiration)?;
                    epoch_secs(at)
                }
            }
            Expiration::At(at) => {
                let until = at
                    .duration_since(now)
                    .map_err(|_| Error::InvalidExpiration)?;
                if until.as_secs() == 0 {
                    return Err(Error::InvalidExpiration);
                }
                if until.as_secs() <= RELATIVE_LIMIT_SECS {
                    Ok(until.as_secs() as u32)
                } else {
                    epoch_secs(at)
                }
            }
        }
    }
}

fn epoch_secs(at: SystemTime) -> Result<u32, Error> {
    let secs = at
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|_| Error::InvalidExpiration)?
        .as_secs();
    u32::try_from(secs).map_err(|_| Error::InvalidExpiration)
}

/// How a store call treats existing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store only if the key does not exist; `KeyExists` otherwise.
    Add,
    /// Store only if the key exists; `KeyNotFound` otherwise.
    Replace,
    /// Store unconditionally.
    Set,
}

impl StoreMode {
    fn opcode(self) -> Opcode {
        match self {
            StoreMode::Add => Opcode::Add,
            StoreMode::Replace => Opcode::Replace,
            StoreMode::Set => Opcode::Set,
        }
    }
}

/// What a counter operation does when the key is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterPolicy {
    /// Seed the counter with `initial` and the given expiration.
    Initialize { initial: u64, expire: Expiration },
    /// Fail with `KeyNotFound` instead of seeding.
    FailIfAbsent,
}

impl CounterPolicy {
    fn wire(self, now: SystemTime) -> Result<(u64, u32), Error> {
        match self {
            CounterPolicy::Initialize { initial, expire } => {
                Ok((initial, expire.normalize(now)?))
            }
            CounterPolicy::FailIfAbsent => Ok((0, 0xffff_ffff)),
        }
    }
}

/// A value paired with the cas token it was read under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasValue<V> {
    pub value: V,
    pub cas: u64,
}

/// The outcome of one client operation. Server replies carry their status
/// code verbatim in `status_code`; failures that never reached a server
/// carry the local [`Error`] instead.
#[derive(Debug)]
pub struct CacheResult<T> {
    pub success: bool,
    pub value: Option<T>,
    pub cas: u64,
    pub status_code: Option<u16>,
    pub message: Option<String>,
    pub error: Option<Error>,
}

impl<T> CacheResult<T> {
    fn hit(value: T, cas: u64) -> Self {
        Self {
            success: true,
            value: Some(value),
            cas,
            status_code: Some(Status::NoError.code()),
            message: None,
            error: None,
        }
    }

    fn status(status: Status, cas: u64) -> Self {
        Self {
            success: false,
            value: None,
            cas,
            status_code: Some(status.code()),
            message: Some(status.to_string()),
            error: None,
        }
    }

    fn local(error: Error) -> Self {
        Self {
            success: false,
            value: None,
            cas: 0,
            status_code: None,
            message: Some(error.to_string()),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Whether the server answered `KeyNotFound`: a plain miss.
    pub fn is_miss(&self) -> bool {
        self.status_code == Some(Status::KeyNotFound.code())
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

/// A client for a memcached cluster. Cheap to clone; clones share the
/// same nodes, socket pools, and locator.
pub struct Client<C: Connection, T: Transcoder = DefaultTranscoder> {
    cluster: Cluster<C>,
    transcoder: T,
    keys: KeyTransform,
}

impl<C: Connection, T: Transcoder> Clone for Client<C, T> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            transcoder: self.transcoder.clone(),
            keys: self.keys.clone(),
        }
    }
}

impl<C: Connection, T: Transcoder> Client<C, T> {
    /// Connect to every configured server and build the first ring.
    /// Unreachable servers start out dead and are probed in the
    /// background until they come back.
    pub async fn connect(config: ClientConfig<T>) -> Result<Self, Error> {
        let ClientConfig {
            servers,
            socket_pool,
            authentication,
            key_transform,
            node_locator,
            transcoder,
            protocol,
        } = config;
        let cluster =
            Cluster::connect(servers, authentication, socket_pool, node_locator, protocol)
                .await?;
        Ok(Self {
            cluster,
            transcoder,
            keys: key_transform,
        })
    }

    /// Get a single value. A miss reports `KeyNotFound` with no value.
    pub async fn get<K: AsRef<[u8]>, V: DeserializeOwned>(&self, key: K) -> CacheResult<V> {
        match self.fetch(key.as_ref()).await {
            Ok(response) => self.shape_value(response),
            Err(err) => CacheResult::local(err),
        }
    }

    /// Get a value together with its cas token for a later [`Client::cas`].
    pub async fn get_with_cas<K: AsRef<[u8]>, V: DeserializeOwned>(
        &self,
        key: K,
    ) -> CacheResult<CasValue<V>> {
        let result = self.get(key).await;
        let cas = result.cas;
        CacheResult {
            success: result.success,
            value: result.value.map(|value| CasValue { value, cas }),
            cas,
            status_code: result.status_code,
            message: result.message,
            error: result.error,
        }
    }

    /// Get the stored payload without decoding it. This is the escape
    /// hatch when a typed `get` reports a transcoder mismatch.
    pub async fn get_raw<K: AsRef<[u8]>>(&self, key: K) -> CacheResult<Payload> {
        match self.fetch(key.as_ref()).await {
            Ok(response) => {
                if let Err(status) = response.error_for_status() {
                    return CacheResult::status(status, response.cas);
                }
                let cas = response.cas;
                let flags = response.flags();
                CacheResult::hit(Payload::new(flags, response.value), cas)
            }
            Err(err) => CacheResult::local(err),
        }
    }

    /// Get many values in one round of per-node pipelines. Keys that are
    /// not present, routed to a dead node, or fail to decode are simply
    /// absent from the result.
    pub async fn multi_get<K: AsRef<[u8]>, V: DeserializeOwned>(
        &self,
        keys: &[K],
    ) -> HashMap<Vec<u8>, V> {
        self.multi_get_with_cas(keys)
            .await
            .into_iter()
            .map(|(key, entry)| (key, entry.value))
            .collect()
    }

    /// [`Client::multi_get`], with each hit's cas token.
    pub async fn multi_get_with_cas<K: AsRef<[u8]>, V: DeserializeOwned>(
        &self,
        keys: &[K],
    ) -> HashMap<Vec<u8>, CasValue<V>> {
        let mut wire_keys = Vec::with_capacity(keys.len());
        let mut original: HashMap<Vec<u8>, Vec<u8>> = HashMap::with_capacity(keys.len());
        for key in keys {
            let app = key.as_ref();
            match self.keys.apply(app) {
                Ok(wire) => {
                    if original.insert(wire.clone(), app.to_vec()).is_none() {
                        wire_keys.push(wire);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping invalid key in multi-get");
                }
            }
        }

        let hits = self.cluster.multi_get(wire_keys).await;
        let mut out = HashMap::with_capacity(hits.len());
        for (wire, response) in hits {
            let Some(app_key) = original.get(&wire) else {
                continue;
            };
            let cas = response.cas;
            let flags = response.flags();
            let payload = Payload::new(flags, response.value);
            match self.transcoder.decode::<V>(&payload) {
                Ok(value) => {
                    out.insert(app_key.clone(), CasValue { value, cas });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping undecodable multi-get value");
                }
            }
        }
        out
    }

    /// Store a value under the given mode.
    pub async fn store<K: AsRef<[u8]>, V: Serialize + ?Sized>(
        &self,
        mode: StoreMode,
        key: K,
        value: &V,
        expiration: Expiration,
    ) -> CacheResult<()> {
        self.shape_unit(
            self.store_inner(mode, key.as_ref(), value, expiration, 0)
                .await,
        )
    }

    /// Store a value only if the key's cas token still matches; a stale
    /// token fails with `KeyExists`.
    pub async fn cas<K: AsRef<[u8]>, V: Serialize + ?Sized>(
        &self,
        mode: StoreMode,
        key: K,
        value: &V,
        cas: u64,
        expiration: Expiration,
    ) -> CacheResult<()> {
        self.shape_unit(
            self.store_inner(mode, key.as_ref(), value, expiration, cas)
                .await,
        )
    }

    /// Shorthand for `store(StoreMode::Add, ..)`.
    pub async fn add<K: AsRef<[u8]>, V: Serialize + ?Sized>(
        &self,
        key: K,
        value: &V,
        expiration: Expiration,
    ) -> CacheResult<()> {
        self.store(StoreMode::Add, key, value, expiration).await
    }

    /// Shorthand for `store(StoreMode::Replace, ..)`.
    pub async fn replace<K: AsRef<[u8]>, V: Serialize + ?Sized>(
        &self,
        key: K,
        value: &V,
        expiration: Expiration,
    ) -> CacheResult<()> {
        self.store(StoreMode::Replace, key, value, expiration).await
    }

    /// Append raw bytes to a stored item's payload.
    pub async fn append<K: AsRef<[u8]>>(&self, key: K, data: &[u8]) -> CacheResult<()> {
        self.shape_unit(self.concat(Opcode::Append, key.as_ref(), data).await)
    }

    /// Prepend raw bytes to a stored item's payload.
    pub async fn prepend<K: AsRef<[u8]>>(&self, key: K, data: &[u8]) -> CacheResult<()> {
        self.shape_unit(self.concat(Opcode::Prepend, key.as_ref(), data).await)
    }

    /// Add `delta` to a counter, returning the new value.
    pub async fn increment<K: AsRef<[u8]>>(
        &self,
        key: K,
        delta: u64,
        policy: CounterPolicy,
    ) -> CacheResult<u64> {
        match self
            .counter(Opcode::Increment, key.as_ref(), delta, policy)
            .await
        {
            Ok(response) => self.shape_counter(response),
            Err(err) => CacheResult::local(err),
        }
    }

    /// Subtract `delta` from a counter, returning the new value. Counters
    /// floor at zero rather than wrapping.
    pub async fn decrement<K: AsRef<[u8]>>(
        &self,
        key: K,
        delta: u64,
        policy: CounterPolicy,
    ) -> CacheResult<u64> {
        match self
            .counter(Opcode::Decrement, key.as_ref(), delta, policy)
            .await
        {
            Ok(response) => self.shape_counter(response),
            Err(err) => CacheResult::local(err),
        }
    }

    /// Delete a key. Deleting an absent key reports `KeyNotFound`.
    pub async fn remove<K: AsRef<[u8]>>(&self, key: K) -> CacheResult<()> {
        let result = match self.keys.apply(key.as_ref()) {
            Ok(wire) => {
                self.cluster
                    .execute(&wire, Operation::delete(wire.clone()))
                    .await
            }
            Err(err) => Err(err.into()),
        };
        self.shape_unit(result)
    }

    /// Drop every item on every alive node immediately.
    pub async fn flush(&self) -> CacheResult<()> {
        self.shape_broadcast(self.cluster.broadcast(Operation::flush(None)).await)
    }

    /// Drop every item on every alive node after a delay.
    pub async fn flush_after(&self, delay: Duration) -> CacheResult<()> {
        let expire = match Expiration::Relative(delay).normalize(SystemTime::now()) {
            Ok(expire) => expire,
            Err(err) => return CacheResult::local(err),
        };
        self.shape_broadcast(
            self.cluster
                .broadcast(Operation::flush(Some(expire)))
                .await,
        )
    }

    /// Collect server statistics, keyed by endpoint. The result fails if
    /// any alive node could not be read, but still carries the statistics
    /// that were collected.
    pub async fn stats(&self) -> CacheResult<HashMap<String, HashMap<String, String>>> {
        let mut collected = HashMap::new();
        let mut failures = Vec::new();
        for (endpoint, result) in self.cluster.stats().await {
            match result {
                Ok(stats) => {
                    collected.insert(endpoint, stats);
                }
                Err(err) => failures.push(format!("{}: {}", endpoint, err)),
            }
        }
        if collected.is_empty() && failures.is_empty() {
            return CacheResult::local(Error::NoAvailableNode);
        }
        CacheResult {
            success: failures.is_empty(),
            value: Some(collected),
            cas: 0,
            status_code: None,
            message: if failures.is_empty() {
                None
            } else {
                Some(failures.join("; "))
            },
            error: None,
        }
    }

    /// Version-ping every alive node. Used by pooled clients to verify a
    /// client before reuse.
    pub async fn keep_alive(&self) -> Result<(), Error> {
        self.cluster.ping().await
    }

    async fn fetch(&self, key: &[u8]) -> Result<Response, Error> {
        let wire = self.keys.apply(key)?;
        self.cluster.execute(&wire, Operation::get(wire.clone())).await
    }

    async fn store_inner<V: Serialize + ?Sized>(
        &self,
        mode: StoreMode,
        key: &[u8],
        value: &V,
        expiration: Expiration,
        cas: u64,
    ) -> Result<Response, Error> {
        let expire = expiration.normalize(SystemTime::now())?;
        let payload = self.transcoder.encode(value)?;
        let wire = self.keys.apply(key)?;
        let op = Operation::store(
            mode.opcode(),
            wire.clone(),
            payload.data,
            payload.flags,
            expire,
            cas,
        );
        self.cluster.execute(&wire, op).await
    }

    async fn concat(&self, opcode: Opcode, key: &[u8], data: &[u8]) -> Result<Response, Error> {
        let wire = self.keys.apply(key)?;
        let op = Operation::concat(opcode, wire.clone(), data.to_vec());
        self.cluster.execute(&wire, op).await
    }

    async fn counter(
        &self,
        opcode: Opcode,
        key: &[u8],
        delta: u64,
        policy: CounterPolicy,
    ) -> Result<Response, Error> {
        let (initial, expire) = policy.wire(SystemTime::now())?;
        let wire = self.keys.apply(key)?;
        let op = Operation::counter(opcode, wire.clone(), delta, initial, expire);
        self.cluster.execute(&wire, op).await
    }

    fn shape_value<V: DeserializeOwned>(&self, response: Response) -> CacheResult<V> {
        if let Err(status) = response.error_for_status() {
            return CacheResult::status(status, response.cas);
        }
        let cas = response.cas;
        let flags = response.flags();
        let payload = Payload::new(flags, response.value);
        match self.transcoder.decode(&payload) {
            Ok(value) => CacheResult::hit(value, cas),
            Err(err) => {
                let mut result = CacheResult::local(err.into());
                result.cas = cas;
                result.status_code = Some(Status::NoError.code());
                result
            }
        }
    }

    fn shape_counter(&self, response: Response) -> CacheResult<u64> {
        if let Err(status) = response.error_for_status() {
            return CacheResult::status(status, response.cas);
        }
        match response.counter_value() {
            Ok(value) => CacheResult::hit(value, response.cas),
            Err(err) => CacheResult::local(err.into()),
        }
    }

    fn shape_unit(&self, result: Result<Response, Error>) -> CacheResult<()> {
        match result {
            Ok(response) => match response.error_for_status() {
                Ok(()) => CacheResult::hit((), response.cas),
                Err(status) => CacheResult::status(status, response.cas),
            },
            Err(err) => CacheResult::local(err),
        }
    }

    fn shape_broadcast(
        &self,
        results: Vec<(String, Result<Response, Error>)>,
    ) -> CacheResult<()> {
        if results.is_empty() {
            return CacheResult::local(Error::NoAvailableNode);
        }
        let mut failures = Vec::new();
        for (endpoint, result) in results {
            match result {
                Ok(response) => {
                    if let Err(status) = response.error_for_status() {
                        failures.push(format!("{}: {}", endpoint, status));
                    }
                }
                Err(err) => failures.push(format!("{}: {}", endpoint, err)),
            }
        }
        if failures.is_empty() {
            CacheResult::hit((), 0)
        } else {
            CacheResult {
                success: false,
                value: None,
                cas: 0,
                status_code: None,
                message: Some(failures.join("; ")),
                error: None,
            }
        }
    }
}

/// Manages pooled clients: each pool slot is a whole [`Client`] with its
/// own sockets, verified with a version ping before reuse.
pub struct ClientManager<C: Connection, T: Transcoder = DefaultTranscoder> {
    config: ClientConfig<T>,
    _conn: PhantomData<fn() -> C>,
}

impl<C: Connection, T: Transcoder> ClientManager<C, T> {
    pub fn new(config: ClientConfig<T>) -> Self {
        Self {
            config,
            _conn: PhantomData,
        }
    }
}

#[async_trait]
impl<C: Connection, T: Transcoder> managed::Manager for ClientManager<C, T> {
    type Type = Client<C, T>;
    type Error = Error;

    async fn create(&self) -> Result<Client<C, T>, Error> {
        let client = Client::connect(self.config.clone()).await?;
        client.keep_alive().await?;
        Ok(client)
    }

    async fn recycle(&self, client: &mut Client<C, T>) -> RecycleResult<Error> {
        client.keep_alive().await.map_err(RecycleError::Backend)?;
        Ok(())
    }
}

/// A pool of clients. Recommended for best throughput: it amortizes TCP
/// connection setup while bounding the total number of clients alive.
pub type Pool<C, T = DefaultTranscoder> = managed::Pool<ClientManager<C, T>>;
