//! Tokio TCP transport for `memring-core`. This crate contributes exactly
//! one thing: a [`Connection`] backed by `tokio::net::TcpStream`. Pooling,
//! health, hashing, and the protocol all live in the core.

use async_trait::async_trait;
use memring_core::{Connection, Error as CoreError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

pub use memring_core::{
    AuthConfig, CacheResult, CasValue, ClientConfig, ClientManager, CounterPolicy, Expiration,
    KeyTransform, LocatorKind, SocketPoolConfig, StoreMode,
};
#[cfg(feature = "zlib")]
pub use memring_core::transcode::zlib::ZlibTranscoder;

/// A client running on tokio TCP connections.
pub type Client<T = memring_core::DefaultTranscoder> =
    memring_core::Client<TokioConnection, T>;

/// A pool of tokio-backed clients. For example:
///
/// ```ignore
/// use memring_tokio::{ClientManager, ClientConfig, Pool};
///
/// let cfg = ClientConfig::new(vec!["localhost:11211".into()]);
/// let pool = Pool::builder(ClientManager::new(cfg)).max_size(16).build()?;
/// ```
pub type Pool<T = memring_core::DefaultTranscoder> =
    memring_core::Pool<TokioConnection, T>;

/// A TCP stream to one memcached server. The endpoint is resolved on
/// every connect, so DNS changes apply whenever the pool opens a socket.
#[derive(Debug)]
pub struct TokioConnection {
    stream: TcpStream,
}

#[async_trait]
impl Connection for TokioConnection {
    async fn connect(endpoint: &str) -> Result<Self, CoreError> {
        let stream = TcpStream::connect(endpoint).await?;
        // Requests are small; waiting to coalesce them only adds latency.
        stream.set_nodelay(true)?;
        Ok(TokioConnection { stream })
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, CoreError> {
        Ok(self.stream.read(buf).await?)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), CoreError> {
        Ok(self.stream.write_all(data).await?)
    }
}

#[cfg(test)]
mod test {
    use futures::Future;
    use rand::prelude::*;
    use serde_derive::{Deserialize, Serialize};
    use std::{collections::HashMap, process::Command, time::Duration};

    use super::*;

    /// Throwaway memcached containers addressed through the same endpoint
    /// strings the client is configured with. Containers run detached and
    /// are force-removed on drop; readiness is probed with the crate's own
    /// transport instead of watching server logs.
    struct TestCluster {
        containers: Vec<String>,
        endpoints: Vec<String>,
    }

    impl TestCluster {
        /// Start `count` servers on random host ports and wait until each
        /// accepts a [`TokioConnection`].
        fn spawn(count: usize) -> Self {
            let mut rng = rand::thread_rng();
            let mut containers = Vec::with_capacity(count);
            let mut endpoints = Vec::with_capacity(count);
            for _ in 0..count {
                let port: u16 = rng.gen_range(20000..60000);
                let output = Command::new("docker")
                    .args([
                        "run",
                        "--rm",
                        "-d",
                        "-p",
                        &format!("{}:11211", port),
                        "memcached",
                    ])
                    .output()
                    .unwrap();
                assert!(
                    output.status.success(),
                    "docker run failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
                containers.push(String::from_utf8(output.stdout).unwrap().trim().to_string());
                endpoints.push(format!("127.0.0.1:{}", port));
            }

            let cluster = Self {
                containers,
                endpoints,
            };
            cluster.wait_until_reachable();
            cluster
        }

        /// A config pointed at every container in this cluster.
        fn config(&self) -> ClientConfig {
            ClientConfig::new(self.endpoints.clone())
        }

        fn wait_until_reachable(&self) {
            tokio_test::block_on(async {
                for endpoint in &self.endpoints {
                    for attempt in 0.. {
                        match TokioConnection::connect(endpoint).await {
                            Ok(_) => break,
                            Err(_) if attempt < 50 => {
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                            Err(err) => {
                                panic!("memcached at {} never came up: {}", endpoint, err)
                            }
                        }
                    }
                }
            });
        }

        fn run<F: Future>(&self, call: F) {
            tokio_test::block_on(call);
        }
    }

    impl Drop for TestCluster {
        fn drop(&mut self) {
            for id in &self.containers {
                // --rm containers clean themselves up once killed.
                let _ = Command::new("docker").args(["rm", "-f", id]).output();
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        field_a: String,
        field_b: String,
        field_c: i64,
        field_d: bool,
    }

    #[test]
    fn test_connect() {
        let cluster = TestCluster::spawn(1);
        cluster.run(async {
            TokioConnection::connect(&cluster.endpoints[0]).await.unwrap();
        })
    }

    async fn exercise<T: memring_core::Transcoder>(client: &Client<T>) {
        // Store modes against a fresh key.
        assert!(client
            .store(StoreMode::Set, "VALUE", "1", Expiration::Never)
            .await
            .success);
        assert!(!client.add("VALUE", "2", Expiration::Never).await.success);
        assert_eq!(
            Some("1".to_string()),
            client.get::<_, String>("VALUE").await.into_value()
        );
        assert!(client.replace("VALUE", "4", Expiration::Never).await.success);
        assert_eq!(
            Some("4".to_string()),
            client.get::<_, String>("VALUE").await.into_value()
        );
        assert!(client.remove("VALUE").await.success);
        assert!(!client.replace("VALUE", "8", Expiration::Never).await.success);
        assert!(client.add("VALUE", "16", Expiration::Never).await.success);

        // CAS tokens.
        let first = client.store(StoreMode::Set, "cas_key", "a", Expiration::Never).await;
        let second = client.store(StoreMode::Set, "cas_key", "b", Expiration::Never).await;
        assert_ne!(first.cas, second.cas);
        assert!(!client
            .cas(StoreMode::Set, "cas_key", "c", first.cas, Expiration::Never)
            .await
            .success);
        assert!(client
            .cas(StoreMode::Set, "cas_key", "c", second.cas, Expiration::Never)
            .await
            .success);

        // Counters seed with the initial value and then apply deltas.
        let initial = 5_600_000_001_234u64;
        client.remove("counter").await;
        let seeded = client
            .increment(
                "counter",
                2,
                CounterPolicy::Initialize {
                    initial,
                    expire: Expiration::Never,
                },
            )
            .await;
        assert_eq!(Some(initial), seeded.into_value());
        let bumped = client
            .increment(
                "counter",
                24,
                CounterPolicy::Initialize {
                    initial: 10,
                    expire: Expiration::Never,
                },
            )
            .await;
        assert_eq!(Some(initial + 24), bumped.into_value());

        // Typed values round-trip.
        let record = Record {
            field_a: "Hello".into(),
            field_b: "World".into(),
            field_c: 19810619,
            field_d: true,
        };
        client
            .store(StoreMode::Set, "record", &record, Expiration::Never)
            .await;
        assert_eq!(
            Some(record),
            client.get::<_, Record>("record").await.into_value()
        );
        client
            .store(StoreMode::Set, "TestLong", &65432123456i64, Expiration::Never)
            .await;
        assert_eq!(
            Some(65432123456i64),
            client.get::<_, i64>("TestLong").await.into_value()
        );

        // A 200 KiB deterministic buffer survives byte for byte.
        let blob: Vec<u8> = (0..200 * 1024).map(|i| (i % 256) as u8).collect();
        client
            .store(StoreMode::Set, "blob", &blob, Expiration::Never)
            .await;
        assert_eq!(Some(blob), client.get::<_, Vec<u8>>("blob").await.into_value());

        // Multi-get over 100 keys, with cas tokens.
        let keys: Vec<String> = (0..100).map(|i| format!("bulk{}", i)).collect();
        for (i, key) in keys.iter().enumerate() {
            assert!(client
                .store(StoreMode::Set, key, &(i as i32), Expiration::Never)
                .await
                .success);
        }
        let found: HashMap<_, _> = client.multi_get::<_, i32>(&keys).await;
        assert_eq!(100, found.len());
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(Some(&(i as i32)), found.get(key.as_bytes()));
        }
        let with_cas = client.multi_get_with_cas::<_, i32>(&keys).await;
        assert!(with_cas.values().all(|entry| entry.cas != 0));

        // Misses are absent from multi-get results, not errors.
        let mixed = vec!["bulk0".to_string(), "never_stored".to_string()];
        assert_eq!(1, client.multi_get::<_, i32>(&mixed).await.len());

        // Stats respond per endpoint.
        let stats = client.stats().await;
        assert!(stats.success);
        assert!(stats
            .into_value()
            .unwrap()
            .values()
            .all(|stats| stats.contains_key("version")));
    }

    #[test]
    fn test_single_server() {
        let cluster = TestCluster::spawn(1);
        cluster.run(async {
            let pool = Pool::builder(ClientManager::new(cluster.config()))
                .max_size(16)
                .build()
                .unwrap();
            let client = pool.get().await.unwrap();
            exercise(&client).await;
        });
    }

    #[test]
    fn test_expiration() {
        let cluster = TestCluster::spawn(1);
        cluster.run(async {
            let client = Client::connect(cluster.config()).await.unwrap();

            let record = Record {
                field_a: "Hello".into(),
                field_b: "World".into(),
                field_c: 19810619,
                field_d: true,
            };
            assert!(client
                .store(
                    StoreMode::Set,
                    "Hello_World",
                    &record,
                    Expiration::seconds(5),
                )
                .await
                .success);
            assert_eq!(
                Some(record),
                client.get::<_, Record>("Hello_World").await.into_value()
            );

            tokio::time::sleep(Duration::from_secs(8)).await;
            assert!(client.get::<_, Record>("Hello_World").await.is_miss());
        });
    }

    #[test]
    fn test_cluster() {
        let cluster = TestCluster::spawn(3);
        cluster.run(async {
            let cfg = cluster.config().with_transcoder(ZlibTranscoder::default());
            let pool = Pool::builder(ClientManager::new(cfg))
                .max_size(16)
                .build()
                .unwrap();
            let client = pool.get().await.unwrap();
            exercise(&client).await;

            // Flush wipes every node.
            assert!(client.flush().await.success);
            assert!(client.get::<_, i32>("bulk0").await.is_miss());
        });
    }
}
