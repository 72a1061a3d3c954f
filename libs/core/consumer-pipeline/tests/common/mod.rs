//! Redis container shared by the integration tests

use redis::aio::ConnectionManager;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Throwaway Redis; the container is removed when this is dropped.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    pub url: String,
}

impl TestRedis {
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        Self {
            container,
            url: format!("redis://127.0.0.1:{}", port),
        }
    }

    /// A fresh connection manager, as each consumer process would hold
    pub async fn connection(&self) -> ConnectionManager {
        let client = redis::Client::open(self.url.as_str()).expect("Failed to create Redis client");
        ConnectionManager::new(client)
            .await
            .expect("Failed to create ConnectionManager")
    }
}

/// Ids still pending in `group` on `stream`
pub async fn pending_ids(conn: &mut ConnectionManager, stream: &str, group: &str) -> Vec<String> {
    let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
        .arg(stream)
        .arg(group)
        .arg("-")
        .arg("+")
        .arg(100)
        .query_async(conn)
        .await
        .expect("XPENDING failed");
    pending.into_iter().map(|(id, _, _, _)| id).collect()
}

/// Every entry on `stream` as (id, field/value pairs)
pub async fn stream_entries(
    conn: &mut ConnectionManager,
    stream: &str,
) -> Vec<(String, Vec<(String, String)>)> {
    redis::cmd("XRANGE")
        .arg(stream)
        .arg("-")
        .arg("+")
        .query_async(conn)
        .await
        .expect("XRANGE failed")
}

/// Poll `condition` every 50ms for up to 10s
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    condition()
}
