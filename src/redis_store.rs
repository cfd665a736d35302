use crate::{
    config::LockConfig,
    error::Result,
    lease::Lease,
    store::{KeyValueStore, StoreResult, SyncKeyValueStore},
};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Cmd};
use std::sync::Arc;
use tracing::info;

/// Async Redis backend. The connection manager reconnects on its own, so a
/// `RedisStore` can be cloned freely and shared between leases.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let store = Self::from_client(client).await?;
        info!("Connected to Redis at {}", url);
        Ok(store)
    }

    pub async fn from_client(client: Client) -> Result<Self> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

fn set_cmd(key: &str, value: &str, ttl_seconds: u64, only_if_absent: bool) -> Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value).arg("EX").arg(ttl_seconds);
    if only_if_absent {
        cmd.arg("NX");
    }
    cmd
}

fn expire_cmd(key: &str, ttl_seconds: u64) -> Cmd {
    let mut cmd = redis::cmd("EXPIRE");
    cmd.arg(key).arg(ttl_seconds);
    cmd
}

fn delete_cmd(key: &str) -> Cmd {
    let mut cmd = redis::cmd("DEL");
    cmd.arg(key);
    cmd
}

fn exists_cmd(key: &str) -> Cmd {
    let mut cmd = redis::cmd("EXISTS");
    cmd.arg(key);
    cmd
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        // SET replies OK when written and nil when NX refused the write
        let reply: Option<String> = set_cmd(key, value, ttl_seconds, only_if_absent)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = expire_cmd(key, ttl_seconds).query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = delete_cmd(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let count: i64 = exists_cmd(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }
}

// Synchronous client, one connection per call. Meant to sit behind
// `Blocking` for callers that cannot hold an async connection.
impl SyncKeyValueStore for Client {
    fn set(&self, key: &str, value: &str, ttl_seconds: u64, only_if_absent: bool)
        -> StoreResult<bool> {
        let mut conn = self.get_connection()?;
        let reply: Option<String> = set_cmd(key, value, ttl_seconds, only_if_absent).query(&mut conn)?;
        Ok(reply.is_some())
    }

    fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()> {
        let mut conn = self.get_connection()?;
        let _: i64 = expire_cmd(key, ttl_seconds).query(&mut conn)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.get_connection()?;
        let _: i64 = delete_cmd(key).query(&mut conn)?;
        Ok(())
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.get_connection()?;
        let count: i64 = exists_cmd(key).query(&mut conn)?;
        Ok(count > 0)
    }
}

impl Lease<RedisStore> {
    /// Connects to the Redis instance named in `config` and builds a lease on
    /// `key` with the configured timings.
    pub async fn connect(key: impl Into<String>, config: &LockConfig) -> Result<Self> {
        let store = RedisStore::connect(&config.redis_url).await?;
        Lease::from_config(key, Arc::new(store), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(cmd: &Cmd) -> String {
        String::from_utf8(cmd.get_packed_command()).unwrap()
    }

    // RESP array of bulk strings, the wire form redis-rs writes for a command
    fn resp(parts: &[&str]) -> String {
        let mut out = format!("*{}\r\n", parts.len());
        for part in parts {
            out.push_str(&format!("${}\r\n{}\r\n", part.len(), part));
        }
        out
    }

    #[test]
    fn test_set_command_shape() {
        assert_eq!(
            packed(&set_cmd("jobs", "True", 8, true)),
            resp(&["SET", "jobs", "True", "EX", "8", "NX"])
        );
        assert_eq!(
            packed(&set_cmd("jobs", "True", 8, false)),
            resp(&["SET", "jobs", "True", "EX", "8"])
        );
    }

    #[test]
    fn test_other_command_shapes() {
        assert_eq!(packed(&expire_cmd("jobs", 4)), resp(&["EXPIRE", "jobs", "4"]));
        assert_eq!(packed(&delete_cmd("jobs")), resp(&["DEL", "jobs"]));
        assert_eq!(packed(&exists_cmd("jobs")), resp(&["EXISTS", "jobs"]));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = RedisStore::connect("not a url").await;
        assert!(matches!(result, Err(crate::error::LockError::Store(_))));
    }
}
