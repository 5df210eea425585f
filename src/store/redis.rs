//! The networked Redis store.

use std::collections::HashMap;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};

use super::{StoreError, StoreUrl};

//----------- RedisStore -------------------------------------------------------

/// A store backed by a Redis server.
///
/// All operations share one multiplexed connection; the server persists
/// per its own policy, so `save` has nothing to do here.
#[derive(Clone)]
pub struct RedisStore {
    /// The shared connection.
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the server named by a URL.
    pub async fn connect(url: &StoreUrl) -> Result<Self, StoreError> {
        let info = connection_info(url);
        let client = redis::Client::open(info)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { conn })
    }

    /// Look up a key.
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    /// Create or overwrite a key.
    pub async fn update(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    /// Delete a key.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Visit every entry and collect the keys accepted by the predicate.
    ///
    /// Drives the server-side SCAN cursor; values are fetched one GET at a
    /// time.  A key deleted between the SCAN and its GET is skipped.
    pub async fn scan<F>(&self, pred: F) -> Result<Vec<String>, StoreError>
    where
        F: Fn(&str, &str) -> bool,
    {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(512)
                .query_async(&mut conn)
                .await?;
            for key in batch {
                let value: Option<String> = conn.get(&key).await?;
                if let Some(value) = value {
                    if pred(&key, &value) {
                        keys.push(key);
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// Fetch the members of a list, for whitelist sources.
    pub async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(members)
    }

    /// Fetch a hash as a field map, for whitelist sources.
    pub async fn hash(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }
}

/// Translate a parsed store URL into Redis connection parameters.
fn connection_info(url: &StoreUrl) -> ConnectionInfo {
    let (addr, db, username, password) = match url {
        StoreUrl::RedisTcp {
            host,
            port,
            db,
            username,
            password,
        } => (
            ConnectionAddr::Tcp(host.clone(), *port),
            *db,
            username.clone(),
            password.clone(),
        ),
        StoreUrl::RedisUnix {
            path,
            db,
            username,
            password,
        } => (
            ConnectionAddr::Unix(path.clone().into_std_path_buf()),
            *db,
            username.clone(),
            password.clone(),
        ),
        StoreUrl::Sled { .. } | StoreUrl::File { .. } => {
            unreachable!("only Redis URLs reach the Redis backend")
        }
    };

    ConnectionInfo {
        addr,
        redis: RedisConnectionInfo {
            db,
            username,
            password,
            ..Default::default()
        },
    }
}
