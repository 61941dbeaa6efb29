use std::fmt::Debug;

use async_trait::async_trait;
use redis::{
    aio::MultiplexedConnection, cluster::ClusterClientBuilder, cluster_async::ClusterConnection,
    AsyncCommands, Client, RedisResult,
};

/// Configuration for a connection to the Redis data plane.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The nodes to use to connect to the Redis cluster or instance.
    pub nodes: Vec<String>,
    /// The password to use to connect to the Redis cluster or instance.
    pub password: Option<String>,
    /// Whether to use cluster mode for the Redis connection.
    pub cluster_mode: bool,
}

/// The subset of Redis operations used by the message bus.
///
/// All coordination between the deliverer, the relay and agent worker
/// instances goes through these operations, there is no other shared state.
/// Implemented by [`ConnectionWrapper`] for real Redis deployments and by
/// [`crate::memory::InMemoryBus`] for tests and local development.
#[async_trait]
pub trait BusConnection: Send + Sync + Debug {
    /// Checks that the backing store is reachable.
    /// [Redis Docs](https://redis.io/commands/PING)
    async fn ping(&mut self) -> RedisResult<()>;

    /// Pops the head of a list, blocking for up to `timeout_ms` milliseconds
    /// when the list is empty.
    /// [Redis Docs](https://redis.io/commands/BLPOP)
    async fn blpop(&mut self, key: &str, timeout_ms: u64) -> RedisResult<Option<String>>;

    /// Pushes a value onto the tail of a list.
    /// [Redis Docs](https://redis.io/commands/RPUSH)
    async fn rpush(&mut self, key: &str, value: &str) -> RedisResult<()>;

    /// Adds a member to a sorted set with the given score.
    /// [Redis Docs](https://redis.io/commands/ZADD)
    async fn zadd(&mut self, key: &str, member: &str, score: u64) -> RedisResult<()>;

    /// Returns up to `count` members with a score between zero and
    /// `max_score` inclusive, lowest scores first.
    /// [Redis Docs](https://redis.io/commands/ZRANGEBYSCORE)
    async fn zrangebyscore(
        &mut self,
        key: &str,
        max_score: u64,
        count: usize,
    ) -> RedisResult<Vec<String>>;

    /// Removes a member from a sorted set, returning the number of members
    /// removed. A zero result means another process claimed the member.
    /// [Redis Docs](https://redis.io/commands/ZREM)
    async fn zrem(&mut self, key: &str, member: &str) -> RedisResult<usize>;

    /// Gets the value of a hash field.
    /// [Redis Docs](https://redis.io/commands/HGET)
    async fn hget(&mut self, key: &str, field: &str) -> RedisResult<Option<String>>;

    /// Sets a hash field to the given value.
    /// [Redis Docs](https://redis.io/commands/HSET)
    async fn hset(&mut self, key: &str, field: &str, value: &str) -> RedisResult<()>;

    /// Deletes a hash field.
    /// [Redis Docs](https://redis.io/commands/HDEL)
    async fn hdel(&mut self, key: &str, field: &str) -> RedisResult<()>;

    /// Returns all field names of a hash.
    /// [Redis Docs](https://redis.io/commands/HKEYS)
    async fn hkeys(&mut self, key: &str) -> RedisResult<Vec<String>>;

    /// Returns whether a hash field exists.
    /// [Redis Docs](https://redis.io/commands/HEXISTS)
    async fn hexists(&mut self, key: &str, field: &str) -> RedisResult<bool>;

    /// Atomically increments a hash field by `delta`, returning the new
    /// value. A missing field is treated as zero.
    /// [Redis Docs](https://redis.io/commands/HINCRBY)
    async fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> RedisResult<i64>;

    /// Gets the value of a key.
    /// [Redis Docs](https://redis.io/commands/GET)
    async fn get(&mut self, key: &str) -> RedisResult<Option<String>>;

    /// Sets the value of a key.
    /// [Redis Docs](https://redis.io/commands/SET)
    async fn set(&mut self, key: &str, value: &str) -> RedisResult<()>;

    /// Clones the connection, this will usually be a shallow clone that
    /// shares the underlying multiplexed connection.
    fn clone_connection(&self) -> Box<dyn BusConnection>;
}

impl Clone for Box<dyn BusConnection> {
    fn clone(&self) -> Self {
        self.clone_connection()
    }
}

/// A wrapper around a Redis connection that provides a unified interface
/// for both single node and cluster mode connections for the subset of
/// Redis commands used by the message bus.
pub enum ConnectionWrapper {
    Cluster(ClusterConnection),
    SingleNode(MultiplexedConnection),
}

impl Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionWrapper::Cluster(_) => write!(f, "ConnectionWrapper::Cluster"),
            ConnectionWrapper::SingleNode(_) => write!(f, "ConnectionWrapper::SingleNode"),
        }
    }
}

impl Clone for ConnectionWrapper {
    fn clone(&self) -> Self {
        match self {
            ConnectionWrapper::Cluster(conn) => ConnectionWrapper::Cluster(conn.clone()),
            ConnectionWrapper::SingleNode(conn) => ConnectionWrapper::SingleNode(conn.clone()),
        }
    }
}

#[async_trait]
impl BusConnection for ConnectionWrapper {
    async fn ping(&mut self) -> RedisResult<()> {
        let cmd = redis::cmd("PING");
        let _: String = match self {
            ConnectionWrapper::Cluster(conn) => cmd.query_async(conn).await?,
            ConnectionWrapper::SingleNode(conn) => cmd.query_async(conn).await?,
        };
        Ok(())
    }

    async fn blpop(&mut self, key: &str, timeout_ms: u64) -> RedisResult<Option<String>> {
        let timeout_secs = timeout_ms as f64 / 1000.0;
        let popped: Option<(String, String)> = match self {
            ConnectionWrapper::Cluster(conn) => conn.blpop(key, timeout_secs).await?,
            ConnectionWrapper::SingleNode(conn) => conn.blpop(key, timeout_secs).await?,
        };
        Ok(popped.map(|(_, value)| value))
    }

    async fn rpush(&mut self, key: &str, value: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.rpush(key, value).await,
            ConnectionWrapper::SingleNode(conn) => conn.rpush(key, value).await,
        }
    }

    async fn zadd(&mut self, key: &str, member: &str, score: u64) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.zadd(key, member, score).await,
            ConnectionWrapper::SingleNode(conn) => conn.zadd(key, member, score).await,
        }
    }

    async fn zrangebyscore(
        &mut self,
        key: &str,
        max_score: u64,
        count: usize,
    ) -> RedisResult<Vec<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.zrangebyscore_limit(key, 0, max_score, 0, count as isize)
                    .await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.zrangebyscore_limit(key, 0, max_score, 0, count as isize)
                    .await
            }
        }
    }

    async fn zrem(&mut self, key: &str, member: &str) -> RedisResult<usize> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.zrem(key, member).await,
            ConnectionWrapper::SingleNode(conn) => conn.zrem(key, member).await,
        }
    }

    async fn hget(&mut self, key: &str, field: &str) -> RedisResult<Option<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.hget(key, field).await,
            ConnectionWrapper::SingleNode(conn) => conn.hget(key, field).await,
        }
    }

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.hset(key, field, value).await,
            ConnectionWrapper::SingleNode(conn) => conn.hset(key, field, value).await,
        }
    }

    async fn hdel(&mut self, key: &str, field: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.hdel(key, field).await,
            ConnectionWrapper::SingleNode(conn) => conn.hdel(key, field).await,
        }
    }

    async fn hkeys(&mut self, key: &str) -> RedisResult<Vec<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.hkeys(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.hkeys(key).await,
        }
    }

    async fn hexists(&mut self, key: &str, field: &str) -> RedisResult<bool> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.hexists(key, field).await,
            ConnectionWrapper::SingleNode(conn) => conn.hexists(key, field).await,
        }
    }

    async fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> RedisResult<i64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.hincr(key, field, delta).await,
            ConnectionWrapper::SingleNode(conn) => conn.hincr(key, field, delta).await,
        }
    }

    async fn get(&mut self, key: &str) -> RedisResult<Option<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.get(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.get(key).await,
        }
    }

    async fn set(&mut self, key: &str, value: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.set(key, value).await,
            ConnectionWrapper::SingleNode(conn) => conn.set(key, value).await,
        }
    }

    fn clone_connection(&self) -> Box<dyn BusConnection> {
        Box::new(self.clone())
    }
}

/// Creates a connection to a Redis cluster or instance.
///
/// In cluster mode the configured nodes are passed to the cluster client
/// builder, otherwise a multiplexed connection is opened against the first
/// node.
pub async fn get_redis_connection(conn_config: &ConnectionConfig) -> RedisResult<ConnectionWrapper> {
    if !conn_config.cluster_mode {
        let client = Client::open(conn_config.nodes[0].clone())?;
        return Ok(ConnectionWrapper::SingleNode(
            client.get_multiplexed_async_connection().await?,
        ));
    }

    let mut builder = ClusterClientBuilder::new(conn_config.nodes.clone());
    if let Some(password) = conn_config.password.clone() {
        builder = builder.password(password);
    }

    let client = builder.build()?;
    Ok(ConnectionWrapper::Cluster(
        client.get_async_connection().await?,
    ))
}
