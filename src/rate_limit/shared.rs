//! Redis sliding-window backend shared by every gateway instance.
//!
//! One sorted set per key, scored by hit time in milliseconds. The Lua
//! script prunes, counts and conditionally records in a single round trip,
//! so concurrent instances never over-admit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use uuid::Uuid;

use super::backend::{CountingBackend, WindowCount, window_ms};
use crate::clock::{Clock, system_clock};
use crate::config::RedisConfig;
use crate::error::{PipError, Result};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};

const SLIDING_WINDOW_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now, member)
  count = count + 1
  admitted = 1
end
redis.call('PEXPIRE', key, window)

local oldest = -1
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if first[2] then
  oldest = tonumber(first[2])
end
return {admitted, count, oldest}
";

/// Sliding-window counter stored in Redis.
#[derive(Clone)]
pub struct SharedBackend {
    connection: ConnectionManager,
    script: Arc<Script>,
    command_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl SharedBackend {
    /// Open a managed connection to `config.url`.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let connection = open_connection(config).await?;
        Ok(Self::from_connection(
            connection,
            Duration::from_millis(config.command_timeout_ms),
        ))
    }

    /// Wrap an existing connection, e.g. one shared by several limiters.
    pub fn from_connection(connection: ConnectionManager, command_timeout: Duration) -> Self {
        Self {
            connection,
            script: Arc::new(Script::new(SLIDING_WINDOW_SCRIPT)),
            command_timeout,
            clock: system_clock(),
        }
    }

    /// Use `clock` for scores and expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl CountingBackend for SharedBackend {
    async fn hit(&self, key: &str, limit: u32, window: Duration) -> Result<WindowCount> {
        let now_ms = self.clock.now_ms();
        let member = format!("{now_ms}-{}", Uuid::new_v4().simple());
        let mut connection = self.connection.clone();

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(key)
            .arg(now_ms)
            .arg(window_ms(window))
            .arg(limit)
            .arg(member);

        let (admitted, count, oldest): (i64, i64, i64) =
            tokio::time::timeout(self.command_timeout, invocation.invoke_async(&mut connection))
                .await
                .map_err(|_| {
                    PipError::cache(format!(
                        "redis sliding window timed out after {} ms",
                        self.command_timeout.as_millis()
                    ))
                })?
                .map_err(|e| PipError::cache_with_source("redis sliding window failed", e))?;

        Ok(WindowCount {
            admitted: admitted == 1,
            count: u32::try_from(count).unwrap_or(u32::MAX),
            oldest_ms: (oldest >= 0).then_some(oldest),
            now_ms,
        })
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}

/// Connect to redis, logging the target with credentials hidden.
async fn open_connection(config: &RedisConfig) -> Result<ConnectionManager> {
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::SharedBackend,
        "connect_redis",
        "connecting to redis",
        url = %redacted_url(&config.url)
    );

    let client = Client::open(config.url.as_str())
        .map_err(|e| PipError::cache_with_source("failed to create redis client", e))?;
    let connection = ConnectionManager::new(client)
        .await
        .map_err(|e| PipError::cache_with_source("failed to connect to redis", e))?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::SharedBackend,
        "redis_connected",
        "redis connection established"
    );
    Ok(connection)
}

fn redacted_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
