//! Redis-backed coordination store shared by every worker process.
//!
//! Window ledgers are hashes `{count, end, blocked}` keyed `scope:<span>`. Every
//! read-modify-write runs inside one Lua script so concurrent permits against the
//! same scope are serialized by Redis.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tollgate_application::CoordinationStore;
use tollgate_core::{AppError, AppResult};
use tollgate_domain::{PermitRequest, RealignUpdate, ScopeKey};

const PERMIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local wait = 0
for index, key in ipairs(KEYS) do
  local max = tonumber(ARGV[index * 2])
  local fields = redis.call('HMGET', key, 'count', 'end', 'blocked')
  local count = tonumber(fields[1] or '0')
  local window_end = tonumber(fields[2] or '0')
  local blocked = tonumber(fields[3] or '0')
  if window_end > now and count >= max then
    wait = math.max(wait, window_end - now)
  end
  if blocked > now then
    wait = math.max(wait, blocked - now)
  end
end
if wait > 0 then
  return wait
end
for index, key in ipairs(KEYS) do
  local span = tonumber(ARGV[index * 2 + 1])
  local fields = redis.call('HMGET', key, 'end', 'blocked')
  local window_end = tonumber(fields[1] or '0')
  local blocked = tonumber(fields[2] or '0')
  if window_end > now then
    redis.call('HINCRBY', key, 'count', 1)
  else
    window_end = now + span
    redis.call('HSET', key, 'count', 1, 'end', window_end)
  end
  redis.call('PEXPIRE', key, math.max(window_end, blocked) - now)
end
return 0
"#;

const PSEUDO_PERMIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local span = tonumber(ARGV[2])
local window_end = tonumber(redis.call('HGET', KEYS[1], 'end') or '0')
if window_end > now then
  return 1
end
redis.call('HSET', KEYS[1], 'count', 1, 'end', now + span)
redis.call('PEXPIRE', KEYS[1], span)
return 0
"#;

const RELEASE_PLACEHOLDER_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1], KEYS[2])
  return 1
end
return 0
"#;

const REALIGN_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
local now = tonumber(ARGV[2])
local retry_at = tonumber(ARGV[3])
for index = 2, #KEYS do
  local key = KEYS[index]
  local base = 4 + (index - 2) * 3
  local observed = tonumber(ARGV[base])
  local span = tonumber(ARGV[base + 2])
  local fields = redis.call('HMGET', key, 'count', 'end', 'blocked')
  local count = tonumber(fields[1] or '0')
  local window_end = tonumber(fields[2] or '0')
  local blocked = tonumber(fields[3] or '0')
  if window_end > now then
    count = math.max(count, observed)
  else
    count = observed
    window_end = now + span
  end
  if retry_at > blocked then
    blocked = retry_at
  end
  redis.call('HSET', key, 'count', count, 'end', window_end, 'blocked', blocked)
  redis.call('PEXPIRE', key, math.max(window_end, blocked) - now)
end
return 0
"#;

/// Redis implementation of the coordination store port.
#[derive(Clone)]
pub struct RedisCoordinationStore {
    connection: ConnectionManager,
    permit_script: Script,
    pseudo_permit_script: Script,
    release_placeholder_script: Script,
    realign_script: Script,
}

impl RedisCoordinationStore {
    /// Creates a store on an established connection manager.
    #[must_use]
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            permit_script: Script::new(PERMIT_SCRIPT),
            pseudo_permit_script: Script::new(PSEUDO_PERMIT_SCRIPT),
            release_placeholder_script: Script::new(RELEASE_PLACEHOLDER_SCRIPT),
            realign_script: Script::new(REALIGN_SCRIPT),
        }
    }

    /// Connects to `redis_url` and creates a store.
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|error| AppError::Validation(format!("invalid redis url: {error}")))?;
        let connection = ConnectionManager::new(client).await.map_err(|error| {
            AppError::Unavailable(format!("failed to connect to redis: {error}"))
        })?;

        Ok(Self::new(connection))
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn create_scope_if_absent(
        &self,
        scope: &ScopeKey,
        value: &str,
        ttl: Duration,
    ) -> AppResult<bool> {
        let mut connection = self.connection.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(scope.as_str())
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to create scope '{scope}': {error}"))
            })?;

        Ok(created.is_some())
    }

    async fn get_scope(&self, scope: &ScopeKey) -> AppResult<Option<String>> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(scope.as_str()).await.map_err(|error| {
            AppError::Unavailable(format!("failed to read scope '{scope}': {error}"))
        })?;

        Ok(value)
    }

    async fn pseudo_permit(
        &self,
        window_key: &str,
        now_ms: i64,
        span_ms: i64,
    ) -> AppResult<bool> {
        let mut connection = self.connection.clone();
        let consumed: i64 = self
            .pseudo_permit_script
            .key(window_key)
            .arg(now_ms)
            .arg(span_ms)
            .invoke_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to run bootstrap permit on '{window_key}': {error}"
                ))
            })?;

        Ok(consumed == 1)
    }

    async fn release_placeholder(
        &self,
        scope: &ScopeKey,
        placeholder: &str,
        window_key: &str,
    ) -> AppResult<()> {
        let mut connection = self.connection.clone();
        self.release_placeholder_script
            .key(scope.as_str())
            .key(window_key)
            .arg(placeholder)
            .invoke_async::<i64>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to release placeholder of scope '{scope}': {error}"
                ))
            })?;

        Ok(())
    }

    async fn permit(&self, request: &PermitRequest) -> AppResult<Option<Duration>> {
        if request.windows.is_empty() {
            return Ok(None);
        }

        let mut invocation = self.permit_script.prepare_invoke();
        invocation.arg(request.timestamp_ms);
        for window in &request.windows {
            invocation
                .key(window.key.as_str())
                .arg(window.max)
                .arg(window.span_ms);
        }

        let mut connection = self.connection.clone();
        let wait_ms: i64 = invocation
            .invoke_async(&mut connection)
            .await
            .map_err(|error| AppError::Unavailable(format!("failed to run permit: {error}")))?;

        Ok((wait_ms > 0).then(|| Duration::from_millis(wait_ms.unsigned_abs())))
    }

    async fn realign(&self, update: &RealignUpdate) -> AppResult<()> {
        let mut invocation = self.realign_script.prepare_invoke();
        invocation
            .key(update.scope.as_str())
            .arg(update.limits.to_header_value())
            .arg(update.timestamp_ms)
            .arg(update.retry_at_ms.unwrap_or(0));
        for window in &update.windows {
            invocation
                .key(window.key.as_str())
                .arg(window.observed)
                .arg(window.max)
                .arg(window.span_ms);
        }

        let mut connection = self.connection.clone();
        invocation
            .invoke_async::<i64>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to realign scope '{}': {error}",
                    update.scope
                ))
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tollgate_application::CoordinationStore;
    use tollgate_domain::{PermitRequest, RealignUpdate, ScopeKey, ScopeLimits, WindowCount};

    use super::RedisCoordinationStore;

    async fn test_store() -> Option<RedisCoordinationStore> {
        let Ok(redis_url) = std::env::var("REDIS_URL") else {
            return None;
        };

        match RedisCoordinationStore::connect(redis_url.as_str()).await {
            Ok(store) => Some(store),
            Err(error) => panic!("failed to connect to REDIS_URL in test: {error}"),
        }
    }

    fn unique_scope() -> ScopeKey {
        ScopeKey::server(
            format!("tollgate-test-{}", uuid::Uuid::new_v4()).as_str(),
            "euw1",
        )
        .unwrap_or_else(|_| unreachable!())
    }

    #[tokio::test]
    async fn scope_is_created_only_once() {
        let Some(store) = test_store().await else {
            return;
        };
        let scope = unique_scope();

        let first = store
            .create_scope_if_absent(&scope, "1:10", Duration::from_secs(10))
            .await;
        let second = store
            .create_scope_if_absent(&scope, "1:10", Duration::from_secs(10))
            .await;

        assert!(matches!(first, Ok(true)));
        assert!(matches!(second, Ok(false)));
        assert_eq!(
            store.get_scope(&scope).await.unwrap_or_default().as_deref(),
            Some("1:10")
        );
    }

    #[tokio::test]
    async fn pseudo_permit_admits_a_single_probe() {
        let Some(store) = test_store().await else {
            return;
        };
        let window_key = unique_scope().window_key(10);

        let first = store.pseudo_permit(window_key.as_str(), 1_000, 10_000).await;
        let second = store.pseudo_permit(window_key.as_str(), 1_500, 10_000).await;

        assert!(matches!(first, Ok(false)));
        assert!(matches!(second, Ok(true)));
    }

    #[tokio::test]
    async fn placeholder_release_spares_published_limits() {
        let Some(store) = test_store().await else {
            return;
        };
        let probed = unique_scope();
        let published = unique_scope();
        let probed_window = probed.window_key(10);
        assert!(
            store
                .create_scope_if_absent(&probed, "1:10", Duration::from_secs(10))
                .await
                .is_ok()
        );
        assert!(
            store
                .pseudo_permit(probed_window.as_str(), 1_000, 10_000)
                .await
                .is_ok()
        );
        assert!(
            store
                .create_scope_if_absent(&published, "20:1", Duration::from_secs(10))
                .await
                .is_ok()
        );

        assert!(
            store
                .release_placeholder(&probed, "1:10", probed_window.as_str())
                .await
                .is_ok()
        );
        assert!(
            store
                .release_placeholder(&published, "1:10", published.window_key(10).as_str())
                .await
                .is_ok()
        );

        assert_eq!(store.get_scope(&probed).await.unwrap_or_default(), None);
        assert!(matches!(
            store.pseudo_permit(probed_window.as_str(), 1_500, 10_000).await,
            Ok(false)
        ));
        assert_eq!(
            store.get_scope(&published).await.unwrap_or_default().as_deref(),
            Some("20:1")
        );
    }

    #[tokio::test]
    async fn permit_blocks_once_a_window_is_full() {
        let Some(store) = test_store().await else {
            return;
        };
        let scope = unique_scope();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let limits = ScopeLimits::parse("3:1,100:120").unwrap_or_else(|_| unreachable!());
        let request = PermitRequest::for_scope(&scope, limits.windows(), now_ms);

        for _ in 0..3 {
            assert!(matches!(store.permit(&request).await, Ok(None)));
        }
        let blocked = store.permit(&request).await.unwrap_or_default();

        assert!(blocked.is_some_and(|wait| wait <= Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn realign_publishes_limits_and_honours_retry_at() {
        let Some(store) = test_store().await else {
            return;
        };
        let scope = unique_scope();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let limits = ScopeLimits::parse("20:1,100:120").unwrap_or_else(|_| unreachable!());
        let counts = WindowCount::parse_list("1:1,1:120").unwrap_or_default();
        let update = RealignUpdate::from_headers(
            &scope,
            limits.clone(),
            counts.as_slice(),
            0,
            now_ms,
            Some(now_ms + 5_000),
        )
        .unwrap_or_else(|_| unreachable!());

        assert!(store.realign(&update).await.is_ok());

        assert_eq!(
            store.get_scope(&scope).await.unwrap_or_default().as_deref(),
            Some("20:1,100:120")
        );
        let request = PermitRequest::for_scope(&scope, limits.windows(), now_ms + 10);
        let blocked = store.permit(&request).await.unwrap_or_default();
        assert_eq!(blocked, Some(Duration::from_millis(4_990)));
    }
}
