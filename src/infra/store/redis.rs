//! Redis-backed reservation store shared across processes.
//!
//! Layout under the configured prefix:
//!
//! | Key | Type | Member / field | Score |
//! |-----|------|----------------|-------|
//! | `{prefix}:reservations` | ZSET | `worker:nonce` | scheduled ms |
//! | `{prefix}:active` | ZSET | `id:worker` | start ms |
//! | `{prefix}:token_usage` | ZSET | `nonce:tokens` | completion ms |
//! | `{prefix}:token_reservations` | ZSET | `nonce:tokens` | scheduled ms |
//! | `{prefix}:worker_fairness` | ZSET | `worker:bucket:nonce` | reservation ms |
//! | `{prefix}:metrics` | HASH | counters | |
//!
//! Every key carries a TTL, so a crashed deployment cleans itself up. The
//! plan-and-commit of `reserve` runs as one Lua script; the other operations
//! are single `MULTI` pipelines.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::slot::{
    COUNTER_TTL_MS, FAIRNESS_BUCKET_MS, FAIRNESS_TTL_MS, RESERVATION_TTL_MS, TOKEN_TTL_MS,
    WINDOW_MS,
};
use crate::core::{
    ActiveRequest, MetricsCounters, ReservationStore, ReserveOutcome, ReserveRequest,
    SchedulerError, SlotPolicy, TokenHandle, TokenUsageEntry, WindowSnapshot,
};

/// Mirrors `core::slot::plan_slot` and commits the result.
///
/// KEYS: reservations, token_reservations, token_usage, worker_fairness, metrics.
/// Returns `{scheduled_ms, estimated_tokens, penalized}`.
const RESERVE_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local worker = ARGV[2]
local nonce = ARGV[3]
local est = tonumber(ARGV[4])
local safe_rpm = tonumber(ARGV[5])
local safe_tpm = tonumber(ARGV[6])
local spacing = tonumber(ARGV[7])
local penalty = tonumber(ARGV[8])
local scale = tonumber(ARGV[9])
local window = tonumber(ARGV[10])
local res_ttl = tonumber(ARGV[11])
local tok_ttl = tonumber(ARGV[12])
local fair_ttl = tonumber(ARGV[13])
local counter_ttl = tonumber(ARGV[14])
local bucket_ms = tonumber(ARGV[15])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. (now - res_ttl))
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', '(' .. (now - tok_ttl))
redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', '(' .. (now - tok_ttl))
redis.call('ZREMRANGEBYSCORE', KEYS[4], '-inf', '(' .. (now - fair_ttl))

if est < 1 then est = 1 end
if est > safe_tpm then est = safe_tpm end

local times = {}
local rows = redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')
for i = 2, #rows, 2 do times[#times + 1] = tonumber(rows[i]) end

local tokens = {}
for _, key in ipairs({KEYS[2], KEYS[3]}) do
  local entries = redis.call('ZRANGE', key, 0, -1, 'WITHSCORES')
  for i = 1, #entries, 2 do
    local amount = tonumber(string.match(entries[i], ':(%d+)$')) or 0
    tokens[#tokens + 1] = {tonumber(entries[i + 1]), amount}
  end
end

table.sort(tokens, function(a, b) return a[1] < b[1] end)

local bucket = math.floor(now / bucket_ms)
local prefix = worker .. ':' .. bucket .. ':'
local in_bucket = false
for _, m in ipairs(redis.call('ZRANGE', KEYS[4], 0, -1)) do
  if string.sub(m, 1, #prefix) == prefix then in_bucket = true end
end

local function upto(t)
  local n = 0
  for _, r in ipairs(times) do
    if r <= t then n = n + 1 else break end
  end
  return n
end

local function token_window(t_end)
  local used = 0
  local earliest = nil
  for _, t in ipairs(tokens) do
    if t[1] > t_end then break end
    if t[1] + window > t_end then
      used = used + t[2]
      if earliest == nil then earliest = t[1] end
    end
  end
  return used, earliest
end

local function count_window(t_end)
  local lo = 0
  for _, r in ipairs(times) do
    if r + window <= t_end then lo = lo + 1 else break end
  end
  local hi = upto(t_end)
  return lo, hi
end

local c = now
local before = upto(now)
if before > 0 and times[before] + spacing > c then c = times[before] + spacing end

local max_passes = 4 * (#times + #tokens) + 16
local passes = 0
local penalized = 0
while true do
  passes = passes + 1
  if passes > max_passes then
    local last = 0
    if #times > 0 then last = times[#times] end
    for _, t in ipairs(tokens) do if t[1] > last then last = t[1] end end
    if last + window + spacing > c then c = last + window + spacing end
    break
  end
  local start = c

  local moved = true
  while moved do
    moved = false
    for _, r in ipairs(times) do
      if r + spacing > c and r < c + spacing then
        c = r + spacing
        moved = true
        break
      end
    end
  end

  local lo, hi = count_window(c)
  if hi - lo >= safe_rpm then
    c = times[hi - safe_rpm + 1] + window
  else
    for i = hi + 1, #times do
      local r = times[i]
      if r >= c + window then break end
      local l2, h2 = count_window(r)
      if h2 - l2 >= safe_rpm then
        c = r + spacing
        break
      end
    end
  end

  if c == start then
    local used, earliest = token_window(c)
    if used + est > safe_tpm then
      local overshoot = used + est - safe_tpm
      local window_delay = 0
      if earliest ~= nil and earliest + window > c then window_delay = earliest + window - c end
      local proportional = math.floor(overshoot / safe_tpm * window * scale)
      if proportional < spacing then proportional = spacing end
      if window_delay > proportional then c = c + window_delay else c = c + proportional end
    else
      for _, t in ipairs(tokens) do
        if t[1] >= c + window then break end
        if t[1] > c and token_window(t[1]) + est > safe_tpm then
          c = t[1] + 1
          break
        end
      end
    end
  end

  if c == start then
    if in_bucket and penalized == 0 then
      penalized = 1
      c = c + penalty
    else
      break
    end
  end
end

redis.call('ZADD', KEYS[1], c, worker .. ':' .. nonce)
redis.call('ZADD', KEYS[2], c, nonce .. ':' .. string.format('%d', est))
redis.call('ZADD', KEYS[4], now, prefix .. nonce)
redis.call('HINCRBY', KEYS[5], 'total_reservations', 1)
redis.call('PEXPIRE', KEYS[1], res_ttl)
redis.call('PEXPIRE', KEYS[2], res_ttl)
redis.call('PEXPIRE', KEYS[4], fair_ttl)
redis.call('PEXPIRE', KEYS[5], counter_ttl)
return {c, est, penalized}
";

/// Reservation store on a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    keys: Arc<StoreKeys>,
    reserve_script: Arc<Script>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.keys.prefix)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct StoreKeys {
    prefix: String,
    reservations: String,
    active: String,
    token_usage: String,
    token_reservations: String,
    worker_fairness: String,
    metrics: String,
}

impl StoreKeys {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            reservations: format!("{prefix}:reservations"),
            active: format!("{prefix}:active"),
            token_usage: format!("{prefix}:token_usage"),
            token_reservations: format!("{prefix}:token_reservations"),
            worker_fairness: format!("{prefix}:worker_fairness"),
            metrics: format!("{prefix}:metrics"),
        }
    }
}

/// Maps a Redis error; replies that fail to decode are backend errors.
fn unavailable(op: &str) -> impl Fn(redis::RedisError) -> SchedulerError + '_ {
    move |e| match e.kind() {
        redis::ErrorKind::TypeError => SchedulerError::Backend(format!("{op} returned an unexpected reply: {e}")),
        _ => SchedulerError::StoreUnavailable(format!("{op} failed: {e}")),
    }
}

/// The reservation is already committed when the follow-up read runs, so a
/// failed read degrades to empty windows instead of failing the grant.
fn snapshot_or_empty(now_ms: u64, result: Result<WindowSnapshot, SchedulerError>) -> WindowSnapshot {
    result.unwrap_or_else(|e| {
        warn!(error = %e, "window snapshot after reserve failed");
        WindowSnapshot {
            now_ms,
            ..WindowSnapshot::default()
        }
    })
}

fn ttl(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Exclusive lower bound for a `ZREMRANGEBYSCORE` prune.
fn expired_before(now: u64, ttl: u64) -> String {
    format!("({}", now.saturating_sub(ttl))
}

impl RedisStore {
    /// Connect to `url` and use `prefix` for every key.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, SchedulerError> {
        let client = redis::Client::open(url)
            .map_err(|e| SchedulerError::StoreUnavailable(format!("failed to open Redis client: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable("connect"))?;
        debug!(prefix, "connected reservation store to redis");
        Ok(Self {
            conn,
            keys: Arc::new(StoreKeys::new(prefix)),
            reserve_script: Arc::new(Script::new(RESERVE_SCRIPT)),
        })
    }

    async fn read_counters(&self, conn: &mut MultiplexedConnection) -> Result<MetricsCounters, SchedulerError> {
        let (total, confirmed, accuracy, usage): (Option<u64>, Option<u64>, Option<u64>, Option<u64>) =
            redis::cmd("HMGET")
                .arg(&self.keys.metrics)
                .arg("total_reservations")
                .arg("confirmed_requests")
                .arg("total_accuracy_ms")
                .arg("total_usage_tokens")
                .query_async(conn)
                .await
                .map_err(unavailable("HMGET metrics"))?;
        Ok(MetricsCounters {
            total_reservations: total.unwrap_or(0),
            confirmed_requests: confirmed.unwrap_or(0),
            total_accuracy_ms: accuracy.unwrap_or(0),
            total_usage_tokens: usage.unwrap_or(0),
        })
    }
}

fn sum_tokens(members: &[String]) -> u64 {
    members
        .iter()
        .filter_map(|m| m.rsplit_once(':').and_then(|(_, n)| n.parse::<u64>().ok()))
        .sum()
}

#[async_trait]
impl ReservationStore for RedisStore {
    async fn reserve(
        &self,
        policy: &SlotPolicy,
        request: ReserveRequest,
    ) -> Result<ReserveOutcome, SchedulerError> {
        let mut conn = self.conn.clone();
        let k = &self.keys;
        let (scheduled_ms, estimated_tokens, penalized): (u64, u64, u8) = self
            .reserve_script
            .key(&k.reservations)
            .key(&k.token_reservations)
            .key(&k.token_usage)
            .key(&k.worker_fairness)
            .key(&k.metrics)
            .arg(request.now_ms)
            .arg(&request.worker_id)
            .arg(&request.nonce)
            .arg(request.estimated_tokens)
            .arg(policy.safe_rpm)
            .arg(policy.safe_tpm)
            .arg(policy.min_spacing_ms)
            .arg(policy.worker_slot_penalty_ms)
            .arg(policy.tpm_backoff_scale)
            .arg(WINDOW_MS)
            .arg(RESERVATION_TTL_MS)
            .arg(TOKEN_TTL_MS)
            .arg(FAIRNESS_TTL_MS)
            .arg(COUNTER_TTL_MS)
            .arg(FAIRNESS_BUCKET_MS)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable("reserve script"))?;

        let snapshot = snapshot_or_empty(request.now_ms, self.snapshot(request.now_ms).await);
        Ok(ReserveOutcome {
            scheduled_ms,
            handle: TokenHandle {
                nonce: request.nonce,
                scheduled_ms,
                estimated_tokens,
            },
            penalized: penalized != 0,
            snapshot,
        })
    }

    async fn confirm(&self, active: ActiveRequest, accuracy_ms: u64) -> Result<(), SchedulerError> {
        let mut conn = self.conn.clone();
        let k = &self.keys;
        let now = active.started_at_ms;
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&k.active)
            .arg("-inf")
            .arg(expired_before(now, RESERVATION_TTL_MS))
            .ignore()
            .zadd(&k.active, format!("{}:{}", active.id, active.worker_id), now)
            .ignore()
            .pexpire(&k.active, ttl(RESERVATION_TTL_MS))
            .ignore()
            .hincr(&k.metrics, "confirmed_requests", 1)
            .ignore()
            .hincr(&k.metrics, "total_accuracy_ms", accuracy_ms)
            .ignore()
            .pexpire(&k.metrics, ttl(COUNTER_TTL_MS))
            .ignore()
            .query_async(&mut conn)
            .await;
        result.map_err(unavailable("confirm"))
    }

    async fn complete(&self, id: &str, _now_ms: u64) -> Result<bool, SchedulerError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrange(&self.keys.active, 0, -1)
            .await
            .map_err(unavailable("ZRANGE active"))?;
        let prefix = format!("{id}:");
        let Some(member) = members.into_iter().find(|m| m.starts_with(&prefix)) else {
            return Ok(false);
        };
        let removed: u64 = conn
            .zrem(&self.keys.active, member)
            .await
            .map_err(unavailable("ZREM active"))?;
        Ok(removed > 0)
    }

    async fn record_usage(&self, entry: TokenUsageEntry) -> Result<(), SchedulerError> {
        let mut conn = self.conn.clone();
        let k = &self.keys;
        let now = entry.timestamp_ms;
        let member = format!("{}:{}", Uuid::new_v4(), entry.token_count);
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&k.token_usage)
            .arg("-inf")
            .arg(expired_before(now, TOKEN_TTL_MS))
            .ignore()
            .zadd(&k.token_usage, member, now)
            .ignore()
            .pexpire(&k.token_usage, ttl(RESERVATION_TTL_MS))
            .ignore()
            .hincr(&k.metrics, "total_usage_tokens", entry.token_count)
            .ignore()
            .pexpire(&k.metrics, ttl(COUNTER_TTL_MS))
            .ignore()
            .query_async(&mut conn)
            .await;
        result.map_err(unavailable("record usage"))
    }

    async fn release_tokens(&self, handle: &TokenHandle, _now_ms: u64) -> Result<bool, SchedulerError> {
        let mut conn = self.conn.clone();
        let member = format!("{}:{}", handle.nonce, handle.estimated_tokens);
        let removed: u64 = conn
            .zrem(&self.keys.token_reservations, member)
            .await
            .map_err(unavailable("ZREM token_reservations"))?;
        Ok(removed > 0)
    }

    async fn snapshot(&self, now_ms: u64) -> Result<WindowSnapshot, SchedulerError> {
        let mut conn = self.conn.clone();
        let k = &self.keys;
        let floor = expired_before(now_ms, WINDOW_MS);
        let (rpm_current, usage, holds, active): (u64, Vec<String>, Vec<String>, u64) = redis::pipe()
            .cmd("ZCOUNT")
            .arg(&k.reservations)
            .arg(&floor)
            .arg(now_ms)
            .cmd("ZRANGEBYSCORE")
            .arg(&k.token_usage)
            .arg(&floor)
            .arg(now_ms)
            .cmd("ZRANGEBYSCORE")
            .arg(&k.token_reservations)
            .arg(expired_before(now_ms, TOKEN_TTL_MS + 1))
            .arg("+inf")
            .cmd("ZCOUNT")
            .arg(&k.active)
            .arg(expired_before(now_ms, RESERVATION_TTL_MS + 1))
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .map_err(unavailable("snapshot"))?;
        let counters = self.read_counters(&mut conn).await?;
        Ok(WindowSnapshot {
            now_ms,
            rpm_current,
            tpm_used: sum_tokens(&usage),
            tpm_reserved: sum_tokens(&holds),
            active_requests: active,
            counters,
        })
    }

    async fn reset(&self) -> Result<(), SchedulerError> {
        let mut conn = self.conn.clone();
        let k = &self.keys;
        let all = vec![
            k.reservations.as_str(),
            k.active.as_str(),
            k.token_usage.as_str(),
            k.token_reservations.as_str(),
            k.worker_fairness.as_str(),
            k.metrics.as_str(),
        ];
        let result: redis::RedisResult<()> = conn.del(all).await;
        result.map_err(unavailable("reset"))
    }
}
