use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::clock::SharedClock;
use crate::error::{AppError, Result};
use crate::models::client::Role;
use crate::models::pairing::{MatchRecord, PairingEntry};
use crate::repositories::pairing_store::*;

/// KEYS: pool, entries, state, timeout.
/// ARGV: client_id, entry_json, score_ms, timeout_secs, force, role, state_ttl_secs.
const JOIN_SCRIPT: &str = r#"
local holder = redis.call('HGET', KEYS[3], ARGV[6])
local status = redis.call('HGET', KEYS[3], ARGV[6] .. ':status')
local replaced = ''
if holder and status == 'waiting' and redis.call('GET', KEYS[4]) == holder then
  if holder ~= ARGV[1] then
    if ARGV[5] ~= '1' then
      return {'conflict', holder}
    end
    replaced = holder
  end
end
if holder then
  redis.call('ZREM', KEYS[1], holder)
  redis.call('HDEL', KEYS[2], holder)
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[6], ARGV[1], ARGV[6] .. ':status', 'waiting')
redis.call('HDEL', KEYS[3], ARGV[6] .. ':pair')
redis.call('EXPIRE', KEYS[3], ARGV[7])
redis.call('SET', KEYS[4], ARGV[1], 'EX', ARGV[4])
return {'joined', replaced}
"#;

/// KEYS: opposite pool, opposite entries, own pool, own entries, state, new match record.
/// ARGV: user_id, role, opposite role, client_id, pair_id, now_ms, record_ttl_secs,
/// timeout prefix, matched prefix.
const MATCH_SCRIPT: &str = r#"
local own_status = redis.call('HGET', KEYS[5], ARGV[2] .. ':status')
local own_holder = redis.call('HGET', KEYS[5], ARGV[2])
if own_status == 'matched' and own_holder == ARGV[4] then
  local pair = redis.call('HGET', KEYS[5], ARGV[2] .. ':pair')
  if pair then
    local existing = redis.call('GET', ARGV[9] .. pair)
    if existing then
      return {'matched', existing}
    end
  end
end
if own_holder ~= ARGV[4] or own_status ~= 'waiting'
  or redis.call('GET', ARGV[8] .. ARGV[1] .. ':' .. ARGV[2]) ~= ARGV[4]
  or not redis.call('ZSCORE', KEYS[3], ARGV[4]) then
  return {'not_waiting', ''}
end

local live = 0
for _, cid in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
  local raw = redis.call('HGET', KEYS[2], cid)
  if not raw then
    redis.call('ZREM', KEYS[1], cid)
  else
    local entry = cjson.decode(raw)
    local marker = redis.call('GET', ARGV[8] .. entry.user_id .. ':' .. ARGV[3])
    if marker == cid then
      if entry.user_id == ARGV[1] then
        local card, pos = ARGV[4], cid
        if ARGV[2] == 'pos-end' then
          card, pos = cid, ARGV[4]
        end
        local record = cjson.encode({
          pair_id = ARGV[5],
          user_id = ARGV[1],
          card_end_client = card,
          pos_end_client = pos,
          matched_at_ms = tonumber(ARGV[6]),
        })
        redis.call('SET', KEYS[6], record, 'EX', ARGV[7])
        redis.call('ZREM', KEYS[1], cid)
        redis.call('HDEL', KEYS[2], cid)
        redis.call('ZREM', KEYS[3], ARGV[4])
        redis.call('HDEL', KEYS[4], ARGV[4])
        redis.call('HSET', KEYS[5],
          ARGV[2] .. ':status', 'matched', ARGV[2] .. ':pair', ARGV[5],
          ARGV[3], cid, ARGV[3] .. ':status', 'matched', ARGV[3] .. ':pair', ARGV[5])
        redis.call('DEL', ARGV[8] .. ARGV[1] .. ':' .. ARGV[2], ARGV[8] .. ARGV[1] .. ':' .. ARGV[3])
        redis.call('EXPIRE', KEYS[5], ARGV[7])
        return {'matched', record}
      end
      live = live + 1
    end
  end
end
return {'waiting', tostring(live)}
"#;

/// KEYS: pool, entries, state, timeout. ARGV: role, only_client ('' for any).
const CANCEL_SCRIPT: &str = r#"
local holder = redis.call('HGET', KEYS[3], ARGV[1])
if not holder then
  return false
end
if ARGV[2] ~= '' and ARGV[2] ~= holder then
  return false
end
local status = redis.call('HGET', KEYS[3], ARGV[1] .. ':status')
local live = status == 'waiting' and redis.call('GET', KEYS[4]) == holder
local removed = redis.call('ZREM', KEYS[1], holder)
redis.call('HDEL', KEYS[2], holder)
redis.call('HDEL', KEYS[3], ARGV[1], ARGV[1] .. ':status', ARGV[1] .. ':pair')
redis.call('DEL', KEYS[4])
if live and removed == 1 then
  return holder
end
return false
"#;

/// KEYS: card-end pool, card-end entries, pos-end pool, pos-end entries.
/// ARGV: timeout prefix, state prefix, status ttl secs, 'card-end', 'pos-end'.
const SWEEP_SCRIPT: &str = r#"
local expired = {}
local roles = {{KEYS[1], KEYS[2], ARGV[4]}, {KEYS[3], KEYS[4], ARGV[5]}}
for _, r in ipairs(roles) do
  for _, cid in ipairs(redis.call('ZRANGE', r[1], 0, -1)) do
    local raw = redis.call('HGET', r[2], cid)
    if not raw then
      redis.call('ZREM', r[1], cid)
    else
      local entry = cjson.decode(raw)
      if redis.call('GET', ARGV[1] .. entry.user_id .. ':' .. r[3]) ~= cid then
        redis.call('ZREM', r[1], cid)
        redis.call('HDEL', r[2], cid)
        local state = ARGV[2] .. entry.user_id
        if redis.call('HGET', state, r[3]) == cid then
          redis.call('HSET', state, r[3] .. ':status', 'timeout')
          redis.call('EXPIRE', state, ARGV[3])
        end
        table.insert(expired, raw)
      end
    end
  end
end
return expired
"#;

/// KEYS: pool, entries. ARGV: timeout prefix, role.
const LIVE_COUNT_SCRIPT: &str = r#"
local live = 0
for _, cid in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
  local raw = redis.call('HGET', KEYS[2], cid)
  if raw then
    local entry = cjson.decode(raw)
    if redis.call('GET', ARGV[1] .. entry.user_id .. ':' .. ARGV[2]) == cid then
      live = live + 1
    end
  end
end
return live
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Pairing store on Redis. Each multi-key mutation is one Lua script.
#[derive(Clone)]
pub struct RedisPairingStore {
    redis: ConnectionManager,
    clock: SharedClock,
    join_script: Script,
    match_script: Script,
    cancel_script: Script,
    sweep_script: Script,
    live_count_script: Script,
    release_script: Script,
}

impl RedisPairingStore {
    /// Creates a new `RedisPairingStore`.
    ///
    /// # Arguments
    ///
    /// * `redis` - The pooled Redis connection.
    /// * `clock` - Supplies join scores and match timestamps.
    pub fn new(redis: ConnectionManager, clock: SharedClock) -> Self {
        Self {
            redis,
            clock,
            join_script: Script::new(JOIN_SCRIPT),
            match_script: Script::new(MATCH_SCRIPT),
            cancel_script: Script::new(CANCEL_SCRIPT),
            sweep_script: Script::new(SWEEP_SCRIPT),
            live_count_script: Script::new(LIVE_COUNT_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    /// Entries in `role`'s queue whose timeout marker is still theirs.
    async fn live_count(&self, role: Role) -> Result<u64> {
        let live: u64 = self
            .live_count_script
            .key(pool_key(role))
            .key(entries_key(role))
            .arg(TIMEOUT_PREFIX)
            .arg(role.as_str())
            .invoke_async(&mut self.redis.clone())
            .await?;
        Ok(live)
    }
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> AppError {
    AppError::Internal(format!("Corrupt {} in pairing store: {}", what, e))
}

#[async_trait]
impl PairingStore for RedisPairingStore {
    async fn join(&self, entry: &PairingEntry, timeout: Duration, force: bool) -> Result<JoinOutcome> {
        let payload = sonic_rs::to_string(entry)?;
        let reply: Vec<String> = self
            .join_script
            .key(pool_key(entry.role))
            .key(entries_key(entry.role))
            .key(state_key(&entry.user_id))
            .key(timeout_key(&entry.user_id, entry.role))
            .arg(&entry.client_id)
            .arg(payload)
            .arg(entry.joined_at.timestamp_millis())
            .arg(timeout.as_secs().max(1))
            .arg(if force { "1" } else { "0" })
            .arg(entry.role.as_str())
            .arg((timeout + STATE_MARGIN).as_secs())
            .invoke_async(&mut self.redis.clone())
            .await?;

        match reply.as_slice() {
            [tag, _] if tag == "conflict" => Err(AppError::Conflict(format!(
                "User {} is already pairing as {}",
                entry.user_id, entry.role
            ))),
            [tag, replaced] if tag == "joined" && replaced.is_empty() => Ok(JoinOutcome::Joined),
            [tag, replaced] if tag == "joined" => Ok(JoinOutcome::Replaced(replaced.clone())),
            other => Err(corrupt("join reply", format!("{:?}", other))),
        }
    }

    async fn try_match(
        &self,
        user_id: &str,
        role: Role,
        client_id: &str,
        pair_id: &str,
        record_ttl: Duration,
    ) -> Result<StoreMatch> {
        let opposite = role.opposite();
        let reply: Vec<String> = self
            .match_script
            .key(pool_key(opposite))
            .key(entries_key(opposite))
            .key(pool_key(role))
            .key(entries_key(role))
            .key(state_key(user_id))
            .key(matched_key(pair_id))
            .arg(user_id)
            .arg(role.as_str())
            .arg(opposite.as_str())
            .arg(client_id)
            .arg(pair_id)
            .arg(self.clock.now().timestamp_millis())
            .arg(record_ttl.as_secs().max(1))
            .arg(TIMEOUT_PREFIX)
            .arg(MATCHED_PREFIX)
            .invoke_async(&mut self.redis.clone())
            .await?;

        match reply.as_slice() {
            [tag, record] if tag == "matched" => {
                let record: MatchRecord =
                    sonic_rs::from_str(record).map_err(|e| corrupt("match record", e))?;
                Ok(StoreMatch::Matched(record))
            }
            [tag, live] if tag == "waiting" => Ok(StoreMatch::Waiting(
                live.parse().map_err(|e| corrupt("queue count", e))?,
            )),
            [tag, _] if tag == "not_waiting" => Ok(StoreMatch::NotWaiting),
            other => Err(corrupt("match reply", format!("{:?}", other))),
        }
    }

    async fn cancel(&self, user_id: &str, role: Role, only_client: Option<&str>) -> Result<Option<String>> {
        let removed: Option<String> = self
            .cancel_script
            .key(pool_key(role))
            .key(entries_key(role))
            .key(state_key(user_id))
            .key(timeout_key(user_id, role))
            .arg(role.as_str())
            .arg(only_client.unwrap_or(""))
            .invoke_async(&mut self.redis.clone())
            .await?;
        Ok(removed)
    }

    async fn status(&self, user_id: &str, role: Role) -> Result<StoreStatus> {
        let mut conn = self.redis.clone();
        let fields: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(state_key(user_id))
            .arg(role.as_str())
            .arg(format!("{}:status", role))
            .arg(format!("{}:pair", role))
            .query_async(&mut conn)
            .await?;

        let (Some(client_id), Some(status)) = (
            fields.first().cloned().flatten(),
            fields.get(1).cloned().flatten(),
        ) else {
            return Ok(StoreStatus::Idle);
        };

        match status.as_str() {
            "waiting" => {
                let marker: Option<String> = redis::cmd("GET")
                    .arg(timeout_key(user_id, role))
                    .query_async(&mut conn)
                    .await?;
                let raw: Option<String> = redis::cmd("HGET")
                    .arg(entries_key(role))
                    .arg(&client_id)
                    .query_async(&mut conn)
                    .await?;
                match (marker, raw) {
                    (Some(marker), Some(raw)) if marker == client_id => {
                        let entry: PairingEntry =
                            sonic_rs::from_str(&raw).map_err(|e| corrupt("pairing entry", e))?;
                        let opposite_waiting = self.live_count(role.opposite()).await?;
                        Ok(StoreStatus::Waiting {
                            entry,
                            opposite_waiting,
                        })
                    }
                    _ => Ok(StoreStatus::TimedOut { client_id }),
                }
            }
            "matched" => {
                let Some(pair_id) = fields.get(2).cloned().flatten() else {
                    return Ok(StoreStatus::Idle);
                };
                let raw: Option<String> = redis::cmd("GET")
                    .arg(matched_key(&pair_id))
                    .query_async(&mut conn)
                    .await?;
                match raw {
                    Some(raw) => Ok(StoreStatus::Matched(
                        sonic_rs::from_str(&raw).map_err(|e| corrupt("match record", e))?,
                    )),
                    None => Ok(StoreStatus::Idle),
                }
            }
            "timeout" => Ok(StoreStatus::TimedOut { client_id }),
            _ => Ok(StoreStatus::Idle),
        }
    }

    async fn sweep(&self) -> Result<Vec<PairingEntry>> {
        let raw: Vec<String> = self
            .sweep_script
            .key(pool_key(Role::CardEnd))
            .key(entries_key(Role::CardEnd))
            .key(pool_key(Role::PosEnd))
            .key(entries_key(Role::PosEnd))
            .arg(TIMEOUT_PREFIX)
            .arg(state_key(""))
            .arg(STATE_MARGIN.as_secs())
            .arg(Role::CardEnd.as_str())
            .arg(Role::PosEnd.as_str())
            .invoke_async(&mut self.redis.clone())
            .await?;

        raw.iter()
            .map(|r| sonic_rs::from_str(r).map_err(|e| corrupt("pairing entry", e)))
            .collect()
    }

    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(acquired.is_some())
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<()> {
        let _: i64 = self
            .release_script
            .key(key)
            .arg(holder)
            .invoke_async(&mut self.redis.clone())
            .await?;
        Ok(())
    }
}
