//! Server-side Lua scripts.
//!
//! Enqueue, dequeue, ack, admission and promotion all mutate several keys that
//! must never interleave with a concurrent caller, so each is a single Lua
//! script executed atomically by Redis. `redis::Script` handles EVALSHA and
//! transparently reloads a script the server has not seen.
//!
//! Key shapes derived inside scripts (from the raw prefix argument) must stay
//! in sync with `keys.rs`.

use redis::Script;

/// Atomically writes a job record, appends it to its group's FIFO list,
/// bumps the group's totalJobs (initializing metadata on first enqueue) and
/// upserts the group into its priority tier with a fresh fairness score.
///
/// KEYS: fair-queue tier, group jobs list, group meta hash, job hash.
/// ARGV: group id, job id, payload, base priority, priority level, alpha,
/// processor type.
const ENQUEUE_LUA: &str = r#"
local queue_key = KEYS[1]
local jobs_key = KEYS[2]
local meta_key = KEYS[3]
local job_key = KEYS[4]

local group_id = ARGV[1]
local job_id = ARGV[2]
local payload = ARGV[3]
local base_priority = tonumber(ARGV[4])
local priority_level = ARGV[5]
local alpha = tonumber(ARGV[6])
local processor_type = ARGV[7]

local t = redis.call('TIME')
local now_ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

redis.call('HSET', job_key,
  'id', job_id,
  'groupId', group_id,
  'processorType', processor_type,
  'payload', payload,
  'status', 'PENDING',
  'retryCount', '0',
  'createdAt', tostring(now_ms))

redis.call('RPUSH', jobs_key, job_id)

if redis.call('EXISTS', meta_key) == 0 then
  redis.call('HSET', meta_key,
    'groupId', group_id,
    'basePriority', tostring(base_priority),
    'priorityLevel', priority_level,
    'doneJobs', '0',
    'status', 'CREATED',
    'createdAt', tostring(now_ms))
end

local total = redis.call('HINCRBY', meta_key, 'totalJobs', 1)
local done = tonumber(redis.call('HGET', meta_key, 'doneJobs')) or 0

local remaining = math.max(1, total - done)
local score = -now_ms + base_priority + alpha * (-1 + total / remaining)
redis.call('ZADD', queue_key, score, group_id)

return total
"#;

/// Atomically picks the highest-score group scanning tiers High -> Normal ->
/// Low, pops the head of its job list, marks the job PROCESSING and the group
/// RUNNING, and re-scores the group (or removes it when its list emptied).
/// Returns the job hash as a flat field/value array, or nil when all tiers
/// are empty.
///
/// KEYS: high tier, normal tier, low tier.
/// ARGV: alpha, key prefix.
const DEQUEUE_LUA: &str = r#"
local alpha = tonumber(ARGV[1])
local prefix = ARGV[2]

local t = redis.call('TIME')
local now_ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

for i = 1, 3 do
  local queue_key = KEYS[i]
  local head = redis.call('ZREVRANGE', queue_key, 0, 0)

  while head[1] do
    local group_id = head[1]
    local jobs_key = prefix .. 'group:' .. group_id .. ':jobs'
    local job_id = redis.call('LPOP', jobs_key)

    if job_id then
      local job_key = prefix .. 'job:' .. job_id
      local meta_key = prefix .. 'group:' .. group_id .. ':meta'

      redis.call('HSET', job_key, 'status', 'PROCESSING')
      redis.call('HSET', meta_key, 'status', 'RUNNING')

      if redis.call('LLEN', jobs_key) == 0 then
        redis.call('ZREM', queue_key, group_id)
      else
        local total = tonumber(redis.call('HGET', meta_key, 'totalJobs')) or 0
        local done = tonumber(redis.call('HGET', meta_key, 'doneJobs')) or 0
        local base = tonumber(redis.call('HGET', meta_key, 'basePriority')) or 0
        local remaining = math.max(1, total - done)
        local score = -now_ms + base + alpha * (-1 + total / remaining)
        redis.call('ZADD', queue_key, score, group_id)
      end

      return redis.call('HGETALL', job_key)
    end

    -- Stale membership: the group's list is empty, drop it and retry the tier.
    redis.call('ZREM', queue_key, group_id)
    head = redis.call('ZREVRANGE', queue_key, 0, 0)
  end
end

return nil
"#;

/// Atomically marks a job COMPLETED and bumps the group's doneJobs. Returns 1
/// exactly when this ack brings doneJobs up to totalJobs, flipping the group
/// to AGGREGATING.
///
/// KEYS: job hash, group meta hash.
const ACK_LUA: &str = r#"
local job_key = KEYS[1]
local meta_key = KEYS[2]

redis.call('HSET', job_key, 'status', 'COMPLETED')

local done = redis.call('HINCRBY', meta_key, 'doneJobs', 1)
local total = tonumber(redis.call('HGET', meta_key, 'totalJobs')) or 0

if total > 0 and done == total then
  redis.call('HSET', meta_key, 'status', 'AGGREGATING')
  return 1
end

return 0
"#;

/// Atomically registers the group as active, increments the windowed global
/// and per-group counters, and rolls both back when either limit is exceeded.
/// Returns {allowed, globalCount, globalLimit, groupCount, perGroupLimit};
/// rejected calls report the rolled-back counts.
///
/// KEYS: group counter, global counter, active-groups set.
/// ARGV: global rps, group id, counter ttl sec.
const RATE_LIMIT_CHECK_LUA: &str = r#"
local group_key = KEYS[1]
local global_key = KEYS[2]
local active_key = KEYS[3]

local global_rps = tonumber(ARGV[1])
local group_id = ARGV[2]
local ttl = tonumber(ARGV[3])

redis.call('SADD', active_key, group_id)
local active = redis.call('SCARD', active_key)
local per_group = math.max(1, math.floor(global_rps / math.max(1, active)))

local global_count = redis.call('INCR', global_key)
if global_count == 1 then
  redis.call('EXPIRE', global_key, ttl)
end

local group_count = redis.call('INCR', group_key)
if group_count == 1 then
  redis.call('EXPIRE', group_key, ttl)
end

if global_count > global_rps or group_count > per_group then
  redis.call('DECR', global_key)
  redis.call('DECR', group_key)
  return {0, global_count - 1, global_rps, group_count - 1, per_group}
end

return {1, global_count, global_rps, group_count, per_group}
"#;

/// Appends a job id to the ready buffer unless the buffer is at capacity.
/// Returns 1 on success, 0 when full. Length check and push are one atomic
/// unit, which is what enforces the hard cap.
///
/// KEYS: ready queue. ARGV: job id, max size.
const READY_QUEUE_PUSH_LUA: &str = r#"
if redis.call('LLEN', KEYS[1]) >= tonumber(ARGV[2]) then
  return 0
end

redis.call('RPUSH', KEYS[1], ARGV[1])
return 1
"#;

/// Atomically bumps the group's non-ready counter, computes its fair-share
/// speed and adaptive backoff, parks the job in the non-ready queue scored by
/// due time, and records the backoff in the group's stats hash.
/// Returns {backoffMs, nonReadyCount, rateLimitSpeed}.
///
/// KEYS: non-ready queue, group congestion stats, group non-ready counter,
/// active-groups set.
/// ARGV: job id, global rps, base backoff ms, max backoff ms, now ms,
/// stats retention ms.
const CONGESTION_BACKOFF_LUA: &str = r#"
local non_ready_key = KEYS[1]
local stats_key = KEYS[2]
local count_key = KEYS[3]
local active_key = KEYS[4]

local job_id = ARGV[1]
local global_rps = tonumber(ARGV[2])
local base_backoff = tonumber(ARGV[3])
local max_backoff = tonumber(ARGV[4])
local now_ms = tonumber(ARGV[5])
local retention_ms = tonumber(ARGV[6])

local count = redis.call('INCR', count_key)
local active = redis.call('SCARD', active_key)
local speed = math.max(1, math.floor(global_rps / math.max(1, active)))

local backoff = math.min(base_backoff + math.floor(count / speed) * 1000, max_backoff)

redis.call('ZADD', non_ready_key, now_ms + backoff, job_id)
redis.call('HSET', stats_key,
  'lastBackoffMs', tostring(backoff),
  'nonReadyCount', tostring(count),
  'updatedAt', tostring(now_ms))
redis.call('PEXPIRE', stats_key, retention_ms)

return {backoff, count, speed}
"#;

/// Decrements a group's non-ready counter by a promotion batch size, floored
/// at zero. Returns the new count.
///
/// KEYS: group non-ready counter, group congestion stats. ARGV: count.
const CONGESTION_RELEASE_LUA: &str = r#"
local count_key = KEYS[1]
local stats_key = KEYS[2]

local released = tonumber(ARGV[1])
local current = tonumber(redis.call('GET', count_key)) or 0
local remaining = math.max(0, current - released)

redis.call('SET', count_key, tostring(remaining))
redis.call('HSET', stats_key, 'nonReadyCount', tostring(remaining))

return remaining
"#;

/// Atomically moves up to a batch of due non-ready entries (score <= now)
/// into the ready buffer, decrementing each owning group's non-ready counter.
/// Returns the number of jobs moved.
///
/// KEYS: non-ready queue, ready queue.
/// ARGV: now ms, batch size, key prefix.
const MOVE_TO_READY_LUA: &str = r#"
local non_ready_key = KEYS[1]
local ready_key = KEYS[2]

local now_ms = ARGV[1]
local batch = tonumber(ARGV[2])
local prefix = ARGV[3]

local job_ids = redis.call('ZRANGEBYSCORE', non_ready_key, '-inf', now_ms, 'LIMIT', 0, batch)
local moved = 0

for _, job_id in ipairs(job_ids) do
  redis.call('ZREM', non_ready_key, job_id)
  redis.call('RPUSH', ready_key, job_id)

  local group_id = redis.call('HGET', prefix .. 'job:' .. job_id, 'groupId')
  if group_id then
    local count_key = prefix .. 'congestion:' .. group_id .. ':non-ready-count'
    if redis.call('DECR', count_key) < 0 then
      redis.call('SET', count_key, '0')
    end
  end

  moved = moved + 1
end

return moved
"#;

/// Prepared script handles, shared by every component that needs atomicity.
pub struct Scripts {
    pub enqueue: Script,
    pub dequeue: Script,
    pub ack: Script,
    pub rate_limit_check: Script,
    pub ready_queue_push: Script,
    pub congestion_backoff: Script,
    pub congestion_release: Script,
    pub move_to_ready: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_LUA),
            dequeue: Script::new(DEQUEUE_LUA),
            ack: Script::new(ACK_LUA),
            rate_limit_check: Script::new(RATE_LIMIT_CHECK_LUA),
            ready_queue_push: Script::new(READY_QUEUE_PUSH_LUA),
            congestion_backoff: Script::new(CONGESTION_BACKOFF_LUA),
            congestion_release: Script::new(CONGESTION_RELEASE_LUA),
            move_to_ready: Script::new(MOVE_TO_READY_LUA),
        }
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_have_distinct_hashes() {
        let scripts = Scripts::new();

        let hashes = [
            scripts.enqueue.get_hash().to_string(),
            scripts.dequeue.get_hash().to_string(),
            scripts.ack.get_hash().to_string(),
            scripts.rate_limit_check.get_hash().to_string(),
            scripts.ready_queue_push.get_hash().to_string(),
            scripts.congestion_backoff.get_hash().to_string(),
            scripts.congestion_release.get_hash().to_string(),
            scripts.move_to_ready.get_hash().to_string(),
        ];

        for (i, hash) in hashes.iter().enumerate() {
            assert_eq!(hash.len(), 40, "sha1 hex digest expected");
            for other in hashes.iter().skip(i + 1) {
                assert_ne!(hash, other);
            }
        }
    }
}
