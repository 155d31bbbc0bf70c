//! Broker key layout, wire messages and the server-side scripts of the fleet protocol.
//!
//! Every generation lives under its own set of keys:
//!
//! - `{prefix}:gen:{g}` is a hash with fields `n`, `model`, `closed`, `acc`,
//!   `eval`, `inflight`, `started` and `reclaimed`;
//! - `{prefix}:gen:{g}:results` is a list of [`wire`](crate::wire)-encoded
//!   [`ResultMessage`]s;
//! - `{prefix}:gen:{g}:leases` is a sorted set of the tickets being worked on,
//!   scored by the broker time (ms) at which their lease runs out.
//!
//! Generation ids come from `INCR {prefix}:generation`, the id being worked on
//! is stored at `{prefix}:current`, and `{prefix}:control` is the pub/sub
//! channel carrying `start:{g}`, `stop:{g}` and `shutdown`. All accounting
//! happens inside the scripts below, which the broker executes atomically, so
//! no two workers can both count as the n-th acceptance.
//!
//! A claim that is never reported (the worker died, or lost its connection
//! before `complete` went through) keeps its slot in the speculation budget
//! only until its lease runs out. The next claim returns expired slots to the
//! budget, so the rest of the fleet can pick the work up.

use redis::{ConnectionLike, RedisResult, Script};
use serde::{Deserialize, Serialize};

/// Key names for one broker namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn generation_counter(&self) -> String {
        format!("{}:generation", self.prefix)
    }

    pub fn current(&self) -> String {
        format!("{}:current", self.prefix)
    }

    pub fn control(&self) -> String {
        format!("{}:control", self.prefix)
    }

    pub fn meta(&self, generation: u64) -> String {
        format!("{}:gen:{generation}", self.prefix)
    }

    pub fn results(&self, generation: u64) -> String {
        format!("{}:gen:{generation}:results", self.prefix)
    }

    pub fn leases(&self, generation: u64) -> String {
        format!("{}:gen:{generation}:leases", self.prefix)
    }
}

/// Messages on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Start(u64),
    Stop(u64),
    Shutdown,
}

impl Control {
    pub fn encode(&self) -> String {
        match self {
            Control::Start(g) => format!("start:{g}"),
            Control::Stop(g) => format!("stop:{g}"),
            Control::Shutdown => "shutdown".to_string(),
        }
    }

    pub fn decode(raw: &str) -> Option<Self> {
        if raw == "shutdown" {
            return Some(Control::Shutdown);
        }
        let (verb, generation) = raw.split_once(':')?;
        let generation = generation.parse().ok()?;
        match verb {
            "start" => Some(Control::Start(generation)),
            "stop" => Some(Control::Stop(generation)),
            _ => None,
        }
    }
}

/// Entry of a generation's result list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultMessage<P> {
    /// One of the first `n` acceptances; `ticket` orders the population.
    Accepted {
        generation: u64,
        ticket: u64,
        particle: P,
    },
    /// A worker's simulate/accept call failed; the generation is closed.
    Failed { worker: String, message: String },
}

/// Answer of the claim script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Start the work item with this ticket.
    Ticket(u64),
    /// The speculation budget is used up; wait for a signal and try again.
    Wait,
    /// The generation is over, closed or gone.
    Stop,
}

impl Claim {
    pub fn from_reply(reply: i64) -> Self {
        match reply {
            r if r > 0 => Claim::Ticket(r as u64),
            0 => Claim::Wait,
            _ => Claim::Stop,
        }
    }
}

/// KEYS: meta, leases. ARGV: lease ms, ttl.
/// Returns -1 to stop, 0 to wait, or a fresh ticket.
///
/// The budget mirrors `AcceptanceEstimate::budget`: `ceil(deficit / rate)` with
/// the rate starting at 1 and floored at `1 / (eval + 1)`.
const CLAIM: &str = r"
local meta = redis.call('HMGET', KEYS[1], 'n', 'closed', 'acc', 'eval', 'inflight')
if not meta[1] then
  return -1
end
local n = tonumber(meta[1])
local acc = tonumber(meta[3])
local ev = tonumber(meta[4])
local inflight = tonumber(meta[5])
if meta[2] == '1' or acc >= n then
  return -1
end
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local expired = redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', now)
if expired > 0 then
  inflight = redis.call('HINCRBY', KEYS[1], 'inflight', -expired)
  redis.call('HINCRBY', KEYS[1], 'reclaimed', expired)
end
local rate = 1
if ev > 0 then
  rate = math.max(acc / ev, 1 / (ev + 1))
end
local budget = math.max(math.ceil((n - acc) / rate), 1)
if inflight >= budget then
  return 0
end
redis.call('HINCRBY', KEYS[1], 'inflight', 1)
local ticket = redis.call('HINCRBY', KEYS[1], 'started', 1)
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[1]), ticket)
redis.call('EXPIRE', KEYS[2], ARGV[2])
return ticket
";

/// KEYS: meta, results, leases. ARGV: accepted flag, payload, ttl, control channel,
/// generation, ticket. Returns -1 if the generation is gone, 0 for a rejection,
/// else the accept count.
///
/// A ticket whose lease already ran out was returned to the budget by a claim,
/// so it no longer counts as in flight; its evaluation still counts.
const COMPLETE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
if redis.call('ZREM', KEYS[3], ARGV[6]) == 1 then
  redis.call('HINCRBY', KEYS[1], 'inflight', -1)
end
redis.call('HINCRBY', KEYS[1], 'eval', 1)
if ARGV[1] ~= '1' then
  return 0
end
local n = tonumber(redis.call('HGET', KEYS[1], 'n'))
local acc = redis.call('HINCRBY', KEYS[1], 'acc', 1)
if acc <= n then
  redis.call('RPUSH', KEYS[2], ARGV[2])
  redis.call('EXPIRE', KEYS[2], ARGV[3])
end
if acc == n then
  redis.call('PUBLISH', ARGV[4], 'stop:' .. ARGV[5])
end
return acc
";

/// KEYS: meta, results, leases. ARGV: payload, ttl, control channel, generation, ticket.
/// Returns -1 if the generation is gone, 0 if it was already closed, 1 otherwise.
const FAIL: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
if redis.call('ZREM', KEYS[3], ARGV[5]) == 1 then
  redis.call('HINCRBY', KEYS[1], 'inflight', -1)
end
if redis.call('HGET', KEYS[1], 'closed') == '1' then
  return 0
end
redis.call('HSET', KEYS[1], 'closed', '1')
redis.call('LPUSH', KEYS[2], ARGV[1])
redis.call('EXPIRE', KEYS[2], ARGV[2])
redis.call('PUBLISH', ARGV[3], 'stop:' .. ARGV[4])
return 1
";

/// The claim, complete and fail scripts bound to one namespace.
pub struct FleetScripts {
    keys: Keys,
    lease_ms: u64,
    ttl_secs: u64,
    claim: Script,
    complete: Script,
    fail: Script,
}

impl FleetScripts {
    pub fn new(keys: Keys, lease_ms: u64, ttl_secs: u64) -> Self {
        Self {
            keys,
            lease_ms,
            ttl_secs,
            claim: Script::new(CLAIM),
            complete: Script::new(COMPLETE),
            fail: Script::new(FAIL),
        }
    }

    /// Asks for a ticket in `generation` and leases it on success.
    pub fn claim(&self, con: &mut dyn ConnectionLike, generation: u64) -> RedisResult<Claim> {
        let reply: i64 = self
            .claim
            .key(self.keys.meta(generation))
            .key(self.keys.leases(generation))
            .arg(self.lease_ms)
            .arg(self.ttl_secs)
            .invoke(con)?;
        Ok(Claim::from_reply(reply))
    }

    /// Reports a finished work item; `accepted` carries the encoded result
    /// message of an acceptance. Returns the script's answer.
    pub fn complete(
        &self,
        con: &mut dyn ConnectionLike,
        generation: u64,
        ticket: u64,
        accepted: Option<&[u8]>,
    ) -> RedisResult<i64> {
        self.complete
            .key(self.keys.meta(generation))
            .key(self.keys.results(generation))
            .key(self.keys.leases(generation))
            .arg(if accepted.is_some() { "1" } else { "0" })
            .arg(accepted.unwrap_or_default())
            .arg(self.ttl_secs)
            .arg(self.keys.control())
            .arg(generation)
            .arg(ticket)
            .invoke(con)
    }

    /// Reports a failed work item and closes the generation.
    pub fn fail(
        &self,
        con: &mut dyn ConnectionLike,
        generation: u64,
        ticket: u64,
        message: &[u8],
    ) -> RedisResult<i64> {
        self.fail
            .key(self.keys.meta(generation))
            .key(self.keys.results(generation))
            .key(self.keys.leases(generation))
            .arg(message)
            .arg(self.ttl_secs)
            .arg(self.keys.control())
            .arg(generation)
            .arg(ticket)
            .invoke(con)
    }
}
