//! Redis-list queue with reliable-queue leasing.
//!
//! Keys for a queue named `q`:
//! - `q` pending envelopes, pushed on the left and leased from the right
//! - `q:processing` leased envelopes; the raw envelope string is the lock token
//! - `q:leases` sorted set of lock tokens scored by lease expiry (unix millis)
//! - `q:deadletter` dead-letter records, newest first

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ports::{MessageConsumer, MessagePublisher, QueueError, QueueResult, ReceivedMessage};
use crate::shutdown::Shutdown;

const PROCESSING_SUFFIX: &str = ":processing";
const LEASES_SUFFIX: &str = ":leases";
const DEAD_LETTER_SUFFIX: &str = ":deadletter";
/// BLMOVE treats 0 as "block forever".
const MIN_BLOCK_SECS: f64 = 0.01;
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Drops the lease in KEYS[1]/KEYS[2] and, only if it was still held, pushes ARGV[2]
/// onto KEYS[3] with the ARGV[3] command. Returns 1 when the lease was held.
const RELEASE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
if KEYS[3] then
    redis.call(ARGV[3], KEYS[3], ARGV[2])
end
return 1
"#;

/// Moves leases that expired before ARGV[1] from KEYS[2] back to the delivery end of KEYS[1],
/// counting the lost delivery in the envelope. Leases with no expiry (a receiver that died
/// between BLMOVE and ZADD) get ARGV[2].
const RECOVER_SCRIPT: &str = r#"
local recovered = 0
for _, token in ipairs(redis.call('LRANGE', KEYS[2], 0, -1)) do
    local expires = redis.call('ZSCORE', KEYS[3], token)
    if not expires then
        redis.call('ZADD', KEYS[3], ARGV[2], token)
    elseif tonumber(expires) <= tonumber(ARGV[1]) then
        redis.call('LREM', KEYS[2], 1, token)
        redis.call('ZREM', KEYS[3], token)
        local value = token
        local ok, envelope = pcall(cjson.decode, token)
        if ok and type(envelope) == 'table' and type(envelope.delivery_count) == 'number' then
            envelope.delivery_count = envelope.delivery_count + 1
            value = cjson.encode(envelope)
        end
        redis.call('RPUSH', KEYS[1], value)
        recovered = recovered + 1
    end
end
return recovered
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: Uuid,
    content_type: String,
    body: String,
    /// Deliveries so far.
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub content_type: String,
    pub body: String,
    pub delivery_count: u32,
    pub reason: String,
    pub description: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RedisQueue {
    queue: String,
    lease_timeout: Duration,
    /// Shared by every non-blocking command.
    commands: MultiplexedConnection,
    /// BLMOVE parks the connection it runs on.
    blocking: MultiplexedConnection,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str, queue: impl Into<String>) -> QueueResult<Self> {
        let redis_client = redis::Client::open(redis_url)?;
        let commands = redis_client.get_multiplexed_async_connection().await?;
        let blocking = redis_client.get_multiplexed_async_connection().await?;

        Ok(Self {
            queue: queue.into(),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            commands,
            blocking,
        })
    }

    /// How long a receiver may hold a message before `recover` hands it to someone else.
    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    fn processing_key(&self) -> String {
        format!("{}{}", self.queue, PROCESSING_SUFFIX)
    }

    fn leases_key(&self) -> String {
        format!("{}{}", self.queue, LEASES_SUFFIX)
    }

    fn dead_letter_key(&self) -> String {
        format!("{}{}", self.queue, DEAD_LETTER_SUFFIX)
    }

    /// Lease expiry in unix millis.
    fn lease_deadline(&self) -> i64 {
        let timeout = i64::try_from(self.lease_timeout.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_add(timeout)
    }

    /// Returns expired leases to the pending list, oldest lease first. Live leases stay put.
    pub async fn recover(&self) -> QueueResult<usize> {
        let mut conn = self.commands.clone();
        let recovered: usize = redis::Script::new(RECOVER_SCRIPT)
            .key(&self.queue)
            .key(self.processing_key())
            .key(self.leases_key())
            .arg(Utc::now().timestamp_millis())
            .arg(self.lease_deadline())
            .invoke_async(&mut conn)
            .await?;
        Ok(recovered)
    }

    /// Runs `recover` every `interval` until shutdown.
    pub async fn run_recovery(&self, interval: Duration, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.recover().await {
                    Ok(0) => {}
                    Ok(n) => info!("Returned {} expired lease(s) to {}", n, self.queue),
                    Err(e) => error!("Lease recovery on {} failed: {}", self.queue, e),
                },
            }
        }
    }

    pub async fn pending_len(&self) -> QueueResult<usize> {
        let mut conn = self.commands.clone();
        Ok(conn.llen(&self.queue).await?)
    }

    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let mut conn = self.commands.clone();
        let raw: Vec<String> = conn.lrange(self.dead_letter_key(), 0, stop).await?;

        raw.iter()
            .map(|value| serde_json::from_str(value).map_err(QueueError::from))
            .collect()
    }

    /// Drops the lease and, if it was still held, pushes `value` with `command` onto `destination`.
    async fn release(
        &self,
        message: &ReceivedMessage,
        destination: Option<(&str, &str, String)>,
    ) -> QueueResult<bool> {
        let script = redis::Script::new(RELEASE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.processing_key())
            .key(self.leases_key())
            .arg(&message.lock_token);
        if let Some((key, command, value)) = destination {
            invocation.key(key).arg(value).arg(command);
        }

        let mut conn = self.commands.clone();
        let released: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(released == 1)
    }
}

#[async_trait]
impl MessagePublisher for RedisQueue {
    async fn publish(&self, queue: &str, payload: &str, content_type: &str) -> QueueResult<()> {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            content_type: content_type.to_string(),
            body: payload.to_string(),
            delivery_count: 0,
            enqueued_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&envelope)?;

        let mut conn = self.commands.clone();
        let _: () = conn.lpush(queue, serialized).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageConsumer for RedisQueue {
    async fn receive(&self, wait: Duration) -> QueueResult<Option<ReceivedMessage>> {
        let mut blocking = self.blocking.clone();
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(self.processing_key())
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait.as_secs_f64().max(MIN_BLOCK_SECS))
            .query_async(&mut blocking)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut conn = self.commands.clone();
        let _: i64 = conn.zadd(self.leases_key(), &raw, self.lease_deadline()).await?;

        let message = match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => ReceivedMessage {
                message_id: envelope.id,
                body: envelope.body,
                content_type: envelope.content_type,
                delivery_count: envelope.delivery_count + 1,
                lock_token: raw,
            },
            Err(e) => {
                // Foreign producers may push bare payloads; hand them over untouched.
                warn!("Queue {} holds a value that is not an envelope: {}", self.queue, e);
                ReceivedMessage {
                    message_id: Uuid::nil(),
                    body: raw.clone(),
                    content_type: String::new(),
                    delivery_count: 1,
                    lock_token: raw,
                }
            }
        };

        Ok(Some(message))
    }

    async fn complete(&self, message: &ReceivedMessage) -> QueueResult<()> {
        if !self.release(message, None).await? {
            return Err(QueueError::UnknownMessage(message.message_id.to_string()));
        }
        Ok(())
    }

    async fn abandon(&self, message: &ReceivedMessage) -> QueueResult<()> {
        let envelope = Envelope {
            id: message.message_id,
            content_type: message.content_type.clone(),
            body: message.body.clone(),
            delivery_count: message.delivery_count,
            enqueued_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&envelope)?;

        // Right end so the message is next in line.
        if !self.release(message, Some((&self.queue, "RPUSH", serialized))).await? {
            warn!(
                "Abandoned message {} had lost its lease; the recovered copy stays queued",
                message.message_id
            );
        }
        Ok(())
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str, description: &str) -> QueueResult<()> {
        let record = DeadLetterRecord {
            id: message.message_id,
            content_type: message.content_type.clone(),
            body: message.body.clone(),
            delivery_count: message.delivery_count,
            reason: reason.to_string(),
            description: description.to_string(),
            dead_lettered_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&record)?;

        let dead_letter_key = self.dead_letter_key();
        if !self
            .release(message, Some((&dead_letter_key, "LPUSH", serialized)))
            .await?
        {
            warn!(
                "Message {} had lost its lease and was not dead-lettered",
                message.message_id
            );
        }
        Ok(())
    }
}
