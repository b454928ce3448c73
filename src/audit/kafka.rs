//! # Bounded Async Publisher
//!
//! A bounded channel (capacity 1000) decouples request handlers from the
//! message bus. A single consumer task dequeues one message at a time and
//! writes it with a per-message deadline. When the channel is full the
//! producer drops the message and logs once per drop: stalling request
//! processing for audit is never acceptable.
//!
//! The transport sits behind the `MessageSink` seam; `KafkaSink` is the
//! production implementation over `rdkafka`.

use crate::audit::Publisher;
use crate::core::config::KafkaConfig;
use crate::core::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Queue depth between producers and the consumer task.
pub const QUEUE_CAPACITY: usize = 1000;

struct Message {
    key: Vec<u8>,
    value: Vec<u8>,
}

/// One write to the underlying bus.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn write(&self, key: &[u8], value: &[u8]) -> Result<(), String>;
    async fn close(&self);
}

/// Drop-on-overflow publisher in front of a [`MessageSink`].
pub struct BoundedPublisher {
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl BoundedPublisher {
    pub fn new<S: MessageSink>(sink: S, write_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let consumer = tokio::spawn(consume(rx, sink, write_timeout));
        Self {
            tx: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Messages dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn consume<S: MessageSink>(
    mut rx: mpsc::Receiver<Message>,
    sink: S,
    write_timeout: Duration,
) {
    while let Some(message) = rx.recv().await {
        match tokio::time::timeout(write_timeout, sink.write(&message.key, &message.value)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "audit write failed"),
            Err(_) => warn!("audit write timed out"),
        }
    }
    sink.close().await;
}

#[async_trait]
impl Publisher for BoundedPublisher {
    fn publish(&self, key: &[u8], value: &[u8]) {
        let guard = self.tx.lock().expect("publisher sender lock");
        let Some(tx) = guard.as_ref() else {
            return;
        };
        let message = Message {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(message) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("audit buffer full, dropping event");
        }
    }

    async fn close(&self) {
        // Dropping the sender lets the consumer drain and exit.
        let tx = self.tx.lock().expect("publisher sender lock").take();
        drop(tx);
        let consumer = self.consumer.lock().expect("publisher consumer lock").take();
        if let Some(handle) = consumer {
            if handle.await.is_err() {
                warn!("audit consumer task panicked during shutdown");
            }
        }
        let dropped = self.dropped();
        if dropped > 0 {
            info!(dropped, "audit publisher closed with dropped events");
        }
    }
}

/// Kafka transport: one writer, one fixed topic, TCID partition key.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
    write_timeout: Duration,
}

impl KafkaSink {
    pub fn from_config(cfg: &KafkaConfig, topic: &str) -> GatewayResult<Self> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", cfg.brokers.join(","))
            .set("client.id", &cfg.client_id)
            .set("acks", map_acks(&cfg.acks))
            .set("compression.type", &cfg.compression)
            .set("message.timeout.ms", cfg.timeout_ms.to_string())
            .set("batch.size", cfg.batch_bytes.to_string())
            .set("linger.ms", cfg.batch_timeout_ms.to_string());

        let mut protocol = "plaintext";
        if cfg.tls.enabled {
            protocol = "ssl";
            if cfg.tls.insecure_skip_verify {
                client.set("enable.ssl.certificate.verification", "false");
            }
        }
        if cfg.sasl.enabled {
            protocol = if cfg.tls.enabled {
                "sasl_ssl"
            } else {
                "sasl_plaintext"
            };
            client
                .set("sasl.mechanism", &cfg.sasl.mechanism)
                .set("sasl.username", &cfg.sasl.username)
                .set("sasl.password", &cfg.sasl.password);
        }
        client.set("security.protocol", protocol);

        let producer: FutureProducer = client
            .create()
            .map_err(|e| GatewayError::config(format!("failed to create kafka producer: {e}")))?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
            write_timeout: cfg.timeout(),
        })
    }
}

fn map_acks(acks: &str) -> &'static str {
    match acks {
        "none" => "0",
        "all" => "all",
        _ => "1",
    }
}

#[async_trait]
impl MessageSink for KafkaSink {
    async fn write(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        let record = FutureRecord::to(&self.topic).key(key).payload(value);
        self.producer
            .send(record, Timeout::After(self.write_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| e.to_string())
    }

    async fn close(&self) {
        if let Err(e) = self.producer.flush(Timeout::After(Duration::from_secs(5))) {
            warn!(error = %e, "kafka flush on close failed");
        }
    }
}

/// Build the publisher selected by configuration.
pub fn build_publisher(cfg: &KafkaConfig, topic: &str) -> GatewayResult<Arc<dyn Publisher>> {
    if !cfg.enabled {
        info!("audit publishing disabled, using noop publisher");
        return Ok(Arc::new(crate::audit::NoopPublisher));
    }
    if cfg.brokers.is_empty() {
        return Err(GatewayError::config("kafka brokers empty"));
    }
    if topic.is_empty() {
        return Err(GatewayError::config("kafka topic empty"));
    }
    let sink = KafkaSink::from_config(cfg, topic)?;
    Ok(Arc::new(BoundedPublisher::new(sink, cfg.timeout())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    /// Sink that holds every write until a permit is released, recording
    /// payloads.
    struct GatedSink {
        received: Arc<Mutex<Vec<Vec<u8>>>>,
        gate: Arc<Semaphore>,
        closed: Arc<AtomicU64>,
    }

    #[async_trait]
    impl MessageSink for GatedSink {
        async fn write(&self, _key: &[u8], value: &[u8]) -> Result<(), String> {
            self.gate.acquire().await.unwrap().forget();
            self.received.lock().unwrap().push(value.to_vec());
            Ok(())
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn test_publish_never_blocks_and_drops_on_overflow() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        let closed = Arc::new(AtomicU64::new(0));
        let sink = GatedSink {
            received: received.clone(),
            gate: gate.clone(),
            closed: closed.clone(),
        };
        let publisher = BoundedPublisher::new(sink, Duration::from_secs(30));

        // With the sink gated, a 2x-capacity burst must overflow the queue.
        for i in 0..(2 * QUEUE_CAPACITY) {
            publisher.publish(b"T1", format!("event-{i}").as_bytes());
        }
        let dropped = publisher.dropped();
        assert!(dropped >= (QUEUE_CAPACITY as u64) - 1, "dropped {dropped}");
        assert!(dropped < 2 * QUEUE_CAPACITY as u64);

        // Release the gate for every in-flight and queued write.
        gate.add_permits(2 * QUEUE_CAPACITY);
        publisher.close().await;

        // Everything accepted was delivered in submission order.
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2 * QUEUE_CAPACITY - dropped as usize);
        assert_eq!(received[0], b"event-0");
        assert_eq!(closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_publish_after_close_is_ignored() {
        struct OkSink;
        #[async_trait]
        impl MessageSink for OkSink {
            async fn write(&self, _key: &[u8], _value: &[u8]) -> Result<(), String> {
                Ok(())
            }
            async fn close(&self) {}
        }

        let publisher = BoundedPublisher::new(OkSink, Duration::from_secs(1));
        publisher.close().await;
        publisher.publish(b"k", b"v");
        assert_eq!(publisher.dropped(), 0);
    }

    #[tokio::test]
    async fn test_write_timeout_does_not_stall_consumer() {
        struct StuckSink {
            attempts: Arc<AtomicU64>,
        }
        #[async_trait]
        impl MessageSink for StuckSink {
            async fn write(&self, _key: &[u8], _value: &[u8]) -> Result<(), String> {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                std::future::pending().await
            }
            async fn close(&self) {}
        }

        let attempts = Arc::new(AtomicU64::new(0));
        let publisher = BoundedPublisher::new(
            StuckSink {
                attempts: attempts.clone(),
            },
            Duration::from_millis(10),
        );
        publisher.publish(b"k", b"one");
        publisher.publish(b"k", b"two");
        publisher.close().await;
        // Both messages reached the sink despite each write timing out.
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_acks_mapping() {
        assert_eq!(map_acks("none"), "0");
        assert_eq!(map_acks("one"), "1");
        assert_eq!(map_acks("all"), "all");
    }
}
