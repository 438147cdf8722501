use anyhow::{anyhow, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::StreamConsumer;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing;

use crate::config::RedpandaConfig;

pub type RedpandaProducer = Arc<FutureProducer>;
pub type RedpandaConsumer = Arc<StreamConsumer>;

fn build_client_config(config: &RedpandaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("metadata.request.timeout.ms", "30000")
        .set("socket.timeout.ms", "30000")
        .set("socket.keepalive.enable", "true")
        .set("broker.address.family", "v4");

    if config.ssl_enabled {
        tracing::info!("SSL/TLS enabled for Redpanda connection");
        client_config.set("security.protocol", "ssl");
        if let Some(ca_location) = &config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    client_config
}

pub fn create_producer(config: &RedpandaConfig) -> Result<RedpandaProducer> {
    tracing::info!("Creating Redpanda producer for brokers {}", config.brokers);

    // Idempotent producer: a broker-side retry must not duplicate a delivery job.
    let producer: FutureProducer = build_client_config(config)
        .set("message.timeout.ms", "5000")
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .create()
        .map_err(|e| {
            tracing::error!("Failed to create Redpanda producer for {}: {}", config.brokers, e);
            anyhow!("Failed to create Redpanda producer: {}", e)
        })?;

    Ok(Arc::new(producer))
}

pub fn create_consumer(config: &RedpandaConfig, group_id: Option<&str>) -> Result<RedpandaConsumer> {
    let group = group_id.unwrap_or(&config.consumer_group);
    tracing::info!("Creating Redpanda consumer (brokers {}, group {})", config.brokers, group);

    let consumer: StreamConsumer = build_client_config(config)
        .set("group.id", group)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "30000")
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "earliest")
        .create()
        .map_err(|e| {
            tracing::error!("Failed to create Redpanda consumer for group {}: {}", group, e);
            anyhow!("Failed to create Redpanda consumer: {}", e)
        })?;

    Ok(Arc::new(consumer))
}

pub async fn produce_message(
    producer: &RedpandaProducer,
    topic: &str,
    key: Option<&str>,
    payload: &[u8],
) -> Result<()> {
    let mut record = FutureRecord::to(topic).payload(payload);

    if let Some(k) = key {
        record = record.key(k);
    }

    match producer.send(record, Duration::from_secs(5)).await {
        Ok((partition, offset)) => {
            tracing::debug!(
                "Message delivered to topic {} partition {} offset {}",
                topic,
                partition,
                offset
            );
            Ok(())
        }
        Err((e, _)) => {
            tracing::error!("Failed to deliver message to topic {}: {:?}", topic, e);
            Err(anyhow!("Failed to deliver message: {:?}", e))
        }
    }
}
