//! Broker stream consumer: schemaless Avro alert payloads over Kafka.

use apache_avro::Schema;
use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::Message;
use rdkafka::consumer::{Consumer, StreamConsumer};
use std::time::Duration;

use super::AlertSource;
use crate::alert::{Alert, ConsumedAlert};
use crate::config::KafkaConfig;
use crate::error::SourceError;

pub struct KafkaAlertSource {
    consumer: StreamConsumer,
    schema: Schema,
}

impl KafkaAlertSource {
    pub fn connect(cfg: &KafkaConfig, topics: &[String]) -> Result<Self, SourceError> {
        let raw_schema = std::fs::read_to_string(&cfg.schema_path)?;
        let schema = Schema::parse_str(&raw_schema)
            .map_err(|e| SourceError::Decode(format!("invalid alert schema: {e}")))?;

        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &cfg.bootstrap_servers)
            .set("group.id", &cfg.group_id)
            .set("auto.offset.reset", "earliest");
        if let Some(password) = &cfg.password {
            client
                .set("security.protocol", "SASL_PLAINTEXT")
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", &cfg.username)
                .set("sasl.password", password);
        }
        let consumer: StreamConsumer = client
            .create()
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        tracing::info!(
            name = "source.kafka.subscribed",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            servers = %cfg.bootstrap_servers,
            group_id = %cfg.group_id,
            topics = ?topics,
            message = "Subscribed to alert stream"
        );
        Ok(Self { consumer, schema })
    }

    fn decode(&self, payload: &[u8]) -> Result<Alert, SourceError> {
        let mut reader = payload;
        let value = apache_avro::from_avro_datum(&self.schema, &mut reader, None)
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        apache_avro::from_value::<Alert>(&value).map_err(|e| SourceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl AlertSource for KafkaAlertSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedAlert>, SourceError> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(SourceError::Connection(e.to_string())),
            Ok(Ok(message)) => message,
        };
        let Some(payload) = message.payload() else {
            tracing::warn!(
                topic = message.topic(),
                offset = message.offset(),
                "empty Kafka payload"
            );
            return Ok(None);
        };
        let alert = self.decode(payload)?;
        let key = message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();
        Ok(Some(ConsumedAlert {
            topic: message.topic().to_string(),
            key,
            alert,
        }))
    }
}
