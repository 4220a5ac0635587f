use crate::amqp::{connect_with_retry, preview};
use crate::conf::Config;
use crate::error::Error as InputError;
use crate::health::{Component, HealthStatus, Outcome, SharedHealthState};
use crate::transform::{Message, MessageTransformer};
use anyhow::{Context, Error};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, Consumer};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Consumes release events, runs them through a [`MessageTransformer`] and
/// publishes the result to the target exchange.
pub struct MessageBridge {
    source_channel: Channel,
    target_channel: Channel,
    source_connection: Connection,
    target_connection: Connection,
    config: Config,
    health_state: SharedHealthState,
    transformer: Arc<dyn MessageTransformer>,
}

/// How a delivery whose transformation failed is settled: malformed input can
/// never succeed and is dropped, anything else goes back on the queue.
pub fn outcome_for_transform_error(err: &Error) -> Outcome {
    if InputError::is_malformed_input(err) {
        Outcome::Rejected
    } else {
        Outcome::Requeued
    }
}

impl MessageBridge {
    pub async fn new(
        config: Config,
        health_state: SharedHealthState,
        transformer: Arc<dyn MessageTransformer>,
    ) -> anyhow::Result<Self> {
        health_state
            .write()
            .await
            .set_status(Component::Bridge, HealthStatus::Starting);

        info!(
            event = "bridge_initializing",
            source_queue = %config.source_queue,
            target_exchange = %config.target_exchange,
            target_routing_key = %config.target_routing_key,
            "Starting MessageBridge initialization"
        );

        let source_dsn = config
            .source_dsn
            .as_deref()
            .context("SOURCE_DSN is required to run the announcer")?;
        let source_conn = connect_with_retry(source_dsn, "Failed to connect to source RabbitMQ")
            .await
            .context("Source RabbitMQ connection failed")?;

        let source_channel = source_conn
            .create_channel()
            .await
            .context("Failed to create source channel")?;

        let target_conn =
            connect_with_retry(&config.target_dsn, "Failed to connect to target RabbitMQ")
                .await
                .context("Target RabbitMQ connection failed")?;

        let target_channel = target_conn
            .create_channel()
            .await
            .context("Failed to create target channel")?;

        target_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        source_channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .context("Failed to set QoS")?;

        info!(
            event = "bridge_initialized",
            "Connected to both RabbitMQ instances"
        );

        health_state
            .write()
            .await
            .set_status(Component::Bridge, HealthStatus::Healthy);

        Ok(Self {
            source_channel,
            target_channel,
            source_connection: source_conn,
            target_connection: target_conn,
            config,
            health_state,
            transformer,
        })
    }

    /// Check if connections and channels are still alive. The broker closes a
    /// channel (but not the connection) on errors such as a missing exchange.
    fn is_connected(&self) -> bool {
        self.source_connection.status().connected()
            && self.target_connection.status().connected()
            && self.source_channel.status().connected()
            && self.target_channel.status().connected()
    }

    async fn mark_unhealthy(&self) {
        self.health_state
            .write()
            .await
            .set_status(Component::Bridge, HealthStatus::Unhealthy);
    }

    async fn process(&self, delivery: &Delivery) -> Result<Outcome, Error> {
        info!(
            event = "message_received",
            bytes = delivery.data.len(),
            delivery_tag = delivery.delivery_tag,
            content = %preview(&delivery.data),
            "Received release event"
        );

        let input = Message::new(&delivery.data[..], delivery.properties.clone());
        let output = match self.transformer.transform(input).await {
            Ok(output) => output,
            Err(e) => match outcome_for_transform_error(&e) {
                Outcome::Rejected => {
                    warn!(
                        event = "message_rejected",
                        delivery_tag = delivery.delivery_tag,
                        error = %e,
                        "Malformed release event, dropping"
                    );
                    delivery
                        .reject(BasicRejectOptions { requeue: false })
                        .await
                        .context("Failed to reject")?;
                    return Ok(Outcome::Rejected);
                }
                _ => {
                    error!(
                        event = "transform_failed",
                        delivery_tag = delivery.delivery_tag,
                        error = %e,
                        "Transformation failed"
                    );
                    return self.requeue(delivery).await;
                }
            },
        };

        let confirm = match self
            .target_channel
            .basic_publish(
                &self.config.target_exchange,
                &self.config.target_routing_key,
                BasicPublishOptions::default(),
                &output.data,
                output.properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => {
                error!(event = "publish_failed", error = %e, "Failed to publish news");
                return self.requeue(delivery).await;
            }
        };

        match confirm.await {
            Ok(confirmation) if !confirmation.is_nack() => {
                delivery
                    .ack(BasicAckOptions::default())
                    .await
                    .context("Failed to ack")?;
                info!(
                    event = "news_published",
                    delivery_tag = delivery.delivery_tag,
                    "Published news to target"
                );
                Ok(Outcome::Announced)
            }
            Ok(_) => {
                error!(event = "publish_nacked", "Broker refused the news message");
                self.requeue(delivery).await
            }
            Err(e) => {
                error!(event = "publish_confirm_failed", error = %e, "Publisher confirmation failed");
                self.requeue(delivery).await
            }
        }
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<Outcome, Error> {
        delivery
            .nack(BasicNackOptions {
                requeue: true,
                multiple: false,
            })
            .await
            .context("Failed to nack")?;
        Ok(Outcome::Requeued)
    }

    async fn consume(&self, mut consumer: Consumer) -> Result<(), Error> {
        while let Some(delivery_result) = consumer.next().await {
            if !self.is_connected() {
                error!(event = "connection_lost", "Connection lost, stopping consumer loop");
                self.mark_unhealthy().await;
                return Err(anyhow::anyhow!("Connection lost during message processing"));
            }

            let delivery = match delivery_result {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(event = "consumer_error", error = %e, "Error receiving message");
                    self.mark_unhealthy().await;
                    return Err(anyhow::anyhow!("Consumer error: {e}"));
                }
            };

            match self.process(&delivery).await {
                Ok(Outcome::Requeued) if !self.is_connected() => {
                    error!(
                        event = "channel_closed",
                        "Channel closed by broker, rebuilding bridge"
                    );
                    self.mark_unhealthy().await;
                    return Err(anyhow::anyhow!("Channel closed while publishing"));
                }
                Ok(outcome) => self.health_state.write().await.record(outcome),
                Err(e) => {
                    error!(event = "ack_failed", error = %e, "Failed to settle delivery");
                    self.mark_unhealthy().await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            event = "bridge_consuming",
            queue = %self.config.source_queue,
            "Starting to consume release events"
        );

        let consumer = self
            .source_channel
            .basic_consume(
                &self.config.source_queue,
                "release_news_bridge",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to start consuming")?;

        self.consume(consumer).await?;

        warn!(event = "consumer_ended", "Consumer stream ended");
        self.mark_unhealthy().await;
        Err(anyhow::anyhow!("Consumer stream ended unexpectedly"))
    }
}
