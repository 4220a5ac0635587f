use crate::amqp::{connect_with_retry, preview};
use crate::conf::Config;
use crate::envelope::Envelope;
use crate::health::{Component, HealthStatus, Outcome, SharedHealthState};
use crate::news::{NewsItem, log_news};
use crate::transform::Message;
use anyhow::{Context, Error};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, Consumer};
use tracing::{error, info, warn};

/// Consumes the news queue and hands every message to [`log_news`].
pub struct NewsListener {
    channel: Channel,
    connection: Connection,
    queue: String,
    health_state: SharedHealthState,
}

/// Decode a news delivery body.
///
/// # Errors
/// Returns an error if the body is not a news item.
pub fn decode_news(message: &Message<'_>) -> Result<Envelope<NewsItem>, crate::Error> {
    message.decode()
}

impl NewsListener {
    pub async fn new(config: &Config, health_state: SharedHealthState) -> anyhow::Result<Self> {
        health_state
            .write()
            .await
            .set_status(Component::Listener, HealthStatus::Starting);

        let connection =
            connect_with_retry(&config.target_dsn, "Failed to connect to news RabbitMQ")
                .await
                .context("News RabbitMQ connection failed")?;

        let channel = connection
            .create_channel()
            .await
            .context("Failed to create news channel")?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .context("Failed to set QoS")?;

        health_state
            .write()
            .await
            .set_status(Component::Listener, HealthStatus::Healthy);

        Ok(Self {
            channel,
            connection,
            queue: config.news_queue.clone(),
            health_state,
        })
    }

    async fn mark_unhealthy(&self) {
        self.health_state
            .write()
            .await
            .set_status(Component::Listener, HealthStatus::Unhealthy);
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, Error> {
        let message = Message::new(&delivery.data[..], delivery.properties.clone());

        match decode_news(&message) {
            Ok(news) => {
                let ack = log_news(&news);
                delivery
                    .ack(BasicAckOptions::default())
                    .await
                    .context("Failed to ack")?;
                info!(
                    event = "news_acknowledged",
                    delivery_tag = delivery.delivery_tag,
                    ack,
                    "News acknowledged"
                );
                Ok(Outcome::Logged)
            }
            Err(e) => {
                warn!(
                    event = "news_rejected",
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    content = %preview(&delivery.data),
                    "Undecodable news message, dropping"
                );
                delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                    .context("Failed to reject")?;
                Ok(Outcome::Rejected)
            }
        }
    }

    async fn consume(&self, mut consumer: Consumer) -> Result<(), Error> {
        while let Some(delivery_result) = consumer.next().await {
            if !self.connection.status().connected() || !self.channel.status().connected() {
                error!(event = "connection_lost", "Connection lost, stopping news listener");
                self.mark_unhealthy().await;
                return Err(anyhow::anyhow!("Connection lost during message processing"));
            }

            let delivery = match delivery_result {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(event = "consumer_error", error = %e, "Error receiving news");
                    self.mark_unhealthy().await;
                    return Err(anyhow::anyhow!("Consumer error: {e}"));
                }
            };

            match self.handle(&delivery).await {
                Ok(outcome) => self.health_state.write().await.record(outcome),
                Err(e) => {
                    error!(event = "ack_failed", error = %e, "Failed to settle news delivery");
                    self.mark_unhealthy().await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            event = "news_listener_consuming",
            queue = %self.queue,
            "Starting to consume news"
        );

        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                "release_news_listener",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to start consuming news")?;

        self.consume(consumer).await?;

        warn!(event = "consumer_ended", "News consumer stream ended");
        self.mark_unhealthy().await;
        Err(anyhow::anyhow!("News consumer stream ended unexpectedly"))
    }
}
