//! `amqp`-feature-gated [`Queue`] backed by `lapin`. Declares a queue the
//! way the original's `components/queue/amqp/channel.go` does: durable,
//! priority-enabled up to 9, lazy (disk-optimized), messages expiring after
//! a week. Illustrative plumbing at the component boundary; the core crawl
//! logic depends only on the `Queue` trait, never on this module.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongLongUInt, ShortUInt};
use lapin::{BasicProperties, Channel};
use tokio_util::sync::CancellationToken;

use crate::error::CrawlError;
use crate::queue::{Ack, ConsumeHandler, Queue, MESSAGE_TTL};
use crate::resource::AnnotatedResource;

fn declare_args() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-max-priority".into(), AMQPValue::ShortUInt(9 as ShortUInt));
    args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongUInt(MESSAGE_TTL.as_millis() as LongLongUInt),
    );
    args.insert("x-queue-mode".into(), AMQPValue::LongString("lazy".into()));
    args
}

impl From<lapin::Error> for CrawlError {
    fn from(e: lapin::Error) -> Self {
        CrawlError::Infrastructure(format!("amqp: {e}"))
    }
}

/// A single named AMQP queue (one of `hashes`, `files`, `directories`).
pub struct AmqpQueue {
    channel: Channel,
    queue_name: String,
}

impl AmqpQueue {
    /// Declares `queue_name` with the wire configuration spec.md §6 requires,
    /// then returns a handle bound to it.
    pub async fn declare(channel: Channel, queue_name: impl Into<String>) -> Result<Self, CrawlError> {
        let queue_name = queue_name.into();
        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions { durable: true, ..Default::default() },
                declare_args(),
            )
            .await?;
        Ok(Self { channel, queue_name })
    }
}

#[async_trait]
impl Queue for AmqpQueue {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        resource: AnnotatedResource,
        priority: crate::queue::Priority,
    ) -> Result<(), CrawlError> {
        let payload = serde_json::to_vec(&resource)?;
        let properties = BasicProperties::default().with_priority(priority.get());

        tokio::select! {
            _ = cancel.cancelled() => Err(CrawlError::Timeout { stage: "amqp-publish" }),
            res = self.channel.basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &payload,
                properties,
            ) => {
                res?.await?;
                Ok(())
            },
        }
    }

    async fn consume(&self, cancel: &CancellationToken, handler: Arc<dyn ConsumeHandler>) -> Result<(), CrawlError> {
        let consumer_tag = format!("{}-consumer", self.queue_name);
        let mut consumer = self
            .channel
            .basic_consume(&self.queue_name, &consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = consumer.next() => next,
            };

            let Some(delivery) = delivery else { return Ok(()) };
            let delivery = delivery?;

            let resource: AnnotatedResource = serde_json::from_slice(&delivery.data)?;

            match handler.handle(resource).await {
                Ok(Ack::Ack) => delivery.ack(BasicAckOptions::default()).await?,
                Ok(Ack::NackRequeue) => {
                    delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?
                },
                Ok(Ack::NackDiscard) => {
                    delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await?
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn depth(&self) -> Result<usize, CrawlError> {
        let passive = QueueDeclareOptions { passive: true, durable: true, ..Default::default() };
        let declared = self.channel.queue_declare(&self.queue_name, passive, FieldTable::default()).await?;
        Ok(declared.message_count() as usize)
    }
}
