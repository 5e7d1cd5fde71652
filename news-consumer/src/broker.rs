use std::sync::Arc;

use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::info;

/// Suffix of the dead letter queue derived from the work queue name.
const DEAD_LETTER_SUFFIX: &str = ".dead";

/// Our end of the message broker: one connection, one channel, the durable
/// work queue and its dead letter queue.
#[derive(Clone)]
pub struct Broker {
    // Kept alive for the lifetime of the channel.
    _connection: Arc<Connection>,
    channel: Channel,
    queue: String,
    dead_letter_queue: String,
}

impl Broker {
    /// Connect and declare both queues. The prefetch count bounds unacked
    /// deliveries pushed to this consumer, providing backpressure. The
    /// channel runs in confirm mode so `publish_dead_letter` completes only
    /// once the broker has taken ownership of the payload.
    pub async fn connect(
        uri: &str,
        queue: &str,
        prefetch_count: u16,
    ) -> Result<Broker, lapin::Error> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        channel
            .queue_declare(queue, durable, FieldTable::default())
            .await?;
        let dead_letter_queue = format!("{}{}", queue, DEAD_LETTER_SUFFIX);
        channel
            .queue_declare(&dead_letter_queue, durable, FieldTable::default())
            .await?;
        info!(queue, dead_letter_queue, "declared queues");

        Ok(Broker {
            _connection: Arc::new(connection),
            channel,
            queue: queue.to_owned(),
            dead_letter_queue,
        })
    }

    pub async fn consume(&self, consumer_tag: &str) -> Result<Consumer, lapin::Error> {
        self.channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
    }

    /// Park a message on the dead letter queue, retaining the original
    /// payload for inspection and recording why it ended up there.
    pub async fn publish_dead_letter(
        &self,
        payload: &[u8],
        reason: &str,
    ) -> Result<(), lapin::Error> {
        let mut headers = FieldTable::default();
        headers.insert(
            "x-dead-letter-reason".into(),
            AMQPValue::LongString(reason.to_owned().into()),
        );
        let properties = BasicProperties::default()
            .with_headers(headers)
            .with_delivery_mode(2); // persistent

        self.channel
            .basic_publish(
                "",
                &self.dead_letter_queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        Ok(())
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}
