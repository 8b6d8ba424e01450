//! AMQP adapters for the durable task queue.
//!
//! Tasks go to the default exchange with the queue name as routing key. Each
//! message carries the task id as `message_id`, and optionally a `return` header
//! naming the queue a consumer should reply to.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tollgate_application::TaskQueue;
use tollgate_core::{AppError, AppResult};
use tollgate_domain::{Task, TaskId};
use tracing::{debug, warn};

const RETURN_HEADER: &str = "return";
const PERSISTENT: u8 = 2;

/// Shared AMQP connection that opens queue channels.
#[derive(Clone)]
pub struct AmqpBroker {
    connection: Arc<Connection>,
}

impl AmqpBroker {
    /// Connects to the broker at `amqp_url`.
    pub async fn connect(amqp_url: &str) -> AppResult<Self> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to connect to amqp broker: {error}"))
            })?;

        Ok(Self {
            connection: Arc::new(connection),
        })
    }

    /// Declares `queue_name` durably and returns a publisher for it.
    pub async fn task_queue(&self, queue_name: impl Into<String>) -> AppResult<AmqpTaskQueue> {
        let name = queue_name.into();
        let channel = self.declared_channel(name.as_str()).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to enable publisher confirms on '{name}': {error}"
                ))
            })?;

        Ok(AmqpTaskQueue { name, channel })
    }

    /// Declares `queue_name` durably and starts consuming at most `prefetch`
    /// unacknowledged tasks at a time.
    pub async fn consumer(
        &self,
        queue_name: impl Into<String>,
        prefetch: u16,
    ) -> AppResult<AmqpTaskConsumer> {
        let name = queue_name.into();
        let channel = self.declared_channel(name.as_str()).await?;
        channel
            .basic_qos(prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to set prefetch on '{name}': {error}"))
            })?;

        let consumer_tag = format!("{name}-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                name.as_str(),
                consumer_tag.as_str(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to consume from '{name}': {error}"))
            })?;

        Ok(AmqpTaskConsumer {
            name,
            _channel: channel,
            consumer,
        })
    }

    /// Closes the connection and every channel opened on it.
    pub async fn close(&self) -> AppResult<()> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to close amqp connection: {error}"))
            })
    }

    async fn declared_channel(&self, name: &str) -> AppResult<Channel> {
        let channel = self.connection.create_channel().await.map_err(|error| {
            AppError::Unavailable(format!("failed to open amqp channel: {error}"))
        })?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to declare queue '{name}': {error}"))
            })?;

        Ok(channel)
    }
}

/// Publisher side of one durable queue.
#[derive(Clone)]
pub struct AmqpTaskQueue {
    name: String,
    channel: Channel,
}

impl AmqpTaskQueue {
    /// Publishes tasks whose consumers should reply to `return_key`.
    pub async fn publish_with_return(&self, tasks: &[Task], return_key: &str) -> AppResult<()> {
        self.publish_all(tasks, Some(return_key)).await
    }

    async fn publish_all(&self, tasks: &[Task], return_key: Option<&str>) -> AppResult<()> {
        let mut confirms = Vec::with_capacity(tasks.len());
        for task in tasks {
            let mut properties = BasicProperties::default()
                .with_delivery_mode(PERSISTENT)
                .with_message_id(ShortString::from(task.id().as_str().to_owned()));
            if let Some(return_key) = return_key {
                let mut headers = FieldTable::default();
                headers.insert(
                    ShortString::from(RETURN_HEADER),
                    AMQPValue::LongString(LongString::from(return_key.to_owned())),
                );
                properties = properties.with_headers(headers);
            }

            let confirm = self
                .channel
                .basic_publish(
                    "",
                    self.name.as_str(),
                    BasicPublishOptions::default(),
                    task.payload(),
                    properties,
                )
                .await
                .map_err(|error| {
                    AppError::Unavailable(format!(
                        "failed to publish task '{}' to '{}': {error}",
                        task.id(),
                        self.name
                    ))
                })?;
            confirms.push(confirm);
        }

        for confirm in confirms {
            let confirmation = confirm.await.map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to confirm publish to '{}': {error}",
                    self.name
                ))
            })?;
            if confirmation.is_nack() {
                return Err(AppError::Unavailable(format!(
                    "broker rejected a publish to '{}'",
                    self.name
                )));
            }
        }

        debug!(queue = %self.name, published = tasks.len(), "published tasks");
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for AmqpTaskQueue {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn depth(&self) -> AppResult<u64> {
        let queue = self
            .channel
            .queue_declare(
                self.name.as_str(),
                QueueDeclareOptions {
                    passive: true,
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to inspect queue '{}': {error}",
                    self.name
                ))
            })?;

        Ok(u64::from(queue.message_count()))
    }

    async fn publish(&self, tasks: &[Task]) -> AppResult<()> {
        self.publish_all(tasks, None).await
    }
}

/// Consumer side of one durable queue.
pub struct AmqpTaskConsumer {
    name: String,
    _channel: Channel,
    consumer: Consumer,
}

impl AmqpTaskConsumer {
    /// Waits for the next task. Returns `None` once the consumer is cancelled.
    ///
    /// A delivery without a task id is rejected without requeueing before its
    /// validation error is returned, so it never holds a prefetch slot.
    pub async fn next(&mut self) -> Option<AppResult<ReceivedTask>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(error) => {
                return Some(Err(AppError::Unavailable(format!(
                    "failed to receive from '{}': {error}",
                    self.name
                ))));
            }
        };

        let id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
            .unwrap_or_default();
        let id = match TaskId::new(id) {
            Ok(id) => id,
            Err(error) => {
                warn!(queue = %self.name, error = %error, "rejecting message without a task id");
                if let Err(reject_error) = delivery
                    .acker
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                {
                    return Some(Err(AppError::Unavailable(format!(
                        "failed to reject undecodable message on '{}': {reject_error}",
                        self.name
                    ))));
                }
                return Some(Err(AppError::Validation(format!(
                    "message on '{}' carries no task id",
                    self.name
                ))));
            }
        };

        let return_key = delivery
            .properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(&ShortString::from(RETURN_HEADER)))
            .and_then(|value| match value {
                AMQPValue::LongString(value) => {
                    Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(value) => Some(value.as_str().to_owned()),
                _ => None,
            });

        Some(Ok(ReceivedTask {
            task: Task::new(id, delivery.data),
            return_key,
            acker: delivery.acker,
        }))
    }
}

/// One delivered task awaiting acknowledgement.
pub struct ReceivedTask {
    task: Task,
    return_key: Option<String>,
    acker: Acker,
}

impl ReceivedTask {
    /// Returns the delivered task.
    #[must_use]
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Returns the queue the producer asked replies to go to.
    #[must_use]
    pub fn return_key(&self) -> Option<&str> {
        self.return_key.as_deref()
    }

    /// Acknowledges the delivery.
    pub async fn ack(&self) -> AppResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to ack task '{}': {error}",
                    self.task.id()
                ))
            })
    }

    /// Rejects the delivery, returning it to the queue when `requeue` is set.
    pub async fn reject(&self, requeue: bool) -> AppResult<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to reject task '{}': {error}",
                    self.task.id()
                ))
            })
    }
}
