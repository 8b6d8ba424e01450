//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod amqp_task_queue;
mod in_memory_coordination_store;
mod in_memory_task_queue;
mod postgres_task_source;
mod redis_coordination_store;
mod reqwest_http_transport;

pub use amqp_task_queue::{AmqpBroker, AmqpTaskConsumer, AmqpTaskQueue, ReceivedTask};
pub use in_memory_coordination_store::InMemoryCoordinationStore;
pub use in_memory_task_queue::InMemoryTaskQueue;
pub use postgres_task_source::PostgresTaskSource;
pub use redis_coordination_store::RedisCoordinationStore;
pub use reqwest_http_transport::{DEFAULT_CREDENTIAL_HEADER, ReqwestHttpTransport};
