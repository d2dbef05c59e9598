pub mod event_publisher;
pub mod status_consumer;
pub mod status_update;

pub use event_publisher::{BrokerEventPublisher, EventPublisher, PublishError, TopicRoutes};
pub use status_consumer::{
    ConsumerHandle, ConsumerState, MessageOutcome, StatusConsumerSettings, StatusEventConsumer,
};
pub use status_update::{StatusUpdateError, StatusUpdateHandler};
