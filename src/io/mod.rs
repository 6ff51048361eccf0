//! I/O infrastructure: wire messages, pub/sub abstraction, the in-memory
//! transport, and scenario resources.

pub mod broker;
pub mod memory;
pub mod messages;
pub mod scenario;

pub use broker::{
    topics, BrokerAccess, BrokerError, KafkaAccessConfig, MqttAccessConfig, Publisher,
    SubscriberCallback, Subscription, TopicEndpoint,
};
pub use memory::MemoryBroker;
pub use messages::{
    BodyPresentationMessage, CollisionDistance, CollisionNotificationMessage, HumanStateMessage,
    RobotStateMessage,
};
pub use scenario::{BodyStateEvent, ScenarioResources};
