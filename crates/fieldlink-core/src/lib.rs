//! Core types shared by the fieldlink gateway crates.
//!
//! This crate defines the error type, the gateway event model, the
//! broadcast event bus used for real-time fan-out, and configuration.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use event::{CommandStatus, ConnectionState, EventMetadata, GatewayEvent};
pub use eventbus::{
    DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver, FilteredReceiver, SharedEventBus,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{
        CommandSettings, GatewayConfig, MqttSettings, StorageSettings, TopicSettings,
    };
    pub use crate::error::{Error, Result};
    pub use crate::event::{CommandStatus, ConnectionState, EventMetadata, GatewayEvent};
    pub use crate::eventbus::{EventBus, SharedEventBus};
}
