//! Device command/response protocol engine for the fieldlink gateway.
//!
//! Devices are reached only through an MQTT broker:
//!
//! ```text
//! cloud ──► cmd/{device_id} ──► device
//! cloud ◄── resp/{device_id} ◄── device
//! cloud ◄── register ◄────────── device (pre-provisioning)
//! ```
//!
//! - [`connection`]: the single broker connection and its lifecycle
//! - [`router`]: maps inbound topics to exactly one handler
//! - [`dispatcher`]: command envelopes, correlation and `wait_for_ack`
//! - [`classifier`] / [`processor`]: response classification and side effects
//! - [`registrar`]: account resolution and auto-registration
//! - [`gateway`]: the facade wiring them together

pub mod classifier;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod processor;
pub mod registrar;
pub mod router;
pub mod testing;
pub mod topic;
pub mod translator;
pub mod transport;

pub use classifier::{classify, parse_payload, ResponseEvent};
pub use connection::ConnectionManager;
pub use dispatcher::{CommandDispatcher, DispatcherStats, PendingSummary};
pub use error::{GatewayError, RegistrationError, Result};
pub use gateway::Gateway;
pub use processor::ResponseProcessor;
pub use registrar::{AutoRegistrar, IdentityClaim, IdentityResolver, Registration, RegistrationHandler};
pub use router::{MessageHandler, TopicRouter};
pub use topic::topic_matches;
pub use translator::{ActionTranslator, CommandEnvelope, CommandTranslator, WireCommand};
pub use transport::{ConnectionEvent, PublishOptions, Qos, Transport};
