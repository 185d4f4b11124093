//! Data models for the triage-link engine.
//!
//! Defines connection configuration, connection state, the wire envelope,
//! event names and subscription metadata.

pub mod connection_options;
pub mod connection_state;
pub mod envelope;
pub mod event_names;
pub mod subscription_info;

pub use connection_options::ConnectionOptions;
pub use connection_state::{ConnectionSnapshot, ConnectionState};
pub use envelope::Envelope;
pub use subscription_info::{SubscriptionAck, SubscriptionInfo, SubscriptionStatus};
