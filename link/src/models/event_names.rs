//! Names of the events that cross the wire or are published locally.
//!
//! Event names are not case-normalized; only payload keys are.

// Control channel
pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";
pub const CONNECT_ERROR: &str = "connect_error";
pub const RECONNECT_ATTEMPT: &str = "reconnect_attempt";

// Heartbeat
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

// Subscription protocol
pub const SUBSCRIBE: &str = "subscribe";
pub const SUBSCRIBE_ACK: &str = "subscribe_ack";
pub const UNSUBSCRIBE: &str = "unsubscribe";
pub const UNSUBSCRIBE_ACK: &str = "unsubscribe_ack";
pub const ENTITY_WATCHERS_CHANGED: &str = "entity_watchers_changed";

// Business events
pub const ENTITY_CREATED: &str = "entity_created";
pub const ENTITY_UPDATED: &str = "entity_updated";
pub const ENTITY_DELETED: &str = "entity_deleted";
pub const COMMENT_ADDED: &str = "comment_added";
pub const COMMENT_UPDATED: &str = "comment_updated";
pub const COMMENT_DELETED: &str = "comment_deleted";
pub const COMMENT_REACTION_CHANGED: &str = "comment_reaction_changed";
pub const JOB_PROGRESS: &str = "job_progress";

// Local only, never sent
pub const CONNECTION_STATE_CHANGED: &str = "connection_state_changed";
pub const CONNECTION_ERROR: &str = "connection_error";
pub const SUBSCRIPTION_ERROR: &str = "subscription_error";
