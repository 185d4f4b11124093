//! Per-entity subscription bookkeeping.
//!
//! The registry itself is plain state owned by the connection task; the
//! public `subscribe`/`unsubscribe` calls on
//! [`TriageLinkClient`](crate::TriageLinkClient) reach it through the task's
//! command channel.

mod registry;

pub(crate) use registry::{
    entity_id_of, watchers_of, SubscribeReply, SubscriptionRegistry, UnsubscribeReply,
};
