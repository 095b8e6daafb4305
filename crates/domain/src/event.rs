//! Integration event trait.

use serde::{Serialize, de::DeserializeOwned};

/// An event published to other services through the outbox.
///
/// Events describe facts that already happened and are named in past tense.
/// The dedup key lets consumers drop redeliveries.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Topic the event is routed to.
    fn topic(&self) -> &'static str;

    /// Key consumers use to deduplicate deliveries of the same fact.
    fn dedup_key(&self) -> String;
}
