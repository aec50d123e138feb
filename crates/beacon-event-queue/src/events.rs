//! Lifecycle notifications published by the event queue.

use beacon_context::Context;

/// Events emitted by [`EventQueue`](crate::EventQueue).
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Before and enrichment stages finished for a context.
    MessageEnriched { context_id: String },
    /// One destination accepted a context.
    MessageDelivered {
        context_id: String,
        destination: String,
    },
    /// Full traversal completed.
    DeliverySuccess(Context),
    /// Context resolved with `failed_delivery` set.
    DeliveryFailure { context: Context, reason: String },
    /// Context went back to the retry queue.
    DeliveryRetry { context_id: String, attempts: u32 },
    /// A context left the queue, successfully or not.
    Flush { context_id: String, delivered: bool },
}
