//! Synchronization primitives and submit-time composition
//!
//! [`SyncPrimitives`] owns the raw fence/semaphore handles, keyed by name.
//! [`SyncOperations`] is the freely copyable value describing the wait and
//! signal entries of one submission. [`SyncObject`] couples primitives with
//! named operation groups so producers and consumers of a graph link agree on
//! how its semaphores are used.

mod feedback;
mod object;
mod operations;
mod primitives;

pub use feedback::SyncFeedbackService;
pub use object::{sync_groups, OperationKind, SyncObject, SyncObjectId, SyncObjectSpec};
pub use operations::{PipelineStageCheck, SyncOperations};
pub use primitives::SyncPrimitives;
