//! Queue plumbing: load balancing, command contexts, submit tracking

mod command_context;
mod load_balancer;
mod submit_tracker;

pub use command_context::{CommandContext, QueueSubmit, SingleShotCommandContext};
pub use load_balancer::{GuardedQueue, QueueLoadBalancer};
pub use submit_tracker::QueueSubmitTracker;
