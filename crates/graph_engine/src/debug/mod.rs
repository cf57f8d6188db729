//! Compile-time filtered debug topics
//!
//! Verbose tracing is grouped into topics that are switched on and off at
//! compile time. A disabled topic compiles to nothing, so tracing the
//! synchronization layer or the graph runtime costs nothing in builds that
//! do not ask for it. Recoverable runtime errors bypass topics and go
//! straight through `log::warn!`/`log::error!`.

/// A compile-time switchable trace topic.
///
/// `ENABLED` must be a constant so the branch folds away entirely when the
/// topic is off.
pub trait Topic {
    /// Whether messages for this topic are compiled in
    const ENABLED: bool;
    /// Log target the topic's messages are tagged with
    const TARGET: &'static str;
}

/// Graph construction and staged-mutation tracing
pub struct RenderGraphBuilderTopic;

impl Topic for RenderGraphBuilderTopic {
    const ENABLED: bool = false;
    const TARGET: &'static str = "render_graph::builder";
}

/// Per-frame node execution tracing
pub struct RenderGraphExecutionTopic;

impl Topic for RenderGraphExecutionTopic {
    const ENABLED: bool = false;
    const TARGET: &'static str = "render_graph::execution";
}

/// Semaphore and fence lifecycle tracing
pub struct SynchronizationTopic;

impl Topic for SynchronizationTopic {
    const ENABLED: bool = false;
    const TARGET: &'static str = "synchronization";
}

/// Data-transfer scheduling tracing
pub struct DataTransferTopic;

impl Topic for DataTransferTopic {
    const ENABLED: bool = false;
    const TARGET: &'static str = "data_transfer";
}

/// Log a debug message under a topic; compiles out when the topic is disabled.
#[macro_export]
macro_rules! topic_log {
    ($topic:ty, $($arg:tt)*) => {
        if <$topic as $crate::debug::Topic>::ENABLED {
            log::debug!(target: <$topic as $crate::debug::Topic>::TARGET, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_topic_folds_to_constant_false() {
        assert!(!RenderGraphExecutionTopic::ENABLED);
        // The macro must still type-check against a disabled topic.
        topic_log!(RenderGraphExecutionTopic, "unreachable {}", 1);
    }
}
