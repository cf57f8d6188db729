//! Engine-wide error taxonomy

use ash::vk;

/// Errors surfaced by the rendering runtime
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Device or context setup failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Graph mutation rejected (duplicate name, dangling endpoint, bad shape)
    #[error("Render graph error: {reason}")]
    GraphConstruction {
        /// Why the mutation was rejected
        reason: String,
    },

    /// Operation not valid in the current state
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// No semaphore registered under the requested name
    #[error("Unknown semaphore: {name}")]
    UnknownSemaphore {
        /// The name that failed to resolve
        name: String,
    },

    /// The projected timeline value would wrap past `u64::MAX`
    #[error("Timeline overflow on semaphore '{name}'; recreate the semaphore to continue")]
    TimelineOverflow {
        /// Name of the affected timeline semaphore
        name: String,
    },

    /// A data transfer failed at submission
    #[error("Transfer failed: {reason}")]
    Transfer {
        /// Description of the failed transfer
        reason: String,
    },

    /// The swapchain no longer matches the surface and must be rebuilt
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// A wait ran past its deadline
    #[error("Timed out waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
    },

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Engine configuration could not be loaded or is not runnable
    #[error("Configuration error: {reason}")]
    Config {
        /// What is wrong with the configuration
        reason: String,
    },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
