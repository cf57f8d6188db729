//! Swapchain hand-off and the window rebuild hook
//!
//! The runtime never creates or rebuilds swapchains itself; it acquires and
//! presents images on whatever the owning window registered, and raises a
//! rebuild request through [`WindowBridge`] when presentation reports the
//! swapchain stale.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use ash::vk;

use crate::device::{AcquireOutcome, LogicalDevice};
use crate::error::EngineResult;

struct SwapchainHandles {
    handle: vk::SwapchainKHR,
    image_count: u32,
}

/// The runtime's view of a window's swapchain.
///
/// Thread-safe: acquire runs on executor threads while the owning window may
/// swap in a rebuilt handle from the event thread.
pub struct Swapchain {
    logical_device: LogicalDevice,
    handles: Mutex<SwapchainHandles>,
}

impl Swapchain {
    /// Register an existing swapchain
    pub fn new(logical_device: LogicalDevice, handle: vk::SwapchainKHR, image_count: u32) -> Self {
        Self {
            logical_device,
            handles: Mutex::new(SwapchainHandles {
                handle,
                image_count,
            }),
        }
    }

    /// Current swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.lock().handle
    }

    /// Number of images in the current swapchain
    pub fn image_count(&self) -> u32 {
        self.lock().image_count
    }

    /// Swap in a rebuilt swapchain
    pub fn reinit(&self, handle: vk::SwapchainKHR, image_count: u32) {
        let mut handles = self.lock();
        handles.handle = handle;
        handles.image_count = image_count;
    }

    /// Acquire the next image, signaling `semaphore` when it is ready
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> EngineResult<AcquireOutcome> {
        let handle = self.handle();
        self.logical_device
            .dispatch()
            .acquire_next_image(handle, u64::MAX, semaphore)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SwapchainHandles> {
        self.handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Hook back into the owning window
pub trait WindowBridge: Send + Sync {
    /// Ask the window to rebuild its swapchain at the next opportunity
    fn request_swapchain_rebuild(&self);
}

/// Default bridge that latches rebuild requests into a flag
#[derive(Default)]
pub struct RebuildFlag {
    requested: AtomicBool,
}

impl RebuildFlag {
    /// Unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a rebuild was requested since the last [`clear`](Self::clear)
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Acknowledge the request
    pub fn clear(&self) {
        self.requested.store(false, Ordering::Release);
    }
}

impl WindowBridge for RebuildFlag {
    fn request_swapchain_rebuild(&self) {
        self.requested.store(true, Ordering::Release);
    }
}
