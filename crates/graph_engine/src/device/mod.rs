//! Logical device handle and dispatch seam
//!
//! Every Vulkan entry point the runtime consumes is funneled through the
//! [`DeviceDispatch`] trait. The shipped implementations are
//! [`vulkan::VulkanDispatch`] (an `ash` adapter) and
//! [`headless::HeadlessDispatch`] (a software simulation used for headless
//! runs and tests). All long-lived objects hold a [`LogicalDevice`] clone and
//! become invalid if the device is torn down first.

pub mod headless;
pub mod vulkan;

use std::fmt;
use std::sync::Arc;

use ash::vk;

use crate::error::EngineResult;

/// One semaphore entry of a submission, wait or signal side.
///
/// `value` is ignored by binary semaphores; for timeline semaphores it is the
/// absolute value to signal or wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSubmit {
    /// Semaphore handle
    pub semaphore: vk::Semaphore,
    /// Absolute timeline value (unused for binary semaphores)
    pub value: u64,
    /// Pipeline stages the wait blocks or the signal is ordered after
    pub stage_mask: vk::PipelineStageFlags2,
}

/// Owned submission description.
///
/// Owning the entry vectors keeps submissions free of borrowed `Vk*Info`
/// pointer chains so they can cross threads; dispatch adapters translate to
/// the native layout at the boundary.
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    /// Command buffers to execute, in order
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Semaphores to wait on before execution
    pub waits: Vec<SemaphoreSubmit>,
    /// Semaphores to signal after execution
    pub signals: Vec<SemaphoreSubmit>,
}

impl SubmitInfo {
    /// Submission executing a single command buffer
    pub fn with_command_buffer(command_buffer: vk::CommandBuffer) -> Self {
        Self {
            command_buffers: vec![command_buffer],
            ..Self::default()
        }
    }
}

/// Owned presentation description
#[derive(Debug, Clone)]
pub struct PresentInfo {
    /// Swapchain to present on
    pub swapchain: vk::SwapchainKHR,
    /// Swapchain image to present
    pub image_index: u32,
    /// Binary semaphores the present waits on
    pub wait_semaphores: Vec<vk::Semaphore>,
}

/// Result of a successful present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The image was presented and the swapchain still matches the surface
    Optimal,
    /// The image was presented but the swapchain should be rebuilt
    Suboptimal,
}

/// Result of a successful image acquisition
#[derive(Debug, Clone, Copy)]
pub struct AcquireOutcome {
    /// Index of the acquired swapchain image
    pub image_index: u32,
    /// The swapchain should be rebuilt at the next opportunity
    pub suboptimal: bool,
}

/// Where a buffer's backing memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device-local memory, not host accessible
    DeviceLocal,
    /// Host-visible, host-coherent memory (staging)
    HostVisible,
}

/// A buffer handle together with its backing memory
#[derive(Debug, Clone, Copy)]
pub struct BufferAllocation {
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// Allocation size in bytes
    pub size: vk::DeviceSize,
}

/// An image handle together with its backing memory
#[derive(Debug, Clone, Copy)]
pub struct ImageAllocation {
    /// Image handle
    pub image: vk::Image,
    /// Backing memory
    pub memory: vk::DeviceMemory,
}

/// Shape and format of a transferable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescription {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth in texels (1 for 2D images)
    pub depth: u32,
    /// Texel format
    pub format: vk::Format,
}

impl ImageDescription {
    /// Size of one texel in bytes for the formats the transfer path accepts
    pub fn texel_size(&self) -> u64 {
        match self.format {
            vk::Format::R8_UINT | vk::Format::R8_UNORM => 1,
            vk::Format::R8G8B8A8_UNORM
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::B8G8R8A8_UNORM
            | vk::Format::B8G8R8A8_SRGB => 4,
            vk::Format::R32G32B32A32_SFLOAT => 16,
            _ => 4,
        }
    }

    /// Total byte size of the image payload
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.depth) * self.texel_size()
    }
}

/// The device entry points the runtime consumes.
///
/// The surface is deliberately narrow: synchronization primitives, queue
/// submission, swapchain hand-off, command recording for transfers, and the
/// handful of pipeline helpers render nodes need. Anything else belongs to
/// the application layer.
pub trait DeviceDispatch: Send + Sync {
    // --- fences ---

    /// Create a fence, optionally already signaled
    fn create_fence(&self, signaled: bool) -> EngineResult<vk::Fence>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);
    /// Wait for fences; `wait_all` selects all-of vs any-of semantics
    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout_ns: u64)
        -> EngineResult<()>;
    /// Poll a fence without waiting
    fn fence_status(&self, fence: vk::Fence) -> EngineResult<bool>;
    /// Reset fences to the unsignaled state
    fn reset_fences(&self, fences: &[vk::Fence]) -> EngineResult<()>;

    // --- semaphores ---

    /// Create a binary semaphore
    fn create_binary_semaphore(&self) -> EngineResult<vk::Semaphore>;
    /// Create a timeline semaphore with the given initial value
    fn create_timeline_semaphore(&self, initial_value: u64) -> EngineResult<vk::Semaphore>;
    /// Destroy a semaphore of either kind
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Signal a timeline semaphore from the host
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> EngineResult<()>;
    /// Wait on timeline semaphore values from the host
    fn wait_semaphores(&self, waits: &[(vk::Semaphore, u64)], timeout_ns: u64)
        -> EngineResult<()>;
    /// Read the current counter of a timeline semaphore
    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> EngineResult<u64>;

    // --- queues ---

    /// Fetch a queue handle of a family
    fn device_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue;
    /// Submit work to a queue; `fence` may be null
    fn queue_submit(&self, queue: vk::Queue, submit: SubmitInfo, fence: vk::Fence)
        -> EngineResult<()>;
    /// Present a swapchain image
    fn queue_present(&self, queue: vk::Queue, present: PresentInfo)
        -> EngineResult<PresentOutcome>;
    /// Acquire the next swapchain image, signaling `semaphore` when ready
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> EngineResult<AcquireOutcome>;

    // --- command pools and buffers ---

    /// Create a command pool for a queue family
    fn create_command_pool(&self, family_index: u32, transient: bool)
        -> EngineResult<vk::CommandPool>;
    /// Destroy a command pool and everything allocated from it
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Allocate one primary command buffer
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> EngineResult<vk::CommandBuffer>;
    /// Begin recording
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        one_time_submit: bool,
    ) -> EngineResult<()>;
    /// End recording
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> EngineResult<()>;

    // --- transfer recording ---

    /// Record a full-range buffer-to-buffer copy
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    );
    /// Record a buffer-to-image copy covering the whole image
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        description: &ImageDescription,
    );
    /// Record an image-to-buffer copy covering the whole image
    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Buffer,
        description: &ImageDescription,
    );

    // --- pipeline helpers ---

    /// Push constants into the bound pipeline layout
    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    /// Create a shader module from SPIR-V words
    fn create_shader_module(&self, code: &[u32]) -> EngineResult<vk::ShaderModule>;
    /// Destroy a shader module
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    /// Create a framebuffer
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        width: u32,
        height: u32,
    ) -> EngineResult<vk::Framebuffer>;
    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // --- resources ---

    /// Create a buffer with bound memory
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> EngineResult<BufferAllocation>;
    /// Destroy a buffer and free its memory
    fn destroy_buffer(&self, allocation: &BufferAllocation);
    /// Write bytes into host-visible memory
    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8])
        -> EngineResult<()>;
    /// Read bytes out of host-visible memory
    fn read_memory(&self, memory: vk::DeviceMemory, offset: u64, out: &mut [u8])
        -> EngineResult<()>;
    /// Create an image with bound memory
    fn create_image(
        &self,
        description: &ImageDescription,
        usage: vk::ImageUsageFlags,
    ) -> EngineResult<ImageAllocation>;
    /// Destroy an image and free its memory
    fn destroy_image(&self, allocation: &ImageAllocation);

    // --- device ---

    /// Block until the device is idle
    fn wait_idle(&self) -> EngineResult<()>;
}

/// Clonable handle to the logical device.
///
/// The handle owns the dispatch; everything else borrows it by holding a
/// clone. Dropping the last clone does not destroy outstanding Vulkan
/// objects, so owners must run their `Drop` impls first (the engine enforces
/// a `wait_idle` before teardown).
#[derive(Clone)]
pub struct LogicalDevice {
    dispatch: Arc<dyn DeviceDispatch>,
}

impl LogicalDevice {
    /// Wrap a dispatch implementation
    pub fn new(dispatch: impl DeviceDispatch + 'static) -> Self {
        Self {
            dispatch: Arc::new(dispatch),
        }
    }

    /// Access the dispatch table
    pub fn dispatch(&self) -> &dyn DeviceDispatch {
        self.dispatch.as_ref()
    }

    /// Block until all queues of the device are idle
    pub fn wait_idle(&self) -> EngineResult<()> {
        self.dispatch.wait_idle()
    }

    /// Whether two handles refer to the same device
    pub fn same_device(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.dispatch, &other.dispatch)
    }
}

impl fmt::Debug for LogicalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalDevice").finish_non_exhaustive()
    }
}
