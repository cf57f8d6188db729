//! Software device dispatch
//!
//! A functional simulation of the dispatch surface for headless runs and
//! tests. Fences and semaphores are condvar-backed states, memory is byte
//! vectors, and submissions retire synchronously: a `queue_submit` blocks on
//! its wait semaphores, replays the recorded transfer commands, then signals
//! its signal semaphores and fence. Present and acquire outcomes can be
//! scripted per call to exercise the swapchain error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;

use crate::error::{EngineError, EngineResult};

use super::{
    AcquireOutcome, BufferAllocation, DeviceDispatch, ImageAllocation, ImageDescription,
    MemoryLocation, PresentInfo, PresentOutcome, SubmitInfo,
};

/// Upper bound on any simulated wait so a broken test fails instead of hanging
const MAX_SIMULATED_WAIT: Duration = Duration::from_secs(10);

/// Scripted outcome for a present or acquire call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Report the swapchain as out of date
    OutOfDate,
    /// Succeed but flag the swapchain as suboptimal
    Suboptimal,
}

#[derive(Debug)]
enum SemaphoreState {
    // Binary signals are counted so pipelined frames that signal before the
    // previous wait retired do not lose a handshake.
    Binary { pending_signals: u32 },
    Timeline { value: u64 },
}

#[derive(Debug, Clone, Copy)]
enum RecordedCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        size: u64,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        size: u64,
    },
    CopyImageToBuffer {
        src: vk::Image,
        dst: vk::Buffer,
        size: u64,
    },
}

#[derive(Debug, Default)]
struct SwapchainState {
    image_count: u32,
    next_image: u32,
    acquire_count: u64,
}

#[derive(Default)]
struct State {
    semaphores: HashMap<u64, SemaphoreState>,
    signal_counts: HashMap<u64, u64>,
    fences: HashMap<u64, bool>,
    memory: HashMap<u64, Vec<u8>>,
    buffers: HashMap<u64, u64>,
    images: HashMap<u64, u64>,
    pools: HashMap<u64, Vec<u64>>,
    command_buffers: HashMap<u64, Vec<RecordedCommand>>,
    recording: HashMap<u64, bool>,
    swapchains: HashMap<u64, SwapchainState>,
    present_script: HashMap<u64, ScriptedOutcome>,
    acquire_script: HashMap<u64, ScriptedOutcome>,
    presented_images: Vec<u32>,
    present_calls: u64,
    submit_count: u64,
}

struct Shared {
    state: Mutex<State>,
    progress: Condvar,
    next_handle: AtomicU64,
}

/// Software dispatch with shared, inspectable state.
///
/// Clones share the same simulated device, so a test can keep one clone for
/// assertions after handing another to [`super::LogicalDevice::new`].
#[derive(Clone)]
pub struct HeadlessDispatch {
    shared: Arc<Shared>,
}

impl Default for HeadlessDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDispatch {
    /// Create an empty simulated device
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                progress: Condvar::new(),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    fn fresh_handle(&self) -> u64 {
        self.shared.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register a simulated swapchain with the given image count
    pub fn register_swapchain(&self, image_count: u32) -> vk::SwapchainKHR {
        let handle = self.fresh_handle();
        self.lock().swapchains.insert(
            handle,
            SwapchainState {
                image_count,
                ..SwapchainState::default()
            },
        );
        vk::SwapchainKHR::from_raw(handle)
    }

    /// Script the outcome of the nth present call (1-based)
    pub fn script_present(&self, nth_call: u64, outcome: ScriptedOutcome) {
        self.lock().present_script.insert(nth_call, outcome);
    }

    /// Script the outcome of the nth acquire call on a swapchain (1-based)
    pub fn script_acquire(&self, nth_call: u64, outcome: ScriptedOutcome) {
        self.lock().acquire_script.insert(nth_call, outcome);
    }

    /// Total acquire calls across all swapchains
    pub fn total_acquires(&self) -> u64 {
        self.lock().swapchains.values().map(|s| s.acquire_count).sum()
    }

    /// Image indices presented successfully, in order
    pub fn presented_images(&self) -> Vec<u32> {
        self.lock().presented_images.clone()
    }

    /// Number of successful presents
    pub fn successful_presents(&self) -> u64 {
        self.lock().presented_images.len() as u64
    }

    /// Number of queue submissions executed
    pub fn submit_count(&self) -> u64 {
        self.lock().submit_count
    }

    /// Fences currently alive (created and not yet destroyed)
    pub fn live_fence_count(&self) -> usize {
        self.lock().fences.len()
    }

    /// Semaphores currently alive
    pub fn live_semaphore_count(&self) -> usize {
        self.lock().semaphores.len()
    }

    /// How often a semaphore has been signaled (submit, acquire, or host)
    pub fn signal_count(&self, semaphore: vk::Semaphore) -> u64 {
        self.lock()
            .signal_counts
            .get(&semaphore.as_raw())
            .copied()
            .unwrap_or(0)
    }

    /// Current counter of a timeline semaphore
    pub fn timeline_value(&self, semaphore: vk::Semaphore) -> Option<u64> {
        match self.lock().semaphores.get(&semaphore.as_raw()) {
            Some(SemaphoreState::Timeline { value }) => Some(*value),
            _ => None,
        }
    }

    /// Snapshot of a memory allocation's bytes
    pub fn memory_bytes(&self, memory: vk::DeviceMemory) -> Option<Vec<u8>> {
        self.lock().memory.get(&memory.as_raw()).cloned()
    }

    fn note_signal(state: &mut State, raw: u64) {
        *state.signal_counts.entry(raw).or_insert(0) += 1;
    }

    fn signal_one(state: &mut State, raw: u64, value: u64) {
        match state.semaphores.get_mut(&raw) {
            Some(SemaphoreState::Binary { pending_signals }) => *pending_signals += 1,
            Some(SemaphoreState::Timeline { value: current }) => {
                *current = (*current).max(value);
            }
            None => {}
        }
        Self::note_signal(state, raw);
    }

    /// Block until every wait entry is satisfied, consuming binary signals.
    fn await_waits(&self, waits: &[(u64, u64)]) -> EngineResult<()> {
        let mut state = self.lock();
        for &(raw, value) in waits {
            loop {
                let satisfied = match state.semaphores.get_mut(&raw) {
                    Some(SemaphoreState::Binary { pending_signals }) => {
                        if *pending_signals > 0 {
                            *pending_signals -= 1;
                            true
                        } else {
                            false
                        }
                    }
                    Some(SemaphoreState::Timeline { value: current }) => *current >= value,
                    None => true,
                };
                if satisfied {
                    break;
                }
                let (next, timeout) = self
                    .shared
                    .progress
                    .wait_timeout(state, MAX_SIMULATED_WAIT)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state = next;
                if timeout.timed_out() {
                    return Err(EngineError::Timeout {
                        what: format!("semaphore {raw:#x}"),
                    });
                }
            }
        }
        Ok(())
    }

    fn execute_command(state: &mut State, command: RecordedCommand) {
        match command {
            RecordedCommand::CopyBuffer { src, dst, size } => {
                let src_memory = state.buffers.get(&src.as_raw()).copied();
                let dst_memory = state.buffers.get(&dst.as_raw()).copied();
                if let (Some(src_memory), Some(dst_memory)) = (src_memory, dst_memory) {
                    let data: Vec<u8> = state
                        .memory
                        .get(&src_memory)
                        .map(|bytes| bytes[..size as usize].to_vec())
                        .unwrap_or_default();
                    if let Some(dst_bytes) = state.memory.get_mut(&dst_memory) {
                        dst_bytes[..data.len()].copy_from_slice(&data);
                    }
                }
            }
            RecordedCommand::CopyBufferToImage { src, dst, size } => {
                let src_memory = state.buffers.get(&src.as_raw()).copied();
                let dst_memory = state.images.get(&dst.as_raw()).copied();
                if let (Some(src_memory), Some(dst_memory)) = (src_memory, dst_memory) {
                    let data: Vec<u8> = state
                        .memory
                        .get(&src_memory)
                        .map(|bytes| bytes[..size as usize].to_vec())
                        .unwrap_or_default();
                    if let Some(dst_bytes) = state.memory.get_mut(&dst_memory) {
                        dst_bytes[..data.len()].copy_from_slice(&data);
                    }
                }
            }
            RecordedCommand::CopyImageToBuffer { src, dst, size } => {
                let src_memory = state.images.get(&src.as_raw()).copied();
                let dst_memory = state.buffers.get(&dst.as_raw()).copied();
                if let (Some(src_memory), Some(dst_memory)) = (src_memory, dst_memory) {
                    let data: Vec<u8> = state
                        .memory
                        .get(&src_memory)
                        .map(|bytes| bytes[..size as usize].to_vec())
                        .unwrap_or_default();
                    if let Some(dst_bytes) = state.memory.get_mut(&dst_memory) {
                        dst_bytes[..data.len()].copy_from_slice(&data);
                    }
                }
            }
        }
    }
}

impl DeviceDispatch for HeadlessDispatch {
    fn create_fence(&self, signaled: bool) -> EngineResult<vk::Fence> {
        let handle = self.fresh_handle();
        self.lock().fences.insert(handle, signaled);
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.lock().fences.remove(&fence.as_raw());
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        _timeout_ns: u64,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        loop {
            let mut signaled = 0usize;
            for fence in fences {
                if state.fences.get(&fence.as_raw()).copied().unwrap_or(false) {
                    signaled += 1;
                }
            }
            let done = if wait_all {
                signaled == fences.len()
            } else {
                signaled > 0 || fences.is_empty()
            };
            if done {
                return Ok(());
            }
            let (next, timeout) = self
                .shared
                .progress
                .wait_timeout(state, MAX_SIMULATED_WAIT)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = next;
            if timeout.timed_out() {
                return Err(EngineError::Timeout {
                    what: "fences".to_string(),
                });
            }
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> EngineResult<bool> {
        Ok(self.lock().fences.get(&fence.as_raw()).copied().unwrap_or(false))
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> EngineResult<()> {
        let mut state = self.lock();
        for fence in fences {
            state.fences.insert(fence.as_raw(), false);
        }
        Ok(())
    }

    fn create_binary_semaphore(&self) -> EngineResult<vk::Semaphore> {
        let handle = self.fresh_handle();
        self.lock()
            .semaphores
            .insert(handle, SemaphoreState::Binary { pending_signals: 0 });
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> EngineResult<vk::Semaphore> {
        let handle = self.fresh_handle();
        self.lock().semaphores.insert(
            handle,
            SemaphoreState::Timeline {
                value: initial_value,
            },
        );
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.lock().semaphores.remove(&semaphore.as_raw());
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> EngineResult<()> {
        {
            let mut state = self.lock();
            Self::signal_one(&mut state, semaphore.as_raw(), value);
        }
        self.shared.progress.notify_all();
        Ok(())
    }

    fn wait_semaphores(&self, waits: &[(vk::Semaphore, u64)], _timeout_ns: u64) -> EngineResult<()> {
        let mut state = self.lock();
        for &(semaphore, value) in waits {
            loop {
                let satisfied = match state.semaphores.get(&semaphore.as_raw()) {
                    Some(SemaphoreState::Timeline { value: current }) => *current >= value,
                    // Host waits are only defined for timelines; treat anything
                    // else as satisfied so a misuse shows up in validation, not
                    // as a hang.
                    _ => true,
                };
                if satisfied {
                    break;
                }
                let (next, timeout) = self
                    .shared
                    .progress
                    .wait_timeout(state, MAX_SIMULATED_WAIT)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state = next;
                if timeout.timed_out() {
                    return Err(EngineError::Timeout {
                        what: format!("timeline semaphore {:#x}", semaphore.as_raw()),
                    });
                }
            }
        }
        Ok(())
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> EngineResult<u64> {
        match self.lock().semaphores.get(&semaphore.as_raw()) {
            Some(SemaphoreState::Timeline { value }) => Ok(*value),
            Some(SemaphoreState::Binary { .. }) => Err(EngineError::InvalidOperation {
                reason: "counter query on a binary semaphore".to_string(),
            }),
            None => Err(EngineError::InvalidOperation {
                reason: "counter query on an unknown semaphore".to_string(),
            }),
        }
    }

    fn device_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        // Stable synthetic handle so the same (family, index) maps to the
        // same queue across calls.
        let raw = 0x5155_0000_u64 | (u64::from(family_index) << 8) | u64::from(queue_index);
        vk::Queue::from_raw(raw)
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        submit: SubmitInfo,
        fence: vk::Fence,
    ) -> EngineResult<()> {
        let waits: Vec<(u64, u64)> = submit
            .waits
            .iter()
            .map(|w| (w.semaphore.as_raw(), w.value))
            .collect();
        self.await_waits(&waits)?;

        {
            let mut state = self.lock();
            for command_buffer in &submit.command_buffers {
                let commands = state
                    .command_buffers
                    .get(&command_buffer.as_raw())
                    .cloned()
                    .unwrap_or_default();
                for command in commands {
                    Self::execute_command(&mut state, command);
                }
            }
            for signal in &submit.signals {
                Self::signal_one(&mut state, signal.semaphore.as_raw(), signal.value);
            }
            if fence != vk::Fence::null() {
                state.fences.insert(fence.as_raw(), true);
            }
            state.submit_count += 1;
        }
        self.shared.progress.notify_all();
        Ok(())
    }

    fn queue_present(&self, _queue: vk::Queue, present: PresentInfo) -> EngineResult<PresentOutcome> {
        let waits: Vec<(u64, u64)> = present
            .wait_semaphores
            .iter()
            .map(|s| (s.as_raw(), 0))
            .collect();
        self.await_waits(&waits)?;

        let outcome = {
            let mut state = self.lock();
            state.present_calls += 1;
            let present_call_idx = state.present_calls;
            match state.present_script.remove(&present_call_idx) {
                Some(ScriptedOutcome::OutOfDate) => Err(EngineError::SwapchainOutOfDate),
                Some(ScriptedOutcome::Suboptimal) => {
                    state.presented_images.push(present.image_index);
                    Ok(PresentOutcome::Suboptimal)
                }
                None => {
                    state.presented_images.push(present.image_index);
                    Ok(PresentOutcome::Optimal)
                }
            }
        };
        self.shared.progress.notify_all();
        outcome
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> EngineResult<AcquireOutcome> {
        let outcome = {
            let mut state = self.lock();
            let total: u64 = state.swapchains.values().map(|s| s.acquire_count).sum();
            let scripted = state.acquire_script.remove(&(total + 1));
            let entry = state.swapchains.get_mut(&swapchain.as_raw()).ok_or_else(|| {
                EngineError::InvalidOperation {
                    reason: "acquire on an unknown swapchain".to_string(),
                }
            })?;
            entry.acquire_count += 1;
            match scripted {
                Some(ScriptedOutcome::OutOfDate) => Err(EngineError::SwapchainOutOfDate),
                scripted => {
                    let image_index = entry.next_image;
                    entry.next_image = (entry.next_image + 1) % entry.image_count.max(1);
                    Self::signal_one(&mut state, semaphore.as_raw(), 0);
                    Ok(AcquireOutcome {
                        image_index,
                        suboptimal: scripted == Some(ScriptedOutcome::Suboptimal),
                    })
                }
            }
        };
        self.shared.progress.notify_all();
        outcome
    }

    fn create_command_pool(&self, _family_index: u32, _transient: bool) -> EngineResult<vk::CommandPool> {
        let handle = self.fresh_handle();
        self.lock().pools.insert(handle, Vec::new());
        Ok(vk::CommandPool::from_raw(handle))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        if let Some(buffers) = state.pools.remove(&pool.as_raw()) {
            for buffer in buffers {
                state.command_buffers.remove(&buffer);
                state.recording.remove(&buffer);
            }
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> EngineResult<vk::CommandBuffer> {
        let handle = self.fresh_handle();
        let mut state = self.lock();
        let pool_entry = state.pools.get_mut(&pool.as_raw()).ok_or_else(|| {
            EngineError::InvalidOperation {
                reason: "allocation from an unknown command pool".to_string(),
            }
        })?;
        pool_entry.push(handle);
        state.command_buffers.insert(handle, Vec::new());
        Ok(vk::CommandBuffer::from_raw(handle))
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _one_time_submit: bool,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        state.command_buffers.insert(command_buffer.as_raw(), Vec::new());
        state.recording.insert(command_buffer.as_raw(), true);
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> EngineResult<()> {
        let mut state = self.lock();
        match state.recording.insert(command_buffer.as_raw(), false) {
            Some(true) => Ok(()),
            _ => Err(EngineError::InvalidOperation {
                reason: "end on a command buffer that was not recording".to_string(),
            }),
        }
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        if let Some(commands) = self.lock().command_buffers.get_mut(&command_buffer.as_raw()) {
            commands.push(RecordedCommand::CopyBuffer { src, dst, size });
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        description: &ImageDescription,
    ) {
        if let Some(commands) = self.lock().command_buffers.get_mut(&command_buffer.as_raw()) {
            commands.push(RecordedCommand::CopyBufferToImage {
                src,
                dst,
                size: description.byte_size(),
            });
        }
    }

    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Buffer,
        description: &ImageDescription,
    ) {
        if let Some(commands) = self.lock().command_buffers.get_mut(&command_buffer.as_raw()) {
            commands.push(RecordedCommand::CopyImageToBuffer {
                src,
                dst,
                size: description.byte_size(),
            });
        }
    }

    fn cmd_push_constants(
        &self,
        _command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        _offset: u32,
        _data: &[u8],
    ) {
    }

    fn create_shader_module(&self, _code: &[u32]) -> EngineResult<vk::ShaderModule> {
        Ok(vk::ShaderModule::from_raw(self.fresh_handle()))
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {}

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _width: u32,
        _height: u32,
    ) -> EngineResult<vk::Framebuffer> {
        Ok(vk::Framebuffer::from_raw(self.fresh_handle()))
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {}

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        _location: MemoryLocation,
    ) -> EngineResult<BufferAllocation> {
        let buffer = self.fresh_handle();
        let memory = self.fresh_handle();
        let mut state = self.lock();
        state.memory.insert(memory, vec![0u8; size as usize]);
        state.buffers.insert(buffer, memory);
        Ok(BufferAllocation {
            buffer: vk::Buffer::from_raw(buffer),
            memory: vk::DeviceMemory::from_raw(memory),
            size,
        })
    }

    fn destroy_buffer(&self, allocation: &BufferAllocation) {
        let mut state = self.lock();
        state.buffers.remove(&allocation.buffer.as_raw());
        state.memory.remove(&allocation.memory.as_raw());
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> EngineResult<()> {
        let mut state = self.lock();
        let bytes = state.memory.get_mut(&memory.as_raw()).ok_or_else(|| {
            EngineError::InvalidOperation {
                reason: "write to an unknown memory allocation".to_string(),
            }
        })?;
        let offset = offset as usize;
        if offset + data.len() > bytes.len() {
            return Err(EngineError::InvalidOperation {
                reason: "write past the end of the allocation".to_string(),
            });
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_memory(&self, memory: vk::DeviceMemory, offset: u64, out: &mut [u8]) -> EngineResult<()> {
        let state = self.lock();
        let bytes = state.memory.get(&memory.as_raw()).ok_or_else(|| {
            EngineError::InvalidOperation {
                reason: "read from an unknown memory allocation".to_string(),
            }
        })?;
        let offset = offset as usize;
        if offset + out.len() > bytes.len() {
            return Err(EngineError::InvalidOperation {
                reason: "read past the end of the allocation".to_string(),
            });
        }
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn create_image(
        &self,
        description: &ImageDescription,
        _usage: vk::ImageUsageFlags,
    ) -> EngineResult<ImageAllocation> {
        let image = self.fresh_handle();
        let memory = self.fresh_handle();
        let size = description.byte_size();
        let mut state = self.lock();
        state.memory.insert(memory, vec![0u8; size as usize]);
        state.images.insert(image, memory);
        Ok(ImageAllocation {
            image: vk::Image::from_raw(image),
            memory: vk::DeviceMemory::from_raw(memory),
        })
    }

    fn destroy_image(&self, allocation: &ImageAllocation) {
        let mut state = self.lock();
        state.images.remove(&allocation.image.as_raw());
        state.memory.remove(&allocation.memory.as_raw());
    }

    fn wait_idle(&self) -> EngineResult<()> {
        // Submissions retire synchronously; nothing can still be in flight.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SemaphoreSubmit;

    #[test]
    fn binary_semaphore_signal_is_consumed_by_wait() {
        let dispatch = HeadlessDispatch::new();
        let semaphore = dispatch.create_binary_semaphore().unwrap();
        let queue = dispatch.device_queue(0, 0);

        let signal = SubmitInfo {
            signals: vec![SemaphoreSubmit {
                semaphore,
                value: 0,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            }],
            ..SubmitInfo::default()
        };
        dispatch.queue_submit(queue, signal, vk::Fence::null()).unwrap();
        assert_eq!(dispatch.signal_count(semaphore), 1);

        let wait = SubmitInfo {
            waits: vec![SemaphoreSubmit {
                semaphore,
                value: 0,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            }],
            ..SubmitInfo::default()
        };
        dispatch.queue_submit(queue, wait, vk::Fence::null()).unwrap();
    }

    #[test]
    fn timeline_values_only_grow() {
        let dispatch = HeadlessDispatch::new();
        let semaphore = dispatch.create_timeline_semaphore(3).unwrap();
        dispatch.signal_semaphore(semaphore, 10).unwrap();
        dispatch.signal_semaphore(semaphore, 5).unwrap();
        assert_eq!(dispatch.semaphore_counter_value(semaphore).unwrap(), 10);
    }

    #[test]
    fn recorded_copy_moves_bytes_between_allocations() {
        let dispatch = HeadlessDispatch::new();
        let src = dispatch
            .create_buffer(4, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::HostVisible)
            .unwrap();
        let dst = dispatch
            .create_buffer(4, vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::DeviceLocal)
            .unwrap();
        dispatch.write_memory(src.memory, 0, &[1, 2, 3, 4]).unwrap();

        let pool = dispatch.create_command_pool(0, true).unwrap();
        let command_buffer = dispatch.allocate_command_buffer(pool).unwrap();
        dispatch.begin_command_buffer(command_buffer, true).unwrap();
        dispatch.cmd_copy_buffer(command_buffer, src.buffer, dst.buffer, 4);
        dispatch.end_command_buffer(command_buffer).unwrap();

        let queue = dispatch.device_queue(0, 0);
        dispatch
            .queue_submit(queue, SubmitInfo::with_command_buffer(command_buffer), vk::Fence::null())
            .unwrap();
        assert_eq!(dispatch.memory_bytes(dst.memory).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn scripted_present_failure_surfaces_once() {
        let dispatch = HeadlessDispatch::new();
        let swapchain = dispatch.register_swapchain(3);
        let queue = dispatch.device_queue(0, 0);
        dispatch.script_present(1, ScriptedOutcome::OutOfDate);

        let present = PresentInfo {
            swapchain,
            image_index: 0,
            wait_semaphores: Vec::new(),
        };
        assert!(matches!(
            dispatch.queue_present(queue, present.clone()),
            Err(EngineError::SwapchainOutOfDate)
        ));
        assert!(dispatch.queue_present(queue, present).is_ok());
        assert_eq!(dispatch.successful_presents(), 1);
    }
}
