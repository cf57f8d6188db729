//! ash-backed device dispatch
//!
//! Thin adapter translating the owned submit/present value types onto the
//! `ash` entry points. The adapter is constructed from an already-created
//! device; instance creation, device selection, and surface plumbing stay in
//! the application layer.

use ash::vk;

use crate::error::{EngineError, EngineResult};

use super::{
    AcquireOutcome, BufferAllocation, DeviceDispatch, ImageAllocation, ImageDescription,
    MemoryLocation, PresentInfo, PresentOutcome, SubmitInfo,
};

/// Dispatch over a real Vulkan device
pub struct VulkanDispatch {
    device: ash::Device,
    swapchain_loader: ash::extensions::khr::Swapchain,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDispatch {
    /// Wrap an existing logical device.
    ///
    /// The dispatch takes ownership of `device` and destroys it on drop, so
    /// it must outlive every object created through it.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let swapchain_loader = ash::extensions::khr::Swapchain::new(instance, &device);
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        Self {
            device,
            swapchain_loader,
            memory_properties,
        }
    }

    fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> EngineResult<u32> {
        for i in 0..self.memory_properties.memory_type_count {
            if (type_filter & (1 << i)) != 0
                && (self.memory_properties.memory_types[i as usize].property_flags & properties)
                    == properties
            {
                return Ok(i);
            }
        }
        Err(EngineError::NoSuitableMemoryType)
    }

    fn allocate_bound_memory(
        &self,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> EngineResult<vk::DeviceMemory> {
        let properties = match location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let memory_type_index = self.find_memory_type(requirements.memory_type_bits, properties)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        unsafe {
            self.device
                .allocate_memory(&alloc_info, None)
                .map_err(EngineError::Api)
        }
    }

    fn semaphore_submit_infos(entries: &[super::SemaphoreSubmit]) -> Vec<vk::SemaphoreSubmitInfo> {
        entries
            .iter()
            .map(|entry| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(entry.semaphore)
                    .value(entry.value)
                    .stage_mask(entry.stage_mask)
                    .build()
            })
            .collect()
    }
}

impl DeviceDispatch for VulkanDispatch {
    fn create_fence(&self, signaled: bool) -> EngineResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe {
            self.device
                .create_fence(&create_info, None)
                .map_err(EngineError::Api)
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe {
            self.device.destroy_fence(fence, None);
        }
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> EngineResult<()> {
        if fences.is_empty() {
            return Ok(());
        }
        unsafe {
            self.device
                .wait_for_fences(fences, wait_all, timeout_ns)
                .map_err(EngineError::Api)
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> EngineResult<bool> {
        unsafe { self.device.get_fence_status(fence).map_err(EngineError::Api) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> EngineResult<()> {
        unsafe { self.device.reset_fences(fences).map_err(EngineError::Api) }
    }

    fn create_binary_semaphore(&self) -> EngineResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        unsafe {
            self.device
                .create_semaphore(&create_info, None)
                .map_err(EngineError::Api)
        }
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> EngineResult<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        unsafe {
            self.device
                .create_semaphore(&create_info, None)
                .map_err(EngineError::Api)
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe {
            self.device.destroy_semaphore(semaphore, None);
        }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> EngineResult<()> {
        let signal_info = vk::SemaphoreSignalInfo::builder()
            .semaphore(semaphore)
            .value(value);
        unsafe {
            self.device
                .signal_semaphore(&signal_info)
                .map_err(EngineError::Api)
        }
    }

    fn wait_semaphores(&self, waits: &[(vk::Semaphore, u64)], timeout_ns: u64) -> EngineResult<()> {
        if waits.is_empty() {
            return Ok(());
        }
        let semaphores: Vec<vk::Semaphore> = waits.iter().map(|w| w.0).collect();
        let values: Vec<u64> = waits.iter().map(|w| w.1).collect();
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        unsafe {
            self.device
                .wait_semaphores(&wait_info, timeout_ns)
                .map_err(EngineError::Api)
        }
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> EngineResult<u64> {
        unsafe {
            self.device
                .get_semaphore_counter_value(semaphore)
                .map_err(EngineError::Api)
        }
    }

    fn device_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family_index, queue_index) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: SubmitInfo,
        fence: vk::Fence,
    ) -> EngineResult<()> {
        let waits = Self::semaphore_submit_infos(&submit.waits);
        let signals = Self::semaphore_submit_infos(&submit.signals);
        let command_buffers: Vec<vk::CommandBufferSubmitInfo> = submit
            .command_buffers
            .iter()
            .map(|&command_buffer| {
                vk::CommandBufferSubmitInfo::builder()
                    .command_buffer(command_buffer)
                    .build()
            })
            .collect();
        let submit_info = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals)
            .build();
        unsafe {
            self.device
                .queue_submit2(queue, &[submit_info], fence)
                .map_err(EngineError::Api)
        }
    }

    fn queue_present(&self, queue: vk::Queue, present: PresentInfo) -> EngineResult<PresentOutcome> {
        let swapchains = [present.swapchain];
        let image_indices = [present.image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&present.wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let suboptimal = unsafe {
            self.swapchain_loader
                .queue_present(queue, &present_info)
                .map_err(|result| match result {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => EngineError::SwapchainOutOfDate,
                    other => EngineError::Api(other),
                })?
        };
        Ok(if suboptimal {
            PresentOutcome::Suboptimal
        } else {
            PresentOutcome::Optimal
        })
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> EngineResult<AcquireOutcome> {
        let (image_index, suboptimal) = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
                .map_err(|result| match result {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => EngineError::SwapchainOutOfDate,
                    other => EngineError::Api(other),
                })?
        };
        Ok(AcquireOutcome {
            image_index,
            suboptimal,
        })
    }

    fn create_command_pool(&self, family_index: u32, transient: bool) -> EngineResult<vk::CommandPool> {
        let mut flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        if transient {
            flags |= vk::CommandPoolCreateFlags::TRANSIENT;
        }
        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(family_index);
        unsafe {
            self.device
                .create_command_pool(&create_info, None)
                .map_err(EngineError::Api)
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe {
            self.device.destroy_command_pool(pool, None);
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> EngineResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(EngineError::Api)?
        };
        Ok(buffers[0])
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        one_time_submit: bool,
    ) -> EngineResult<()> {
        let flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(EngineError::Api)
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> EngineResult<()> {
        unsafe {
            self.device
                .end_command_buffer(command_buffer)
                .map_err(EngineError::Api)
        }
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        let region = vk::BufferCopy::builder().size(size).build();
        unsafe {
            self.device.cmd_copy_buffer(command_buffer, src, dst, &[region]);
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        description: &ImageDescription,
    ) {
        let subresource_range = vk::ImageSubresourceRange::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1)
            .build();
        let to_transfer = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst)
            .subresource_range(subresource_range)
            .build();
        let region = vk::BufferImageCopy::builder()
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1)
                    .build(),
            )
            .image_extent(vk::Extent3D {
                width: description.width,
                height: description.height,
                depth: description.depth,
            })
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Buffer,
        description: &ImageDescription,
    ) {
        let region = vk::BufferImageCopy::builder()
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1)
                    .build(),
            )
            .image_extent(vk::Extent3D {
                width: description.width,
                height: description.height,
                depth: description.depth,
            })
            .build();
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                &[region],
            );
        }
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(command_buffer, layout, stages, offset, data);
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> EngineResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        unsafe {
            self.device
                .create_shader_module(&create_info, None)
                .map_err(EngineError::Api)
        }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe {
            self.device.destroy_shader_module(module, None);
        }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        width: u32,
        height: u32,
    ) -> EngineResult<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(width)
            .height(height)
            .layers(1);
        unsafe {
            self.device
                .create_framebuffer(&create_info, None)
                .map_err(EngineError::Api)
        }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe {
            self.device.destroy_framebuffer(framebuffer, None);
        }
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> EngineResult<BufferAllocation> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            self.device
                .create_buffer(&create_info, None)
                .map_err(EngineError::Api)?
        };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory = self.allocate_bound_memory(requirements, location)?;
        unsafe {
            self.device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(EngineError::Api)?;
        }
        Ok(BufferAllocation {
            buffer,
            memory,
            size,
        })
    }

    fn destroy_buffer(&self, allocation: &BufferAllocation) {
        unsafe {
            self.device.destroy_buffer(allocation.buffer, None);
            self.device.free_memory(allocation.memory, None);
        }
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> EngineResult<()> {
        unsafe {
            let pointer = self
                .device
                .map_memory(
                    memory,
                    offset,
                    data.len() as u64,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(EngineError::Api)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), pointer.cast(), data.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn read_memory(&self, memory: vk::DeviceMemory, offset: u64, out: &mut [u8]) -> EngineResult<()> {
        unsafe {
            let pointer = self
                .device
                .map_memory(memory, offset, out.len() as u64, vk::MemoryMapFlags::empty())
                .map_err(EngineError::Api)?;
            std::ptr::copy_nonoverlapping(pointer.cast(), out.as_mut_ptr(), out.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn create_image(
        &self,
        description: &ImageDescription,
        usage: vk::ImageUsageFlags,
    ) -> EngineResult<ImageAllocation> {
        let image_type = if description.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(image_type)
            .format(description.format)
            .extent(vk::Extent3D {
                width: description.width,
                height: description.height,
                depth: description.depth,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe {
            self.device
                .create_image(&create_info, None)
                .map_err(EngineError::Api)?
        };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = self.allocate_bound_memory(requirements, MemoryLocation::DeviceLocal)?;
        unsafe {
            self.device
                .bind_image_memory(image, memory, 0)
                .map_err(EngineError::Api)?;
        }
        Ok(ImageAllocation { image, memory })
    }

    fn destroy_image(&self, allocation: &ImageAllocation) {
        unsafe {
            self.device.destroy_image(allocation.image, None);
            self.device.free_memory(allocation.memory, None);
        }
    }

    fn wait_idle(&self) -> EngineResult<()> {
        unsafe { self.device.device_wait_idle().map_err(EngineError::Api) }
    }
}

impl Drop for VulkanDispatch {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}
