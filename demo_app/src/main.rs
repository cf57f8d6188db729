//! Headless frame-loop demo
//!
//! Builds the canonical acquire -> draw -> present graph on the software
//! device dispatch, uploads a vertex buffer through the transfer node, and
//! pumps a fixed number of frames. Useful as an API walkthrough and as a
//! smoke test environment without a GPU.

use std::sync::{Arc, Mutex};

use ash::vk;

use graph_engine::device::headless::HeadlessDispatch;
use graph_engine::prelude::*;
use graph_engine::resources::{Buffer, BufferState};
use graph_engine::window::RebuildFlag;

const FRAMES: u32 = 60;
const BACK_BUFFER_COUNT: u32 = 3;

/// Minimal renderer: records one empty command buffer per frame
struct ClearRenderer {
    device: LogicalDevice,
    context: Arc<CommandContext>,
    recorded: Mutex<Option<vk::CommandBuffer>>,
}

impl Renderer for ClearRenderer {
    fn draw(&mut self, image_index: u32) -> EngineResult<()> {
        log::debug!("recording draw for swapchain image {image_index}");
        let command_buffer = self.context.create_command_buffer(0)?;
        self.device
            .dispatch()
            .begin_command_buffer(command_buffer, false)?;
        self.device.dispatch().end_command_buffer(command_buffer)?;
        *self.recorded.lock().unwrap() = Some(command_buffer);
        Ok(())
    }

    fn command_buffers(&self, _frame: u64) -> Vec<vk::CommandBuffer> {
        self.recorded.lock().unwrap().take().into_iter().collect()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let dispatch = HeadlessDispatch::new();
    let device = LogicalDevice::new(dispatch.clone());

    let graphics_flags =
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
    let graphics_balancer = Arc::new(QueueLoadBalancer::new(&device, 0, 2));
    let render_context = Arc::new(CommandContext::new(
        device.clone(),
        0,
        graphics_flags,
        graphics_balancer.clone(),
        BACK_BUFFER_COUNT,
    )?);
    let present_context = Arc::new(CommandContext::new(
        device.clone(),
        0,
        graphics_flags,
        graphics_balancer,
        BACK_BUFFER_COUNT,
    )?);
    let transfer_balancer = Arc::new(QueueLoadBalancer::new(&device, 1, 1));
    let transfer_context = Arc::new(SingleShotCommandContext::new(
        device.clone(),
        1,
        vk::QueueFlags::TRANSFER,
        transfer_balancer,
    ));

    let config = RenderEngineConfig {
        back_buffer_count: BACK_BUFFER_COUNT,
        in_flight_frames: Some(2),
        validation_layers: Vec::new(),
    };
    let mut engine = ParallelRenderEngine::new(
        device.clone(),
        render_context.clone(),
        present_context,
        transfer_context.clone(),
        config,
    );

    let swapchain = Arc::new(Swapchain::new(
        device.clone(),
        dispatch.register_swapchain(BACK_BUFFER_COUNT),
        BACK_BUFFER_COUNT,
    ));
    let window = Arc::new(RebuildFlag::new());

    let mut builder = engine.create_render_graph_builder("headless-frame");
    builder.add_cpu_node(
        "acquire",
        Box::new(ImageAcquireTask::new(window.clone(), swapchain.clone(), "draw")),
    )?;
    builder.add_transfer_node("upload")?;
    builder.add_render_node(
        "draw",
        Box::new(ClearRenderer {
            device: device.clone(),
            context: render_context,
            recorded: Mutex::new(None),
        }),
        TrackingMode::On,
    )?;
    builder.add_present_node("present", swapchain, window)?;

    builder
        .add_cpu_sync_link("acquire", "draw")?
        .with_signal_wait_semaphore(
            ImageAcquireTask::IMAGE_AVAILABLE_SEMAPHORE_NAME,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        );
    builder.add_cpu_sync_link("upload", "draw")?;
    builder
        .add_cpu_sync_link("draw", "present")?
        .with_signal_wait_semaphore(
            RENDER_FINISHED_SEMAPHORE_NAME,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags2::ALL_COMMANDS,
        );
    engine.set_render_graph(builder.reset("installed"))?;

    // Feed some vertex data through the transfer node before the first frame.
    let vertex_buffer = Arc::new(Buffer::new(
        device.clone(),
        256,
        vk::BufferUsageFlags::VERTEX_BUFFER,
    )?);
    engine.transfer_scheduler().upload_buffer(
        &vertex_buffer,
        (0u8..=255).collect(),
        &transfer_context,
        BufferState {
            pipeline_stage: vk::PipelineStageFlags2::VERTEX_INPUT,
            queue_family_index: 0,
        },
    );

    log::info!("pumping {FRAMES} frames");
    for _ in 0..FRAMES {
        engine.render()?;
    }
    engine.wait_idle()?;

    log::info!(
        "done: {} acquires, {} submissions, {} presents",
        dispatch.total_acquires(),
        dispatch.submit_count(),
        dispatch.successful_presents()
    );
    Ok(())
}
