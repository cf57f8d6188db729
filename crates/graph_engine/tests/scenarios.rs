//! End-to-end frame-loop scenarios on the software dispatch

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;

use graph_engine::device::headless::{HeadlessDispatch, ScriptedOutcome};
use graph_engine::prelude::*;
use graph_engine::resources::{Buffer, BufferState};
use graph_engine::window::RebuildFlag;

struct Harness {
    dispatch: HeadlessDispatch,
    device: LogicalDevice,
    engine: ParallelRenderEngine,
    transfer_context: Arc<SingleShotCommandContext>,
    swapchain: Arc<Swapchain>,
    window: Arc<RebuildFlag>,
    render_context: Arc<CommandContext>,
}

fn harness(back_buffer_count: u32, in_flight_frames: u32, swapchain_images: u32) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let dispatch = HeadlessDispatch::new();
    let device = LogicalDevice::new(dispatch.clone());

    let graphics_flags =
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
    let graphics_balancer = Arc::new(QueueLoadBalancer::new(&device, 0, 2));
    let render_context = Arc::new(
        CommandContext::new(
            device.clone(),
            0,
            graphics_flags,
            graphics_balancer.clone(),
            back_buffer_count,
        )
        .unwrap(),
    );
    let present_context = Arc::new(
        CommandContext::new(
            device.clone(),
            0,
            graphics_flags,
            graphics_balancer,
            back_buffer_count,
        )
        .unwrap(),
    );
    let transfer_balancer = Arc::new(QueueLoadBalancer::new(&device, 1, 1));
    let transfer_context = Arc::new(SingleShotCommandContext::new(
        device.clone(),
        1,
        vk::QueueFlags::TRANSFER,
        transfer_balancer,
    ));

    let config = RenderEngineConfig {
        back_buffer_count,
        in_flight_frames: Some(in_flight_frames),
        validation_layers: Vec::new(),
    };
    let engine = ParallelRenderEngine::new(
        device.clone(),
        render_context.clone(),
        present_context,
        transfer_context.clone(),
        config,
    );
    let swapchain = Arc::new(Swapchain::new(
        device.clone(),
        dispatch.register_swapchain(swapchain_images),
        swapchain_images,
    ));
    Harness {
        dispatch,
        device,
        engine,
        transfer_context,
        swapchain,
        window: Arc::new(RebuildFlag::new()),
        render_context,
    }
}

/// Renderer recording one empty command buffer per frame
struct RecordingRenderer {
    device: LogicalDevice,
    context: Arc<CommandContext>,
    draw_count: Arc<AtomicU32>,
    recorded: Mutex<Option<vk::CommandBuffer>>,
}

impl RecordingRenderer {
    fn new(device: LogicalDevice, context: Arc<CommandContext>) -> (Box<Self>, Arc<AtomicU32>) {
        let draw_count = Arc::new(AtomicU32::new(0));
        (
            Box::new(Self {
                device,
                context,
                draw_count: draw_count.clone(),
                recorded: Mutex::new(None),
            }),
            draw_count,
        )
    }
}

impl Renderer for RecordingRenderer {
    fn draw(&mut self, _image_index: u32) -> EngineResult<()> {
        let command_buffer = self.context.create_command_buffer(0)?;
        self.device
            .dispatch()
            .begin_command_buffer(command_buffer, false)?;
        self.device.dispatch().end_command_buffer(command_buffer)?;
        *self.recorded.lock().unwrap() = Some(command_buffer);
        self.draw_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn command_buffers(&self, _frame: u64) -> Vec<vk::CommandBuffer> {
        self.recorded.lock().unwrap().take().into_iter().collect()
    }
}

/// Builds the acquire -> draw -> present frame graph; the draw-to-present
/// link is `CpuSync` or `CpuAsync` depending on `pipelined_present`.
fn build_frame_graph(harness: &Harness, pipelined_present: bool) -> (Graph, Arc<AtomicU32>) {
    let (renderer, draw_count) =
        RecordingRenderer::new(harness.device.clone(), harness.render_context.clone());

    let mut builder = harness.engine.create_render_graph_builder("frame");
    builder
        .add_cpu_node(
            "acquire",
            Box::new(ImageAcquireTask::new(
                harness.window.clone(),
                harness.swapchain.clone(),
                "draw",
            )),
        )
        .unwrap();
    builder
        .add_render_node("draw", renderer, TrackingMode::On)
        .unwrap();
    builder
        .add_present_node("present", harness.swapchain.clone(), harness.window.clone())
        .unwrap();

    builder
        .add_cpu_sync_link("acquire", "draw")
        .unwrap()
        .with_signal_wait_semaphore(
            ImageAcquireTask::IMAGE_AVAILABLE_SEMAPHORE_NAME,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        );
    let link = if pipelined_present {
        builder.add_cpu_async_link("draw", "present")
    } else {
        builder.add_cpu_sync_link("draw", "present")
    };
    link.unwrap().with_signal_wait_semaphore(
        RENDER_FINISHED_SEMAPHORE_NAME,
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::PipelineStageFlags2::ALL_COMMANDS,
    );
    (builder.reset("done"), draw_count)
}

#[test]
fn minimal_present_loop_pumps_five_frames() {
    let mut harness = harness(3, 2, 3);
    let (graph, draw_count) = build_frame_graph(&harness, false);
    harness.engine.set_render_graph(graph).unwrap();

    for _ in 0..5 {
        harness.engine.render().unwrap();
        assert!(harness.engine.outstanding_frames() <= 2);
    }
    harness.engine.wait_idle().unwrap();

    assert_eq!(harness.dispatch.total_acquires(), 5);
    assert_eq!(draw_count.load(Ordering::Relaxed), 5);
    // Every frame produced exactly one render submission signaling
    // render-finished.
    assert_eq!(harness.dispatch.submit_count(), 5);
    assert_eq!(harness.dispatch.successful_presents(), 5);

    let mut presented = harness.dispatch.presented_images();
    presented.sort_unstable();
    assert_eq!(presented, vec![0, 0, 1, 1, 2]);
}

#[test]
fn lost_swapchain_skips_one_frame_and_recovers() {
    let mut harness = harness(3, 2, 3);
    let (graph, draw_count) = build_frame_graph(&harness, false);
    harness.engine.set_render_graph(graph).unwrap();
    harness
        .dispatch
        .script_present(3, ScriptedOutcome::OutOfDate);

    for _ in 0..3 {
        harness.engine.render().unwrap();
    }
    harness.engine.wait_idle().unwrap();
    assert_eq!(harness.dispatch.successful_presents(), 2);
    assert!(harness.window.is_requested(), "present must request a rebuild");

    // The owning window rebuilds the swapchain, then the loop continues.
    let rebuilt = harness.dispatch.register_swapchain(3);
    harness.swapchain.reinit(rebuilt, 3);
    harness.window.clear();

    for _ in 0..2 {
        harness.engine.render().unwrap();
    }
    harness.engine.wait_idle().unwrap();

    assert_eq!(draw_count.load(Ordering::Relaxed), 5);
    assert_eq!(harness.dispatch.successful_presents(), 4);

    // Teardown drains and destroys every fence, including frame 3's.
    let dispatch = harness.dispatch.clone();
    drop(harness);
    assert_eq!(dispatch.live_fence_count(), 0);
}

#[test]
fn coalesced_uploads_reach_the_device_as_one_submission() {
    let mut harness = harness(2, 2, 2);
    let mut builder = harness.engine.create_render_graph_builder("transfers");
    builder.add_transfer_node("upload").unwrap();
    harness.engine.set_render_graph(builder.reset("done")).unwrap();

    let buffer = Arc::new(
        Buffer::new(harness.device.clone(), 64, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap(),
    );
    let state = BufferState {
        pipeline_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        queue_family_index: 0,
    };
    let scheduler = harness.engine.transfer_scheduler().clone();
    scheduler.upload_buffer(&buffer, vec![0x00; 64], &harness.transfer_context, state);
    let task = scheduler.upload_buffer(&buffer, vec![0xFF; 64], &harness.transfer_context, state);

    harness.engine.render().unwrap();
    harness.engine.wait_idle().unwrap();

    assert_eq!(harness.dispatch.submit_count(), 1);
    assert_eq!(
        harness.dispatch.memory_bytes(buffer.memory()).unwrap(),
        vec![0xFF; 64]
    );
    let task = task.upgrade().expect("storage retained until reclaimed");
    assert!(task.lock().unwrap().is_finished());
}

#[test]
fn pipelined_present_waits_on_the_previous_frame() {
    let mut harness = harness(3, 2, 3);
    let (graph, draw_count) = build_frame_graph(&harness, true);

    // The cross-frame link shares one sync object between all slots; grab
    // its semaphore before the graph is frozen into the engine.
    let shared_link = graph
        .links()
        .into_iter()
        .find(|link| link.link_type() == LinkType::CpuAsync)
        .expect("draw -> present is pipelined");
    let shared_object = shared_link.shared_sync_object(&harness.device).unwrap();
    let render_finished = shared_object
        .primitives()
        .semaphore(RENDER_FINISHED_SEMAPHORE_NAME)
        .unwrap();

    harness.engine.set_render_graph(graph).unwrap();
    for _ in 0..4 {
        harness.engine.render().unwrap();
    }
    harness.engine.wait_idle().unwrap();

    // Frame 0's present passes on the initial state; frames 1..3 each
    // consume the signal of the frame before them. All four frames complete
    // without a stall, and every draw signaled the shared semaphore once.
    assert_eq!(draw_count.load(Ordering::Relaxed), 4);
    assert_eq!(harness.dispatch.successful_presents(), 4);
    assert_eq!(harness.dispatch.signal_count(render_finished), 4);
}

#[test]
fn relative_timeline_values_resolve_across_three_frames() {
    let harness = harness(2, 2, 2);
    let mut primitives = SyncPrimitives::create_empty(harness.device.clone());
    primitives
        .create_timeline_semaphore("frame-window", 0, 4)
        .unwrap();

    let mut resolved = Vec::new();
    for _ in 0..3 {
        let mut operations = SyncOperations::default();
        operations
            .add_wait_value(
                &primitives,
                "frame-window",
                vk::PipelineStageFlags2::ALL_COMMANDS,
                2,
            )
            .unwrap();
        resolved.push(operations.timeline_waits()[0].1);
        primitives.step_timeline("frame-window").unwrap();
    }
    assert_eq!(resolved, vec![2, 6, 10]);
}

struct CountingCompute {
    runs: Arc<AtomicU32>,
}

impl ComputeTask for CountingCompute {
    fn run(
        &self,
        _execution_context: &ExecutionContext,
        _sync_operations: &SyncOperations,
    ) -> EngineResult<()> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn compute_and_empty_nodes_run_every_frame() {
    let mut harness = harness(2, 2, 2);
    let runs = Arc::new(AtomicU32::new(0));

    let mut builder = harness.engine.create_render_graph_builder("compute");
    builder.add_empty_node("prepare").unwrap();
    builder
        .add_compute_node("simulate", Box::new(CountingCompute { runs: runs.clone() }))
        .unwrap();
    builder.add_cpu_sync_link("prepare", "simulate").unwrap();
    harness.engine.set_render_graph(builder.reset("done")).unwrap();

    for _ in 0..3 {
        harness.engine.render().unwrap();
    }
    harness.engine.wait_idle().unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 3);
}

#[test]
fn a_second_render_graph_is_rejected() {
    let mut harness = harness(2, 2, 2);
    let mut builder = harness.engine.create_render_graph_builder("first");
    builder.add_empty_node("only").unwrap();
    harness.engine.set_render_graph(builder.reset("a")).unwrap();

    let mut second = harness.engine.create_render_graph_builder("second");
    second.add_empty_node("only").unwrap();
    assert!(matches!(
        harness.engine.set_render_graph(second.reset("b")),
        Err(EngineError::InvalidOperation { .. })
    ));
}

#[test]
fn acquire_nodes_must_be_roots_and_present_nodes_leaves() {
    let harness = harness(2, 2, 2);
    let mut builder = harness.engine.create_render_graph_builder("bad-shape");
    builder.add_empty_node("before").unwrap();
    builder
        .add_cpu_node(
            "acquire",
            Box::new(ImageAcquireTask::new(
                harness.window.clone(),
                harness.swapchain.clone(),
                "draw",
            )),
        )
        .unwrap();
    builder.add_cpu_sync_link("before", "acquire").unwrap();

    let mut engine = harness.engine;
    assert!(matches!(
        engine.set_render_graph(builder.reset("x")),
        Err(EngineError::GraphConstruction { .. })
    ));
}
