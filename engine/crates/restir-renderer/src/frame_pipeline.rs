//! 每帧的 stage 编排
//!
//! 录制顺序固定为：
//!
//! ```text
//! Geometry ──depth/GBuffer──▶ RayTracing ──▶ Overlay ──▶ PresentCopy
//!                 light buffer (Transfer) ──┘
//! ```
//!
//! stage 之间的所有 barrier 都由 [`ResourceStateTracker`] 按 [`BarrierTable::restir`] 推导。
//! geometry 和光追 stage 录制前先取得自己的输出，上一帧留下的状态（例如 present 拷贝用的
//! TRANSFER_SRC）在这里转换回写入状态。overlay 在当前显示输出所处的状态上直接绘制，不产生 barrier。

use ash::vk;

use restir_gfx::{
    basic::color::LabelColor,
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier},
        command_stream::GfxCommandStream,
    },
    device::GfxDevice,
    error::GfxError,
    resources::{
        handles::GfxImageHandle,
        image::VulkanFormatUtils,
        resource_manager::GfxResourceManager,
    },
};
use restir_render_graph::{
    barrier::{RgBufferBarrierDesc, RgImageBarrierDesc},
    barrier_table::{BarrierTable, ResourceKind, StageCategory},
    resource_state::{RgBufferState, RgImageState},
    state_tracker::ResourceStateTracker,
};
use restir_scene::scene_manager::SceneManager;

use crate::{
    error::{PipelineError, PipelineResult},
    light_buffer::LightBufferBinding,
    output_registry::{OutputRegistry, OutputSelection, StageOutputs},
    pipeline_settings::FrameRenderInfo,
    stages::{
        GBufferView, OverlayStage, PipelineStages, PresentCopyStage, RaytraceInputs, RaytraceStage, RenderStage,
        StageContext, snapshot_outputs,
    },
};

/// 配置管线时需要的外部输入
#[derive(Clone, Copy, Debug)]
pub struct PipelineInputs {
    pub environment_map: GfxImageHandle,
    pub noise: GfxImageHandle,
    pub light_buffer: Option<LightBufferBinding>,
}

pub struct FramePipeline {
    stages: PipelineStages,
    tracker: ResourceStateTracker,
    registry: OutputRegistry,

    /// 当前被 tracker 跟踪的 stage 输出，重建时整体替换
    tracked_outputs: Vec<GfxImageHandle>,
    gbuffer: Option<GBufferView>,
    light_buffer: Option<LightBufferBinding>,

    extent: vk::Extent2D,
    configured: bool,
}
// new & init
impl FramePipeline {
    pub fn new(stages: PipelineStages) -> Self {
        Self {
            stages,
            tracker: ResourceStateTracker::new(BarrierTable::restir()),
            registry: OutputRegistry::new(),
            tracked_outputs: Vec::new(),
            gbuffer: None,
            light_buffer: None,
            extent: vk::Extent2D::default(),
            configured: false,
        }
    }

    /// 初始化所有 stage，建立输出注册表，并把 overlay / present 指向显示的输出
    ///
    /// `preferred_output` 不存在时返回 [`PipelineError::UnknownOutput`]；为空时显示第一个输出。
    pub fn configure(
        &mut self,
        ctx: &mut StageContext,
        scene: &SceneManager,
        inputs: &PipelineInputs,
        preferred_output: Option<&str>,
    ) -> PipelineResult<()> {
        let _span = restir_crate_tools::profile_span!("FramePipeline::configure");
        self.extent = ctx.extent;

        let geometry = &mut self.stages.geometry;
        geometry.init(ctx, scene).map_err(PipelineError::stage(geometry.name(), "initialize"))?;

        let gbuffer = self.snapshot_gbuffer()?;
        let raytrace = &mut self.stages.raytrace;
        raytrace
            .init(
                ctx,
                &RaytraceInputs {
                    gbuffer: gbuffer.clone(),
                    environment_map: inputs.environment_map,
                    noise: inputs.noise,
                    light_buffer: inputs.light_buffer,
                },
            )
            .map_err(PipelineError::stage(raytrace.name(), "initialize"))?;
        self.gbuffer = Some(gbuffer);
        self.track_light_buffer(inputs.light_buffer);

        let overlay = &mut self.stages.overlay;
        overlay.init(ctx, None).map_err(PipelineError::stage(overlay.name(), "initialize"))?;
        let present_copy = &mut self.stages.present_copy;
        present_copy.init(ctx, None).map_err(PipelineError::stage(present_copy.name(), "initialize"))?;

        self.rebuild_outputs(ctx.resource_manager)?;
        if let Some(name) = preferred_output {
            self.registry.request(name)?;
            self.registry.take_pending();
        }
        self.retarget_display();

        self.configured = true;
        log::info!(
            "frame pipeline configured: {}x{}, {} outputs, displaying {:?}",
            self.extent.width,
            self.extent.height,
            self.registry.len(),
            self.registry.active_name()
        );
        self.print_barrier_plan();
        Ok(())
    }
}
// getter
impl FramePipeline {
    #[inline]
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn registry(&self) -> &OutputRegistry {
        &self.registry
    }

    #[inline]
    pub fn tracker(&self) -> &ResourceStateTracker {
        &self.tracker
    }

    pub fn available_outputs(&self) -> Vec<String> {
        self.registry.names().map(str::to_string).collect()
    }

    #[inline]
    pub fn active_output(&self) -> Option<&str> {
        self.registry.active_name()
    }

    #[inline]
    pub fn output_selection(&self) -> &OutputSelection {
        self.registry.selection()
    }

    #[inline]
    pub fn gbuffer(&self) -> Option<&GBufferView> {
        self.gbuffer.as_ref()
    }

    #[inline]
    pub fn light_buffer(&self) -> Option<LightBufferBinding> {
        self.light_buffer
    }

    #[inline]
    pub fn raytrace(&self) -> &dyn RaytraceStage {
        self.stages.raytrace.as_ref()
    }

    #[inline]
    pub fn overlay(&self) -> &dyn OverlayStage {
        self.stages.overlay.as_ref()
    }

    #[inline]
    pub fn overlay_mut(&mut self) -> &mut dyn OverlayStage {
        self.stages.overlay.as_mut()
    }

    #[inline]
    pub fn present_copy(&self) -> &dyn PresentCopyStage {
        self.stages.present_copy.as_ref()
    }
}
// update
impl FramePipeline {
    /// 录制一帧
    ///
    /// 失败时 tracker 回到录制前的状态，调用方应当丢弃 `cmd`。
    pub fn record(
        &mut self,
        cmd: &mut dyn GfxCommandStream,
        frame: &FrameRenderInfo,
        resource_manager: &GfxResourceManager,
    ) -> PipelineResult<()> {
        let _span = restir_crate_tools::profile_span!("FramePipeline::record");

        let snapshot = self.tracker.snapshot();
        let result = self.record_commands(cmd, frame, resource_manager);
        if result.is_err() {
            self.tracker.restore(snapshot);
        }
        result
    }

    fn record_commands(
        &mut self,
        cmd: &mut dyn GfxCommandStream,
        frame: &FrameRenderInfo,
        resource_manager: &GfxResourceManager,
    ) -> PipelineResult<()> {
        if !self.configured {
            return Err(PipelineError::NotConfigured);
        }
        let gbuffer = self.gbuffer.clone().ok_or(PipelineError::NotConfigured)?;
        let (display_image, display_producer) = self
            .registry
            .active_entry()
            .map(|entry| (entry.image, entry.category))
            .ok_or(PipelineError::NoActiveOutput)?;

        cmd.begin_label(&frame.frame_name(), LabelColor::COLOR_FRAME);

        // geometry
        let mut acquire_barriers =
            Self::acquire_outputs(&mut self.tracker, self.stages.geometry.as_ref(), StageCategory::Geometry)?;
        acquire_barriers.extend(self.tracker.acquire_image(
            gbuffer.depth,
            self.stages.geometry.depth_write_state(),
            StageCategory::Geometry,
        ));
        Self::emit_barriers(cmd, "-> Geometry", &acquire_barriers, &[], resource_manager)?;
        Self::record_stage(cmd, self.stages.geometry.as_mut(), frame, resource_manager)?;
        Self::assume_outputs(&mut self.tracker, self.stages.geometry.as_ref())?;
        self.tracker.assume_image_state(gbuffer.depth, self.stages.geometry.depth_state());

        // geometry -> ray tracing，同时取得光追 stage 自己的输出
        let mut image_barriers =
            Self::acquire_outputs(&mut self.tracker, self.stages.raytrace.as_ref(), StageCategory::RayTracing)?;
        image_barriers.extend(self.tracker.transition_image(
            gbuffer.depth,
            RgImageState::DEPTH_READ_RAY_TRACING,
            StageCategory::Geometry,
            StageCategory::RayTracing,
        ));
        for (_, handle) in &gbuffer.outputs {
            image_barriers.extend(self.tracker.transition_image(
                *handle,
                RgImageState::STORAGE_READ_RAY_TRACING,
                StageCategory::Geometry,
                StageCategory::RayTracing,
            ));
        }
        let mut buffer_barriers = Vec::new();
        if let Some(light_buffer) = self.light_buffer {
            buffer_barriers.extend(self.tracker.transition_buffer(
                light_buffer.buffer,
                RgBufferState::STORAGE_READ_RAY_TRACING,
                StageCategory::Transfer,
                StageCategory::RayTracing,
            ));
        }
        Self::emit_barriers(cmd, "Geometry -> RayTracing", &image_barriers, &buffer_barriers, resource_manager)?;

        // ray tracing
        Self::record_stage(cmd, self.stages.raytrace.as_mut(), frame, resource_manager)?;
        Self::assume_outputs(&mut self.tracker, self.stages.raytrace.as_ref())?;

        // overlay，直接在显示输出当前的 layout 上绘制
        let current = self.tracker.image_state(display_image).ok_or(PipelineError::NoActiveOutput)?;
        let overlay_barrier = self.tracker.transition_image(
            display_image,
            RgImageState::overlay_draw(current.layout),
            display_producer,
            StageCategory::Overlay,
        );
        Self::emit_barriers(cmd, "-> Overlay", overlay_barrier.as_slice(), &[], resource_manager)?;
        Self::record_stage(cmd, self.stages.overlay.as_mut(), frame, resource_manager)?;
        Self::assume_outputs(&mut self.tracker, self.stages.overlay.as_ref())?;

        // overlay -> present copy
        let present_barrier = self.tracker.transition_image(
            display_image,
            RgImageState::TRANSFER_SRC,
            StageCategory::Overlay,
            StageCategory::PresentCopy,
        );
        Self::emit_barriers(cmd, "Overlay -> PresentCopy", present_barrier.as_slice(), &[], resource_manager)?;
        Self::record_stage(cmd, self.stages.present_copy.as_mut(), frame, resource_manager)?;
        Self::assume_outputs(&mut self.tracker, self.stages.present_copy.as_ref())?;

        cmd.end_label();
        Ok(())
    }

    /// 尺寸变化：等待设备空闲后让所有 stage 重新分配，再重新绑定所有下游引用
    pub fn on_resized(&mut self, device: &impl GfxDevice, ctx: &mut StageContext) -> PipelineResult<()> {
        let _span = restir_crate_tools::profile_span!("FramePipeline::on_resized");
        if !self.configured {
            return Err(PipelineError::NotConfigured);
        }

        device.wait_idle()?;
        log::info!(
            "frame pipeline resize: {}x{} -> {}x{}",
            self.extent.width,
            self.extent.height,
            ctx.extent.width,
            ctx.extent.height
        );
        self.extent = ctx.extent;

        let geometry = &mut self.stages.geometry;
        geometry.on_resized(ctx).map_err(PipelineError::stage(geometry.name(), "resize"))?;

        let gbuffer = self.snapshot_gbuffer()?;
        let raytrace = &mut self.stages.raytrace;
        raytrace.set_gbuffer(&gbuffer);
        self.gbuffer = Some(gbuffer);
        raytrace.on_resized(ctx).map_err(PipelineError::stage(raytrace.name(), "resize"))?;

        let overlay = &mut self.stages.overlay;
        overlay.on_resized(ctx).map_err(PipelineError::stage(overlay.name(), "resize"))?;
        let present_copy = &mut self.stages.present_copy;
        present_copy.on_resized(ctx).map_err(PipelineError::stage(present_copy.name(), "resize"))?;

        self.rebuild_outputs(ctx.resource_manager)?;
        self.retarget_display();
        Ok(())
    }

    /// 请求切换显示的输出，在下一次 [`Self::apply_pending_output`] 时生效
    pub fn request_output(&mut self, name: &str) -> PipelineResult<()> {
        self.registry.request(name)
    }

    /// 在帧之间应用等待中的输出切换；返回是否发生了切换
    pub fn apply_pending_output(&mut self, device: &impl GfxDevice) -> PipelineResult<bool> {
        if !self.registry.has_pending_change() {
            return Ok(false);
        }

        // 旧的输出可能仍在被 overlay / present 读取
        device.wait_idle()?;
        self.registry.take_pending();
        self.retarget_display();
        log::info!("displaying output {:?}", self.registry.active_name());
        Ok(true)
    }

    /// 光源 buffer 重新上传之后调用
    pub fn set_light_buffer(&mut self, light_buffer: Option<LightBufferBinding>) {
        self.track_light_buffer(light_buffer);
        self.stages.raytrace.set_light_buffer(light_buffer);
    }

    /// 场景几何变化后通知光追 stage
    pub fn update_scene(&mut self, scene: &SceneManager) {
        self.stages.raytrace.update_scene(scene);
    }
}
// tools
impl FramePipeline {
    fn snapshot_gbuffer(&self) -> PipelineResult<GBufferView> {
        let geometry = self.stages.geometry.as_ref();
        let depth = geometry.depth_output().ok_or_else(|| PipelineError::MissingStageInput {
            stage: self.stages.raytrace.name().to_string(),
            input: format!("{} depth", geometry.name()),
        })?;
        Ok(GBufferView {
            outputs: snapshot_outputs(geometry)?,
            depth,
        })
    }

    fn track_light_buffer(&mut self, light_buffer: Option<LightBufferBinding>) {
        if let Some(old) = self.light_buffer.take() {
            self.tracker.forget_buffer(old.buffer);
        }
        if let Some(new) = light_buffer {
            // 刚上传完，下一次录制时需要 transfer -> ray tracing 的 barrier
            self.tracker.track_buffer(new.buffer, RgBufferState::TRANSFER_DST);
        }
        self.light_buffer = light_buffer;
    }

    /// 重新跟踪所有 stage 输出并重建注册表
    fn rebuild_outputs(&mut self, resource_manager: &GfxResourceManager) -> PipelineResult<()> {
        for handle in self.tracked_outputs.drain(..) {
            self.tracker.forget_image(handle);
        }

        let stages = vec![
            StageOutputs {
                stage: self.stages.geometry.name().to_string(),
                category: StageCategory::Geometry,
                outputs: snapshot_outputs(self.stages.geometry.as_ref())?,
            },
            StageOutputs {
                stage: self.stages.raytrace.name().to_string(),
                category: StageCategory::RayTracing,
                outputs: snapshot_outputs(self.stages.raytrace.as_ref())?,
            },
            StageOutputs {
                stage: self.stages.overlay.name().to_string(),
                category: StageCategory::Overlay,
                outputs: snapshot_outputs(self.stages.overlay.as_ref())?,
            },
            StageOutputs {
                stage: self.stages.present_copy.name().to_string(),
                category: StageCategory::PresentCopy,
                outputs: snapshot_outputs(self.stages.present_copy.as_ref())?,
            },
        ];

        let depth = self.gbuffer.as_ref().map(|gbuffer| gbuffer.depth);
        let handles = stages
            .iter()
            .flat_map(|stage| stage.outputs.iter().map(|(_, handle)| *handle))
            .chain(depth);
        for handle in handles {
            if self.tracker.is_tracking_image(handle) {
                continue;
            }
            let image = resource_manager.get_image(handle).ok_or(GfxError::StaleImage(handle))?;
            let kind = if VulkanFormatUtils::is_depth_format(image.format()) {
                ResourceKind::DepthImage
            } else {
                ResourceKind::ColorImage
            };
            self.tracker.track_image(handle, kind, image.aspect(), RgImageState::UNDEFINED);
            self.tracked_outputs.push(handle);
        }

        self.registry.rebuild(stages);
        Ok(())
    }

    fn retarget_display(&mut self) {
        let display = self.registry.active_image();
        self.stages.overlay.set_target_image(display);
        self.stages.present_copy.set_source_image(display);
    }

    fn record_stage<S: RenderStage + ?Sized>(
        cmd: &mut dyn GfxCommandStream,
        stage: &mut S,
        frame: &FrameRenderInfo,
        resource_manager: &GfxResourceManager,
    ) -> PipelineResult<()> {
        cmd.begin_label(stage.name(), LabelColor::COLOR_STAGE);
        let result = stage.record_frame(cmd, frame, resource_manager);
        cmd.end_label();
        result.map_err(PipelineError::stage(stage.name(), "record"))
    }

    /// 把 stage 的输出转换到它开始写入时需要的状态
    fn acquire_outputs<S: RenderStage + ?Sized>(
        tracker: &mut ResourceStateTracker,
        stage: &S,
        category: StageCategory,
    ) -> PipelineResult<Vec<RgImageBarrierDesc>> {
        let mut barriers = Vec::new();
        for name in stage.output_names() {
            let handle = stage.output(&name).ok_or_else(|| PipelineError::MissingStageOutput {
                stage: stage.name().to_string(),
                output: name.clone(),
            })?;
            let state = stage.output_write_state(&name).ok_or_else(|| PipelineError::MissingOutputState {
                stage: stage.name().to_string(),
                output: name.clone(),
            })?;
            barriers.extend(tracker.acquire_image(handle, state, category));
        }
        Ok(barriers)
    }

    /// stage 报告它留下的输出状态
    fn assume_outputs<S: RenderStage + ?Sized>(tracker: &mut ResourceStateTracker, stage: &S) -> PipelineResult<()> {
        for name in stage.output_names() {
            let handle = stage.output(&name).ok_or_else(|| PipelineError::MissingStageOutput {
                stage: stage.name().to_string(),
                output: name.clone(),
            })?;
            let state = stage.output_state(&name).ok_or_else(|| PipelineError::MissingOutputState {
                stage: stage.name().to_string(),
                output: name.clone(),
            })?;
            tracker.assume_image_state(handle, state);
        }
        Ok(())
    }

    fn emit_barriers(
        cmd: &mut dyn GfxCommandStream,
        label: &str,
        image_barriers: &[RgImageBarrierDesc],
        buffer_barriers: &[RgBufferBarrierDesc],
        resource_manager: &GfxResourceManager,
    ) -> PipelineResult<()> {
        if image_barriers.is_empty() && buffer_barriers.is_empty() {
            return Ok(());
        }

        let images = image_barriers
            .iter()
            .map(|desc| -> PipelineResult<GfxImageBarrier> {
                let image = resource_manager.get_image(desc.image).ok_or(GfxError::StaleImage(desc.image))?;
                Ok(desc.to_gfx_barrier(image.handle()))
            })
            .collect::<PipelineResult<Vec<_>>>()?;
        let buffers = buffer_barriers
            .iter()
            .map(|desc| -> PipelineResult<GfxBufferBarrier> {
                let buffer = resource_manager.get_buffer(desc.buffer).ok_or(GfxError::StaleBuffer(desc.buffer))?;
                Ok(desc.to_gfx_barrier(buffer.vk_buffer()))
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        cmd.begin_label(label, LabelColor::COLOR_BARRIER);
        if !images.is_empty() {
            cmd.image_memory_barrier(vk::DependencyFlags::empty(), &images);
        }
        if !buffers.is_empty() {
            cmd.buffer_memory_barrier(vk::DependencyFlags::empty(), &buffers);
        }
        cmd.end_label();
        Ok(())
    }

    /// 打印 barrier 规则和当前的显示状态
    pub fn print_barrier_plan(&self) {
        log::debug!("╔══════════════════════════════════════╗");
        log::debug!("║            Frame Pipeline            ║");
        log::debug!("╠══════════════════════════════════════╣");
        log::debug!("║ extent: {}x{}", self.extent.width, self.extent.height);
        log::debug!("║ tracked images: {}", self.tracker.tracked_image_count());
        log::debug!("║ outputs: {}", self.available_outputs().join(", "));
        log::debug!("║ display: {:?}", self.registry.active_name());
        log::debug!("╚══════════════════════════════════════╝");
        self.tracker.table().print_rules();
    }
}
// destroy
impl FramePipeline {
    pub fn destroy(&mut self, ctx: &mut StageContext) {
        let _span = restir_crate_tools::profile_span!("FramePipeline::destroy");

        self.stages.present_copy.destroy(ctx);
        self.stages.overlay.destroy(ctx);
        self.stages.raytrace.destroy(ctx);
        self.stages.geometry.destroy(ctx);

        for handle in self.tracked_outputs.drain(..) {
            self.tracker.forget_image(handle);
        }
        self.track_light_buffer(None);
        self.gbuffer = None;
        self.registry.rebuild(Vec::new());
        self.configured = false;
    }
}
