//! 单元测试用的最小 stage 实现
//!
//! 只分配和注册输出 image、记录 label，并在录制时检查自己持有的 handle 是否仍然有效。

use std::{
    cell::Cell,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{bail, Context};
use ash::vk;
use ash::vk::Handle;

use restir_gfx::{
    basic::color::LabelColor,
    commands::command_stream::GfxCommandStream,
    resources::{
        handles::GfxImageHandle,
        image::{GfxImage, GfxImageDesc},
        resource_manager::GfxResourceManager,
    },
};
use restir_render_graph::resource_state::RgImageState;
use restir_scene::scene_manager::SceneManager;

use crate::{
    light_buffer::LightBufferBinding,
    pipeline_settings::{DefaultRendererSettings, FrameRenderInfo},
    stages::{
        GBufferView, GeometryStage, OverlayStage, PipelineStages, PresentCopyStage, RaytraceInputs, RaytraceStage,
        RenderStage, StageContext, WindowDraw,
    },
};

pub(crate) const GBUFFER_OUTPUTS: [&str; 6] = [
    "Albedo",
    "WorldspacePosition",
    "WorldspaceNormal",
    "MotionVector",
    "MaterialIndex",
    "MeshInstanceIndex",
];
pub(crate) const RAYTRACE_OUTPUT: &str = "RaytracingTarget";

static NEXT_RAW_IMAGE: AtomicU64 = AtomicU64::new(0x1_0000);

fn register_target(
    resource_manager: &mut GfxResourceManager,
    name: &str,
    extent: vk::Extent2D,
    format: vk::Format,
) -> GfxImageHandle {
    let raw = NEXT_RAW_IMAGE.fetch_add(1, Ordering::Relaxed);
    let desc = GfxImageDesc::new_2d(name, extent, format, vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC);
    resource_manager.register_image(GfxImage::from_external(vk::Image::from_raw(raw), desc))
}

fn ensure_alive(resource_manager: &GfxResourceManager, handle: Option<GfxImageHandle>, what: &str) -> anyhow::Result<()> {
    let handle = handle.with_context(|| format!("{what} is not bound"))?;
    if !resource_manager.contains_image(handle) {
        bail!("{what} refers to a destroyed image");
    }
    Ok(())
}

#[derive(Default)]
pub(crate) struct TestGeometryStage {
    outputs: Vec<(String, GfxImageHandle)>,
    depth: Option<GfxImageHandle>,
    /// 置位时录制失败
    fail_record: Rc<Cell<bool>>,
}
impl TestGeometryStage {
    fn allocate(&mut self, ctx: &mut StageContext) {
        self.outputs = GBUFFER_OUTPUTS
            .iter()
            .map(|name| {
                let handle =
                    register_target(ctx.resource_manager, name, ctx.extent, DefaultRendererSettings::HDR_COLOR_FORMAT);
                (name.to_string(), handle)
            })
            .collect();
        self.depth = Some(register_target(ctx.resource_manager, "depth", ctx.extent, DefaultRendererSettings::DEPTH_FORMAT));
    }

    fn release(&mut self, ctx: &mut StageContext) {
        for (_, handle) in self.outputs.drain(..) {
            ctx.resource_manager.remove_image(handle);
        }
        if let Some(depth) = self.depth.take() {
            ctx.resource_manager.remove_image(depth);
        }
    }
}
impl RenderStage for TestGeometryStage {
    fn name(&self) -> &str {
        "gbuffer"
    }

    fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|(name, _)| name.clone()).collect()
    }

    fn output(&self, name: &str) -> Option<GfxImageHandle> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, handle)| *handle)
    }

    fn output_state(&self, name: &str) -> Option<RgImageState> {
        self.output(name).map(|_| RgImageState::COLOR_ATTACHMENT_WRITE)
    }

    fn record_frame(
        &mut self,
        cmd: &mut dyn GfxCommandStream,
        _frame: &FrameRenderInfo,
        resource_manager: &GfxResourceManager,
    ) -> anyhow::Result<()> {
        for (name, handle) in &self.outputs {
            ensure_alive(resource_manager, Some(*handle), name)?;
        }
        ensure_alive(resource_manager, self.depth, "depth")?;
        if self.fail_record.get() {
            bail!("device lost while drawing gbuffer");
        }
        cmd.begin_label("draw gbuffer", LabelColor::COLOR_CMD);
        cmd.end_label();
        Ok(())
    }

    fn on_resized(&mut self, ctx: &mut StageContext) -> anyhow::Result<()> {
        self.release(ctx);
        self.allocate(ctx);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut StageContext) {
        self.release(ctx);
    }
}
impl GeometryStage for TestGeometryStage {
    fn init(&mut self, ctx: &mut StageContext, _scene: &SceneManager) -> anyhow::Result<()> {
        self.allocate(ctx);
        Ok(())
    }

    fn depth_output(&self) -> Option<GfxImageHandle> {
        self.depth
    }
}

#[derive(Default)]
pub(crate) struct TestRaytraceStage {
    target: Option<GfxImageHandle>,
    gbuffer: Option<GBufferView>,
    environment_map: Option<GfxImageHandle>,
    light_buffer: Option<LightBufferBinding>,
}
impl RenderStage for TestRaytraceStage {
    fn name(&self) -> &str {
        "restir"
    }

    fn output_names(&self) -> Vec<String> {
        self.target.iter().map(|_| RAYTRACE_OUTPUT.to_string()).collect()
    }

    fn output(&self, name: &str) -> Option<GfxImageHandle> {
        self.target.filter(|_| name == RAYTRACE_OUTPUT)
    }

    fn output_state(&self, name: &str) -> Option<RgImageState> {
        self.output(name).map(|_| RgImageState::STORAGE_WRITE_RAY_TRACING)
    }

    fn record_frame(
        &mut self,
        cmd: &mut dyn GfxCommandStream,
        _frame: &FrameRenderInfo,
        resource_manager: &GfxResourceManager,
    ) -> anyhow::Result<()> {
        let gbuffer = self.gbuffer.as_ref().context("gbuffer is not bound")?;
        for (name, handle) in &gbuffer.outputs {
            ensure_alive(resource_manager, Some(*handle), name)?;
        }
        ensure_alive(resource_manager, Some(gbuffer.depth), "depth")?;
        ensure_alive(resource_manager, self.environment_map, "environment map")?;
        ensure_alive(resource_manager, self.target, RAYTRACE_OUTPUT)?;
        if let Some(light_buffer) = self.light_buffer {
            if resource_manager.get_buffer(light_buffer.buffer).is_none() {
                bail!("light buffer refers to a destroyed buffer");
            }
        }
        cmd.begin_label("trace rays", LabelColor::COLOR_CMD);
        cmd.end_label();
        Ok(())
    }

    fn on_resized(&mut self, ctx: &mut StageContext) -> anyhow::Result<()> {
        if let Some(old) = self.target.take() {
            ctx.resource_manager.remove_image(old);
        }
        self.target = Some(register_target(
            ctx.resource_manager,
            RAYTRACE_OUTPUT,
            ctx.extent,
            DefaultRendererSettings::HDR_COLOR_FORMAT,
        ));
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut StageContext) {
        if let Some(target) = self.target.take() {
            ctx.resource_manager.remove_image(target);
        }
    }
}
impl RaytraceStage for TestRaytraceStage {
    fn init(&mut self, ctx: &mut StageContext, inputs: &RaytraceInputs) -> anyhow::Result<()> {
        self.gbuffer = Some(inputs.gbuffer.clone());
        self.environment_map = Some(inputs.environment_map);
        self.light_buffer = inputs.light_buffer;
        self.on_resized(ctx)
    }

    fn set_gbuffer(&mut self, gbuffer: &GBufferView) {
        self.gbuffer = Some(gbuffer.clone());
    }

    fn set_light_buffer(&mut self, light_buffer: Option<LightBufferBinding>) {
        self.light_buffer = light_buffer;
    }
}

#[derive(Default)]
pub(crate) struct TestOverlayStage {
    target: Option<GfxImageHandle>,
    draws: Vec<WindowDraw>,
}
impl RenderStage for TestOverlayStage {
    fn name(&self) -> &str {
        "gui"
    }

    fn output_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn output(&self, _name: &str) -> Option<GfxImageHandle> {
        None
    }

    fn output_state(&self, _name: &str) -> Option<RgImageState> {
        None
    }

    fn record_frame(
        &mut self,
        cmd: &mut dyn GfxCommandStream,
        frame: &FrameRenderInfo,
        resource_manager: &GfxResourceManager,
    ) -> anyhow::Result<()> {
        ensure_alive(resource_manager, self.target, "overlay target")?;
        for draw in &mut self.draws {
            draw(frame);
        }
        cmd.begin_label("draw gui", LabelColor::COLOR_CMD);
        cmd.end_label();
        Ok(())
    }

    fn on_resized(&mut self, _ctx: &mut StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(&mut self, _ctx: &mut StageContext) {
        self.draws.clear();
    }
}
impl OverlayStage for TestOverlayStage {
    fn init(&mut self, _ctx: &mut StageContext, target: Option<GfxImageHandle>) -> anyhow::Result<()> {
        self.target = target;
        Ok(())
    }

    fn set_target_image(&mut self, target: Option<GfxImageHandle>) {
        self.target = target;
    }

    fn target_image(&self) -> Option<GfxImageHandle> {
        self.target
    }

    fn add_window_draw(&mut self, draw: WindowDraw) {
        self.draws.push(draw);
    }
}

#[derive(Default)]
pub(crate) struct TestPresentCopyStage {
    source: Option<GfxImageHandle>,
}
impl RenderStage for TestPresentCopyStage {
    fn name(&self) -> &str {
        "present"
    }

    fn output_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn output(&self, _name: &str) -> Option<GfxImageHandle> {
        None
    }

    fn output_state(&self, _name: &str) -> Option<RgImageState> {
        None
    }

    fn record_frame(
        &mut self,
        cmd: &mut dyn GfxCommandStream,
        _frame: &FrameRenderInfo,
        resource_manager: &GfxResourceManager,
    ) -> anyhow::Result<()> {
        ensure_alive(resource_manager, self.source, "present source")?;
        cmd.begin_label("copy to swapchain", LabelColor::COLOR_CMD);
        cmd.end_label();
        Ok(())
    }

    fn on_resized(&mut self, _ctx: &mut StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(&mut self, _ctx: &mut StageContext) {}
}
impl PresentCopyStage for TestPresentCopyStage {
    fn init(&mut self, _ctx: &mut StageContext, source: Option<GfxImageHandle>) -> anyhow::Result<()> {
        self.source = source;
        Ok(())
    }

    fn set_source_image(&mut self, source: Option<GfxImageHandle>) {
        self.source = source;
    }

    fn source_image(&self) -> Option<GfxImageHandle> {
        self.source
    }
}

pub(crate) fn test_stages() -> PipelineStages {
    PipelineStages {
        geometry: Box::<TestGeometryStage>::default(),
        raytrace: Box::<TestRaytraceStage>::default(),
        overlay: Box::<TestOverlayStage>::default(),
        present_copy: Box::<TestPresentCopyStage>::default(),
    }
}

/// geometry stage 在 `fail_record` 置位时录制失败
pub(crate) fn test_stages_with_failing_geometry(fail_record: Rc<Cell<bool>>) -> PipelineStages {
    PipelineStages {
        geometry: Box::new(TestGeometryStage {
            fail_record,
            ..Default::default()
        }),
        ..test_stages()
    }
}
