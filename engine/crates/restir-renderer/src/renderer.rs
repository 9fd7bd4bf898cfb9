//! ReSTIR 应用的组合入口
//!
//! 初始化顺序：环境贴图和噪声 -> stage 配置 -> 收集自发光三角形 -> 上传光源。
//! 之后每帧调用 [`RestirRenderer::update`] 和 [`RestirRenderer::render_frame`]。

use anyhow::Context;
use ash::vk;

use restir_gfx::{
    device::GfxDevice,
    resources::{handles::GfxImageHandle, resource_manager::GfxResourceManager},
};
use restir_scene::{
    light::extractor::{EmissiveLightExtractor, LightSet},
    scene_manager::SceneManager,
};

use crate::{
    config::RendererConfig,
    error::PipelineResult,
    frame_lifecycle::FrameLifecycleController,
    frame_pipeline::{FramePipeline, PipelineInputs},
    inputs::{environment_map::EnvironmentMap, noise_source::NoiseSource},
    light_buffer::LightBufferUploader,
    pipeline_settings::FrameRenderInfo,
    stages::{PipelineStages, StageContext, WindowDraw},
};

pub struct RestirRenderer<D: GfxDevice> {
    device: D,
    config: RendererConfig,
    resource_manager: GfxResourceManager,
    scene: SceneManager,

    extractor: EmissiveLightExtractor,
    light_set: LightSet,
    light_uploader: LightBufferUploader,

    pipeline: FramePipeline,
    lifecycle: FrameLifecycleController,

    environment_map: GfxImageHandle,
    noise: GfxImageHandle,
}
// new & init
impl<D: GfxDevice> RestirRenderer<D> {
    pub fn init(device: D, config: RendererConfig, scene: SceneManager, stages: PipelineStages) -> anyhow::Result<Self> {
        let _span = restir_crate_tools::profile_span!("RestirRenderer::init");
        let frame_extent = config.frame_extent();
        let mut resource_manager = GfxResourceManager::new();

        let environment_map = EnvironmentMap::load_or_default(config.environment_map.as_deref())
            .upload(&device, &mut resource_manager)
            .context("failed to upload environment map")?;
        let noise = NoiseSource::generate(config.noise_extent(), config.noise_seed)
            .upload(&device, &mut resource_manager)
            .context("failed to upload noise texture")?;

        let mut pipeline = FramePipeline::new(stages);
        pipeline
            .configure(
                &mut StageContext {
                    resource_manager: &mut resource_manager,
                    extent: frame_extent,
                },
                &scene,
                &PipelineInputs {
                    environment_map,
                    noise,
                    light_buffer: None,
                },
                config.initial_output.as_deref(),
            )
            .context("failed to configure frame pipeline")?;

        let extractor = EmissiveLightExtractor::new(config.light_extraction);
        let light_set = extractor.extract(&scene).context("failed to collect emissive triangles")?;
        let mut light_uploader = LightBufferUploader::new();
        let light_buffer = light_uploader
            .upload(&device, &mut resource_manager, &light_set)
            .context("failed to upload light buffer")?;
        pipeline.set_light_buffer(light_buffer);

        let lifecycle = FrameLifecycleController::new(&device, frame_extent)?;

        log::info!(
            "renderer initialized: {}x{}, {} emissive triangles ({:?})",
            frame_extent.width,
            frame_extent.height,
            light_set.len(),
            extractor.mode()
        );

        Ok(Self {
            device,
            config,
            resource_manager,
            scene,
            extractor,
            light_set,
            light_uploader,
            pipeline,
            lifecycle,
            environment_map,
            noise,
        })
    }
}
// getter
impl<D: GfxDevice> RestirRenderer<D> {
    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    #[inline]
    pub fn scene(&self) -> &SceneManager {
        &self.scene
    }

    /// 几何相关的修改会在下一次 [`Self::update`] 时重建光源
    #[inline]
    pub fn scene_mut(&mut self) -> &mut SceneManager {
        &mut self.scene
    }

    #[inline]
    pub fn resource_manager(&self) -> &GfxResourceManager {
        &self.resource_manager
    }

    #[inline]
    pub fn pipeline(&self) -> &FramePipeline {
        &self.pipeline
    }

    #[inline]
    pub fn lifecycle(&self) -> &FrameLifecycleController {
        &self.lifecycle
    }

    #[inline]
    pub fn light_set(&self) -> &LightSet {
        &self.light_set
    }

    #[inline]
    pub fn environment_map(&self) -> GfxImageHandle {
        self.environment_map
    }

    #[inline]
    pub fn noise(&self) -> GfxImageHandle {
        self.noise
    }

    pub fn available_outputs(&self) -> Vec<String> {
        self.pipeline.available_outputs()
    }

    #[inline]
    pub fn active_output(&self) -> Option<&str> {
        self.pipeline.active_output()
    }
}
// update
impl<D: GfxDevice> RestirRenderer<D> {
    /// 帧之间调用：应用 resize 和输出切换，场景几何变化时重建光源
    pub fn update(&mut self) -> PipelineResult<()> {
        if let Some(extent) = self.lifecycle.take_pending_resize() {
            self.resize_now(extent)?;
        }
        self.pipeline.apply_pending_output(&self.device)?;
        if self.light_set.is_stale(&self.scene) {
            self.rebuild_lights()?;
        }
        Ok(())
    }

    /// 录制并提交一帧
    pub fn render_frame(&mut self) -> PipelineResult<FrameRenderInfo> {
        let _span = restir_crate_tools::profile_span!("RestirRenderer::render_frame");

        let frame = self.lifecycle.begin_frame(&self.device)?;
        let cmd = match self.record_commands(&frame) {
            Ok(cmd) => cmd,
            Err(err) => {
                log::error!("{} recording failed: {err}", frame.frame_name());
                self.lifecycle.abandon_frame(&self.device)?;
                return Err(err);
            }
        };
        self.lifecycle.submit(&self.device, cmd)?;

        restir_crate_tools::profiling::frame_mark();
        Ok(frame)
    }

    fn record_commands(&mut self, frame: &FrameRenderInfo) -> PipelineResult<D::CommandBuffer> {
        let mut cmd = self.device.begin_commands(*frame.frame_label, &frame.frame_name())?;
        self.pipeline.record(&mut cmd, frame, &self.resource_manager)?;
        Ok(cmd)
    }

    /// 非阻塞，返回这次新完成的帧序号
    pub fn poll_frame_results(&mut self) -> PipelineResult<Vec<u64>> {
        Ok(self.lifecycle.poll_completed(&self.device)?)
    }

    /// 记录窗口尺寸变化，在下一次 [`Self::update`] 时生效
    pub fn request_resize(&mut self, extent: vk::Extent2D) {
        self.lifecycle.request_resize(extent);
    }

    /// 立即应用尺寸变化
    pub fn on_resized(&mut self, extent: vk::Extent2D) -> PipelineResult<()> {
        self.lifecycle.request_resize(extent);
        match self.lifecycle.take_pending_resize() {
            Some(extent) => self.resize_now(extent),
            None => Ok(()),
        }
    }

    pub fn request_output(&mut self, name: &str) -> PipelineResult<()> {
        self.pipeline.request_output(name)
    }

    pub fn add_window_draw(&mut self, draw: WindowDraw) {
        self.pipeline.overlay_mut().add_window_draw(draw);
    }

    fn resize_now(&mut self, extent: vk::Extent2D) -> PipelineResult<()> {
        self.lifecycle.wait_all(&self.device)?;
        self.pipeline.on_resized(
            &self.device,
            &mut StageContext {
                resource_manager: &mut self.resource_manager,
                extent,
            },
        )
    }

    fn rebuild_lights(&mut self) -> PipelineResult<()> {
        let _span = restir_crate_tools::profile_span!("RestirRenderer::rebuild_lights");

        self.light_set = self.extractor.extract(&self.scene)?;
        let light_buffer = self.light_uploader.upload(&self.device, &mut self.resource_manager, &self.light_set)?;
        self.pipeline.set_light_buffer(light_buffer);
        self.pipeline.update_scene(&self.scene);

        log::info!(
            "lights rebuilt for geometry revision {}: {} emissive triangles",
            self.light_set.geometry_revision(),
            self.light_set.len()
        );
        Ok(())
    }
}
// destroy
impl<D: GfxDevice> RestirRenderer<D> {
    /// 释放所有资源，把设备交还给调用者
    pub fn destroy(self) -> PipelineResult<D> {
        let Self {
            device,
            mut resource_manager,
            mut scene,
            mut light_uploader,
            mut pipeline,
            lifecycle,
            ..
        } = self;

        device.wait_idle()?;
        lifecycle.destroy(&device)?;

        let frame_extent = pipeline.extent();
        pipeline.destroy(&mut StageContext {
            resource_manager: &mut resource_manager,
            extent: frame_extent,
        });
        light_uploader.destroy(&device, &mut resource_manager);
        resource_manager.destroy_all(&device);
        scene.destroy_mut();

        log::info!("renderer destroyed");
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use glam::{Mat4, Vec3, Vec4};
    use restir_gfx::headless::HeadlessDevice;
    use restir_scene::{
        components::{
            instance::Instance,
            material::Material,
            mesh::{Mesh, Primitive, Vertex},
        },
        guid_new_type::MaterialHandle,
        light::extractor::LightExtractionMode,
    };

    use super::*;
    use crate::{
        error::PipelineError,
        frame_lifecycle::FrameState,
        stages::test_stages::{RAYTRACE_OUTPUT, test_stages, test_stages_with_failing_geometry},
    };

    fn quad(material: MaterialHandle) -> Mesh {
        Mesh {
            name: "quad".to_string(),
            primitives: vec![Primitive {
                vertices: vec![
                    Vertex::from_position(Vec3::new(0.0, 0.0, 0.0)),
                    Vertex::from_position(Vec3::new(1.0, 0.0, 0.0)),
                    Vertex::from_position(Vec3::new(1.0, 1.0, 0.0)),
                    Vertex::from_position(Vec3::new(0.0, 1.0, 0.0)),
                ],
                indices: vec![0, 1, 2, 0, 2, 3],
                material,
            }],
        }
    }

    fn scene_with_emitter() -> (SceneManager, MaterialHandle) {
        let mut scene = SceneManager::new();
        let light = scene.register_mat(Material {
            name: "light".to_string(),
            emissive: Vec4::new(5.0, 5.0, 5.0, 0.0),
            ..Default::default()
        });
        let mesh = scene.register_mesh(quad(light));
        scene.register_instance(Instance {
            name: "ceiling-light".to_string(),
            mesh,
            transform: Mat4::from_translation(Vec3::new(0.0, 3.0, 0.0)),
        });
        (scene, light)
    }

    fn config() -> RendererConfig {
        RendererConfig {
            noise_extent: 8,
            ..Default::default()
        }
    }

    fn renderer() -> (RestirRenderer<HeadlessDevice>, MaterialHandle) {
        let (scene, light) = scene_with_emitter();
        let renderer = RestirRenderer::init(HeadlessDevice::new(3), config(), scene, test_stages()).unwrap();
        (renderer, light)
    }

    #[test]
    fn test_init_uploads_lights_and_configures_pipeline() {
        let (renderer, _) = renderer();

        let light_buffer = renderer.pipeline().light_buffer().unwrap();
        assert_eq!(light_buffer.light_count, 2);
        assert_eq!(renderer.light_set().len(), 2);
        assert!(renderer.pipeline().is_configured());
        assert!(renderer.available_outputs().iter().any(|name| name == RAYTRACE_OUTPUT));
        assert_eq!(renderer.active_output(), Some("Albedo"));
    }

    #[test]
    fn test_init_rejects_unknown_initial_output() {
        let (scene, _) = scene_with_emitter();
        let config = RendererConfig {
            initial_output: Some("Bogus".to_string()),
            ..config()
        };
        let result = RestirRenderer::init(HeadlessDevice::new(3), config, scene, test_stages());
        assert!(result.is_err());
    }

    #[test]
    fn test_frames_cycle_through_slots() {
        let (mut renderer, _) = renderer();

        let frames: Vec<_> = (0..4).map(|_| renderer.render_frame().unwrap()).collect();
        assert_eq!(frames.iter().map(|f| f.frame_id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        // 第四帧复用 slot A，等待了第一帧
        assert_eq!(renderer.device().blocking_fence_wait_count(), 1);

        renderer.device().complete_submitted();
        assert_eq!(renderer.poll_frame_results().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_scene_change_rebuilds_lights_on_update() {
        let (mut renderer, light) = renderer();
        renderer.render_frame().unwrap();

        let mesh = renderer.scene_mut().register_mesh(quad(light));
        renderer.scene_mut().register_instance(Instance {
            name: "second-light".to_string(),
            mesh,
            transform: Mat4::IDENTITY,
        });
        assert!(renderer.light_set().is_stale(renderer.scene()));

        renderer.update().unwrap();
        assert!(!renderer.light_set().is_stale(renderer.scene()));
        assert_eq!(renderer.pipeline().light_buffer().unwrap().light_count, 4);
        renderer.render_frame().unwrap();
    }

    #[test]
    fn test_removing_all_emitters_releases_light_buffer() {
        let (mut renderer, light) = renderer();
        renderer.scene_mut().set_material_emissive(light, Vec4::ZERO);

        renderer.update().unwrap();
        assert!(renderer.pipeline().light_buffer().is_none());
        assert_eq!(renderer.device().live_buffer_count(), 0);
        renderer.render_frame().unwrap();
    }

    #[test]
    fn test_output_change_is_applied_on_update() {
        let (mut renderer, _) = renderer();
        renderer.render_frame().unwrap();

        renderer.request_output(RAYTRACE_OUTPUT).unwrap();
        assert_eq!(renderer.active_output(), Some("Albedo"));
        renderer.update().unwrap();
        assert_eq!(renderer.active_output(), Some(RAYTRACE_OUTPUT));

        assert!(matches!(renderer.request_output("Bogus"), Err(PipelineError::UnknownOutput(_))));
    }

    #[test]
    fn test_resize_requests_apply_on_update() {
        let (mut renderer, _) = renderer();
        renderer.render_frame().unwrap();
        renderer.render_frame().unwrap();

        renderer.request_resize(vk::Extent2D { width: 800, height: 600 });
        renderer.request_resize(vk::Extent2D { width: 1024, height: 768 });
        renderer.update().unwrap();

        assert_eq!(renderer.pipeline().extent(), vk::Extent2D { width: 1024, height: 768 });
        assert_eq!(renderer.lifecycle().in_flight_count(), 0);
        let frame = renderer.render_frame().unwrap();
        assert_eq!(frame.frame_extent, vk::Extent2D { width: 1024, height: 768 });
    }

    #[test]
    fn test_destroy_releases_everything() {
        let (mut renderer, _) = renderer();
        renderer.render_frame().unwrap();

        let device = renderer.destroy().unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_image_count(), 0);
        assert_eq!(device.live_fence_count(), 0);
    }

    #[test]
    fn test_legacy_extraction_is_configurable() {
        let (scene, _) = scene_with_emitter();
        let config = RendererConfig {
            light_extraction: LightExtractionMode::LegacySingleMesh,
            ..config()
        };
        let renderer = RestirRenderer::init(HeadlessDevice::new(3), config, scene, test_stages()).unwrap();

        // 旧模式不应用 instance 变换
        assert_eq!(renderer.light_set().lights()[0].p1.y, 0.0);
    }

    #[test]
    fn test_failed_recording_releases_frame_slot() {
        let (scene, _) = scene_with_emitter();
        let fail_record = Rc::new(Cell::new(false));
        let mut renderer =
            RestirRenderer::init(HeadlessDevice::new(3), config(), scene, test_stages_with_failing_geometry(fail_record.clone()))
                .unwrap();
        renderer.render_frame().unwrap();

        fail_record.set(true);
        let result = renderer.render_frame();
        assert!(matches!(result, Err(PipelineError::Stage { ref stage, .. }) if stage == "gbuffer"));
        assert_eq!(renderer.lifecycle().frame_state(renderer.lifecycle().frame_label()), FrameState::Idle);
        assert_eq!(renderer.lifecycle().frame_id(), 1);

        // 同一帧重新录制，不会因为 slot 仍处于 Recording 而 panic
        fail_record.set(false);
        let frame = renderer.render_frame().unwrap();
        assert_eq!(frame.frame_id, 1);
        assert_eq!(renderer.device().live_fence_count(), 3);
    }
}
