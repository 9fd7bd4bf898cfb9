//! 帧管线的 stage 契约
//!
//! 具体的 GBuffer / ReSTIR / GUI / 交换链 stage 在外部实现，管线只通过这里的 trait 使用它们。
//! 每个 stage 拥有自己的输出 image，在 [`StageContext`] 的资源管理器里注册，
//! 对外只暴露 [`GfxImageHandle`]。resize 后旧 handle 失效，消费者必须重新获取。

use ash::vk;

use restir_gfx::{
    commands::command_stream::GfxCommandStream,
    resources::{
        handles::GfxImageHandle,
        resource_manager::GfxResourceManager,
    },
};
use restir_render_graph::resource_state::RgImageState;
use restir_scene::scene_manager::SceneManager;

use crate::{light_buffer::LightBufferBinding, pipeline_settings::FrameRenderInfo};

#[cfg(test)]
pub(crate) mod test_stages;

/// stage 初始化和 resize 时可以访问的设备侧上下文
pub struct StageContext<'a> {
    pub resource_manager: &'a mut GfxResourceManager,
    pub extent: vk::Extent2D,
}

/// 所有 stage 的公共能力
pub trait RenderStage {
    fn name(&self) -> &str;

    /// 可以被选作显示输出的名字，按声明顺序
    fn output_names(&self) -> Vec<String>;

    /// 输出名字对应的 image；名字未知时为 `None`
    fn output(&self, name: &str) -> Option<GfxImageHandle>;

    /// `record_frame` 结束时该输出所处的状态
    fn output_state(&self, name: &str) -> Option<RgImageState>;

    /// `record_frame` 开始写入时该输出需要处于的状态
    ///
    /// geometry 和光追 stage 录制之前，管线把它们的输出从上一次使用留下的状态转换到这里。
    fn output_write_state(&self, name: &str) -> Option<RgImageState> {
        self.output_state(name)
    }

    fn record_frame(
        &mut self,
        cmd: &mut dyn GfxCommandStream,
        frame: &FrameRenderInfo,
        resource_manager: &GfxResourceManager,
    ) -> anyhow::Result<()>;

    /// 按 `ctx.extent` 重新分配尺寸相关的资源
    fn on_resized(&mut self, ctx: &mut StageContext) -> anyhow::Result<()>;

    fn destroy(&mut self, ctx: &mut StageContext);
}

/// 光栅化 GBuffer 的 stage
pub trait GeometryStage: RenderStage {
    fn init(&mut self, ctx: &mut StageContext, scene: &SceneManager) -> anyhow::Result<()>;

    /// 深度不是可显示输出，单独暴露给光追 stage
    fn depth_output(&self) -> Option<GfxImageHandle>;

    /// 录制前深度需要处于的状态
    fn depth_write_state(&self) -> RgImageState {
        RgImageState::DEPTH_ATTACHMENT_WRITE
    }

    /// 录制结束时深度所处的状态
    fn depth_state(&self) -> RgImageState {
        self.depth_write_state()
    }
}

/// geometry stage 输出的快照，交给光追 stage 绑定
#[derive(Clone, Debug, PartialEq)]
pub struct GBufferView {
    pub outputs: Vec<(String, GfxImageHandle)>,
    pub depth: GfxImageHandle,
}
impl GBufferView {
    pub fn get(&self, name: &str) -> Option<GfxImageHandle> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, handle)| *handle)
    }
}

#[derive(Clone, Debug)]
pub struct RaytraceInputs {
    pub gbuffer: GBufferView,
    pub environment_map: GfxImageHandle,
    pub noise: GfxImageHandle,
    pub light_buffer: Option<LightBufferBinding>,
}

pub trait RaytraceStage: RenderStage {
    fn init(&mut self, ctx: &mut StageContext, inputs: &RaytraceInputs) -> anyhow::Result<()>;

    /// geometry stage resize 之后重新绑定 GBuffer
    fn set_gbuffer(&mut self, gbuffer: &GBufferView);

    /// 光源 buffer 重新上传之后调用；没有自发光三角形时为 `None`
    fn set_light_buffer(&mut self, light_buffer: Option<LightBufferBinding>);

    fn update_scene(&mut self, _scene: &SceneManager) {}
}

/// GUI 绘制回调，在 overlay stage 录制时依次调用
pub type WindowDraw = Box<dyn FnMut(&FrameRenderInfo)>;

/// 在当前显示的输出上叠加 GUI
pub trait OverlayStage: RenderStage {
    fn init(&mut self, ctx: &mut StageContext, target: Option<GfxImageHandle>) -> anyhow::Result<()>;

    fn set_target_image(&mut self, target: Option<GfxImageHandle>);

    fn target_image(&self) -> Option<GfxImageHandle>;

    fn add_window_draw(&mut self, draw: WindowDraw);
}

/// 把当前显示的输出拷贝到交换链
pub trait PresentCopyStage: RenderStage {
    fn init(&mut self, ctx: &mut StageContext, source: Option<GfxImageHandle>) -> anyhow::Result<()>;

    fn set_source_image(&mut self, source: Option<GfxImageHandle>);

    fn source_image(&self) -> Option<GfxImageHandle>;
}

/// 管线持有的四个 stage
pub struct PipelineStages {
    pub geometry: Box<dyn GeometryStage>,
    pub raytrace: Box<dyn RaytraceStage>,
    pub overlay: Box<dyn OverlayStage>,
    pub present_copy: Box<dyn PresentCopyStage>,
}

/// 一个 stage 在某一时刻的全部可显示输出
pub(crate) fn snapshot_outputs<S: RenderStage + ?Sized>(
    stage: &S,
) -> Result<Vec<(String, GfxImageHandle)>, crate::error::PipelineError> {
    stage
        .output_names()
        .into_iter()
        .map(|name| match stage.output(&name) {
            Some(handle) => Ok((name, handle)),
            None => Err(crate::error::PipelineError::MissingStageOutput {
                stage: stage.name().to_string(),
                output: name,
            }),
        })
        .collect()
}
