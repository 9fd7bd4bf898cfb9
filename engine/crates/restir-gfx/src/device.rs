use crate::{
    commands::{command_stream::GfxCommandStream, fence::GfxFence},
    error::GfxResult,
    resources::{
        buffer::{GfxBuffer, GfxBufferDesc},
        image::{GfxImage, GfxImageDesc},
    },
};

/// 渲染核心需要的设备能力
///
/// 帧循环、light buffer 上传、resize 和输出切换都只通过这个 trait 访问 GPU。
/// [`GfxContext`](crate::gfx_context::GfxContext) 是 Vulkan 实现，
/// [`HeadlessDevice`](crate::headless::HeadlessDevice) 用于没有 GPU 的环境。
///
/// 设备级错误一律视为致命错误，调用方只负责向上传递。
pub trait GfxDevice {
    type CommandBuffer: GfxCommandStream;

    /// 阻塞，直到设备上所有已提交的工作完成
    fn wait_idle(&self) -> GfxResult<()>;

    // fence
    fn create_fence(&self, signaled: bool, debug_name: &str) -> GfxResult<GfxFence>;
    /// 阻塞等待 fence
    fn wait_fence(&self, fence: &GfxFence) -> GfxResult<()>;
    /// 非阻塞查询
    fn fence_signaled(&self, fence: &GfxFence) -> GfxResult<bool>;
    fn reset_fence(&self, fence: &GfxFence) -> GfxResult<()>;
    fn destroy_fence(&self, fence: GfxFence);

    // command
    /// 从 frame slot 对应的 command pool 中取一个 command buffer 并开始录制
    ///
    /// 调用前需要保证该 slot 上一次提交已经完成
    fn begin_commands(&self, frame_slot: usize, debug_name: &str) -> GfxResult<Self::CommandBuffer>;
    /// 结束录制并提交，完成时 signal `fence`
    fn submit(&self, cmd: Self::CommandBuffer, fence: &GfxFence) -> GfxResult<()>;

    // buffer
    /// device local，host 不可见
    fn create_device_local_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBuffer>;
    /// 通过 stage buffer 把 data 写到 buffer 的开头，同步等待完成
    fn upload_to_buffer(&self, buffer: &GfxBuffer, data: &[u8]) -> GfxResult<()>;
    fn destroy_buffer(&self, buffer: GfxBuffer);

    // image
    /// 创建 sampled image 并上传 texels，完成后 image 处于 SHADER_READ_ONLY_OPTIMAL
    fn create_sampled_image(&self, desc: &GfxImageDesc, texels: &[u8]) -> GfxResult<GfxImage>;
    fn destroy_image(&self, image: GfxImage);
}
