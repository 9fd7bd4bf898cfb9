use ash::vk;

use crate::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};

/// 各个 stage 录制命令时看到的接口
///
/// 真实的 [`GfxCommandBuffer`](crate::commands::command_buffer::GfxCommandBuffer) 直接翻译成 vkCmd*，
/// headless 后端只是把命令记录下来。
pub trait GfxCommandStream {
    /// 帧内的名字，用于 debug label 和日志
    fn name(&self) -> &str;

    /// - command type: synchronize
    fn image_memory_barrier(&mut self, dependency_flags: vk::DependencyFlags, barriers: &[GfxImageBarrier]);

    /// - command type: synchronize
    fn buffer_memory_barrier(&mut self, dependency_flags: vk::DependencyFlags, barriers: &[GfxBufferBarrier]);

    fn begin_label(&mut self, label_name: &str, label_color: glam::Vec4);

    fn end_label(&mut self);
}
