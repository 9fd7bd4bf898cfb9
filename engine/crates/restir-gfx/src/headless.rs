//! 不依赖 GPU 的设备实现
//!
//! 命令只被记录下来，fence 的完成由 host 侧模拟：等待一个已提交的 fence、`wait_idle`
//! 或者 [`HeadlessDevice::complete_submitted`] 都会让它进入 signaled 状态。
//! 用于单元测试以及没有显卡的 CI 环境。
//!
//! 提交和事件只保留最近 [`HeadlessDevice::DEFAULT_HISTORY_LIMIT`] 条，计数不受影响，
//! 长时间运行时内存不会随帧数增长。

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
};

use ash::vk;
use ash::vk::Handle;

use crate::{
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier},
        command_stream::GfxCommandStream,
        fence::GfxFence,
    },
    device::GfxDevice,
    error::{GfxError, GfxResult},
    resources::{
        buffer::{GfxBuffer, GfxBufferDesc},
        image::{GfxImage, GfxImageDesc, ImageSource, VulkanFormatUtils},
    },
};

/// 被记录下来的一条命令
#[derive(Clone, Debug)]
pub enum HeadlessCommand {
    ImageBarrier(GfxImageBarrier),
    BufferBarrier(GfxBufferBarrier),
    BeginLabel(String),
    EndLabel,
}

/// 设备上发生过的事情，按时间顺序排列
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeadlessEvent {
    WaitIdle,
    FenceWait { fence: String, blocked: bool },
    Submit { name: String, frame_slot: usize },
    CreateBuffer { name: String, size: vk::DeviceSize },
    UploadBuffer { name: String, size: vk::DeviceSize },
    DestroyBuffer { name: String },
    CreateImage { name: String },
    DestroyImage { name: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FenceStatus {
    Unsignaled,
    /// 已提交，GPU 还没有完成
    Pending,
    Signaled,
}

pub struct HeadlessCommandBuffer {
    name: String,
    frame_slot: usize,
    commands: Vec<HeadlessCommand>,
}
impl HeadlessCommandBuffer {
    #[inline]
    pub fn commands(&self) -> &[HeadlessCommand] {
        &self.commands
    }

    #[inline]
    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }
}
impl GfxCommandStream for HeadlessCommandBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    fn image_memory_barrier(&mut self, _dependency_flags: vk::DependencyFlags, barriers: &[GfxImageBarrier]) {
        self.commands.extend(barriers.iter().copied().map(HeadlessCommand::ImageBarrier));
    }

    fn buffer_memory_barrier(&mut self, _dependency_flags: vk::DependencyFlags, barriers: &[GfxBufferBarrier]) {
        self.commands.extend(barriers.iter().copied().map(HeadlessCommand::BufferBarrier));
    }

    fn begin_label(&mut self, label_name: &str, _label_color: glam::Vec4) {
        self.commands.push(HeadlessCommand::BeginLabel(label_name.to_string()));
    }

    fn end_label(&mut self) {
        self.commands.push(HeadlessCommand::EndLabel);
    }
}

/// 一次提交的快照
#[derive(Clone, Debug)]
pub struct HeadlessSubmission {
    pub name: String,
    pub frame_slot: usize,
    pub fence: vk::Fence,
    pub commands: Vec<HeadlessCommand>,
}
impl HeadlessSubmission {
    pub fn image_barriers(&self) -> impl Iterator<Item = &GfxImageBarrier> {
        self.commands.iter().filter_map(|cmd| match cmd {
            HeadlessCommand::ImageBarrier(barrier) => Some(barrier),
            _ => None,
        })
    }

    pub fn buffer_barriers(&self) -> impl Iterator<Item = &GfxBufferBarrier> {
        self.commands.iter().filter_map(|cmd| match cmd {
            HeadlessCommand::BufferBarrier(barrier) => Some(barrier),
            _ => None,
        })
    }

    /// 所有 label 的名字，按录制顺序
    pub fn labels(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|cmd| match cmd {
                HeadlessCommand::BeginLabel(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

pub struct HeadlessDevice {
    frames_in_flight: usize,
    next_handle: Cell<u64>,

    fences: RefCell<HashMap<vk::Fence, FenceStatus>>,
    /// 每个 frame slot 最近一次提交使用的 fence
    slot_fences: RefCell<HashMap<usize, vk::Fence>>,
    buffers: RefCell<HashMap<vk::Buffer, Vec<u8>>>,
    images: RefCell<HashMap<vk::Image, GfxImageDesc>>,

    history_limit: usize,
    submissions: RefCell<VecDeque<HeadlessSubmission>>,
    events: RefCell<VecDeque<HeadlessEvent>>,
    wait_idle_count: Cell<usize>,
    blocking_fence_wait_count: Cell<usize>,
}
// new & init
impl HeadlessDevice {
    pub const DEFAULT_HISTORY_LIMIT: usize = 256;

    pub fn new(frames_in_flight: usize) -> Self {
        Self::with_history_limit(frames_in_flight, Self::DEFAULT_HISTORY_LIMIT)
    }

    /// `history_limit` 为保留的提交数和事件数上限，至少为 1
    pub fn with_history_limit(frames_in_flight: usize, history_limit: usize) -> Self {
        Self {
            frames_in_flight,
            next_handle: Cell::new(1),
            fences: RefCell::new(HashMap::new()),
            slot_fences: RefCell::new(HashMap::new()),
            buffers: RefCell::new(HashMap::new()),
            images: RefCell::new(HashMap::new()),
            history_limit: history_limit.max(1),
            submissions: RefCell::new(VecDeque::new()),
            events: RefCell::new(VecDeque::new()),
            wait_idle_count: Cell::new(0),
            blocking_fence_wait_count: Cell::new(0),
        }
    }

    fn alloc_raw_handle(&self) -> u64 {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        raw
    }

    fn push_event(&self, event: HeadlessEvent) {
        match &event {
            HeadlessEvent::WaitIdle => self.wait_idle_count.set(self.wait_idle_count.get() + 1),
            HeadlessEvent::FenceWait { blocked: true, .. } => {
                self.blocking_fence_wait_count.set(self.blocking_fence_wait_count.get() + 1)
            }
            _ => {}
        }
        Self::push_bounded(&mut self.events.borrow_mut(), event, self.history_limit);
    }

    fn push_bounded<T>(history: &mut VecDeque<T>, item: T, limit: usize) {
        if history.len() == limit {
            history.pop_front();
        }
        history.push_back(item);
    }
}
// tools
impl HeadlessDevice {
    /// 模拟 GPU 追上 host：所有已提交的工作完成
    pub fn complete_submitted(&self) {
        for status in self.fences.borrow_mut().values_mut() {
            if *status == FenceStatus::Pending {
                *status = FenceStatus::Signaled;
            }
        }
    }

    /// 最近的提交，从旧到新
    pub fn submissions(&self) -> Vec<HeadlessSubmission> {
        self.submissions.borrow().iter().cloned().collect()
    }

    pub fn last_submission(&self) -> Option<HeadlessSubmission> {
        self.submissions.borrow().back().cloned()
    }

    /// 最近的事件，从旧到新
    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.events.borrow().iter().cloned().collect()
    }

    /// 只清空事件记录，计数保持不变
    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }

    /// 设备创建以来 `wait_idle` 的次数
    pub fn wait_idle_count(&self) -> usize {
        self.wait_idle_count.get()
    }

    /// 真正阻塞（等待的是尚未完成的提交）的 fence wait 次数
    pub fn blocking_fence_wait_count(&self) -> usize {
        self.blocking_fence_wait_count.get()
    }

    pub fn buffer_contents(&self, buffer: &GfxBuffer) -> Option<Vec<u8>> {
        self.buffers.borrow().get(&buffer.vk_buffer()).cloned()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.borrow().len()
    }

    pub fn live_image_count(&self) -> usize {
        self.images.borrow().len()
    }

    pub fn live_fence_count(&self) -> usize {
        self.fences.borrow().len()
    }

    fn fence_status(&self, fence: &GfxFence) -> GfxResult<FenceStatus> {
        self.fences
            .borrow()
            .get(&fence.handle())
            .copied()
            .ok_or(GfxError::UnknownFence(fence.handle()))
    }
}
impl GfxDevice for HeadlessDevice {
    type CommandBuffer = HeadlessCommandBuffer;

    fn wait_idle(&self) -> GfxResult<()> {
        self.complete_submitted();
        self.push_event(HeadlessEvent::WaitIdle);
        Ok(())
    }

    fn create_fence(&self, signaled: bool, debug_name: &str) -> GfxResult<GfxFence> {
        let fence = vk::Fence::from_raw(self.alloc_raw_handle());
        let status = if signaled { FenceStatus::Signaled } else { FenceStatus::Unsignaled };
        self.fences.borrow_mut().insert(fence, status);
        Ok(GfxFence::from_handle(fence, debug_name))
    }

    fn wait_fence(&self, fence: &GfxFence) -> GfxResult<()> {
        let status = self.fence_status(fence)?;
        // 等待一个从未提交的 unsignaled fence 在真实设备上会永远阻塞
        assert_ne!(
            status,
            FenceStatus::Unsignaled,
            "waiting on fence `{}` that was never submitted",
            fence.debug_name()
        );
        let blocked = status == FenceStatus::Pending;
        self.fences.borrow_mut().insert(fence.handle(), FenceStatus::Signaled);
        self.push_event(HeadlessEvent::FenceWait {
            fence: fence.debug_name().to_string(),
            blocked,
        });
        Ok(())
    }

    fn fence_signaled(&self, fence: &GfxFence) -> GfxResult<bool> {
        Ok(self.fence_status(fence)? == FenceStatus::Signaled)
    }

    fn reset_fence(&self, fence: &GfxFence) -> GfxResult<()> {
        let status = self.fence_status(fence)?;
        assert_ne!(status, FenceStatus::Pending, "resetting fence `{}` while it is in flight", fence.debug_name());
        self.fences.borrow_mut().insert(fence.handle(), FenceStatus::Unsignaled);
        Ok(())
    }

    fn destroy_fence(&self, fence: GfxFence) {
        self.fences.borrow_mut().remove(&fence.handle());
    }

    fn begin_commands(&self, frame_slot: usize, debug_name: &str) -> GfxResult<HeadlessCommandBuffer> {
        if frame_slot >= self.frames_in_flight {
            return Err(GfxError::InvalidFrameSlot(frame_slot));
        }
        if let Some(fence) = self.slot_fences.borrow().get(&frame_slot) {
            let status = self.fences.borrow().get(fence).copied();
            assert_ne!(
                status,
                Some(FenceStatus::Pending),
                "frame slot {frame_slot} reused while its previous submission is still in flight"
            );
        }

        Ok(HeadlessCommandBuffer {
            name: debug_name.to_string(),
            frame_slot,
            commands: Vec::new(),
        })
    }

    fn submit(&self, cmd: HeadlessCommandBuffer, fence: &GfxFence) -> GfxResult<()> {
        let status = self.fence_status(fence)?;
        assert_eq!(status, FenceStatus::Unsignaled, "submitting with fence `{}` that is not reset", fence.debug_name());

        self.fences.borrow_mut().insert(fence.handle(), FenceStatus::Pending);
        self.slot_fences.borrow_mut().insert(cmd.frame_slot, fence.handle());
        self.push_event(HeadlessEvent::Submit {
            name: cmd.name.clone(),
            frame_slot: cmd.frame_slot,
        });
        Self::push_bounded(
            &mut self.submissions.borrow_mut(),
            HeadlessSubmission {
                name: cmd.name,
                frame_slot: cmd.frame_slot,
                fence: fence.handle(),
                commands: cmd.commands,
            },
            self.history_limit,
        );
        Ok(())
    }

    fn create_device_local_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBuffer> {
        if desc.size == 0 {
            return Err(GfxError::ZeroSizedBuffer(desc.name.clone()));
        }
        let buffer = vk::Buffer::from_raw(self.alloc_raw_handle());
        self.buffers.borrow_mut().insert(buffer, vec![0; desc.size as usize]);
        self.push_event(HeadlessEvent::CreateBuffer {
            name: desc.name.clone(),
            size: desc.size,
        });
        Ok(GfxBuffer::new(buffer, desc))
    }

    fn upload_to_buffer(&self, buffer: &GfxBuffer, data: &[u8]) -> GfxResult<()> {
        let mut buffers = self.buffers.borrow_mut();
        let contents = buffers
            .get_mut(&buffer.vk_buffer())
            .ok_or_else(|| GfxError::UnknownBuffer(buffer.debug_name().to_string()))?;
        if data.len() > contents.len() {
            return Err(GfxError::UploadOverflow {
                name: buffer.debug_name().to_string(),
                data_size: data.len() as vk::DeviceSize,
                capacity: contents.len() as vk::DeviceSize,
            });
        }
        contents[..data.len()].copy_from_slice(data);
        drop(buffers);

        self.push_event(HeadlessEvent::UploadBuffer {
            name: buffer.debug_name().to_string(),
            size: data.len() as vk::DeviceSize,
        });
        Ok(())
    }

    fn destroy_buffer(&self, buffer: GfxBuffer) {
        if self.buffers.borrow_mut().remove(&buffer.vk_buffer()).is_some() {
            self.push_event(HeadlessEvent::DestroyBuffer {
                name: buffer.debug_name().to_string(),
            });
        }
    }

    fn create_sampled_image(&self, desc: &GfxImageDesc, texels: &[u8]) -> GfxResult<GfxImage> {
        let expected = VulkanFormatUtils::pixel_size_in_bytes(desc.format).unwrap_or(0) * desc.texel_count();
        if expected == 0 || expected != texels.len() {
            return Err(GfxError::TexelSizeMismatch {
                name: desc.name.clone(),
                data_size: texels.len(),
                expected,
            });
        }
        let image = vk::Image::from_raw(self.alloc_raw_handle());
        self.images.borrow_mut().insert(image, desc.clone());
        self.push_event(HeadlessEvent::CreateImage { name: desc.name.clone() });
        Ok(GfxImage::new_allocated(image, desc.clone()))
    }

    fn destroy_image(&self, image: GfxImage) {
        if image.source() == ImageSource::External {
            return;
        }
        if self.images.borrow_mut().remove(&image.handle()).is_some() {
            self.push_event(HeadlessEvent::DestroyImage {
                name: image.name().to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_becomes_signaled_after_wait() {
        let device = HeadlessDevice::new(3);
        let fence = device.create_fence(false, "frame-fence").unwrap();
        let cmd = device.begin_commands(0, "frame").unwrap();
        device.submit(cmd, &fence).unwrap();

        assert!(!device.fence_signaled(&fence).unwrap());
        device.wait_fence(&fence).unwrap();
        assert!(device.fence_signaled(&fence).unwrap());
        assert_eq!(device.blocking_fence_wait_count(), 1);
    }

    #[test]
    #[should_panic(expected = "still in flight")]
    fn test_reusing_busy_slot_panics() {
        let device = HeadlessDevice::new(3);
        let fence = device.create_fence(false, "frame-fence").unwrap();
        let cmd = device.begin_commands(1, "frame").unwrap();
        device.submit(cmd, &fence).unwrap();

        let _ = device.begin_commands(1, "frame");
    }

    #[test]
    fn test_upload_writes_prefix() {
        let device = HeadlessDevice::new(1);
        let buffer = device
            .create_device_local_buffer(&GfxBufferDesc {
                name: "lights".to_string(),
                size: 8,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            })
            .unwrap();
        device.upload_to_buffer(&buffer, &[1, 2, 3, 4]).unwrap();

        assert_eq!(device.buffer_contents(&buffer).unwrap(), vec![1, 2, 3, 4, 0, 0, 0, 0]);
        assert!(matches!(
            device.upload_to_buffer(&buffer, &[0; 9]),
            Err(GfxError::UploadOverflow { capacity: 8, .. })
        ));
    }

    #[test]
    fn test_history_is_bounded_but_counts_are_not() {
        let device = HeadlessDevice::with_history_limit(1, 4);
        for frame in 0..10 {
            let fence = device.create_fence(false, "frame-fence").unwrap();
            let cmd = device.begin_commands(0, &format!("frame-{frame}")).unwrap();
            device.submit(cmd, &fence).unwrap();
            device.wait_fence(&fence).unwrap();
            device.destroy_fence(fence);
        }
        device.wait_idle().unwrap();

        let submissions = device.submissions();
        assert_eq!(submissions.len(), 4);
        assert_eq!(submissions.first().unwrap().name, "frame-6");
        assert_eq!(device.last_submission().unwrap().name, "frame-9");
        assert_eq!(device.events().len(), 4);
        assert!(matches!(device.events().last(), Some(HeadlessEvent::WaitIdle)));

        assert_eq!(device.blocking_fence_wait_count(), 10);
        assert_eq!(device.wait_idle_count(), 1);
        device.clear_events();
        assert_eq!(device.wait_idle_count(), 1);
    }
}
