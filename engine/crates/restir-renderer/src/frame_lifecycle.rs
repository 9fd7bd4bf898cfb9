//! 帧生命周期
//!
//! 每个 frame slot（A/B/C）有一个 fence 和一个状态：
//!
//! ```text
//! Idle -> Recording -> Submitted -> ResultsAvailable -> Recording -> ...
//! ```
//!
//! slot 被复用之前必须等到它上一次提交的 fence，`begin_frame` 负责这一点。
//! 录制失败的帧通过 [`FrameLifecycleController::abandon_frame`] 把 slot 还回去，帧序号不前进。

use ash::vk;

use restir_gfx::{commands::fence::GfxFence, device::GfxDevice, error::GfxResult};

use crate::{
    frame_counter::FrameCounter,
    pipeline_settings::{FrameLabel, FrameRenderInfo},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// 没有未完成的提交，也没有待读取的结果：从未使用，或者上一次录制被放弃
    Idle,
    Recording,
    /// 已提交，GPU 可能仍在执行
    Submitted,
    /// GPU 已完成，结果可以读取
    ResultsAvailable,
}

struct FrameSlot {
    fence: GfxFence,
    state: FrameState,
    frame_id: Option<u64>,
}

pub struct FrameLifecycleController {
    frame_counter: FrameCounter,
    slots: Vec<FrameSlot>,

    frame_extent: vk::Extent2D,
    /// 多次 resize 请求只保留最后一次
    pending_resize: Option<vk::Extent2D>,
}
// new & init
impl FrameLifecycleController {
    pub fn new(device: &impl GfxDevice, frame_extent: vk::Extent2D) -> GfxResult<Self> {
        let slots = FrameCounter::frame_labels()
            .into_iter()
            .map(|label| -> GfxResult<FrameSlot> {
                Ok(FrameSlot {
                    // 初始为 signaled，第一次使用时不会阻塞
                    fence: device.create_fence(true, &format!("frame-fence-{label}"))?,
                    state: FrameState::Idle,
                    frame_id: None,
                })
            })
            .collect::<GfxResult<Vec<_>>>()?;

        Ok(Self {
            frame_counter: FrameCounter::new(0),
            slots,
            frame_extent,
            pending_resize: None,
        })
    }
}
// getter
impl FrameLifecycleController {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_counter.frame_id()
    }

    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        self.frame_counter.frame_label()
    }

    #[inline]
    pub fn frame_extent(&self) -> vk::Extent2D {
        self.frame_extent
    }

    #[inline]
    pub fn frame_state(&self, label: FrameLabel) -> FrameState {
        self.slots[*label].state
    }

    pub fn in_flight_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state == FrameState::Submitted).count()
    }

    #[inline]
    pub fn has_pending_resize(&self) -> bool {
        self.pending_resize.is_some()
    }
}
// update
impl FrameLifecycleController {
    /// 开始录制新的一帧，必要时阻塞等待该 slot 上一次的提交完成
    pub fn begin_frame(&mut self, device: &impl GfxDevice) -> GfxResult<FrameRenderInfo> {
        let _span = restir_crate_tools::profile_span!("FrameLifecycleController::begin_frame");

        let label = self.frame_counter.frame_label();
        let frame_id = self.frame_counter.frame_id();
        let slot = &mut self.slots[*label];
        assert_ne!(slot.state, FrameState::Recording, "frame slot {label} is already recording");

        device.wait_fence(&slot.fence)?;
        if slot.state == FrameState::Submitted {
            slot.state = FrameState::ResultsAvailable;
        }
        device.reset_fence(&slot.fence)?;

        slot.state = FrameState::Recording;
        slot.frame_id = Some(frame_id);

        Ok(FrameRenderInfo {
            frame_id,
            frame_label: label,
            frame_extent: self.frame_extent,
        })
    }

    /// 提交当前帧并推进帧计数
    pub fn submit<D: GfxDevice>(&mut self, device: &D, cmd: D::CommandBuffer) -> GfxResult<()> {
        let label = self.frame_counter.frame_label();
        let slot = &mut self.slots[*label];
        assert_eq!(slot.state, FrameState::Recording, "frame slot {label} submitted without begin_frame");

        device.submit(cmd, &slot.fence)?;
        slot.state = FrameState::Submitted;
        self.frame_counter.next_frame();
        Ok(())
    }

    /// 放弃正在录制的帧，slot 回到 [`FrameState::Idle`]，下一次 `begin_frame` 重新使用同一个帧序号
    ///
    /// `begin_frame` 已经 reset 了 fence，而 host 不能 signal fence，所以换一个 signaled 的新 fence。
    pub fn abandon_frame(&mut self, device: &impl GfxDevice) -> GfxResult<()> {
        let label = self.frame_counter.frame_label();
        let slot = &mut self.slots[*label];
        assert_eq!(slot.state, FrameState::Recording, "frame slot {label} abandoned without begin_frame");

        let fence = device.create_fence(true, &format!("frame-fence-{label}"))?;
        device.destroy_fence(std::mem::replace(&mut slot.fence, fence));
        slot.state = FrameState::Idle;
        slot.frame_id = None;
        log::warn!("frame {} abandoned in slot {label}", self.frame_counter.frame_id());
        Ok(())
    }

    /// 非阻塞地检查已提交的帧，返回这次新完成的帧序号
    pub fn poll_completed(&mut self, device: &impl GfxDevice) -> GfxResult<Vec<u64>> {
        let mut completed = Vec::new();
        for slot in self.slots.iter_mut().filter(|slot| slot.state == FrameState::Submitted) {
            if device.fence_signaled(&slot.fence)? {
                slot.state = FrameState::ResultsAvailable;
                completed.extend(slot.frame_id);
            }
        }
        completed.sort_unstable();
        Ok(completed)
    }

    /// 等待所有已提交的帧完成
    pub fn wait_all(&mut self, device: &impl GfxDevice) -> GfxResult<()> {
        for slot in self.slots.iter_mut().filter(|slot| slot.state == FrameState::Submitted) {
            device.wait_fence(&slot.fence)?;
            slot.state = FrameState::ResultsAvailable;
        }
        Ok(())
    }

    /// 记录一次 resize 请求；和当前尺寸相同的请求会覆盖掉等待中的请求
    pub fn request_resize(&mut self, extent: vk::Extent2D) {
        if extent == self.frame_extent {
            self.pending_resize = None;
        } else {
            self.pending_resize = Some(extent);
        }
    }

    /// 取出等待中的 resize，同时更新帧尺寸
    pub fn take_pending_resize(&mut self) -> Option<vk::Extent2D> {
        let extent = self.pending_resize.take()?;
        self.frame_extent = extent;
        Some(extent)
    }
}
// destroy
impl FrameLifecycleController {
    pub fn destroy(mut self, device: &impl GfxDevice) -> GfxResult<()> {
        self.wait_all(device)?;
        for slot in self.slots.drain(..) {
            device.destroy_fence(slot.fence);
        }
        Ok(())
    }
}
