//! Barrier 描述
//!
//! tracker 只产出逻辑描述，录制时再结合物理句柄转换成 gfx 层的 barrier。

use ash::vk;
use restir_gfx::{
    commands::barrier::{GfxBarrierMask, GfxBufferBarrier, GfxImageBarrier},
    resources::handles::{GfxBufferHandle, GfxImageHandle},
};

use crate::resource_state::{RgBufferState, RgImageState};

/// 图像 barrier 描述
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgImageBarrierDesc {
    pub image: GfxImageHandle,
    pub src_state: RgImageState,
    pub dst_state: RgImageState,
    pub aspect: vk::ImageAspectFlags,
}

impl RgImageBarrierDesc {
    #[inline]
    pub fn new(image: GfxImageHandle, src_state: RgImageState, dst_state: RgImageState) -> Self {
        Self {
            image,
            src_state,
            dst_state,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    #[inline]
    pub fn with_aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect;
        self
    }

    #[inline]
    pub fn has_layout_change(&self) -> bool {
        self.src_state.layout != self.dst_state.layout
    }

    #[inline]
    pub fn mask(&self) -> GfxBarrierMask {
        GfxBarrierMask {
            src_stage: self.src_state.stage,
            dst_stage: self.dst_state.stage,
            src_access: self.src_state.src_access(),
            dst_access: self.dst_state.access,
        }
    }

    /// 结合物理句柄生成 gfx barrier
    pub fn to_gfx_barrier(&self, image: vk::Image) -> GfxImageBarrier {
        GfxImageBarrier::new()
            .image(image)
            .layout_transfer(self.src_state.layout, self.dst_state.layout)
            .mask(self.mask())
            .image_aspect_flag(self.aspect)
    }
}

/// 缓冲区 barrier 描述，总是覆盖整个 buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgBufferBarrierDesc {
    pub buffer: GfxBufferHandle,
    pub src_state: RgBufferState,
    pub dst_state: RgBufferState,
}

impl RgBufferBarrierDesc {
    #[inline]
    pub fn new(buffer: GfxBufferHandle, src_state: RgBufferState, dst_state: RgBufferState) -> Self {
        Self {
            buffer,
            src_state,
            dst_state,
        }
    }

    #[inline]
    pub fn mask(&self) -> GfxBarrierMask {
        GfxBarrierMask {
            src_stage: self.src_state.stage,
            dst_stage: self.dst_state.stage,
            src_access: self.src_state.src_access(),
            dst_access: self.dst_state.access,
        }
    }

    pub fn to_gfx_barrier(&self, buffer: vk::Buffer) -> GfxBufferBarrier {
        GfxBufferBarrier::new().buffer(buffer, 0, vk::WHOLE_SIZE).mask(self.mask())
    }
}

/// tracker 推导出的 barrier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RgBarrier {
    Image(RgImageBarrierDesc),
    Buffer(RgBufferBarrierDesc),
}
