use ash::vk;

use crate::resources::handles::{GfxBufferHandle, GfxImageHandle};

/// gfx 层的错误
///
/// 这些错误都来自设备或资源管理，属于不可恢复的运行时错误，一路向上传递到应用退出。
#[derive(Debug, thiserror::Error)]
pub enum GfxError {
    /// Vulkan 调用返回了错误码
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    /// 找不到对应的 buffer（已经被销毁，或者不是这个设备创建的）
    #[error("unknown buffer `{0}`")]
    UnknownBuffer(String),

    #[error("unknown image `{0}`")]
    UnknownImage(String),

    #[error("stale buffer handle {0:?}")]
    StaleBuffer(GfxBufferHandle),

    #[error("stale image handle {0:?}")]
    StaleImage(GfxImageHandle),

    #[error("unknown fence {0:?}")]
    UnknownFence(vk::Fence),

    /// 上传的数据超过了 buffer 的容量
    #[error("upload of {data_size} bytes does not fit into buffer `{name}` ({capacity} bytes)")]
    UploadOverflow {
        name: String,
        data_size: vk::DeviceSize,
        capacity: vk::DeviceSize,
    },

    #[error("texel data of {data_size} bytes does not match image `{name}` ({expected} bytes)")]
    TexelSizeMismatch { name: String, data_size: usize, expected: usize },

    #[error("frame slot {0} is out of range")]
    InvalidFrameSlot(usize),

    #[error("zero-sized buffer `{0}` is not allowed")]
    ZeroSizedBuffer(String),
}

pub type GfxResult<T> = Result<T, GfxError>;
