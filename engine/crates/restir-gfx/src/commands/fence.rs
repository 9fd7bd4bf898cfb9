use ash::vk;

/// # Destroy
/// 可以 Clone，需要通过创建它的 device 手动 destroy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxFence {
    fence: vk::Fence,
    debug_name: String,
}
// new
impl GfxFence {
    #[inline]
    pub fn from_handle(fence: vk::Fence, debug_name: impl Into<String>) -> Self {
        Self {
            fence,
            debug_name: debug_name.into(),
        }
    }
}
// getters
impl GfxFence {
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}
