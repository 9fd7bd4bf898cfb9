use slotmap::SlotMap;

use crate::{
    device::GfxDevice,
    resources::{
        buffer::GfxBuffer,
        handles::{GfxBufferHandle, GfxImageHandle},
        image::GfxImage,
    },
};

/// 资源管理器
///
/// 使用 SlotMap 存储资源记录，对外提供轻量级的 Handle。
/// stage 重新分配输出时会先移除旧记录再注册新记录，旧 handle 随之失效。
#[derive(Default)]
pub struct GfxResourceManager {
    /// 存储所有的 Buffer 资源
    buffer_pool: SlotMap<GfxBufferHandle, GfxBuffer>,
    /// 存储所有的 Image 资源
    image_pool: SlotMap<GfxImageHandle, GfxImage>,
}
// new & init
impl GfxResourceManager {
    pub fn new() -> Self {
        Self::default()
    }
}
// image
impl GfxResourceManager {
    #[inline]
    pub fn register_image(&mut self, image: GfxImage) -> GfxImageHandle {
        log::debug!("register image `{}`", image.name());
        self.image_pool.insert(image)
    }

    #[inline]
    pub fn get_image(&self, handle: GfxImageHandle) -> Option<&GfxImage> {
        self.image_pool.get(handle)
    }

    #[inline]
    pub fn contains_image(&self, handle: GfxImageHandle) -> bool {
        self.image_pool.contains_key(handle)
    }

    /// 只移除记录，不释放内存
    #[inline]
    pub fn remove_image(&mut self, handle: GfxImageHandle) -> Option<GfxImage> {
        self.image_pool.remove(handle)
    }

    /// 移除记录并通过 device 释放内存
    pub fn destroy_image(&mut self, handle: GfxImageHandle, device: &impl GfxDevice) {
        if let Some(image) = self.image_pool.remove(handle) {
            device.destroy_image(image);
        }
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.image_pool.len()
    }
}
// buffer
impl GfxResourceManager {
    #[inline]
    pub fn register_buffer(&mut self, buffer: GfxBuffer) -> GfxBufferHandle {
        log::debug!("register buffer `{}` ({} bytes)", buffer.debug_name(), buffer.size());
        self.buffer_pool.insert(buffer)
    }

    #[inline]
    pub fn get_buffer(&self, handle: GfxBufferHandle) -> Option<&GfxBuffer> {
        self.buffer_pool.get(handle)
    }

    #[inline]
    pub fn remove_buffer(&mut self, handle: GfxBufferHandle) -> Option<GfxBuffer> {
        self.buffer_pool.remove(handle)
    }

    pub fn destroy_buffer(&mut self, handle: GfxBufferHandle, device: &impl GfxDevice) {
        if let Some(buffer) = self.buffer_pool.remove(handle) {
            device.destroy_buffer(buffer);
        }
    }
}
// destroy
impl GfxResourceManager {
    pub fn destroy_all(&mut self, device: &impl GfxDevice) {
        let _span = restir_crate_tools::profile_span!("GfxResourceManager::destroy_all");

        for (_, image) in self.image_pool.drain() {
            device.destroy_image(image);
        }
        for (_, buffer) in self.buffer_pool.drain() {
            device.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use ash::vk::Handle;

    use super::*;
    use crate::resources::image::GfxImageDesc;

    fn external_image(raw: u64, name: &str) -> GfxImage {
        GfxImage::from_external(
            vk::Image::from_raw(raw),
            GfxImageDesc::new_2d(
                name,
                vk::Extent2D { width: 4, height: 4 },
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
            ),
        )
    }

    #[test]
    fn test_removed_handle_is_stale() {
        let mut manager = GfxResourceManager::new();
        let old = manager.register_image(external_image(1, "Albedo"));
        manager.remove_image(old);
        let new = manager.register_image(external_image(2, "Albedo"));

        assert!(manager.get_image(old).is_none());
        assert_eq!(manager.get_image(new).map(|image| image.handle()), Some(vk::Image::from_raw(2)));
        assert_eq!(manager.image_count(), 1);
    }
}
