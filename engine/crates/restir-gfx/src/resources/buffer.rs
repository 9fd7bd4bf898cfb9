use ash::vk;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxBufferDesc {
    pub name: String,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

/// 一个 buffer 的描述记录，allocation 由创建它的设备持有
#[derive(Clone, Debug)]
pub struct GfxBuffer {
    handle: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,

    debug_name: String,
}
// new & init
impl GfxBuffer {
    #[inline]
    pub(crate) fn new(handle: vk::Buffer, desc: &GfxBufferDesc) -> Self {
        Self {
            handle,
            size: desc.size,
            usage: desc.usage,
            debug_name: desc.name.clone(),
        }
    }
}
// getter
impl GfxBuffer {
    #[inline]
    pub fn vk_buffer(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}
