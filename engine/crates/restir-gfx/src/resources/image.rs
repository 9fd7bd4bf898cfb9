use ash::vk;

/// Vulkan 格式相关的工具类
pub struct VulkanFormatUtils;
impl VulkanFormatUtils {
    /// 根据 format 推断 aspect
    pub fn infer_image_aspect(format: vk::Format) -> vk::ImageAspectFlags {
        match format {
            vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
                vk::ImageAspectFlags::DEPTH
            }

            vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,

            vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }

            _ => vk::ImageAspectFlags::COLOR,
        }
    }

    #[inline]
    pub fn is_depth_format(format: vk::Format) -> bool {
        Self::infer_image_aspect(format).contains(vk::ImageAspectFlags::DEPTH)
    }

    /// 每个像素的字节数，只覆盖上传路径会用到的格式
    pub fn pixel_size_in_bytes(format: vk::Format) -> Option<usize> {
        match format {
            vk::Format::R8_UNORM | vk::Format::R8_UINT => Some(1),
            vk::Format::R8G8B8A8_UNORM
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::B8G8R8A8_UNORM
            | vk::Format::B8G8R8A8_SRGB
            | vk::Format::R32_SFLOAT
            | vk::Format::R32_UINT => Some(4),
            vk::Format::R16G16B16A16_SFLOAT | vk::Format::R16G16B16A16_UNORM => Some(8),
            vk::Format::R32G32B32A32_SFLOAT => Some(16),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxImageDesc {
    pub name: String,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}
impl GfxImageDesc {
    pub fn new_2d(name: impl Into<String>, extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            name: name.into(),
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            format,
            usage,
        }
    }

    #[inline]
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    #[inline]
    pub fn texel_count(&self) -> usize {
        self.extent.width as usize * self.extent.height as usize * self.extent.depth as usize
    }
}

/// Image 来源
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    /// 由设备分配，内存由设备回收
    Allocated,
    /// 外部 Image（例如 stage 自己持有的 render target），不管理其内存生命周期
    External,
}

/// 一个 image 的描述记录
///
/// 不持有内存；真正的 allocation 在创建它的设备那里
#[derive(Clone, Debug)]
pub struct GfxImage {
    handle: vk::Image,
    desc: GfxImageDesc,
    source: ImageSource,
}
// new & init
impl GfxImage {
    #[inline]
    pub(crate) fn new_allocated(handle: vk::Image, desc: GfxImageDesc) -> Self {
        Self {
            handle,
            desc,
            source: ImageSource::Allocated,
        }
    }

    #[inline]
    pub fn from_external(handle: vk::Image, desc: GfxImageDesc) -> Self {
        Self {
            handle,
            desc,
            source: ImageSource::External,
        }
    }
}
// getter
impl GfxImage {
    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    #[inline]
    pub fn desc(&self) -> &GfxImageDesc {
        &self.desc
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent_2d()
    }

    #[inline]
    pub fn source(&self) -> ImageSource {
        self.source
    }

    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        VulkanFormatUtils::infer_image_aspect(self.desc.format)
    }
}
