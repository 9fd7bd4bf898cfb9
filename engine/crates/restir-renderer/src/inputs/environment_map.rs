use std::path::Path;

use ash::vk;

use restir_gfx::{
    device::GfxDevice,
    error::GfxResult,
    resources::{handles::GfxImageHandle, image::GfxImageDesc, resource_manager::GfxResourceManager},
};

use crate::pipeline_settings::DefaultRendererSettings;

/// CPU 侧的环境贴图，rgba32f
pub struct EnvironmentMap {
    extent: vk::Extent2D,
    texels: Vec<f32>,
}
// new & init
impl EnvironmentMap {
    /// 1x1 黑色贴图
    pub fn black() -> Self {
        Self {
            extent: vk::Extent2D { width: 1, height: 1 },
            texels: vec![0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn load(path: &Path) -> Result<Self, image::ImageError> {
        let _span = restir_crate_tools::profile_span!("EnvironmentMap::load");
        let img = image::open(path)?.into_rgba32f();
        let extent = vk::Extent2D {
            width: img.width(),
            height: img.height(),
        };
        Ok(Self {
            extent,
            texels: img.into_raw(),
        })
    }

    /// 加载失败时记录警告并退回黑色贴图，渲染仍然可以继续
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            log::info!("no environment map configured, using black");
            return Self::black();
        };
        match Self::load(path) {
            Ok(env_map) => {
                log::info!(
                    "environment map loaded: {} ({}x{})",
                    path.display(),
                    env_map.extent.width,
                    env_map.extent.height
                );
                env_map
            }
            Err(err) => {
                log::warn!("failed to load environment map {}: {err}; using black", path.display());
                Self::black()
            }
        }
    }
}
// getter
impl EnvironmentMap {
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn texel_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.texels)
    }
}
// tools
impl EnvironmentMap {
    pub fn upload(
        &self,
        device: &impl GfxDevice,
        resource_manager: &mut GfxResourceManager,
    ) -> GfxResult<GfxImageHandle> {
        let desc = GfxImageDesc::new_2d(
            "environment-map",
            self.extent,
            DefaultRendererSettings::ENVIRONMENT_MAP_FORMAT,
            vk::ImageUsageFlags::SAMPLED,
        );
        let image = device.create_sampled_image(&desc, self.texel_bytes())?;
        Ok(resource_manager.register_image(image))
    }
}
