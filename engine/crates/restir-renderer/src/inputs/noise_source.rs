use ash::vk;
use rand::{RngCore, SeedableRng};

use restir_gfx::{
    device::GfxDevice,
    error::GfxResult,
    resources::{handles::GfxImageHandle, image::GfxImageDesc, resource_manager::GfxResourceManager},
};

use crate::pipeline_settings::DefaultRendererSettings;

/// rgba8 白噪声，作为积分器的随机数种子纹理
pub struct NoiseSource {
    extent: vk::Extent2D,
    texels: Vec<u8>,
}
impl NoiseSource {
    /// 相同的 seed 生成相同的纹理
    pub fn generate(extent: vk::Extent2D, seed: u64) -> Self {
        let _span = restir_crate_tools::profile_span!("NoiseSource::generate");
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut texels = vec![0u8; extent.width as usize * extent.height as usize * 4];
        rng.fill_bytes(&mut texels);
        Self { extent, texels }
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn texels(&self) -> &[u8] {
        &self.texels
    }

    pub fn upload(
        &self,
        device: &impl GfxDevice,
        resource_manager: &mut GfxResourceManager,
    ) -> GfxResult<GfxImageHandle> {
        let desc = GfxImageDesc::new_2d(
            "noise-source",
            self.extent,
            DefaultRendererSettings::NOISE_FORMAT,
            vk::ImageUsageFlags::SAMPLED,
        );
        let image = device.create_sampled_image(&desc, &self.texels)?;
        Ok(resource_manager.register_image(image))
    }
}
