use std::path::{Path, PathBuf};

use ash::vk;

use restir_scene::light::extractor::LightExtractionMode;

use crate::error::{PipelineError, PipelineResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExtentConfig {
    pub width: u32,
    pub height: u32,
}
impl Default for ExtentConfig {
    fn default() -> Self {
        Self {
            width: 1600,
            height: 900,
        }
    }
}
impl From<ExtentConfig> for vk::Extent2D {
    fn from(value: ExtentConfig) -> Self {
        vk::Extent2D {
            width: value.width,
            height: value.height,
        }
    }
}

/// 渲染器的启动配置
///
/// ```toml
/// environment_map = "assets/hdr/sky.exr"
/// initial_output = "RaytracingTarget"
/// light_extraction = "accumulate"
///
/// [frame_extent]
/// width = 1920
/// height = 1080
/// ```
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub frame_extent: ExtentConfig,
    pub environment_map: Option<PathBuf>,
    /// 第一帧显示的输出；为空时使用注册表里的第一个输出
    pub initial_output: Option<String>,
    pub light_extraction: LightExtractionMode,
    /// 噪声纹理边长
    pub noise_extent: u32,
    pub noise_seed: u64,
}
impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frame_extent: ExtentConfig::default(),
            environment_map: None,
            initial_output: None,
            light_extraction: LightExtractionMode::default(),
            noise_extent: 128,
            noise_seed: 0x5EED,
        }
    }
}
impl RendererConfig {
    pub fn from_toml_str(text: &str) -> PipelineResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PipelineError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::info!("renderer config loaded from {}", path.display());
        Ok(config)
    }

    #[inline]
    pub fn frame_extent(&self) -> vk::Extent2D {
        self.frame_extent.into()
    }

    #[inline]
    pub fn noise_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.noise_extent.max(1),
            height: self.noise_extent.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = RendererConfig::from_toml_str(
            r#"
            initial_output = "Albedo"
            light_extraction = "legacy_single_mesh"

            [frame_extent]
            width = 640
            height = 480
            "#,
        )
        .unwrap();

        assert_eq!(config.initial_output.as_deref(), Some("Albedo"));
        assert_eq!(config.light_extraction, LightExtractionMode::LegacySingleMesh);
        assert_eq!(config.frame_extent(), vk::Extent2D { width: 640, height: 480 });
        assert_eq!(config.noise_extent, RendererConfig::default().noise_extent);
        assert!(config.environment_map.is_none());
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let result = RendererConfig::from_toml_str("light_extraction = \"everything\"");
        assert!(matches!(result, Err(PipelineError::ConfigParse(_))));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let result = RendererConfig::load("does/not/exist.toml");
        match result {
            Err(PipelineError::ConfigIo { path, .. }) => assert_eq!(path, PathBuf::from("does/not/exist.toml")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
