//! 自发光三角形的 GPU buffer
//!
//! buffer 的大小总是恰好等于 `光源数量 * TriLight::GPU_SIZE`。大小不变时复用原来的 buffer，
//! 否则销毁后重新创建。写入之前会等待设备空闲，光追 stage 永远不会读到写了一半的数据。

use ash::vk;

use restir_gfx::{
    device::GfxDevice,
    error::{GfxError, GfxResult},
    resources::{buffer::GfxBufferDesc, handles::GfxBufferHandle, resource_manager::GfxResourceManager},
};
use restir_scene::light::{extractor::LightSet, tri_light::TriLight};

/// 交给光追 stage 的光源 buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LightBufferBinding {
    pub buffer: GfxBufferHandle,
    pub light_count: u32,
}

#[derive(Default)]
pub struct LightBufferUploader {
    binding: Option<LightBufferBinding>,
}
// new & init
impl LightBufferUploader {
    pub fn new() -> Self {
        Self::default()
    }
}
// getter
impl LightBufferUploader {
    #[inline]
    pub fn binding(&self) -> Option<LightBufferBinding> {
        self.binding
    }
}
// update
impl LightBufferUploader {
    /// 把 `lights` 写入 GPU，返回新的绑定；没有光源时释放 buffer 并返回 `None`
    pub fn upload(
        &mut self,
        device: &impl GfxDevice,
        resource_manager: &mut GfxResourceManager,
        lights: &LightSet,
    ) -> GfxResult<Option<LightBufferBinding>> {
        let _span = restir_crate_tools::profile_span!("LightBufferUploader::upload");

        // 上一帧可能仍在读这个 buffer
        device.wait_idle()?;

        let size = (lights.len() * TriLight::GPU_SIZE) as vk::DeviceSize;
        if size == 0 {
            if let Some(old) = self.binding.take() {
                resource_manager.destroy_buffer(old.buffer, device);
                log::info!("no emissive triangles, light buffer released");
            }
            return Ok(None);
        }

        let reusable = self
            .binding
            .and_then(|binding| resource_manager.get_buffer(binding.buffer).map(|buffer| (binding, buffer.size())))
            .filter(|(_, old_size)| *old_size == size)
            .map(|(binding, _)| binding.buffer);

        let handle = match reusable {
            Some(handle) => handle,
            None => {
                if let Some(old) = self.binding.take() {
                    resource_manager.destroy_buffer(old.buffer, device);
                }
                let buffer = device.create_device_local_buffer(&GfxBufferDesc {
                    name: "emissive-triangles".to_string(),
                    size,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                })?;
                log::info!("light buffer allocated: {} triangles, {size} bytes", lights.len());
                resource_manager.register_buffer(buffer)
            }
        };

        let buffer = resource_manager.get_buffer(handle).ok_or(GfxError::StaleBuffer(handle))?;
        device.upload_to_buffer(buffer, lights.as_bytes())?;

        let binding = LightBufferBinding {
            buffer: handle,
            light_count: lights.len() as u32,
        };
        self.binding = Some(binding);
        Ok(Some(binding))
    }

    pub fn destroy(&mut self, device: &impl GfxDevice, resource_manager: &mut GfxResourceManager) {
        if let Some(binding) = self.binding.take() {
            resource_manager.destroy_buffer(binding.buffer, device);
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3, Vec4};
    use restir_gfx::headless::{HeadlessDevice, HeadlessEvent};
    use restir_scene::{
        components::{
            instance::Instance,
            material::Material,
            mesh::{Mesh, Primitive, Vertex},
        },
        light::extractor::{EmissiveLightExtractor, LightExtractionMode},
        scene_manager::SceneManager,
    };

    use super::*;

    /// `triangle_count` 个自发光三角形
    fn light_set(triangle_count: usize) -> LightSet {
        let mut scene = SceneManager::new();
        let material = scene.register_mat(Material {
            emissive: Vec4::new(1.0, 1.0, 1.0, 1.0),
            ..Default::default()
        });
        if triangle_count > 0 {
            let vertices = vec![
                Vertex::from_position(Vec3::ZERO),
                Vertex::from_position(Vec3::X),
                Vertex::from_position(Vec3::Y),
            ];
            let mesh = scene.register_mesh(Mesh {
                name: "emitter".to_string(),
                primitives: vec![Primitive {
                    vertices,
                    indices: [0, 1, 2].repeat(triangle_count),
                    material,
                }],
            });
            scene.register_instance(Instance {
                name: "emitter".to_string(),
                mesh,
                transform: Mat4::IDENTITY,
            });
        }
        EmissiveLightExtractor::new(LightExtractionMode::Accumulate).extract(&scene).unwrap()
    }

    #[test]
    fn test_buffer_has_exact_size() {
        let device = HeadlessDevice::new(3);
        let mut resources = GfxResourceManager::new();
        let mut uploader = LightBufferUploader::new();

        let lights = light_set(2);
        let binding = uploader.upload(&device, &mut resources, &lights).unwrap().unwrap();

        let buffer = resources.get_buffer(binding.buffer).unwrap();
        assert_eq!(binding.light_count, 2);
        assert_eq!(buffer.size(), 2 * TriLight::GPU_SIZE as vk::DeviceSize);
        assert_eq!(device.buffer_contents(buffer).unwrap(), lights.as_bytes());
    }

    #[test]
    fn test_same_size_reuses_buffer() {
        let device = HeadlessDevice::new(3);
        let mut resources = GfxResourceManager::new();
        let mut uploader = LightBufferUploader::new();

        let first = uploader.upload(&device, &mut resources, &light_set(3)).unwrap().unwrap();
        let second = uploader.upload(&device, &mut resources, &light_set(3)).unwrap().unwrap();

        assert_eq!(first.buffer, second.buffer);
        assert_eq!(device.live_buffer_count(), 1);
        let created = device
            .events()
            .iter()
            .filter(|e| matches!(e, HeadlessEvent::CreateBuffer { .. }))
            .count();
        assert_eq!(created, 1);
    }

    #[test]
    fn test_size_change_reallocates() {
        let device = HeadlessDevice::new(3);
        let mut resources = GfxResourceManager::new();
        let mut uploader = LightBufferUploader::new();

        let first = uploader.upload(&device, &mut resources, &light_set(1)).unwrap().unwrap();
        let second = uploader.upload(&device, &mut resources, &light_set(4)).unwrap().unwrap();

        assert_ne!(first.buffer, second.buffer);
        assert!(resources.get_buffer(first.buffer).is_none());
        assert_eq!(device.live_buffer_count(), 1);
        assert_eq!(resources.get_buffer(second.buffer).unwrap().size(), 4 * 64);
    }

    #[test]
    fn test_zero_lights_releases_buffer() {
        let device = HeadlessDevice::new(3);
        let mut resources = GfxResourceManager::new();
        let mut uploader = LightBufferUploader::new();

        uploader.upload(&device, &mut resources, &light_set(2)).unwrap();
        let binding = uploader.upload(&device, &mut resources, &light_set(0)).unwrap();

        assert!(binding.is_none());
        assert!(uploader.binding().is_none());
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_every_upload_waits_for_idle_first() {
        let device = HeadlessDevice::new(3);
        let mut resources = GfxResourceManager::new();
        let mut uploader = LightBufferUploader::new();

        uploader.upload(&device, &mut resources, &light_set(2)).unwrap();
        uploader.upload(&device, &mut resources, &light_set(2)).unwrap();

        let events = device.events();
        let uploads: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, HeadlessEvent::UploadBuffer { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(uploads.len(), 2);
        for upload in uploads {
            assert!(events[..upload].iter().rev().any(|e| matches!(e, HeadlessEvent::WaitIdle)));
        }
        assert_eq!(device.wait_idle_count(), 2);
    }
}
