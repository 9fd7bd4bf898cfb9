//! 自发光三角形提取
//!
//! 从场景几何中构建积分器采样用的光源列表。有两种模式：
//!
//! - [`LightExtractionMode::Accumulate`]：所有 instance 中材质自发光的图元都会被收集，
//!   顶点变换到世界空间。
//! - [`LightExtractionMode::LegacySingleMesh`]：兼容早期行为。只使用遍历中最后一个
//!   单图元 mesh instance，多图元的 mesh 被整体跳过，不检查自发光，也不应用 instance 变换，
//!   所以结果位于物体空间。只在需要和旧结果逐位对比时使用。

use slotmap::SecondaryMap;

use crate::{
    components::mesh::Primitive,
    guid_new_type::MaterialHandle,
    light::tri_light::TriLight,
    scene_manager::SceneManager,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightExtractionMode {
    #[default]
    Accumulate,
    LegacySingleMesh,
}

/// 光源提取失败属于配置错误，初始化应当直接中止
#[derive(Debug, thiserror::Error)]
pub enum LightExtractionError {
    #[error("primitive {primitive} of mesh `{mesh}` has {index_count} indices, which is not a multiple of 3")]
    IndexCountMismatch {
        mesh: String,
        primitive: usize,
        index_count: usize,
    },

    #[error("primitive {primitive} of mesh `{mesh}` references vertex {index}, but it only has {vertex_count} vertices")]
    IndexOutOfRange {
        mesh: String,
        primitive: usize,
        index: u32,
        vertex_count: usize,
    },

    #[error("mesh `{0}` has no primitives")]
    EmptyMesh(String),

    #[error("instance `{0}` references a mesh that does not exist")]
    DanglingMesh(String),

    #[error("primitive {primitive} of mesh `{mesh}` references a material that does not exist")]
    DanglingMaterial { mesh: String, primitive: usize },
}

/// 提取结果，记录了它对应的场景几何版本
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LightSet {
    lights: Vec<TriLight>,
    geometry_revision: u64,
}
// getter
impl LightSet {
    #[inline]
    pub fn lights(&self) -> &[TriLight] {
        &self.lights
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lights.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    #[inline]
    pub fn geometry_revision(&self) -> u64 {
        self.geometry_revision
    }

    /// 场景几何在提取之后被修改过
    #[inline]
    pub fn is_stale(&self, scene: &SceneManager) -> bool {
        self.geometry_revision != scene.geometry_revision()
    }

    /// 紧密排列的 GPU 数据
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.lights)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EmissiveLightExtractor {
    mode: LightExtractionMode,
}
// new & init
impl EmissiveLightExtractor {
    pub fn new(mode: LightExtractionMode) -> Self {
        Self { mode }
    }

    #[inline]
    pub fn mode(&self) -> LightExtractionMode {
        self.mode
    }
}
// tools
impl EmissiveLightExtractor {
    pub fn extract(&self, scene: &SceneManager) -> Result<LightSet, LightExtractionError> {
        let _span = restir_crate_tools::profile_span!("EmissiveLightExtractor::extract");

        let material_indices = scene.material_indices();

        let lights = match self.mode {
            LightExtractionMode::Accumulate => Self::extract_accumulate(scene, &material_indices)?,
            LightExtractionMode::LegacySingleMesh => Self::extract_legacy(scene, &material_indices)?,
        };

        log::info!("extracted {} emissive triangles ({:?})", lights.len(), self.mode);
        Ok(LightSet {
            lights,
            geometry_revision: scene.geometry_revision(),
        })
    }

    fn extract_accumulate(
        scene: &SceneManager,
        material_indices: &SecondaryMap<MaterialHandle, u32>,
    ) -> Result<Vec<TriLight>, LightExtractionError> {
        let mut lights = Vec::new();
        for (_, instance) in scene.instances() {
            let mesh = scene
                .get_mesh(instance.mesh)
                .ok_or_else(|| LightExtractionError::DanglingMesh(instance.name.clone()))?;

            for (primitive_idx, primitive) in mesh.primitives.iter().enumerate() {
                let dangling = || LightExtractionError::DanglingMaterial {
                    mesh: mesh.name.clone(),
                    primitive: primitive_idx,
                };
                let material = scene.get_material(primitive.material).ok_or_else(dangling)?;
                if !material.is_emissive() {
                    continue;
                }
                let material_index = material_indices.get(primitive.material).copied().ok_or_else(dangling)?;

                Self::append_triangles(
                    &mut lights,
                    &mesh.name,
                    primitive_idx,
                    primitive,
                    material_index,
                    Some(&instance.transform),
                )?;
            }
        }
        Ok(lights)
    }

    fn extract_legacy(
        scene: &SceneManager,
        material_indices: &SecondaryMap<MaterialHandle, u32>,
    ) -> Result<Vec<TriLight>, LightExtractionError> {
        let mut selected = None;
        for (_, instance) in scene.instances() {
            let mesh = scene
                .get_mesh(instance.mesh)
                .ok_or_else(|| LightExtractionError::DanglingMesh(instance.name.clone()))?;
            log::debug!("mesh `{}` has {} primitives", mesh.name, mesh.primitives.len());

            match mesh.primitives.len() {
                0 => return Err(LightExtractionError::EmptyMesh(mesh.name.clone())),
                1 => selected = Some((mesh, &mesh.primitives[0])),
                _ => continue,
            }
        }

        let Some((mesh, primitive)) = selected else {
            log::warn!("no single-primitive mesh instance in scene, light set is empty");
            return Ok(Vec::new());
        };
        let material_index =
            material_indices
                .get(primitive.material)
                .copied()
                .ok_or_else(|| LightExtractionError::DanglingMaterial {
                    mesh: mesh.name.clone(),
                    primitive: 0,
                })?;

        let mut lights = Vec::with_capacity(primitive.triangle_count());
        Self::append_triangles(&mut lights, &mesh.name, 0, primitive, material_index, None)?;
        Ok(lights)
    }

    /// 每 3 个索引构成一个三角形
    fn append_triangles(
        lights: &mut Vec<TriLight>,
        mesh_name: &str,
        primitive_idx: usize,
        primitive: &Primitive,
        material_index: u32,
        transform: Option<&glam::Mat4>,
    ) -> Result<(), LightExtractionError> {
        if primitive.indices.len() % 3 != 0 {
            return Err(LightExtractionError::IndexCountMismatch {
                mesh: mesh_name.to_string(),
                primitive: primitive_idx,
                index_count: primitive.indices.len(),
            });
        }

        let position = |index: u32| -> Result<glam::Vec3, LightExtractionError> {
            let vertex = primitive.vertices.get(index as usize).ok_or_else(|| LightExtractionError::IndexOutOfRange {
                mesh: mesh_name.to_string(),
                primitive: primitive_idx,
                index,
                vertex_count: primitive.vertices.len(),
            })?;
            Ok(match transform {
                Some(transform) => transform.transform_point3(vertex.position),
                None => vertex.position,
            })
        };

        lights.reserve(primitive.triangle_count());
        for tri in primitive.indices.chunks_exact(3) {
            lights.push(TriLight::new(position(tri[0])?, position(tri[1])?, position(tri[2])?, material_index));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        components::{
            instance::Instance,
            material::Material,
            mesh::{Mesh, Vertex},
        },
        guid_new_type::MeshHandle,
    };

    fn emissive() -> Material {
        Material {
            name: "light".to_string(),
            emissive: glam::vec4(10.0, 10.0, 10.0, 0.0),
            ..Default::default()
        }
    }

    /// xy 平面上的单位正方形，两个三角形
    fn quad_primitive(material: MaterialHandle) -> Primitive {
        Primitive {
            vertices: [glam::vec3(0.0, 0.0, 0.0), glam::vec3(1.0, 0.0, 0.0), glam::vec3(1.0, 1.0, 0.0), glam::vec3(0.0, 1.0, 0.0)]
                .into_iter()
                .map(Vertex::from_position)
                .collect(),
            indices: vec![0, 1, 2, 0, 2, 3],
            material,
        }
    }

    fn add_instance(scene: &mut SceneManager, name: &str, primitives: Vec<Primitive>, transform: glam::Mat4) -> MeshHandle {
        let mesh = scene.register_mesh(Mesh {
            name: name.to_string(),
            primitives,
        });
        scene.register_instance(Instance {
            name: name.to_string(),
            mesh,
            transform,
        });
        mesh
    }

    #[test]
    fn test_one_record_per_triangle() {
        let mut scene = SceneManager::new();
        let mat = scene.register_mat(emissive());
        add_instance(&mut scene, "quad", vec![quad_primitive(mat)], glam::Mat4::IDENTITY);

        let set = EmissiveLightExtractor::default().extract(&scene).unwrap();
        assert_eq!(set.len(), 2);
        for light in set.lights() {
            let (p1, p2, p3) = (light.p1.truncate(), light.p2.truncate(), light.p3.truncate());
            assert_eq!(light.normal_area, (p2 - p1).cross(p3 - p1).length());
            assert_eq!(light.normal_area, 1.0);
            assert_eq!(light.material_index, 0);
        }
        assert_eq!(set.as_bytes().len(), 2 * TriLight::GPU_SIZE);
    }

    #[test]
    fn test_accumulate_applies_world_transform_and_skips_non_emissive() {
        let mut scene = SceneManager::new();
        let diffuse = scene.register_mat(Material::default());
        let light_mat = scene.register_mat(emissive());
        let transform = glam::Mat4::from_translation(glam::vec3(0.0, 5.0, 0.0)) * glam::Mat4::from_scale(glam::Vec3::splat(2.0));
        add_instance(
            &mut scene,
            "lamp",
            vec![quad_primitive(diffuse), quad_primitive(light_mat)],
            transform,
        );

        let set = EmissiveLightExtractor::new(LightExtractionMode::Accumulate).extract(&scene).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.lights()[0].p1, glam::vec4(0.0, 5.0, 0.0, 1.0));
        assert_eq!(set.lights()[0].p2, glam::vec4(2.0, 5.0, 0.0, 1.0));
        // 缩放 2 倍后面积变为 4 倍
        assert_eq!(set.lights()[0].normal_area, 4.0);
        assert!(set.lights().iter().all(|light| light.material_index == 1));
    }

    #[test]
    fn test_accumulate_collects_all_instances() {
        let mut scene = SceneManager::new();
        let mat = scene.register_mat(emissive());
        add_instance(&mut scene, "a", vec![quad_primitive(mat)], glam::Mat4::IDENTITY);
        add_instance(&mut scene, "b", vec![quad_primitive(mat), quad_primitive(mat)], glam::Mat4::IDENTITY);

        let set = EmissiveLightExtractor::new(LightExtractionMode::Accumulate).extract(&scene).unwrap();
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn test_legacy_uses_last_single_primitive_instance_untransformed() {
        let mut scene = SceneManager::new();
        let mat = scene.register_mat(Material::default());
        add_instance(&mut scene, "first", vec![quad_primitive(mat)], glam::Mat4::IDENTITY);
        add_instance(&mut scene, "multi", vec![quad_primitive(mat), quad_primitive(mat)], glam::Mat4::IDENTITY);
        let mut last = quad_primitive(mat);
        last.indices.truncate(3);
        add_instance(
            &mut scene,
            "last",
            vec![last],
            glam::Mat4::from_translation(glam::vec3(100.0, 0.0, 0.0)),
        );

        let set = EmissiveLightExtractor::new(LightExtractionMode::LegacySingleMesh).extract(&scene).unwrap();
        assert_eq!(set.len(), 1);
        // 不应用 instance 变换
        assert_eq!(set.lights()[0].p2, glam::vec4(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn test_legacy_rejects_mesh_without_primitives() {
        let mut scene = SceneManager::new();
        add_instance(&mut scene, "empty", Vec::new(), glam::Mat4::IDENTITY);

        let result = EmissiveLightExtractor::new(LightExtractionMode::LegacySingleMesh).extract(&scene);
        assert!(matches!(result, Err(LightExtractionError::EmptyMesh(name)) if name == "empty"));
    }

    #[test]
    fn test_index_count_not_multiple_of_three() {
        let mut scene = SceneManager::new();
        let mat = scene.register_mat(emissive());
        let mut primitive = quad_primitive(mat);
        primitive.indices.push(0);
        add_instance(&mut scene, "broken", vec![primitive], glam::Mat4::IDENTITY);

        let result = EmissiveLightExtractor::default().extract(&scene);
        assert!(matches!(result, Err(LightExtractionError::IndexCountMismatch { index_count: 7, .. })));
    }

    #[test]
    fn test_index_out_of_range() {
        let mut scene = SceneManager::new();
        let mat = scene.register_mat(emissive());
        let mut primitive = quad_primitive(mat);
        primitive.indices[5] = 9;
        add_instance(&mut scene, "broken", vec![primitive], glam::Mat4::IDENTITY);

        let result = EmissiveLightExtractor::default().extract(&scene);
        assert!(matches!(result, Err(LightExtractionError::IndexOutOfRange { index: 9, vertex_count: 4, .. })));
    }

    #[test]
    fn test_light_set_becomes_stale_after_geometry_change() {
        let mut scene = SceneManager::new();
        let mat = scene.register_mat(emissive());
        let mesh = add_instance(&mut scene, "quad", vec![quad_primitive(mat)], glam::Mat4::IDENTITY);

        let set = EmissiveLightExtractor::default().extract(&scene).unwrap();
        assert!(!set.is_stale(&scene));
        scene.update_mesh(mesh, |mesh| mesh.primitives[0].indices.truncate(3));
        assert!(set.is_stale(&scene));
    }
}
