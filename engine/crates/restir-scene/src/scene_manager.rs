use slotmap::{SecondaryMap, SlotMap};

use crate::{
    components::{instance::Instance, material::Material, mesh::Mesh},
    guid_new_type::{InstanceHandle, MaterialHandle, MeshHandle},
};

/// 在 CPU 侧管理场景数据
///
/// 所有会影响几何的修改都会递增 `geometry_revision`，
/// 由此判断已经提取的光源数据是否过期。
#[derive(Default)]
pub struct SceneManager {
    all_mats: SlotMap<MaterialHandle, Material>,
    all_instances: SlotMap<InstanceHandle, Instance>,
    all_meshes: SlotMap<MeshHandle, Mesh>,

    geometry_revision: u64,
}
// new & init
impl SceneManager {
    pub fn new() -> Self {
        Self::default()
    }
}
// getter
impl SceneManager {
    #[inline]
    pub fn mat_map(&self) -> &SlotMap<MaterialHandle, Material> {
        &self.all_mats
    }
    #[inline]
    pub fn instance_map(&self) -> &SlotMap<InstanceHandle, Instance> {
        &self.all_instances
    }
    #[inline]
    pub fn mesh_map(&self) -> &SlotMap<MeshHandle, Mesh> {
        &self.all_meshes
    }
    #[inline]
    pub fn geometry_revision(&self) -> u64 {
        self.geometry_revision
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.all_instances.is_empty() && self.all_meshes.is_empty() && self.all_mats.is_empty()
    }

    /// instance 的遍历顺序即 SlotMap 的顺序
    #[inline]
    pub fn instances(&self) -> impl Iterator<Item = (InstanceHandle, &Instance)> {
        self.all_instances.iter()
    }

    /// 每个材质在 GPU 材质数组中的下标，即材质的遍历序号
    pub fn material_indices(&self) -> SecondaryMap<MaterialHandle, u32> {
        self.all_mats.keys().enumerate().map(|(idx, handle)| (handle, idx as u32)).collect()
    }
}
// tools
impl SceneManager {
    #[inline]
    pub fn get_instance(&self, handle: InstanceHandle) -> Option<&Instance> {
        self.all_instances.get(handle)
    }

    #[inline]
    pub fn get_mesh(&self, handle: MeshHandle) -> Option<&Mesh> {
        self.all_meshes.get(handle)
    }

    #[inline]
    pub fn get_material(&self, handle: MaterialHandle) -> Option<&Material> {
        self.all_mats.get(handle)
    }

    /// 向场景中添加材质
    pub fn register_mat(&mut self, mat: Material) -> MaterialHandle {
        self.bump_revision();
        self.all_mats.insert(mat)
    }

    /// 向场景中添加 mesh
    pub fn register_mesh(&mut self, mesh: Mesh) -> MeshHandle {
        self.bump_revision();
        self.all_meshes.insert(mesh)
    }

    /// 向场景中添加 instance
    pub fn register_instance(&mut self, instance: Instance) -> InstanceHandle {
        self.bump_revision();
        self.all_instances.insert(instance)
    }

    pub fn remove_instance(&mut self, handle: InstanceHandle) -> Option<Instance> {
        let removed = self.all_instances.remove(handle);
        if removed.is_some() {
            self.bump_revision();
        }
        removed
    }

    /// 修改 instance 的变换，返回 instance 是否存在
    pub fn set_instance_transform(&mut self, handle: InstanceHandle, transform: glam::Mat4) -> bool {
        let Some(instance) = self.all_instances.get_mut(handle) else {
            return false;
        };
        instance.transform = transform;
        self.bump_revision();
        true
    }

    /// 修改 mesh 的几何数据
    pub fn update_mesh(&mut self, handle: MeshHandle, f: impl FnOnce(&mut Mesh)) -> bool {
        let Some(mesh) = self.all_meshes.get_mut(handle) else {
            return false;
        };
        f(mesh);
        self.bump_revision();
        true
    }

    /// 自发光的变化会改变光源集合，同样视为几何变化
    pub fn set_material_emissive(&mut self, handle: MaterialHandle, emissive: glam::Vec4) -> bool {
        let Some(mat) = self.all_mats.get_mut(handle) else {
            return false;
        };
        mat.emissive = emissive;
        self.bump_revision();
        true
    }

    #[inline]
    fn bump_revision(&mut self) {
        self.geometry_revision = self.geometry_revision.wrapping_add(1);
    }
}
// destroy
impl SceneManager {
    pub fn destroy_mut(&mut self) {
        self.all_mats.clear();
        self.all_instances.clear();
        self.all_meshes.clear();
        self.bump_revision();
        log::info!("SceneManager cleared.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::mesh::{Primitive, Vertex};

    #[test]
    fn test_mutations_bump_revision() {
        let mut scene = SceneManager::new();
        let mat = scene.register_mat(Material::default());
        let mesh = scene.register_mesh(Mesh {
            name: "tri".to_string(),
            primitives: vec![Primitive {
                vertices: vec![Vertex::default(); 3],
                indices: vec![0, 1, 2],
                material: mat,
            }],
        });
        let instance = scene.register_instance(Instance {
            name: "tri".to_string(),
            mesh,
            transform: glam::Mat4::IDENTITY,
        });

        let before = scene.geometry_revision();
        assert!(scene.set_instance_transform(instance, glam::Mat4::from_translation(glam::Vec3::X)));
        assert!(scene.geometry_revision() > before);

        let before = scene.geometry_revision();
        assert!(!scene.set_instance_transform(InstanceHandle::default(), glam::Mat4::IDENTITY));
        assert_eq!(scene.geometry_revision(), before);
    }

    #[test]
    fn test_material_indices_follow_registration_order() {
        let mut scene = SceneManager::new();
        let a = scene.register_mat(Material::default());
        let b = scene.register_mat(Material::default());
        let indices = scene.material_indices();
        assert_eq!(indices.get(a), Some(&0));
        assert_eq!(indices.get(b), Some(&1));
        assert_eq!(indices.get(MaterialHandle::default()), None);
    }
}
