use crate::guid_new_type::MeshHandle;

#[derive(Clone, Debug)]
pub struct Instance {
    pub name: String,
    pub mesh: MeshHandle,
    /// 物体空间到世界空间
    pub transform: glam::Mat4,
}
