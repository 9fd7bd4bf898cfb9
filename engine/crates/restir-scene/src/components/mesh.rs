use crate::guid_new_type::MaterialHandle;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: glam::Vec3,
    pub normal: glam::Vec3,
    pub uv: glam::Vec2,
}
impl Vertex {
    #[inline]
    pub fn from_position(position: glam::Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }
}

/// mesh 中的一个图元：一组顶点、三角形列表形式的索引，以及它使用的材质
#[derive(Clone, Debug)]
pub struct Primitive {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub material: MaterialHandle,
}
impl Primitive {
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Clone, Debug)]
pub struct Mesh {
    pub name: String,
    pub primitives: Vec<Primitive>,
}
