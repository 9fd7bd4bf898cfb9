/// CPU 侧的材质数据
#[derive(Clone, Debug, Default)]
pub struct Material {
    pub name: String,
    pub base_color: glam::Vec4,
    /// rgb 为自发光强度，a 未使用
    pub emissive: glam::Vec4,
    pub metallic: f32,
    pub roughness: f32,
}
impl Material {
    /// 任意一个颜色通道大于 0 即视为自发光
    #[inline]
    pub fn is_emissive(&self) -> bool {
        self.emissive.truncate().max_element() > 0.0
    }
}
