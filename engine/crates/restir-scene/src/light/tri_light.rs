/// 一个自发光三角形，和积分器 shader 中的 `TriLight` 逐字节对应
///
/// `normal_area` 存的是两条边叉积的模长，也就是**未归一化的两倍面积**。
/// 生产端和 shader 端都按这个含义使用，需要真实面积时乘以 0.5。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TriLight {
    /// 齐次坐标，w = 1
    pub p1: glam::Vec4,
    pub p2: glam::Vec4,
    pub p3: glam::Vec4,
    pub material_index: u32,
    pub normal_area: f32,
    pub _padding: [u32; 2],
}
impl TriLight {
    /// GPU 中每条记录的字节数
    pub const GPU_SIZE: usize = size_of::<Self>();

    pub fn new(p1: glam::Vec3, p2: glam::Vec3, p3: glam::Vec3, material_index: u32) -> Self {
        Self {
            p1: p1.extend(1.0),
            p2: p2.extend(1.0),
            p3: p3.extend(1.0),
            material_index,
            normal_area: Self::doubled_area(p1, p2, p3),
            _padding: [0; 2],
        }
    }

    /// |cross(p2 - p1, p3 - p1)|
    #[inline]
    pub fn doubled_area(p1: glam::Vec3, p2: glam::Vec3, p3: glam::Vec3) -> f32 {
        (p2 - p1).cross(p3 - p1).length()
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.normal_area * 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_layout() {
        assert_eq!(TriLight::GPU_SIZE, 64);
        assert_eq!(std::mem::offset_of!(TriLight, material_index), 48);
        assert_eq!(std::mem::offset_of!(TriLight, normal_area), 52);
    }

    #[test]
    fn test_normal_area_is_doubled_area() {
        let light = TriLight::new(glam::Vec3::ZERO, glam::Vec3::new(2.0, 0.0, 0.0), glam::Vec3::new(0.0, 3.0, 0.0), 7);
        assert_eq!(light.normal_area, 6.0);
        assert_eq!(light.area(), 3.0);
        assert_eq!(light.p3, glam::Vec4::new(0.0, 3.0, 0.0, 1.0));
    }
}
