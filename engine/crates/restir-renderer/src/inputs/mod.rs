//! 积分器的静态输入：环境贴图和噪声纹理

pub mod environment_map;
pub mod noise_source;
