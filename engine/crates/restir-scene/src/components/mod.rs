pub mod instance;
pub mod material;
pub mod mesh;
