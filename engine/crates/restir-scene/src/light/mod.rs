pub mod extractor;
pub mod tri_light;
