pub mod buffer;
pub mod handles;
pub mod image;
pub mod resource_manager;
