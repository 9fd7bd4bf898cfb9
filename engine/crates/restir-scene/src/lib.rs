pub mod components;
pub mod guid_new_type;
pub mod light;
pub mod scene_manager;
