pub mod basic;
pub mod commands;
pub mod device;
pub mod error;
pub mod gfx_context;
pub mod headless;
pub mod resources;
