pub mod config;
pub mod error;
pub mod frame_counter;
pub mod frame_lifecycle;
pub mod frame_pipeline;
pub mod inputs;
pub mod light_buffer;
pub mod output_registry;
pub mod pipeline_settings;
pub mod renderer;
pub mod stages;
