pub mod init_log;
pub mod profiling;

pub use tracy_client;
