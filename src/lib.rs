mod app;
pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod logging;
pub mod pipeline;
pub mod shader;
pub mod sync;

pub use app::WrappedApp;
pub use config::AppConfig;
