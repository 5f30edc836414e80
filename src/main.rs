use std::process::ExitCode;
use triangle::{
    logging::{init_logging, LoggingConfig},
    AppConfig, WrappedApp,
};
use winit::event_loop::{ControlFlow, EventLoop};

fn main() -> anyhow::Result<ExitCode> {
    init_logging(LoggingConfig::default());
    log::info!(
        "OS: {}, Architecture: {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);
    let mut app = WrappedApp::new(AppConfig::default());
    event_loop.run_app(&mut app)?;
    // Already logged when the loop stopped.
    match app.take_error() {
        Some(_) => Ok(ExitCode::FAILURE),
        None => Ok(ExitCode::SUCCESS),
    }
}
