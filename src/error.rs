use ash::vk;
use thiserror::Error;

use crate::shader::Stage;

#[derive(Debug, Error)]
#[error("failed to compile {stage} shader:\n{log}")]
pub struct CompileError {
    pub stage: Stage,
    pub log: String,
}

#[derive(Debug, Error)]
#[error("failed to link shader program:\n{log}")]
pub struct LinkError {
    pub log: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("geometry has no points")]
    Empty,
    #[error("geometry has {len} floats, expected a multiple of 3")]
    Ragged { len: usize },
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to create window: {0}")]
    Window(#[from] winit::error::OsError),
    #[error("window handle unavailable: {0}")]
    Handle(#[from] winit::raw_window_handle::HandleError),
    #[error("vulkan: failed to {context}: {result}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },
    #[error("no physical device supports graphics, presentation and swapchains")]
    NoSuitableDevice,
    #[error("no memory type matches {0:?}")]
    NoMemoryType(vk::MemoryPropertyFlags),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

impl InitError {
    pub fn vk(context: &'static str) -> impl FnOnce(vk::Result) -> InitError {
        move |result| InitError::Vulkan { context, result }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("vulkan: failed to {context}: {result}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },
    #[error("failed to recreate swapchain: {0}")]
    Swapchain(#[from] InitError),
}

impl FrameError {
    pub fn vk(context: &'static str) -> impl FnOnce(vk::Result) -> FrameError {
        move |result| FrameError::Vulkan { context, result }
    }
}
