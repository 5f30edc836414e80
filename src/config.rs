// Drawn first; peeks out around TRIANGLE as an outline.
pub const TRIANGLE_BG: [f32; 9] = [
    0.0, 0.32, 0.0, //
    -0.32, -0.315, 0.0, //
    0.32, -0.315, 0.0,
];

pub const TRIANGLE: [f32; 9] = [
    0.0, 0.3, 0.0, //
    -0.3, -0.3, 0.0, //
    0.3, -0.3, 0.0,
];

#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            title: "test-crossplatform".to_owned(),
            resizable: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub clear_color: [f32; 4],
    pub max_in_flight: usize,
    pub validation: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.3, 0.3, 0.3, 1.0],
            max_in_flight: 2,
            validation: cfg!(debug_assertions),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SceneConfig {
    pub background: Vec<f32>,
    pub foreground: Vec<f32>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            background: TRIANGLE_BG.to_vec(),
            foreground: TRIANGLE.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub window: WindowConfig,
    pub render: RenderConfig,
    pub scene: SceneConfig,
}
