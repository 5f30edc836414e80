use glam::Vec4;
use std::time::Instant;
use winit::keyboard::{KeyCode, PhysicalKey};

pub fn color_scalar(time: f64) -> f32 {
    (time.sin() / 2.0 + 0.5) as f32
}

// Inverse of the sRGB transfer function. Writing the result to an sRGB
// attachment stores the original value; alpha is untouched.
pub fn srgb_to_linear(color: Vec4) -> Vec4 {
    let channel = |v: f32| {
        if v <= 0.04045 {
            v / 12.92
        } else {
            ((v + 0.055) / 1.055).powf(2.4)
        }
    };
    Vec4::new(channel(color.x), channel(color.y), channel(color.z), color.w)
}

#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    start: Instant,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameState {
    pub time: f64,
    pub c: f32,
}

impl FrameState {
    pub fn at(time: f64) -> Self {
        Self {
            time,
            c: color_scalar(time),
        }
    }

    pub fn sample(clock: &FrameClock) -> Self {
        Self::at(clock.elapsed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Background,
    Foreground,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Draw {
    pub layer: Layer,
    pub color: Vec4,
}

// No depth test: the foreground must come last.
pub fn frame_draws(c: f32) -> [Draw; 2] {
    [
        Draw {
            layer: Layer::Background,
            color: Vec4::new(c / 1.5, c / 2.0, 0.0, 1.0),
        },
        Draw {
            layer: Layer::Foreground,
            color: Vec4::new(c, c, 0.0, 1.0),
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Running,
    Closing,
}

impl LoopState {
    pub fn handle_key(&mut self, key: PhysicalKey, pressed: bool) {
        if pressed && key == PhysicalKey::Code(KeyCode::Escape) {
            *self = LoopState::Closing;
        }
    }

    pub fn request_close(&mut self) {
        *self = LoopState::Closing;
    }

    pub fn is_closing(self) -> bool {
        self == LoopState::Closing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn color_scalar_samples() {
        assert!(approx(color_scalar(0.0), 0.5));
        assert!(approx(color_scalar(PI / 2.0), 1.0));
        assert!(approx(color_scalar(PI), 0.5));
        assert!(approx(color_scalar(3.0 * PI / 2.0), 0.0));
    }

    #[test]
    fn color_scalar_stays_in_unit_range() {
        for i in -2000..2000 {
            let c = color_scalar(i as f64 * 0.37);
            assert!((0.0..=1.0).contains(&c), "c({}) = {c}", i as f64 * 0.37);
        }
    }

    #[test]
    fn frame_state_derives_scalar_from_time() {
        let state = FrameState::at(PI / 2.0);
        assert_eq!(state.time, PI / 2.0);
        assert!(approx(state.c, 1.0));
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = FrameClock::new();
        let a = clock.elapsed();
        let b = clock.elapsed();
        assert!(a >= 0.0 && b >= a);
    }

    #[test]
    fn two_draws_background_first() {
        for i in 0..500 {
            let draws = frame_draws(FrameState::at(i as f64 * 0.1).c);
            assert_eq!(draws.len(), 2);
            assert_eq!(draws[0].layer, Layer::Background);
            assert_eq!(draws[1].layer, Layer::Foreground);
        }
    }

    #[test]
    fn draw_colors() {
        let [bg, fg] = frame_draws(0.6);
        assert!(bg.color.abs_diff_eq(Vec4::new(0.4, 0.3, 0.0, 1.0), 1e-6));
        assert!(fg.color.abs_diff_eq(Vec4::new(0.6, 0.6, 0.0, 1.0), 1e-6));
    }

    #[test]
    fn linearized_colors_encode_back() {
        let encode = |v: f32| {
            if v <= 0.0031308 {
                v * 12.92
            } else {
                1.055 * v.powf(1.0 / 2.4) - 0.055
            }
        };
        let clear = srgb_to_linear(Vec4::new(0.3, 0.3, 0.3, 1.0));
        assert!(clear.x < 0.1, "0.3 must be darkened before an sRGB write");
        assert!((encode(clear.x) - 0.3).abs() < 1e-5);
        assert_eq!(clear.w, 1.0);
        for draw in frame_draws(0.8) {
            let linear = srgb_to_linear(draw.color);
            for (l, v) in linear.to_array().iter().zip(draw.color.to_array()).take(3) {
                assert!((encode(*l) - v).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn escape_closes() {
        let mut state = LoopState::default();
        state.handle_key(PhysicalKey::Code(KeyCode::Escape), true);
        assert_eq!(state, LoopState::Closing);
    }

    #[test]
    fn other_keys_and_releases_keep_running() {
        let mut state = LoopState::Running;
        for key in [KeyCode::KeyQ, KeyCode::Space, KeyCode::Enter, KeyCode::F4] {
            state.handle_key(PhysicalKey::Code(key), true);
        }
        state.handle_key(PhysicalKey::Code(KeyCode::Escape), false);
        assert_eq!(state, LoopState::Running);
    }

    #[test]
    fn closing_is_terminal() {
        let mut state = LoopState::Running;
        state.request_close();
        state.handle_key(PhysicalKey::Code(KeyCode::KeyA), true);
        state.handle_key(PhysicalKey::Code(KeyCode::Escape), false);
        assert!(state.is_closing());
    }
}
