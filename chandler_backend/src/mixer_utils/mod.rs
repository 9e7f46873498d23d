pub mod blend_mode;
pub mod dynamic_blends;
pub mod fade_canvas;
pub mod state;
