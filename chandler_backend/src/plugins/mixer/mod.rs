//! Frame rendering: the compositor that stacks group layers onto universes,
//! and the loop that runs it.

pub mod compositor;
pub mod render_loop;

pub use compositor::render_frame;
pub use render_loop::{PushCallback, RenderLoop};
