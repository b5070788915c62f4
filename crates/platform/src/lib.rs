//! Platform layer: winit window, Vulkan surface, keyboard state and the
//! resize event channel.

mod input;
mod resize;
mod window;

pub use input::{InputState, KeyCode};
pub use resize::{ResizeEvents, ResizeSender};
pub use window::{Surface, Window};

pub use winit::event::WindowEvent;
pub use winit::event_loop::{ActiveEventLoop, EventLoop};
