//! Narrow resource layer consumed by the transfer scheduler

mod binding_map;
mod buffer;
mod texture;

pub use binding_map::{TextureBindingMap, TextureView};
pub use buffer::{Buffer, BufferId, BufferState};
pub use texture::{Image, Texture, TextureId, TextureState};
