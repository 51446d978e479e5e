pub mod handle;
pub mod per_frame;

pub use handle::{Handle, Pool};
pub use per_frame::PerFrame;
