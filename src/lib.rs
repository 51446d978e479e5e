pub mod gpu;
pub mod utils;

pub use gpu::*;
pub use utils::{Handle, PerFrame, Pool};
