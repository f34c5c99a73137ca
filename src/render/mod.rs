//! Fixed-size rendering worker pool.

mod pool;

pub use pool::{RenderError, RenderPool};
