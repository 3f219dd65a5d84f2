pub mod assets;
pub mod pipe;

pub use assets::*;
