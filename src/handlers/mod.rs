pub mod assets;

pub use assets::*;
