pub mod cipher;
pub mod frames;
pub mod keys;

pub use cipher::*;
pub use frames::*;
pub use keys::*;
