pub mod create;
pub mod extract;
pub mod info;

pub use create::*;
pub use extract::*;
pub use info::*;
