pub mod frames;
pub mod payload;
pub mod types;
pub mod validation;

pub use frames::*;
pub use payload::*;
pub use types::*;
pub use validation::*;
