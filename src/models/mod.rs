pub use errors::*;
pub use events::*;
pub use projections::*;

pub mod errors;
pub mod events;
pub mod projections;
