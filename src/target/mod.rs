//! The store that change operations are applied to.

pub mod origin;
pub mod store;

pub use origin::setup_origin;
pub use store::{PostgresTarget, TargetStore};
