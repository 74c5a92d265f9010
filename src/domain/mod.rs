//! Domain layer

pub mod call;
pub mod cause;
pub mod shared;
