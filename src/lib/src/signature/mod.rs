pub mod canonical;
mod keys;
mod sign;

pub use keys::*;
pub use sign::*;
