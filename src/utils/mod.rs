//! Small shared utilities.

pub mod hash;
pub mod ident;
pub mod path;
