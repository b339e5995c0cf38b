//! Game simulation modules

pub mod broadcast;
pub mod map;
pub mod r#match;
pub mod registry;
pub mod sprite;

pub use r#match::JoinError;
pub use registry::MatchRegistry;
