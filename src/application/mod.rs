//! Application services: render orchestration and the collaborator seams it
//! depends on.

pub mod audit;
pub mod error;
pub mod render;
pub mod repos;
