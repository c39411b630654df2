//! Repository traits for update database operations.

pub mod json_data;
pub mod launches;
pub mod updates;

pub use json_data::JsonDataRepo;
pub use launches::LaunchRepo;
pub use updates::{InsertedUpdate, UpdateRepo};
