//! Rewind common – data model and shared logic for the session
//! recorder/replayer.

pub mod config;
pub mod images;
pub mod naming;
pub mod protocol;
pub mod recording;
pub mod tree;
