//! Outpost daemon library - exposes modules for testing.

pub mod controller;
pub mod downloader;
pub mod events;
pub mod runtime;
