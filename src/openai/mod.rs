//! Client-facing chat completions schema.

pub mod api;
