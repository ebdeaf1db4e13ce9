//! Upstream chat completions schema.

pub mod api;
