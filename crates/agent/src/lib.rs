//! Aurora agent: embeds the monitor in a standalone process and serves its
//! HTTP surface.

pub mod api;
pub mod config;
