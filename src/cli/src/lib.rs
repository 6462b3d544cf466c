//! Airlift CLI - disconnected-mirror imageset tool.

pub mod commands;
