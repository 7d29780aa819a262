//! Per-room signaling hubs for peer-to-peer session setup.

pub mod config;
pub mod signaling;
