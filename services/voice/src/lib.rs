//! KappaTron Voice Library Crate
//!
//! Runtime for the voice client: device capture and playback, the
//! ElevenLabs connector, configuration, and the controller that drives a
//! [`kappatron_core::SessionManager`] with them. The `kappatron` binary is a
//! thin wrapper around this library.

pub mod agent;
pub mod audio;
pub mod config;
pub mod controller;
pub mod microphone;
pub mod playback;
