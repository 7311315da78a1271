//! Companion Service Library Crate
//!
//! Concrete adapters for the companion core: configuration from the
//! environment, the ElevenLabs voice agent connector, the ffmpeg webcam, local
//! audio I/O, and the application toggle that runs capture and conversation
//! together. The `companion` binary is a thin wrapper around this library.

pub mod app;
pub mod audio;
pub mod audio_utils;
pub mod camera;
pub mod config;
pub mod elevenlabs;
