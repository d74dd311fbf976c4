//! Hold-to-talk speech transcription daemon.
//!
//! A global hotkey starts capturing microphone audio to a temp WAV file;
//! releasing it hands the file to a transcription worker subprocess over a
//! line-JSON protocol, and the final transcript lands on the clipboard.
//! The [`controller::Controller`] owns the job lifecycle; everything else is
//! a service it talks to over channels.

pub mod app;
pub mod audio;
pub mod broadcast;
pub mod clipboard;
pub mod config;
pub mod controller;
pub mod hotkey;
pub mod job;
pub mod messages;
pub mod protocol;
pub mod services;
pub mod worker;
