//! Client for a remote stem-separation service: health monitoring, job
//! submission and polling, per-stem playback and batch export.
pub mod api;
pub mod error;
pub mod export;
pub mod monitor;
pub mod mpv;
pub mod playback;
pub mod poller;
pub mod submit;
