//! Noise Stream
//!
//! Keeps a fixed set of HLS noise channels alive. Each channel is an external
//! encoder process writing a rolling playlist and segments to disk; a
//! supervisor per channel restarts it with exponential backoff when it exits
//! or its playlist stops advancing. An HTTP API serves the files and exposes
//! control, status and health.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              noise-stream                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────┐ ← POST /stream/start, /stream/:id/stop            │
//! │  │  HTTP API Server │ ← GET  /health, /status, /stream/:id              │
//! │  │  (axum)          │ ← GET  /hls/:id/stream.m3u8, segmentNNN.ts ◀──┐   │
//! │  └────────┬─────────┘                                               │   │
//! │           │ delegates                                               │   │
//! │           ▼                                                         │   │
//! │  ┌──────────────────┐  one per channel  ┌──────────────────────┐    │   │
//! │  │  Stream Registry │──────────────────▶│  Channel Supervisor  │    │   │
//! │  │  (fixed set)     │                   │  (task + watch)      │    │   │
//! │  └──────────────────┘                   └──────────┬───────────┘    │   │
//! │                                                    │ spawns/reaps   │   │
//! │                                                    ▼                │   │
//! │                                         ┌──────────────────────┐    │   │
//! │                                         │  Encoder Process     │    │   │
//! │                                         │  (ffmpeg anoisesrc)  │    │   │
//! │                                         └──────────┬───────────┘    │   │
//! │                                                    │ writes         │   │
//! │                                                    ▼                │   │
//! │                                         ┌──────────────────────┐    │   │
//! │                                         │  Segment Store       │────┘   │
//! │                                         │  <hls_dir>/<id>/     │        │
//! │                                         └──────────────────────┘        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod backoff;
pub mod channel;
pub mod clock;
pub mod config;
pub mod encoder;
pub mod error;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod segment;
pub mod supervisor;

pub use error::{Error, Result};
