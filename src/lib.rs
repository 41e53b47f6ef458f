//! imagine-batch
//!
//! Batch image-to-video automation: a queue of source images is walked one
//! item at a time, each dispatched to a page driver that uploads the image
//! to a third-party generation site, waits for the render, requests an
//! upscale pass and downloads the result. A watchdog restarts stalled items
//! and the job state is persisted so progress survives restarts.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
