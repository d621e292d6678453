//! Two-window presenter core.
//!
//! A controller window and a presenter window show the same paged document
//! and keep their page position in sync over a named [`sync::SyncBus`]
//! channel. Each window rasterizes pages through its own
//! [`cache::PageRenderCache`].

pub mod cache;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod engine;
pub mod loader;
pub mod payload;
pub mod present;
pub mod sync;
pub mod typst_engine;
pub mod window;
