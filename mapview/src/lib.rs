//! Headless map widget core: tile grids, downloads, overlays and viewport control
//!
//! The host owns rendering. It feeds input and a clock into [`MapWidget`], drains
//! [`MapEvent`]s, and draws the tile quads and overlay geometry the widget exposes.

pub mod config;
pub mod error;
pub mod event;
pub mod map;

pub use config::MapConfig;
pub use error::{MapError, Result};
pub use event::{MapEvent, OverlayTarget};
pub use map::MapWidget;
