//! Error type shared by the map core

use thiserror::Error;

use crate::map::overlay::OverlayKind;
use crate::map::source::SourceKind;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("io {0}")]
    Io(#[from] std::io::Error),
    #[error("image decode {0}")]
    Image(#[from] image::ImageError),
    #[error("xml parse {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("http transport {0}")]
    Transport(String),
    #[error("download protocol unavailable")]
    ProtocolUnavailable,
    #[error("unknown {kind:?} source {name:?}")]
    UnknownSource { kind: SourceKind, name: String },
    #[error("overlay kind {actual:?} does not support {op}")]
    WrongKind {
        op: &'static str,
        actual: OverlayKind,
    },
    #[error("stale handle")]
    StaleHandle,
    #[error("zoom level {0} is too high for the scale bar")]
    ScaleZoom(i32),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, MapError>;
