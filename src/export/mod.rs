//! Clip export module
//!
//! This module turns a buffer snapshot into an MP4 file:
//! - ExportTrigger debounces requests and takes the snapshot
//! - ContainerMuxer orders frames and names the artifact
//! - Mp4Writer emits the container

pub mod atoms;
pub mod mp4;
pub mod muxer;
pub mod trigger;
pub mod types;

pub use mp4::{Mp4Writer, WriterState};
pub use muxer::{artifact_name, sort_and_rebase, ContainerMuxer};
pub use trigger::{ExportOutcome, ExportTrigger};
pub use types::{
    ExportError, ExportRequest, ExportStage, MuxError, MuxResult, CONTAINER_EXTENSION,
    CONTAINER_MEDIA_TYPE,
};
