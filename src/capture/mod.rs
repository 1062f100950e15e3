//! Frame producers
//!
//! This module provides the frame model, the encoder and PCM source traits,
//! and the producer threads that move encoder output into the ring buffer.

pub mod audio;
pub mod clock;
pub mod frame;
pub mod h264;
pub mod orientation;
pub mod synthetic;
pub mod traits;
pub mod video;

pub use audio::AudioProducer;
pub use clock::{MediaClock, PtsAccumulator};
pub use frame::{AudioCodec, Frame, FrameFlags, MediaParams, TrackFormat, TrackKind, VideoCodec};
pub use orientation::{compute_rotation, LensFacing, OrientationState, Rotation};
pub use traits::{
    AudioEncoder, CaptureError, CaptureResult, Encoder, EncoderOutput, PcmFormat, PcmSource,
    SourceFactory,
};
pub use video::VideoProducer;
