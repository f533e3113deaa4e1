//! Audio codec plumbing: Opus decode for inbound device frames, WAV/PCM
//! parsing and frame splitting for outbound synthesis files.

pub mod framer;
pub mod opus_codec;

pub use framer::{frame_audio_file, parse_wav};
pub use opus_codec::OpusAudioDecoder;
