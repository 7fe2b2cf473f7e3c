//! Media I/O for a desktop player, built around one external
//! ffmpeg-compatible tool.
//!
//! Three pipelines share the tool and the [`process`] supervision layer:
//!
//! - [`decode`] shells out to the tool to turn unsupported containers
//!   into an in-memory, seekable PCM stream for playback.
//! - [`capture`] records the system audio output mix to a WAV file
//!   through a bounded queue between the device thread and the writer.
//! - [`recording`] coordinates a screen-capture process with the
//!   loopback pipeline and muxes both legs into one file on stop.

pub mod capture;
pub mod decode;
pub mod error;
pub mod process;
pub mod recording;
pub mod settings;

pub use capture::LoopbackCapture;
pub use decode::{decode_to_pcm, PcmAudioStream};
pub use error::MediaError;
pub use process::{resolve_tool_binary, ToolProcess, TOOL_NAME};
pub use recording::{CaptureRegion, RecordingFinished, RecordingStarted, ScreenRecorder};
pub use settings::RecorderSettings;
