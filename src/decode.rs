use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MediaError;
use crate::process::{SpawnOptions, ToolProcess};

/// Fixed output format requested from the decoder: signed 16-bit
/// little-endian PCM, stereo, 44.1 kHz.
pub const PCM_SAMPLE_RATE_HZ: u32 = 44_100;
pub const PCM_CHANNEL_COUNT: u16 = 2;
pub const PCM_BITS_PER_SAMPLE: u16 = 16;
pub const PCM_BYTES_PER_SECOND: u64 =
    PCM_SAMPLE_RATE_HZ as u64 * PCM_CHANNEL_COUNT as u64 * (PCM_BITS_PER_SAMPLE as u64 / 8);

/// Budget for the decoder process to finish after its stdout closes. A
/// track that cannot be decoded within the budget yields a truncated
/// stream rather than an error; source tracks are finite files, not live
/// streams.
const DECODE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn decoder_args(media_path: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-i".to_string(),
        media_path.to_string_lossy().to_string(),
        "-f".to_string(),
        "s16le".to_string(),
        "-acodec".to_string(),
        "pcm_s16le".to_string(),
        "-ar".to_string(),
        PCM_SAMPLE_RATE_HZ.to_string(),
        "-ac".to_string(),
        PCM_CHANNEL_COUNT.to_string(),
        "-".to_string(),
    ]
}

/// An unsupported container decoded into a fixed-length, seekable PCM
/// buffer. The whole track is decoded up front; playback then reads from
/// memory with no further process involvement.
pub struct PcmAudioStream {
    source: PathBuf,
    buffer: Vec<u8>,
    position: u64,
}

impl PcmAudioStream {
    pub(crate) fn from_pcm_buffer(source: PathBuf, buffer: Vec<u8>) -> Self {
        Self {
            source,
            buffer,
            position: 0,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the read cursor, clamped to `[0, len]`.
    pub fn set_position(&mut self, position: u64) {
        self.position = position.min(self.len());
    }

    pub fn total_time(&self) -> Duration {
        Duration::from_secs_f64(self.len() as f64 / PCM_BYTES_PER_SECOND as f64)
    }

    pub fn current_time(&self) -> Duration {
        Duration::from_secs_f64(self.position as f64 / PCM_BYTES_PER_SECOND as f64)
    }

    pub fn set_current_time(&mut self, time: Duration) {
        self.set_position((time.as_secs_f64() * PCM_BYTES_PER_SECOND as f64) as u64);
    }

    /// Returns an error for a stream the decoder produced no bytes for, so
    /// playback can reject the track instead of feeding silence.
    pub fn ensure_playable(&self) -> Result<(), MediaError> {
        if self.is_empty() {
            return Err(MediaError::DecodeEmptyResult {
                path: self.source.clone(),
            });
        }
        Ok(())
    }
}

impl Read for PcmAudioStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = (self.len() - self.position) as usize;
        let count = buf.len().min(remaining);
        let start = self.position as usize;
        buf[..count].copy_from_slice(&self.buffer[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }
}

impl Seek for PcmAudioStream {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.len() as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of PCM stream",
            ));
        }
        self.set_position(target as u64);
        Ok(self.position)
    }
}

/// Decodes `media_path` by running the external decoder and draining its
/// stdout synchronously into memory.
///
/// A decoder that produces zero bytes yields an empty stream, not an
/// error; the caller treats that track as unplayable via
/// [`PcmAudioStream::ensure_playable`].
pub fn decode_to_pcm(binary: &Path, media_path: &Path) -> Result<PcmAudioStream, MediaError> {
    let args = decoder_args(media_path);
    let mut process = ToolProcess::spawn(
        binary,
        &args,
        SpawnOptions {
            capture_stdout: true,
            forward_stderr: true,
            ..SpawnOptions::default()
        },
    )?;

    let mut buffer = Vec::new();
    if let Some(mut stdout) = process.take_stdout() {
        if let Err(error) = stdout.read_to_end(&mut buffer) {
            tracing::warn!(
                media = %media_path.display(),
                "Decoder stdout ended early: {error}"
            );
        }
    }

    match process.wait_timeout(DECODE_WAIT_TIMEOUT) {
        Ok(Some(status)) => {
            tracing::debug!(
                media = %media_path.display(),
                decoded_bytes = buffer.len(),
                %status,
                "Decoder process finished"
            );
        }
        Ok(None) => {
            tracing::warn!(
                media = %media_path.display(),
                timeout_ms = DECODE_WAIT_TIMEOUT.as_millis() as u64,
                "Decoder did not exit within the wait budget, force-terminating"
            );
            process.force_kill();
        }
        Err(error) => {
            tracing::warn!(
                media = %media_path.display(),
                "Failed waiting for decoder process: {error}"
            );
            process.force_kill();
        }
    }

    if buffer.is_empty() {
        tracing::warn!(
            media = %media_path.display(),
            "Decoder produced no PCM data"
        );
    }

    Ok(PcmAudioStream::from_pcm_buffer(
        media_path.to_path_buf(),
        buffer,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(len: usize) -> PcmAudioStream {
        let buffer = (0..len).map(|value| value as u8).collect();
        PcmAudioStream::from_pcm_buffer(PathBuf::from("track.dat"), buffer)
    }

    #[test]
    fn read_never_exceeds_remaining_bytes() {
        let mut stream = stream_of(10);
        stream.set_position(7);

        let mut buf = [0u8; 8];
        let read = stream.read(&mut buf).unwrap();
        assert_eq!(read, 3);
        assert_eq!(&buf[..3], &[7, 8, 9]);
        assert_eq!(stream.position(), 10);

        let read = stream.read(&mut buf).unwrap();
        assert_eq!(read, 0);
    }

    #[test]
    fn position_advances_by_bytes_actually_read() {
        let mut stream = stream_of(100);
        let mut buf = [0u8; 32];

        let before = stream.position();
        let read = stream.read(&mut buf).unwrap();
        assert_eq!(stream.position(), before + read as u64);
    }

    #[test]
    fn set_position_clamps_to_length() {
        let mut stream = stream_of(16);
        stream.set_position(1_000);
        assert_eq!(stream.position(), 16);
    }

    #[test]
    fn seek_clamps_past_end_and_rejects_before_start() {
        let mut stream = stream_of(16);

        let position = stream.seek(SeekFrom::End(10)).unwrap();
        assert_eq!(position, 16);

        let position = stream.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(position, 4);

        assert!(stream.seek(SeekFrom::Current(-8)).is_err());
        assert_eq!(stream.position(), 4);
    }

    #[test]
    fn times_derive_from_the_fixed_byte_rate() {
        let mut stream = stream_of(PCM_BYTES_PER_SECOND as usize * 2);
        assert_eq!(stream.total_time(), Duration::from_secs(2));

        stream.set_current_time(Duration::from_secs(1));
        assert_eq!(stream.position(), PCM_BYTES_PER_SECOND);
        assert_eq!(stream.current_time(), Duration::from_secs(1));
    }

    #[test]
    fn empty_stream_is_reported_unplayable_not_fatal() {
        let stream = stream_of(0);
        assert!(stream.is_empty());
        assert_eq!(stream.len(), 0);
        assert!(matches!(
            stream.ensure_playable(),
            Err(MediaError::DecodeEmptyResult { .. })
        ));
    }

    #[test]
    fn decoder_arguments_request_raw_stereo_pcm_on_stdout() {
        let args = decoder_args(Path::new("song.m4a"));
        let joined = args.join(" ");
        assert!(joined.contains("-f s16le"));
        assert!(joined.contains("-acodec pcm_s16le"));
        assert!(joined.contains("-ar 44100"));
        assert!(joined.contains("-ac 2"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[cfg(unix)]
    #[test]
    fn empty_decoder_output_yields_zero_length_stream() {
        // A tool that writes nothing to stdout stands in for a decoder
        // fed a malformed input.
        let stream = decode_to_pcm(Path::new("true"), Path::new("broken.m4a")).unwrap();
        assert_eq!(stream.len(), 0);
        assert!(stream.ensure_playable().is_err());
    }
}
