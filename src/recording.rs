use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::capture::LoopbackCapture;
use crate::error::MediaError;
use crate::process::{resolve_tool_binary, SpawnOptions, ToolProcess, TOOL_NAME};
use crate::settings::RecorderSettings;

mod merge;

use merge::MergePlan;

/// How long the screen-capture process gets to honor the quit keystroke
/// before it is force-terminated.
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Name of the temp working folder under the OS temp directory.
const TEMP_DIR_NAME: &str = "playcap_recording";

const VIDEO_CODEC: &str = "libx264";
const VIDEO_PRESET: &str = "ultrafast";
const PIXEL_FORMAT: &str = "yuv420p";

/// Screen rectangle to record, in physical pixels. Odd dimensions are
/// rounded up to the next even value before capture starts; the video
/// encoder rejects odd frame sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRegion {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Facts about a session reported back from a successful start.
#[derive(Debug, Clone)]
pub struct RecordingStarted {
    pub output_path: PathBuf,
    /// Actual capture dimensions after even-rounding.
    pub width: u32,
    pub height: u32,
    /// False when loopback capture could not start and the session runs
    /// video-only.
    pub audio_enabled: bool,
}

/// Outcome of a completed session.
#[derive(Debug, Clone)]
pub struct RecordingFinished {
    pub output_path: PathBuf,
    /// Size of the merged output file, or `None` when the merge produced
    /// no usable file. The temp captures are deleted in both cases.
    pub output_bytes: Option<u64>,
    /// True when the capture process ignored the quit keystroke and had
    /// to be killed.
    pub forced_stop: bool,
    pub duration: Duration,
}

struct ActiveSession {
    binary: PathBuf,
    video_process: ToolProcess,
    audio_capture: LoopbackCapture,
    temp_video_path: PathBuf,
    temp_audio_path: PathBuf,
    output_path: PathBuf,
    started_at: Instant,
}

/// Records a screen region with system audio by driving one external
/// capture process and the loopback pipeline, then muxing both legs into
/// a single file on stop.
///
/// At most one session is active at a time; a second `start` fails
/// without touching the running session. `stop` is a no-op when idle.
pub struct ScreenRecorder {
    settings: RecorderSettings,
    session: Option<ActiveSession>,
}

impl ScreenRecorder {
    pub fn new(settings: RecorderSettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Starts a new recording session over `region`.
    ///
    /// Tool resolution and output-directory checks run before anything is
    /// spawned, so a failed start leaves the recorder idle with no temp
    /// files behind. A session without working loopback capture degrades
    /// to video-only rather than failing.
    pub fn start(&mut self, region: CaptureRegion) -> Result<RecordingStarted, MediaError> {
        if self.session.is_some() {
            return Err(MediaError::RecordingInProgress);
        }

        let binary = resolve_tool_binary(self.settings.tool_dir.as_deref())?;
        let output_dir = self.settings.resolve_output_dir()?;

        let width = even_dimension(region.width);
        let height = even_dimension(region.height);

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let temp_dir = std::env::temp_dir().join(TEMP_DIR_NAME);
        fs::create_dir_all(&temp_dir)?;
        let temp_video_path = temp_dir.join(format!("video_{timestamp}.mp4"));
        let temp_audio_path = temp_dir.join(format!("audio_{timestamp}.wav"));
        let output_path = output_dir.join(format!(
            "{}.mp4",
            self.settings.output_file_stem(&timestamp)
        ));

        let mut audio_capture = LoopbackCapture::new();
        let audio_enabled = match audio_capture.start_to_wav(&temp_audio_path) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!("System audio capture unavailable, recording video only: {error}");
                false
            }
        };

        let args = screen_capture_args(
            &region,
            width,
            height,
            self.settings.frame_rate,
            self.settings.video_crf,
            &temp_video_path,
        );
        let video_process = match ToolProcess::spawn(
            &binary,
            &args,
            SpawnOptions {
                pipe_stdin: true,
                forward_stderr: true,
                ..SpawnOptions::default()
            },
        ) {
            Ok(process) => process,
            Err(error) => {
                audio_capture.stop();
                merge::cleanup_temp_files(&temp_video_path, &temp_audio_path);
                return Err(error);
            }
        };

        tracing::info!(
            pid = video_process.id(),
            output = %output_path.display(),
            width,
            height,
            frame_rate = self.settings.frame_rate,
            audio_enabled,
            "Started screen recording"
        );

        self.session = Some(ActiveSession {
            binary,
            video_process,
            audio_capture,
            temp_video_path,
            temp_audio_path,
            output_path: output_path.clone(),
            started_at: Instant::now(),
        });

        Ok(RecordingStarted {
            output_path,
            width,
            height,
            audio_enabled,
        })
    }

    /// Stops the active session: shuts down audio capture, asks the
    /// capture process to quit, merges both legs and deletes the temp
    /// files. Returns `Ok(None)` when no session is active.
    ///
    /// A merge that produces no output is reported through
    /// `output_bytes: None` rather than an error; by then the recorder is
    /// already idle again.
    pub fn stop(&mut self) -> Result<Option<RecordingFinished>, MediaError> {
        let Some(mut session) = self.session.take() else {
            tracing::debug!("Stop requested with no active recording session");
            return Ok(None);
        };

        // The audio leg closes first so its WAV file is finalized before
        // the merge inspects it.
        session.audio_capture.stop();

        if let Err(error) = session.video_process.write_line("q") {
            tracing::debug!("Failed to send quit keystroke to {TOOL_NAME}: {error}");
        }
        let forced_stop = match session.video_process.wait_timeout(GRACEFUL_STOP_TIMEOUT) {
            Ok(Some(status)) => {
                tracing::info!(%status, "Screen capture process exited after quit signal");
                false
            }
            Ok(None) => {
                tracing::warn!(
                    timeout_ms = GRACEFUL_STOP_TIMEOUT.as_millis() as u64,
                    "Screen capture process ignored the quit signal, force-terminating"
                );
                session.video_process.force_kill();
                true
            }
            Err(error) => {
                tracing::warn!("Failed waiting for screen capture process: {error}");
                session.video_process.force_kill();
                true
            }
        };

        let plan = MergePlan::new(
            &session.temp_video_path,
            &session.temp_audio_path,
            &session.output_path,
            self.settings.audio_bitrate_kbps,
        );
        let merge_result = plan.run(&session.binary);
        merge::cleanup_temp_files(&session.temp_video_path, &session.temp_audio_path);

        let duration = session.started_at.elapsed();
        let output_bytes = match merge_result {
            Ok(bytes) => {
                tracing::info!(
                    output = %session.output_path.display(),
                    output_bytes = bytes,
                    duration_ms = duration.as_millis() as u64,
                    "Recording finalized"
                );
                Some(bytes)
            }
            Err(error) => {
                tracing::error!("Recording produced no output file: {error}");
                None
            }
        };

        Ok(Some(RecordingFinished {
            output_path: session.output_path.clone(),
            output_bytes,
            forced_stop,
            duration,
        }))
    }
}

impl Drop for ScreenRecorder {
    fn drop(&mut self) {
        if self.session.is_some() {
            tracing::warn!("Recorder dropped with an active session, stopping it");
            if let Err(error) = self.stop() {
                tracing::warn!("Failed to stop recording at dispose: {error}");
            }
        }
    }
}

/// Rounds an odd dimension up to the next even value. Zero-sized regions
/// are bumped to the encoder minimum of 2.
fn even_dimension(value: u32) -> u32 {
    let value = value.max(2);
    if value % 2 != 0 {
        value + 1
    } else {
        value
    }
}

fn screen_capture_args(
    region: &CaptureRegion,
    width: u32,
    height: u32,
    frame_rate: u32,
    video_crf: u32,
    temp_video: &Path,
) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-f".to_string(),
        "gdigrab".to_string(),
        "-framerate".to_string(),
        frame_rate.to_string(),
        "-offset_x".to_string(),
        region.x.to_string(),
        "-offset_y".to_string(),
        region.y.to_string(),
        "-video_size".to_string(),
        format!("{width}x{height}"),
        "-i".to_string(),
        "desktop".to_string(),
        "-c:v".to_string(),
        VIDEO_CODEC.to_string(),
        "-preset".to_string(),
        VIDEO_PRESET.to_string(),
        "-crf".to_string(),
        video_crf.to_string(),
        "-pix_fmt".to_string(),
        PIXEL_FORMAT.to_string(),
        "-y".to_string(),
        temp_video.to_string_lossy().to_string(),
    ]
}
