use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MediaError;
use crate::process::{SpawnOptions, ToolProcess, TOOL_NAME};

/// Budget for the mux step. A merge that overruns it is killed and the
/// session still completes; the temp files are gone either way.
const MERGE_TIMEOUT: Duration = Duration::from_secs(30);

/// An audio temp file at or below this size carries only a WAV header and
/// is treated as silence worth discarding.
pub(crate) const MIN_AUDIO_FILE_BYTES: u64 = 1000;

/// One mux invocation, planned after both capture legs have shut down.
///
/// The audio leg is inspected once at construction; whether the plan
/// muxes audio in or copies the video alone is fixed from that point on.
pub(crate) struct MergePlan {
    temp_video: PathBuf,
    temp_audio: PathBuf,
    output: PathBuf,
    has_audio: bool,
    audio_bitrate_kbps: u32,
}

impl MergePlan {
    pub(crate) fn new(
        temp_video: &Path,
        temp_audio: &Path,
        output: &Path,
        audio_bitrate_kbps: u32,
    ) -> Self {
        let audio_bytes = fs::metadata(temp_audio).map(|meta| meta.len()).unwrap_or(0);
        Self {
            temp_video: temp_video.to_path_buf(),
            temp_audio: temp_audio.to_path_buf(),
            output: output.to_path_buf(),
            has_audio: audio_bytes > MIN_AUDIO_FILE_BYTES,
            audio_bitrate_kbps,
        }
    }

    pub(crate) fn has_audio(&self) -> bool {
        self.has_audio
    }

    /// Video packets are never re-encoded; with audio present the WAV leg
    /// is encoded to AAC and the result is cut to the shorter stream.
    pub(crate) fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-i".to_string(),
            self.temp_video.to_string_lossy().to_string(),
        ];
        if self.has_audio {
            args.extend([
                "-i".to_string(),
                self.temp_audio.to_string_lossy().to_string(),
                "-c:v".to_string(),
                "copy".to_string(),
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                format!("{}k", self.audio_bitrate_kbps),
                "-shortest".to_string(),
            ]);
        } else {
            args.extend(["-c:v".to_string(), "copy".to_string()]);
        }
        args.extend([
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-y".to_string(),
            self.output.to_string_lossy().to_string(),
        ]);
        args
    }

    /// Runs the mux and returns the size of the output file in bytes.
    ///
    /// Exit codes are logged but not trusted; the output file existing
    /// with content is the success signal.
    pub(crate) fn run(&self, binary: &Path) -> Result<u64, MediaError> {
        tracing::info!(
            has_audio = self.has_audio,
            output = %self.output.display(),
            "Merging recording"
        );

        let mut process = ToolProcess::spawn(
            binary,
            &self.args(),
            SpawnOptions {
                forward_stderr: true,
                ..SpawnOptions::default()
            },
        )?;

        match process.wait_timeout(MERGE_TIMEOUT) {
            Ok(Some(status)) if status.success() => {}
            Ok(Some(status)) => {
                tracing::warn!(%status, "Merge process exited with a failure status");
            }
            Ok(None) => {
                tracing::warn!(
                    timeout_ms = MERGE_TIMEOUT.as_millis() as u64,
                    "Merge did not finish within the budget, force-terminating"
                );
                process.force_kill();
            }
            Err(error) => {
                tracing::warn!("Failed waiting for {TOOL_NAME} merge: {error}");
                process.force_kill();
            }
        }

        match fs::metadata(&self.output) {
            Ok(meta) if meta.len() > 0 => Ok(meta.len()),
            _ => Err(MediaError::MergeFailure {
                path: self.output.clone(),
            }),
        }
    }
}

/// Removes both temp capture files. Runs on every stop path, whether or
/// not the merge produced an output.
pub(crate) fn cleanup_temp_files(temp_video: &Path, temp_audio: &Path) {
    for path in [temp_video, temp_audio] {
        if path.exists() {
            match fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed temp capture file"),
                Err(error) => {
                    tracing::warn!(path = %path.display(), "Failed to remove temp file: {error}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_dir(label: &str) -> PathBuf {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!("playcap_{label}_{suffix}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_audio_file_selects_the_video_only_path() {
        let dir = unique_temp_dir("merge_noaudio");
        let plan = MergePlan::new(
            &dir.join("video.mp4"),
            &dir.join("audio.wav"),
            &dir.join("out.mp4"),
            192,
        );

        assert!(!plan.has_audio());
        let joined = plan.args().join(" ");
        assert!(joined.contains("-c:v copy"));
        assert!(!joined.contains("-c:a aac"));
        assert!(!joined.contains("-shortest"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn header_only_audio_file_is_discarded() {
        let dir = unique_temp_dir("merge_tiny");
        let audio = dir.join("audio.wav");
        fs::write(&audio, vec![0u8; MIN_AUDIO_FILE_BYTES as usize]).unwrap();

        let plan = MergePlan::new(&dir.join("video.mp4"), &audio, &dir.join("out.mp4"), 192);
        assert!(!plan.has_audio());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn substantial_audio_file_is_muxed_in() {
        let dir = unique_temp_dir("merge_audio");
        let audio = dir.join("audio.wav");
        fs::write(&audio, vec![0u8; MIN_AUDIO_FILE_BYTES as usize + 1]).unwrap();

        let plan = MergePlan::new(&dir.join("video.mp4"), &audio, &dir.join("out.mp4"), 192);
        assert!(plan.has_audio());

        let joined = plan.args().join(" ");
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-b:a 192k"));
        assert!(joined.contains("-shortest"));
        assert!(joined.contains("+faststart"));
        assert_eq!(
            plan.args().last().map(String::clone),
            Some(dir.join("out.mp4").to_string_lossy().to_string())
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn run_without_an_output_file_is_a_merge_failure() {
        let dir = unique_temp_dir("merge_fail");
        let plan = MergePlan::new(
            &dir.join("video.mp4"),
            &dir.join("audio.wav"),
            &dir.join("out.mp4"),
            192,
        );

        // `true` accepts the arguments and exits without writing anything.
        let result = plan.run(Path::new("true"));
        assert!(matches!(result, Err(MediaError::MergeFailure { .. })));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cleanup_removes_both_temp_files() {
        let dir = unique_temp_dir("cleanup");
        let video = dir.join("video.mp4");
        let audio = dir.join("audio.wav");
        fs::write(&video, b"v").unwrap();
        fs::write(&audio, b"a").unwrap();

        cleanup_temp_files(&video, &audio);
        assert!(!video.exists());
        assert!(!audio.exists());

        // Missing files are not an error on a second pass.
        cleanup_temp_files(&video, &audio);

        let _ = fs::remove_dir_all(&dir);
    }
}
