use std::io::{BufRead, BufReader, Write};
#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::MediaError;

/// Name of the external codec/capture/mux tool. All three roles are served
/// by one ffmpeg-compatible binary.
pub const TOOL_NAME: &str = "ffmpeg";

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How a [`ToolProcess`] wires up the child's standard streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOptions {
    /// Pipe stdin so the caller can send the graceful-quit keystroke.
    pub pipe_stdin: bool,
    /// Pipe stdout so the caller can drain the tool's output bytes.
    pub capture_stdout: bool,
    /// Forward stderr lines to the diagnostic log. The tools are chatty by
    /// design, so stderr content never gates success or failure.
    pub forward_stderr: bool,
}

/// Supervision handle for one external tool invocation.
///
/// Owned by whichever component started it; the process is terminated or
/// reaped on every path, including drop.
pub struct ToolProcess {
    tool: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<thread::JoinHandle<()>>,
}

impl ToolProcess {
    pub fn spawn(
        binary: &Path,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<Self, MediaError> {
        let mut command = Command::new(binary);
        #[cfg(target_os = "windows")]
        command.creation_flags(CREATE_NO_WINDOW);
        command
            .args(args)
            .stdin(if options.pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if options.capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if options.forward_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn().map_err(|source| {
            tracing::error!(
                binary = %binary.display(),
                "Failed to spawn {TOOL_NAME} process: {source}"
            );
            MediaError::ProcessStartFailure {
                tool: TOOL_NAME.to_string(),
                source,
            }
        })?;

        let stdin = child.stdin.take();
        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(content) if !content.trim().is_empty() => {
                            tracing::debug!("{TOOL_NAME}: {}", content.trim());
                        }
                        Ok(_) => {}
                        Err(error) => {
                            tracing::warn!("Failed to read {TOOL_NAME} stderr: {error}");
                            break;
                        }
                    }
                }
            })
        });

        Ok(Self {
            tool: TOOL_NAME.to_string(),
            child,
            stdin,
            stderr_thread,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Sends one line to the child's stdin, if stdin was piped. Used to
    /// request graceful shutdown of tools that honor a quit keystroke.
    pub fn write_line(&mut self, text: &str) -> std::io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        stdin.write_all(text.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    /// Takes ownership of the child's stdout pipe for synchronous draining.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Waits for the process to exit, polling up to `timeout`. Returns
    /// `Ok(None)` when the process is still running at the deadline; the
    /// caller decides whether to force-terminate.
    pub fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait()? {
                Some(status) => return Ok(Some(status)),
                None if Instant::now() >= deadline => return Ok(None),
                None => thread::sleep(WAIT_POLL_INTERVAL),
            }
        }
    }

    /// Kills the process and reaps it. Safe to call on an already-exited
    /// process.
    pub fn force_kill(&mut self) {
        if let Err(error) = self.child.kill() {
            tracing::debug!(tool = %self.tool, "Kill request returned: {error}");
        }
        if let Err(error) = self.child.wait() {
            tracing::warn!(tool = %self.tool, "Failed to collect exit status after kill: {error}");
        }
    }
}

impl Drop for ToolProcess {
    fn drop(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(
                    tool = %self.tool,
                    pid = self.child.id(),
                    "Terminating external process still running at dispose"
                );
                self.force_kill();
            }
            Err(error) => {
                tracing::warn!(tool = %self.tool, "Failed to poll process at dispose: {error}");
                self.force_kill();
            }
        }

        if let Some(stderr_thread) = self.stderr_thread.take() {
            if stderr_thread.join().is_err() {
                tracing::warn!(tool = %self.tool, "Stderr reader thread panicked");
            }
        }
    }
}

fn tool_file_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    }
}

fn probe_tool_on_path() -> bool {
    let mut command = Command::new(TOOL_NAME);
    #[cfg(target_os = "windows")]
    command.creation_flags(CREATE_NO_WINDOW);
    command
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Locates the media tool binary.
///
/// Resolution order: the configured bundled directory, then the bundled
/// locations next to the application executable, then the system PATH
/// (verified with a `-version` probe). Absence of all is `BinaryNotFound`.
pub fn resolve_tool_binary(bundled_dir: Option<&Path>) -> Result<PathBuf, MediaError> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = bundled_dir {
        candidates.push(dir.join(tool_file_name()));
    }

    if let Ok(current_executable) = std::env::current_exe() {
        if let Some(executable_directory) = current_executable.parent() {
            candidates.push(executable_directory.join(TOOL_NAME).join(tool_file_name()));
            candidates.push(executable_directory.join(tool_file_name()));
        }
    }

    if let Some(found) = candidates.into_iter().find(|path| path.is_file()) {
        tracing::debug!(binary = %found.display(), "Resolved bundled {TOOL_NAME} binary");
        return Ok(found);
    }

    if probe_tool_on_path() {
        tracing::debug!("Resolved {TOOL_NAME} from the system PATH");
        return Ok(PathBuf::from(TOOL_NAME));
    }

    Err(MediaError::BinaryNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

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
    fn spawn_of_missing_binary_is_a_start_failure() {
        let result = ToolProcess::spawn(
            Path::new("/definitely/not/a/real/tool"),
            &[],
            SpawnOptions::default(),
        );
        assert!(matches!(
            result,
            Err(MediaError::ProcessStartFailure { .. })
        ));
    }

    #[test]
    fn bundled_directory_wins_over_path_probe() {
        let dir = unique_temp_dir("bundled");
        let binary = dir.join(tool_file_name());
        fs::write(&binary, b"").unwrap();

        let resolved = resolve_tool_binary(Some(&dir)).expect("resolve bundled binary");
        assert_eq!(resolved, binary);

        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn wait_timeout_reports_quick_exit() {
        let mut process = ToolProcess::spawn(
            Path::new("sh"),
            &["-c".to_string(), "exit 0".to_string()],
            SpawnOptions::default(),
        )
        .expect("spawn sh");

        let status = process
            .wait_timeout(Duration::from_secs(5))
            .expect("wait for sh")
            .expect("sh should exit within the bound");
        assert!(status.success());
    }

    #[cfg(unix)]
    #[test]
    fn wait_timeout_leaves_slow_process_for_force_kill() {
        let mut process = ToolProcess::spawn(
            Path::new("sh"),
            &["-c".to_string(), "sleep 30".to_string()],
            SpawnOptions::default(),
        )
        .expect("spawn sh");

        let status = process
            .wait_timeout(Duration::from_millis(100))
            .expect("poll sh");
        assert!(status.is_none());

        process.force_kill();
        let status = process
            .wait_timeout(Duration::from_secs(5))
            .expect("wait after kill");
        assert!(status.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn write_line_drives_a_stdin_handshake() {
        let mut process = ToolProcess::spawn(
            Path::new("sh"),
            &["-c".to_string(), "read line; exit 0".to_string()],
            SpawnOptions {
                pipe_stdin: true,
                ..SpawnOptions::default()
            },
        )
        .expect("spawn sh");

        process.write_line("q").expect("write quit line");
        let status = process
            .wait_timeout(Duration::from_secs(5))
            .expect("wait for handshake exit")
            .expect("process should exit after the quit line");
        assert!(status.success());
    }

    #[cfg(unix)]
    #[test]
    fn drop_terminates_a_running_process() {
        let process = ToolProcess::spawn(
            Path::new("sh"),
            &["-c".to_string(), "sleep 30".to_string()],
            SpawnOptions::default(),
        )
        .expect("spawn sh");
        let pid = process.id();
        drop(process);

        // After drop the pid must no longer be running (kill -0 fails once
        // the process is reaped).
        let alive = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        assert!(!alive);
    }
}
