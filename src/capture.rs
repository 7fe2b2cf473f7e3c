use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;

#[cfg(target_os = "windows")]
use std::collections::VecDeque;
#[cfg(target_os = "windows")]
use std::time::Duration;

#[cfg(target_os = "windows")]
use wasapi::{initialize_mta, DeviceEnumerator, Direction, SampleType, StreamMode, WaveFormat};

use crate::error::MediaError;

pub const CAPTURE_SAMPLE_RATE_HZ: usize = 48_000;
pub const CAPTURE_CHANNEL_COUNT: usize = 2;
pub const CAPTURE_BITS_PER_SAMPLE: usize = 16;
#[cfg(target_os = "windows")]
const CAPTURE_CHUNK_FRAMES: usize = 960;
const CAPTURE_QUEUE_CAPACITY: usize = 256;
#[cfg(target_os = "windows")]
const CAPTURE_EVENT_TIMEOUT_MS: u32 = 500;

#[derive(Default)]
struct CaptureStats {
    queued_chunks: AtomicU64,
    written_chunks: AtomicU64,
    dropped_chunks: AtomicU64,
}

struct CaptureWorker {
    capture_stop_tx: std_mpsc::Sender<()>,
    capture_thread: thread::JoinHandle<Result<(), String>>,
    writer_thread: thread::JoinHandle<Result<(), String>>,
    stats: Arc<CaptureStats>,
}

/// Captures the system's audio-output mix as PCM, independent of which
/// application is producing sound.
///
/// Chunks flow from a capture-owned thread through a bounded queue to a
/// writer thread that exclusively owns the WAV file writer, so no "is the
/// writer still open" locking is needed. [`LoopbackCapture::stop`] joins
/// both threads; once it returns, no further write can reach the file and
/// the WAV header is finalized.
#[derive(Default)]
pub struct LoopbackCapture {
    worker: Option<CaptureWorker>,
}

impl LoopbackCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Starts delivering the output mix into a WAV file at `wav_path`.
    ///
    /// Fails with [`MediaError::CaptureDeviceUnavailable`] when no output
    /// device can be opened, before any file is created; the recording
    /// orchestrator then proceeds video-only.
    pub fn start_to_wav(&mut self, wav_path: &Path) -> Result<(), MediaError> {
        if self.worker.is_some() {
            return Err(MediaError::RecordingInProgress);
        }

        probe_loopback_device().map_err(MediaError::CaptureDeviceUnavailable)?;

        let spec = hound::WavSpec {
            channels: CAPTURE_CHANNEL_COUNT as u16,
            sample_rate: CAPTURE_SAMPLE_RATE_HZ as u32,
            bits_per_sample: CAPTURE_BITS_PER_SAMPLE as u16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(wav_path, spec)
            .map_err(|error| MediaError::Io(std::io::Error::other(error)))?;

        let (audio_tx, audio_rx) = std_mpsc::sync_channel::<Vec<u8>>(CAPTURE_QUEUE_CAPACITY);
        let (capture_stop_tx, capture_stop_rx) = std_mpsc::channel::<()>();
        let stats = Arc::new(CaptureStats::default());

        let writer_stats = Arc::clone(&stats);
        let writer_thread = thread::spawn(move || run_wav_writer(writer, audio_rx, writer_stats));

        let capture_stats = Arc::clone(&stats);
        let capture_thread =
            thread::spawn(move || run_loopback_capture(audio_tx, capture_stop_rx, capture_stats));

        tracing::info!(
            wav_path = %wav_path.display(),
            sample_rate_hz = CAPTURE_SAMPLE_RATE_HZ,
            channels = CAPTURE_CHANNEL_COUNT,
            "Started system audio loopback capture"
        );

        self.worker = Some(CaptureWorker {
            capture_stop_tx,
            capture_thread,
            writer_thread,
            stats,
        });
        Ok(())
    }

    /// Stops capture and finalizes the WAV file. Idempotent: calling it
    /// twice, or on a capture never started, is a no-op. The capture thread
    /// is joined before the writer thread, so writes stop strictly before
    /// the backing writer closes.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        if worker.capture_stop_tx.send(()).is_err() {
            tracing::debug!("Capture stop channel already closed");
        }

        match worker.capture_thread.join() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!("System audio capture thread failed: {error}");
            }
            Err(error) => {
                tracing::error!("System audio capture thread panicked: {error:?}");
            }
        }

        match worker.writer_thread.join() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!("System audio writer thread failed: {error}");
            }
            Err(error) => {
                tracing::error!("System audio writer thread panicked: {error:?}");
            }
        }

        tracing::info!(
            queued_chunks = worker.stats.queued_chunks.load(Ordering::Relaxed),
            written_chunks = worker.stats.written_chunks.load(Ordering::Relaxed),
            dropped_chunks = worker.stats.dropped_chunks.load(Ordering::Relaxed),
            "System audio loopback capture stopped"
        );
    }
}

impl Drop for LoopbackCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drains queued PCM chunks into the WAV writer until every producer is
/// gone, then finalizes the header. The writer thread is the only owner of
/// the file handle.
fn run_wav_writer(
    mut writer: hound::WavWriter<BufWriter<File>>,
    audio_rx: std_mpsc::Receiver<Vec<u8>>,
    stats: Arc<CaptureStats>,
) -> Result<(), String> {
    while let Ok(chunk) = audio_rx.recv() {
        for sample_bytes in chunk.chunks_exact(2) {
            let sample = i16::from_le_bytes([sample_bytes[0], sample_bytes[1]]);
            writer
                .write_sample(sample)
                .map_err(|error| format!("Failed to write audio sample to WAV sink: {error}"))?;
        }
        stats.written_chunks.fetch_add(1, Ordering::Relaxed);
    }

    writer
        .finalize()
        .map_err(|error| format!("Failed to finalize WAV sink: {error}"))
}

#[cfg(target_os = "windows")]
fn build_loopback_capture_context(
) -> Result<(wasapi::AudioClient, wasapi::AudioCaptureClient, WaveFormat), String> {
    initialize_mta()
        .ok()
        .map_err(|error| format!("Failed to initialize COM for system audio capture: {error}"))?;

    let enumerator = DeviceEnumerator::new()
        .map_err(|error| format!("Failed to enumerate audio devices: {error}"))?;
    let device = enumerator
        .get_default_device(&Direction::Render)
        .map_err(|error| format!("Failed to access default output audio device: {error}"))?;
    let mut audio_client = device
        .get_iaudioclient()
        .map_err(|error| format!("Failed to create WASAPI audio client: {error}"))?;

    let wave_format = WaveFormat::new(
        CAPTURE_BITS_PER_SAMPLE,
        CAPTURE_BITS_PER_SAMPLE,
        &SampleType::Int,
        CAPTURE_SAMPLE_RATE_HZ,
        CAPTURE_CHANNEL_COUNT,
        None,
    );
    let mode = StreamMode::EventsShared {
        autoconvert: true,
        buffer_duration_hns: 0,
    };

    audio_client
        .initialize_client(&wave_format, &Direction::Capture, &mode)
        .map_err(|error| {
            format!("Failed to initialize WASAPI loopback client for system audio: {error}")
        })?;

    let capture_client = audio_client
        .get_audiocaptureclient()
        .map_err(|error| format!("Failed to create WASAPI capture client: {error}"))?;

    Ok((audio_client, capture_client, wave_format))
}

#[cfg(target_os = "windows")]
fn probe_loopback_device() -> Result<(), String> {
    let _ = build_loopback_capture_context()?;
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn probe_loopback_device() -> Result<(), String> {
    Err("system audio loopback capture requires a Windows audio output device".to_string())
}

#[cfg(target_os = "windows")]
fn run_loopback_capture(
    audio_tx: std_mpsc::SyncSender<Vec<u8>>,
    stop_rx: std_mpsc::Receiver<()>,
    stats: Arc<CaptureStats>,
) -> Result<(), String> {
    let (audio_client, capture_client, wave_format) = build_loopback_capture_context()?;
    let event_handle = audio_client
        .set_get_eventhandle()
        .map_err(|error| format!("Failed to configure WASAPI event handle: {error}"))?;

    audio_client
        .start_stream()
        .map_err(|error| format!("Failed to start system audio stream: {error}"))?;

    let mut sample_backlog: VecDeque<u8> = VecDeque::new();
    let chunk_size_bytes = wave_format.get_blockalign() as usize * CAPTURE_CHUNK_FRAMES;
    let mut should_stop = false;
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(std_mpsc::TryRecvError::Disconnected) => {
                should_stop = true;
            }
            Err(std_mpsc::TryRecvError::Empty) => {}
        }

        let next_packet_frames = match capture_client.get_next_packet_size() {
            Ok(packet_size) => packet_size.unwrap_or(0),
            Err(error) => {
                tracing::warn!("Failed to poll system audio packets: {error}");
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        if next_packet_frames > 0 {
            if let Err(error) = capture_client.read_from_device_to_deque(&mut sample_backlog) {
                tracing::warn!("Failed to read system audio packet: {error}");
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        }

        while sample_backlog.len() >= chunk_size_bytes {
            let mut chunk = Vec::with_capacity(chunk_size_bytes);
            chunk.extend(sample_backlog.drain(..chunk_size_bytes));

            match audio_tx.try_send(chunk) {
                Ok(()) => {
                    stats.queued_chunks.fetch_add(1, Ordering::Relaxed);
                }
                Err(std_mpsc::TrySendError::Full(_)) => {
                    let dropped_chunks = stats.dropped_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped_chunks % 64 == 0 {
                        tracing::warn!(
                            dropped_chunks,
                            "Dropping system audio chunks due to queue backpressure"
                        );
                    }
                }
                Err(std_mpsc::TrySendError::Disconnected(_)) => return Ok(()),
            }
        }

        if should_stop {
            break;
        }

        if let Err(error) = event_handle.wait_for_event(CAPTURE_EVENT_TIMEOUT_MS) {
            tracing::debug!("System audio wait event timed/failed: {error}");
        }
    }

    if !sample_backlog.is_empty() {
        let mut remaining = Vec::with_capacity(sample_backlog.len());
        remaining.extend(sample_backlog.drain(..));
        if audio_tx.try_send(remaining).is_ok() {
            stats.queued_chunks.fetch_add(1, Ordering::Relaxed);
        }
    }

    if let Err(error) = audio_client.stop_stream() {
        tracing::warn!("Failed to stop system audio stream cleanly: {error}");
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn run_loopback_capture(
    audio_tx: std_mpsc::SyncSender<Vec<u8>>,
    stop_rx: std_mpsc::Receiver<()>,
    stats: Arc<CaptureStats>,
) -> Result<(), String> {
    let _ = (audio_tx, stop_rx, stats);
    Err("system audio loopback capture is only supported on Windows".to_string())
}
