//! PulseAudio backend
//!
//! Each stream runs on its own OS thread with a blocking `Simple`
//! connection, so reads and writes never stall the Tokio runtime. Samples
//! cross the wire as 32-bit little-endian floats.
//!
//! The output plays buffers back-to-back in submission order, which is what
//! the scheduler's start offsets describe while delivery keeps up; a late
//! buffer simply starts as soon as it is written.

use super::{
    CaptureBuffer, CaptureCallback, CaptureDevice, CaptureStream, FinishedCallback, OutputDevice, OutputSink,
};
use crate::error::{LiveError, Result};
use crate::playback::PlayableBuffer;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Capture and output through the default (or a named) PulseAudio device.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
    device: Option<String>,
}

impl PulseBackend {
    pub fn new(app_name: &str, device: Option<&str>) -> Self {
        Self {
            app_name: app_name.to_string(),
            device: device.map(|s| s.to_string()),
        }
    }
}

fn float_spec(rate: u32) -> Spec {
    Spec {
        format: Format::F32le,
        channels: 1,
        rate,
    }
}

/// Spawn a stream thread and wait until it reports whether the device
/// opened.
fn spawn_stream<F>(name: &str, body: F) -> std::result::Result<(), String>
where
    F: FnOnce(mpsc::Sender<std::result::Result<(), String>>) + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::channel();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(ready_tx))
        .map_err(|e| format!("failed to spawn {} thread: {}", name, e))?;

    ready_rx
        .recv()
        .unwrap_or_else(|_| Err(format!("{} thread exited during startup", name)))
}

impl CaptureDevice for PulseBackend {
    fn open(&self, sample_rate: u32, buffer_frames: usize) -> Result<Box<dyn CaptureStream>> {
        let spec = float_spec(sample_rate);
        if !spec.is_valid() || buffer_frames == 0 {
            return Err(LiveError::Permission(format!(
                "unsupported capture format: {} Hz, {} frames",
                sample_rate, buffer_frames
            )));
        }

        let (start_tx, start_rx) = mpsc::channel::<CaptureCallback>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let app_name = self.app_name.clone();
        let device = self.device.clone();

        spawn_stream("pulse-capture", move |ready| {
            let simple = match Simple::new(
                None,
                &app_name,
                Direction::Record,
                device.as_deref(),
                "microphone",
                &spec,
                None,
                None,
            ) {
                Ok(simple) => {
                    let _ = ready.send(Ok(()));
                    simple
                }
                Err(e) => {
                    let _ = ready.send(Err(format!("{:?}", e)));
                    return;
                }
            };

            // Released before it was ever started
            let Ok(mut deliver) = start_rx.recv() else {
                return;
            };
            info!("Capturing {} Hz in {}-frame buffers", sample_rate, buffer_frames);

            let mut samples = vec![0f32; buffer_frames];
            while !shutdown_thread.load(Ordering::Relaxed) {
                if let Err(e) = simple.read(bytemuck::cast_slice_mut(&mut samples)) {
                    error!("Audio read error: {:?}", e);
                    break;
                }
                if shutdown_thread.load(Ordering::Relaxed) {
                    break;
                }
                let buffer = CaptureBuffer {
                    samples: samples.clone(),
                    sample_rate,
                };
                if !deliver(buffer) {
                    break;
                }
            }
            debug!("Capture thread exiting");
        })
        .map_err(LiveError::Permission)?;

        Ok(Box::new(PulseCapture {
            start: Some(start_tx),
            shutdown,
        }))
    }
}

struct PulseCapture {
    start: Option<mpsc::Sender<CaptureCallback>>,
    shutdown: Arc<AtomicBool>,
}

impl CaptureStream for PulseCapture {
    fn start(&mut self, deliver: CaptureCallback) -> Result<()> {
        let start = self
            .start
            .take()
            .ok_or_else(|| LiveError::Permission("microphone already started or released".to_string()))?;
        start
            .send(deliver)
            .map_err(|_| LiveError::Permission("capture thread is gone".to_string()))
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.start = None;
    }
}

impl Drop for PulseCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

enum OutputCommand {
    Play { id: u64, buffer: Arc<PlayableBuffer> },
    Close,
}

impl OutputDevice for PulseBackend {
    fn open(&self, sample_rate: u32, on_finished: FinishedCallback) -> Result<Box<dyn OutputSink>> {
        let spec = float_spec(sample_rate);
        if !spec.is_valid() {
            return Err(LiveError::AudioDevice(format!("unsupported output rate {} Hz", sample_rate)));
        }

        let (commands_tx, commands_rx) = mpsc::channel();
        // Buffers with a smaller id are stopped
        let floor = Arc::new(AtomicU64::new(0));
        let floor_thread = floor.clone();
        let app_name = self.app_name.clone();
        let device = self.device.clone();
        let slice_frames = (sample_rate / 100).max(1) as usize;

        spawn_stream("pulse-output", move |ready| {
            let simple = match Simple::new(
                None,
                &app_name,
                Direction::Playback,
                device.as_deref(),
                "model speech",
                &spec,
                None,
                None,
            ) {
                Ok(simple) => {
                    let _ = ready.send(Ok(()));
                    simple
                }
                Err(e) => {
                    let _ = ready.send(Err(format!("{:?}", e)));
                    return;
                }
            };

            for command in commands_rx {
                let (id, buffer) = match command {
                    OutputCommand::Play { id, buffer } => (id, buffer),
                    OutputCommand::Close => break,
                };
                if id < floor_thread.load(Ordering::Relaxed) {
                    continue;
                }
                if buffer.sample_rate != sample_rate {
                    debug!("Buffer {} is {} Hz on a {} Hz output", id, buffer.sample_rate, sample_rate);
                }

                let samples = buffer.channels.first().map(Vec::as_slice).unwrap_or_default();
                let mut stopped = false;
                for slice in samples.chunks(slice_frames) {
                    if id < floor_thread.load(Ordering::Relaxed) {
                        stopped = true;
                        break;
                    }
                    if let Err(e) = simple.write(bytemuck::cast_slice(slice)) {
                        error!("Audio write error: {:?}", e);
                        return;
                    }
                }

                if stopped {
                    if let Err(e) = simple.flush() {
                        debug!("Flush failed: {:?}", e);
                    }
                } else {
                    on_finished(id);
                }
            }

            let _ = simple.flush();
            debug!("Output thread exiting");
        })
        .map_err(LiveError::AudioDevice)?;

        Ok(Box::new(PulseOutput {
            commands: commands_tx,
            floor,
            closed: false,
        }))
    }
}

struct PulseOutput {
    commands: mpsc::Sender<OutputCommand>,
    floor: Arc<AtomicU64>,
    closed: bool,
}

impl OutputSink for PulseOutput {
    fn schedule(&mut self, id: u64, _start: Duration, buffer: Arc<PlayableBuffer>) -> Result<()> {
        self.commands
            .send(OutputCommand::Play { id, buffer })
            .map_err(|_| LiveError::AudioDevice("output thread is gone".to_string()))
    }

    fn stop(&mut self, id: u64) {
        self.floor.fetch_max(id + 1, Ordering::Relaxed);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.floor.store(u64::MAX, Ordering::Relaxed);
        let _ = self.commands.send(OutputCommand::Close);
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}
