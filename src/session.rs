//! Live session state machine
//!
//! A [`LiveSession`] is a handle to one driver task. Commands from the
//! handle, capture buffers, meter ticks, playback completions and channel
//! events are all posted onto a single queue and handled one at a time, so
//! inbound messages are applied strictly in arrival order and outbound audio
//! leaves in capture order.
//!
//! Events produced by device callbacks and the channel reader carry the
//! epoch of the connection that produced them. Teardown bumps the epoch, so
//! anything still queued from a previous connection is discarded instead of
//! processed.

use crate::channel::{ChannelSink, Connector, OpenChannel};
use crate::clock::{Clock, MonotonicClock};
use crate::codec;
use crate::config::LiveConfig;
use crate::device::{CaptureBuffer, CaptureStream, Devices, FinishedCallback, OutputSink};
use crate::error::{LiveError, Result};
use crate::meter::{Meter, RecentSamples, VolumeLevel, METER_WINDOW};
use crate::playback::PlaybackScheduler;
use crate::protocol::{
    ChannelEvent, ClientFrame, FeedbackEvent, ServerContent, ServerEvent, SessionSetup, ToolCall, ToolResponse,
    FEEDBACK_TOOL,
};
use crate::resample;
use crate::transcript::{Transcript, TranscriptItem};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Everything a front end renders, republished after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub state: ConnectionState,
    /// Human-readable reason for the last failure, kept while in `Error`
    pub error: Option<String>,
    pub volume: VolumeLevel,
    pub feedback: Option<FeedbackEvent>,
    pub transcripts: Vec<TranscriptItem>,
    /// In-progress model speech, overwritten on every delta
    pub subtitle: String,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            error: None,
            volume: VolumeLevel::default(),
            feedback: None,
            transcripts: Vec::new(),
            subtitle: String::new(),
        }
    }
}

#[derive(Debug)]
enum SessionEvent {
    Connect { instruction: Option<String> },
    Disconnect,
    SendText(String),
    Shutdown,
    /// Produced on behalf of the connection with this epoch
    Scoped { epoch: u64, input: SessionInput },
}

#[derive(Debug)]
enum SessionInput {
    Capture(CaptureBuffer),
    MeterTick,
    PlaybackFinished(u64),
    Channel(ChannelEvent),
}

impl SessionInput {
    fn kind(&self) -> &'static str {
        match self {
            Self::Capture(_) => "capture buffer",
            Self::MeterTick => "meter tick",
            Self::PlaybackFinished(_) => "playback completion",
            Self::Channel(_) => "channel event",
        }
    }
}

/// Handle to a running session. Must be created inside a Tokio runtime.
///
/// Every method is fire-and-forget; observe the outcome through
/// [`view`](Self::view) or [`subscribe`](Self::subscribe).
pub struct LiveSession {
    tx: mpsc::UnboundedSender<SessionEvent>,
    view: watch::Receiver<SessionView>,
}

impl LiveSession {
    pub fn spawn(config: LiveConfig, connector: Arc<dyn Connector>, devices: Devices) -> Self {
        Self::spawn_with_clock(config, connector, devices, Arc::new(MonotonicClock::new()))
    }

    /// Like [`spawn`](Self::spawn) with an explicit session clock, shared by
    /// playback scheduling and transcript timestamps.
    pub fn spawn_with_clock(
        config: LiveConfig,
        connector: Arc<dyn Connector>,
        devices: Devices,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(SessionView::default());

        let driver = SessionDriver {
            config,
            connector,
            devices,
            tx: tx.clone(),
            rx,
            view_tx,
            state: ConnectionState::Disconnected,
            error: None,
            epoch: 0,
            core: SessionCore::new(clock),
            meter: Meter::new(),
            volume: VolumeLevel::default(),
            input_tail: RecentSamples::default(),
            context: None,
        };
        tokio::spawn(driver.run());

        Self { tx, view }
    }

    /// Start a connection attempt. `None` uses the configured instruction.
    pub fn connect(&self, instruction: Option<String>) {
        self.post(SessionEvent::Connect { instruction });
    }

    pub fn disconnect(&self) {
        self.post(SessionEvent::Disconnect);
    }

    /// Inject a text turn. Dropped unless connected.
    pub fn send_text(&self, text: impl Into<String>) {
        self.post(SessionEvent::SendText(text.into()));
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    fn post(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("Session driver is gone, dropping command");
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        let _ = self.tx.send(SessionEvent::Shutdown);
    }
}

/// Conversation state that reacts to server events. Owns the playback
/// scheduler while connected.
struct SessionCore {
    clock: Arc<dyn Clock>,
    transcript: Transcript,
    feedback: Option<FeedbackEvent>,
    scheduler: Option<PlaybackScheduler>,
}

impl SessionCore {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            transcript: Transcript::new(),
            feedback: None,
            scheduler: None,
        }
    }

    /// Apply one server event. Returns the frames to send back.
    fn handle_server(&mut self, event: ServerEvent) -> Vec<ClientFrame> {
        let mut out = Vec::new();

        if event.setup_complete.is_some() {
            info!("Remote setup complete");
        }
        if let Some(go_away) = &event.go_away {
            warn!("Remote is going away (time left: {:?})", go_away.time_left);
        }
        if let Some(cancel) = &event.tool_call_cancellation {
            debug!("Tool calls cancelled: {:?}", cancel.ids);
        }

        let content = event.server_content.unwrap_or_default();
        self.apply_transcription(&content);

        if let Some(tool_call) = event.tool_call {
            out.extend(self.handle_tool_call(tool_call));
        }

        if let Some(turn) = &content.model_turn {
            for inline in turn.parts.iter().filter_map(|p| p.inline_data.as_ref()) {
                self.play(&inline.data, inline.sample_rate());
            }
        }

        if content.interrupted {
            info!("Model interrupted by the user");
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.interrupt();
            }
            self.transcript.clear_output();
        }

        out
    }

    fn apply_transcription(&mut self, content: &ServerContent) {
        if let Some(text) = content.output_transcription.as_ref().and_then(|t| t.text.as_deref()) {
            let subtitle = self.transcript.push_output(text);
            debug!("Subtitle: {}", subtitle);
        }
        if let Some(text) = content.input_transcription.as_ref().and_then(|t| t.text.as_deref()) {
            self.transcript.push_input(text);
        }
        if content.turn_complete {
            for item in self.transcript.complete_turn(self.clock.now()) {
                info!("[{}] {}", item.role.as_str(), item.text);
            }
        }
    }

    /// Surface the first call of the batch and acknowledge every call.
    fn handle_tool_call(&mut self, tool_call: ToolCall) -> Option<ClientFrame> {
        let calls = tool_call.function_calls;
        let first = calls.first()?;

        if calls.len() > 1 {
            debug!("{} tool calls in one batch, surfacing the first", calls.len());
        }
        if first.name == FEEDBACK_TOOL {
            match FeedbackEvent::from_args(&first.args) {
                Ok(feedback) => {
                    if !feedback.is_complete() {
                        warn!("Feedback is missing required fields: {:?}", feedback);
                    }
                    info!("Feedback: {} / {}", feedback.japanese, feedback.advice);
                    self.feedback = Some(feedback);
                }
                Err(e) => warn!("Malformed {} arguments: {}", FEEDBACK_TOOL, e),
            }
        } else {
            warn!("Unknown tool call: {}", first.name);
        }

        Some(ClientFrame::ToolResponse {
            response: ToolResponse::ok_for(&calls),
        })
    }

    fn play(&mut self, data: &str, sample_rate: u32) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            debug!("No output open, dropping response audio");
            return;
        };
        let result = codec::decode(data).and_then(|bytes| scheduler.enqueue(&bytes, sample_rate, 1));
        match result {
            Ok(_) => {}
            Err(e) if e.is_recoverable() => warn!("Skipping audio chunk: {}", e),
            Err(e) => error!("Failed to schedule audio chunk: {}", e),
        }
    }

    fn output_window(&self) -> Vec<f32> {
        self.scheduler
            .as_ref()
            .map(|s| s.recent_samples(METER_WINDOW))
            .unwrap_or_default()
    }
}

/// Handles owned by one established connection, released together.
struct SessionContext {
    channel: Box<dyn ChannelSink>,
    capture: Box<dyn CaptureStream>,
    forwarder: JoinHandle<()>,
    meter_timer: JoinHandle<()>,
}

/// Output and microphone acquired so far by a connection attempt. Dropping
/// it releases whatever it still holds, which covers failed and cancelled
/// attempts alike.
#[derive(Default)]
struct Pending {
    output: Option<Box<dyn OutputSink>>,
    capture: Option<Box<dyn CaptureStream>>,
}

impl Pending {
    fn finish(mut self, channel: OpenChannel) -> Result<Acquired> {
        match (self.output.take(), self.capture.take()) {
            (Some(output), Some(capture)) => Ok(Acquired {
                output,
                capture,
                channel,
            }),
            _ => Err(LiveError::AudioDevice("audio devices released during connect".to_string())),
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut output) = self.output.take() {
            output.close();
        }
    }
}

struct Acquired {
    output: Box<dyn OutputSink>,
    capture: Box<dyn CaptureStream>,
    channel: OpenChannel,
}

/// Acquire everything a connection needs. The configuration check runs
/// before any device is touched.
async fn acquire(
    connector: Arc<dyn Connector>,
    devices: Devices,
    config: LiveConfig,
    setup: SessionSetup,
    on_finished: FinishedCallback,
) -> Result<Acquired> {
    connector.check_configured()?;

    let mut pending = Pending {
        output: Some(devices.output.open(config.output_sample_rate, on_finished)?),
        capture: None,
    };

    let capture = devices.capture.clone();
    let (rate, frames) = (config.capture_sample_rate, config.capture_buffer_frames);
    let stream = tokio::task::spawn_blocking(move || capture.open(rate, frames))
        .await
        .map_err(|e| LiveError::Permission(format!("microphone request aborted: {}", e)))??;
    pending.capture = Some(stream);
    info!("Microphone acquired");

    let channel = connector.open(setup).await?;
    pending.finish(channel)
}

enum Cancel {
    Disconnect,
    Shutdown,
}

struct SessionDriver {
    config: LiveConfig,
    connector: Arc<dyn Connector>,
    devices: Devices,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    view_tx: watch::Sender<SessionView>,
    state: ConnectionState,
    error: Option<String>,
    epoch: u64,
    core: SessionCore,
    meter: Meter,
    volume: VolumeLevel,
    input_tail: RecentSamples,
    context: Option<SessionContext>,
}

impl SessionDriver {
    async fn run(mut self) {
        info!("Session driver started");

        while let Some(event) = self.rx.recv().await {
            let running = self.handle(event).await;
            self.publish();
            if !running {
                break;
            }
        }

        self.teardown(ConnectionState::Disconnected).await;
        self.publish();
        info!("Session driver stopped");
    }

    /// Returns false once the driver should exit.
    async fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Connect { instruction } => return self.connect(instruction).await,
            SessionEvent::Disconnect => match self.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    info!("Disconnecting");
                    self.teardown(ConnectionState::Disconnected).await;
                }
                state => debug!("Disconnect while {:?} is a no-op", state),
            },
            SessionEvent::SendText(text) => {
                if self.state != ConnectionState::Connected || self.context.is_none() {
                    debug!("Not connected, dropping text turn");
                } else if let Err(e) = self.send(ClientFrame::Text { text }).await {
                    self.fail(e).await;
                }
            }
            SessionEvent::Shutdown => return false,
            SessionEvent::Scoped { epoch, input } => {
                if epoch != self.epoch || self.context.is_none() {
                    debug!("Discarding stale {}", input.kind());
                } else {
                    self.handle_scoped(input).await;
                }
            }
        }
        true
    }

    async fn connect(&mut self, instruction: Option<String>) -> bool {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            error!("connect called while {:?}, ignoring", self.state);
            return true;
        }

        self.epoch += 1;
        self.error = None;
        self.core.transcript.clear();
        self.core.feedback = None;
        self.state = ConnectionState::Connecting;
        self.publish();
        info!("Connecting (attempt {})", self.epoch);

        let setup = SessionSetup::audio(
            &self.config.model,
            &self.config.voice,
            self.config.instruction_or_default(instruction),
        );
        let epoch = self.epoch;
        let tx = self.tx.clone();
        let on_finished: FinishedCallback = Arc::new(move |id| {
            let _ = tx.send(SessionEvent::Scoped {
                epoch,
                input: SessionInput::PlaybackFinished(id),
            });
        });

        let mut attempt = Box::pin(acquire(
            self.connector.clone(),
            self.devices.clone(),
            self.config.clone(),
            setup,
            on_finished,
        ));

        let outcome = loop {
            tokio::select! {
                result = &mut attempt => break Ok(result),
                event = self.rx.recv() => match event {
                    None | Some(SessionEvent::Shutdown) => break Err(Cancel::Shutdown),
                    Some(SessionEvent::Disconnect) => break Err(Cancel::Disconnect),
                    Some(SessionEvent::Connect { .. }) => error!("connect called while connecting, ignoring"),
                    Some(SessionEvent::SendText(_)) => debug!("Still connecting, dropping text turn"),
                    Some(SessionEvent::Scoped { input, .. }) => debug!("Discarding {} while connecting", input.kind()),
                },
            }
        };
        drop(attempt);

        match outcome {
            Ok(Ok(acquired)) => {
                if let Err(e) = self.install(acquired) {
                    self.fail(e).await;
                }
                true
            }
            Ok(Err(e)) => {
                self.fail(e).await;
                true
            }
            Err(Cancel::Disconnect) => {
                info!("Connection attempt cancelled");
                self.teardown(ConnectionState::Disconnected).await;
                true
            }
            Err(Cancel::Shutdown) => false,
        }
    }

    /// Take ownership of an established connection and start streaming.
    fn install(&mut self, acquired: Acquired) -> Result<()> {
        let Acquired {
            output,
            capture,
            channel,
        } = acquired;
        let OpenChannel { sink, mut events } = channel;
        let epoch = self.epoch;

        self.core.scheduler = Some(PlaybackScheduler::new(output, self.core.clock.clone()));

        let tx = self.tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = matches!(event, ChannelEvent::Close | ChannelEvent::Error { .. });
                let input = SessionInput::Channel(event);
                if tx.send(SessionEvent::Scoped { epoch, input }).is_err() || terminal {
                    return;
                }
            }
            let input = SessionInput::Channel(ChannelEvent::Close);
            let _ = tx.send(SessionEvent::Scoped { epoch, input });
        });

        let tx = self.tx.clone();
        let period = self.config.meter_interval;
        let meter_timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let input = SessionInput::MeterTick;
                if tx.send(SessionEvent::Scoped { epoch, input }).is_err() {
                    break;
                }
            }
        });

        let context = self.context.insert(SessionContext {
            channel: sink,
            capture,
            forwarder,
            meter_timer,
        });

        let tx = self.tx.clone();
        context.capture.start(Box::new(move |buffer| {
            let input = SessionInput::Capture(buffer);
            tx.send(SessionEvent::Scoped { epoch, input }).is_ok()
        }))?;

        self.state = ConnectionState::Connected;
        info!("Session connected");
        Ok(())
    }

    async fn handle_scoped(&mut self, input: SessionInput) {
        match input {
            SessionInput::Capture(buffer) => {
                self.input_tail.push(&buffer.samples);
                let media = resample::frame(&buffer.samples, buffer.sample_rate);
                if media.data.is_empty() {
                    return;
                }
                if let Err(e) = self.send(ClientFrame::Audio { media }).await {
                    self.fail(e).await;
                }
            }
            SessionInput::MeterTick => {
                let output = self.core.output_window();
                self.volume = self.meter.sample(self.input_tail.as_slice(), &output);
            }
            SessionInput::PlaybackFinished(id) => {
                if let Some(scheduler) = self.core.scheduler.as_mut() {
                    scheduler.finished(id);
                }
            }
            SessionInput::Channel(ChannelEvent::Message { data }) => {
                for frame in self.core.handle_server(data) {
                    if let Err(e) = self.send(frame).await {
                        self.fail(e).await;
                        return;
                    }
                }
            }
            SessionInput::Channel(ChannelEvent::Open) => debug!("Ignoring repeated open"),
            SessionInput::Channel(ChannelEvent::Close) => {
                info!("Remote closed the session");
                self.teardown(ConnectionState::Disconnected).await;
            }
            SessionInput::Channel(ChannelEvent::Error { error }) => {
                self.fail(LiveError::ChannelRuntime(error)).await;
            }
        }
    }

    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        match self.context.as_mut() {
            Some(context) => context.channel.send(frame).await,
            None => Ok(()),
        }
    }

    async fn fail(&mut self, e: LiveError) {
        error!("Session failed: {}", e);
        self.error = Some(e.to_string());
        self.teardown(ConnectionState::Error).await;
    }

    /// Release everything the current connection holds and settle in `next`.
    /// Safe to run when nothing is held.
    async fn teardown(&mut self, next: ConnectionState) {
        if let Some(mut context) = self.context.take() {
            context.capture.stop();
            context.meter_timer.abort();
            context.forwarder.abort();
            context.channel.close().await;
            info!("Released microphone, timer and channel");
        }
        if let Some(mut scheduler) = self.core.scheduler.take() {
            scheduler.close();
        }

        self.epoch += 1;
        self.core.transcript.reset_buffers();
        self.core.feedback = None;
        self.meter.reset();
        self.volume = VolumeLevel::default();
        self.input_tail.clear();
        if self.state != next {
            info!("Session state {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    fn publish(&self) {
        let view = SessionView {
            state: self.state,
            error: self.error.clone(),
            volume: self.volume,
            feedback: self.core.feedback.clone(),
            transcripts: self.core.transcript.items().to_vec(),
            subtitle: self.core.transcript.subtitle().to_string(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
