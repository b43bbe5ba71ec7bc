//! In-memory fakes shared by the unit tests

use crate::channel::{ChannelSink, Connector, OpenChannel};
use crate::device::{
    CaptureBuffer, CaptureCallback, CaptureDevice, CaptureStream, FinishedCallback, OutputDevice, OutputSink,
};
use crate::error::{LiveError, Result};
use crate::playback::PlayableBuffer;
use crate::protocol::{ChannelEvent, ClientFrame, SessionSetup};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Schedule { id: u64, start: Duration, frames: usize },
    Stop(u64),
    Close,
}

/// Output sink that records what it was asked to do.
#[derive(Clone, Default)]
pub struct RecordingSink {
    calls: Arc<Mutex<Vec<SinkCall>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl OutputSink for RecordingSink {
    fn schedule(&mut self, id: u64, start: Duration, buffer: Arc<PlayableBuffer>) -> Result<()> {
        self.calls.lock().unwrap().push(SinkCall::Schedule {
            id,
            start,
            frames: buffer.frame_count(),
        });
        Ok(())
    }

    fn stop(&mut self, id: u64) {
        self.calls.lock().unwrap().push(SinkCall::Stop(id));
    }

    fn close(&mut self) {
        self.calls.lock().unwrap().push(SinkCall::Close);
    }
}

/// Output device handing out [`RecordingSink`]s.
#[derive(Clone, Default)]
pub struct FakeOutput {
    pub sink: RecordingSink,
    pub opened: Arc<Mutex<usize>>,
}

impl OutputDevice for FakeOutput {
    fn open(&self, _sample_rate: u32, _on_finished: FinishedCallback) -> Result<Box<dyn OutputSink>> {
        *self.opened.lock().unwrap() += 1;
        Ok(Box::new(self.sink.clone()))
    }
}

/// Microphone whose buffers are pushed by the test.
#[derive(Clone, Default)]
pub struct FakeMicrophone {
    pub deny: bool,
    callback: Arc<Mutex<Option<CaptureCallback>>>,
    pub stops: Arc<Mutex<usize>>,
}

impl FakeMicrophone {
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Deliver a buffer as the device would. Returns false when not started.
    pub fn push(&self, samples: Vec<f32>, sample_rate: u32) -> bool {
        match self.callback.lock().unwrap().as_mut() {
            Some(deliver) => deliver(CaptureBuffer { samples, sample_rate }),
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }
}

struct FakeCaptureStream {
    mic: FakeMicrophone,
}

impl CaptureDevice for FakeMicrophone {
    fn open(&self, _sample_rate: u32, _buffer_frames: usize) -> Result<Box<dyn CaptureStream>> {
        if self.deny {
            return Err(LiveError::Permission("Permission denied".to_string()));
        }
        Ok(Box::new(FakeCaptureStream { mic: self.clone() }))
    }
}

impl CaptureStream for FakeCaptureStream {
    fn start(&mut self, deliver: CaptureCallback) -> Result<()> {
        *self.mic.callback.lock().unwrap() = Some(deliver);
        Ok(())
    }

    fn stop(&mut self) {
        if self.mic.callback.lock().unwrap().take().is_some() {
            *self.mic.stops.lock().unwrap() += 1;
        }
    }
}

/// Connector whose channel is driven by the test through [`FakeRemote`].
#[derive(Clone)]
pub struct FakeConnector {
    pub configured: bool,
    pub refuse: Option<String>,
    /// Delay before the channel opens, to exercise cancellation
    pub open_delay: Duration,
    remote: Arc<Mutex<Option<FakeRemote>>>,
    pub setups: Arc<Mutex<Vec<SessionSetup>>>,
}

/// Test-side end of an open fake channel.
#[derive(Clone)]
pub struct FakeRemote {
    pub events: mpsc::Sender<ChannelEvent>,
    pub sent: Arc<Mutex<Vec<ClientFrame>>>,
    pub closes: Arc<Mutex<usize>>,
}

impl FakeRemote {
    pub fn sent(&self) -> Vec<ClientFrame> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self {
            configured: true,
            refuse: None,
            open_delay: Duration::ZERO,
            remote: Arc::new(Mutex::new(None)),
            setups: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl FakeConnector {
    /// Connector that fails the credential check.
    pub fn not_configured() -> Self {
        Self {
            configured: false,
            ..Self::default()
        }
    }

    /// Connector whose channel never opens.
    pub fn refusing(reason: &str) -> Self {
        Self {
            refuse: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn remote(&self) -> Option<FakeRemote> {
        self.remote.lock().unwrap().clone()
    }
}

struct FakeChannelSink {
    sent: Arc<Mutex<Vec<ClientFrame>>>,
    closes: Arc<Mutex<usize>>,
}

#[async_trait]
impl ChannelSink for FakeChannelSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        *self.closes.lock().unwrap() += 1;
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn check_configured(&self) -> Result<()> {
        if self.configured {
            Ok(())
        } else {
            Err(LiveError::Configuration("API Key not configured".to_string()))
        }
    }

    async fn open(&self, setup: SessionSetup) -> Result<OpenChannel> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if let Some(reason) = &self.refuse {
            return Err(LiveError::ChannelOpen(reason.clone()));
        }
        self.setups.lock().unwrap().push(setup);

        let (tx, rx) = mpsc::channel(64);
        let remote = FakeRemote {
            events: tx,
            sent: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(Mutex::new(0)),
        };
        let sink = FakeChannelSink {
            sent: remote.sent.clone(),
            closes: remote.closes.clone(),
        };
        *self.remote.lock().unwrap() = Some(remote);

        Ok(OpenChannel {
            sink: Box::new(sink),
            events: rx,
        })
    }
}
