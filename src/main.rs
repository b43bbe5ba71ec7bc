//! Terminal front end for a live session
//!
//! Talk into the default PulseAudio source. Typed lines are injected as text
//! turns; `/quit` (or Ctrl-C) ends the session.

use anyhow::Result;
use kaiwa_live::device::pulse::PulseBackend;
use kaiwa_live::{ConnectionState, Devices, LiveConfig, LiveSession, SessionView, WsConnector};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting kaiwa-live");

    let config = LiveConfig::from_env();
    let connector = WsConnector::from_config(&config);
    let backend = Arc::new(PulseBackend::new("kaiwa-live", None));
    let devices = Devices {
        capture: backend.clone(),
        output: backend,
    };

    let session = LiveSession::spawn(config, Arc::new(connector), devices);
    let mut view = session.subscribe();
    session.connect(None);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shown = Printed::default();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                shown.print(&current);
                let ended = match current.state {
                    ConnectionState::Error => true,
                    ConnectionState::Disconnected => shown.started,
                    _ => false,
                };
                if ended {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) if line.trim() == "/quit" => session.disconnect(),
                    Some(line) if !line.trim().is_empty() => session.send_text(line.trim()),
                    Some(_) => {}
                    None => {
                        stdin_open = false;
                        session.disconnect();
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                session.disconnect();
            }
        }
    }

    if let Some(error) = session.view().error {
        warn!("Session ended with an error: {}", error);
    }
    Ok(())
}

/// What has already been written to the terminal.
#[derive(Default)]
struct Printed {
    state: Option<ConnectionState>,
    transcripts: usize,
    subtitle: String,
    feedback: Option<kaiwa_live::FeedbackEvent>,
    started: bool,
}

impl Printed {
    fn print(&mut self, view: &SessionView) {
        if self.state != Some(view.state) {
            println!("-- {:?}", view.state);
            if let Some(error) = &view.error {
                println!("!! {}", error);
            }
            self.state = Some(view.state);
            self.started |= matches!(view.state, ConnectionState::Connecting | ConnectionState::Connected);
        }

        if view.transcripts.len() < self.transcripts {
            self.transcripts = 0;
        }
        for item in &view.transcripts[self.transcripts..] {
            println!("[{}] {}", item.role.as_str(), item.text);
        }
        self.transcripts = view.transcripts.len();

        if view.subtitle != self.subtitle {
            if !view.subtitle.is_empty() {
                println!("   ~ {}", view.subtitle);
            }
            self.subtitle = view.subtitle.clone();
        }

        if view.feedback != self.feedback {
            if let Some(feedback) = &view.feedback {
                println!("** {}: {}", feedback.japanese, feedback.advice);
                if let Some(correction) = &feedback.correction {
                    println!("   -> {}", correction);
                }
            }
            self.feedback = view.feedback.clone();
        }
    }
}
