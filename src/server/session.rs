//! Per-connection protocol handler.
//!
//! ```text
//! Connected ──configure ok──▶ Configured ──configure ok/err──▶ Configured
//!     │  └─configure err─▶ Connected                 │
//!     └──────────────── close ──────▶ Closed ◀───────┘
//! ```
//!
//! A failed reconfigure never drops a session back to `Connected`: the
//! previous engine stays live and the session stays `Configured`.
//!
//! Audio is only accepted once an engine is configured. Every handler
//! error is turned into an `error` message at [`Session::handle_text`];
//! none of them close the connection.

use crate::engine::{EngineFactory, EngineHandle, EngineOptions};
use crate::error::{RelayError, Result};
use crate::pipeline::scheduler::ProcessingScheduler;
use crate::pipeline::windower::{SampleWindower, WindowerConfig};
use crate::server::protocol::{ClientMessage, ServerMessage};
use crate::server::registry::ConnectionId;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, no engine yet
    Connected,
    /// Engine configured, audio accepted
    Configured,
    /// Terminal
    Closed,
}

pub struct Session {
    id: ConnectionId,
    state: SessionState,
    engine: Option<EngineHandle>,
    windower: SampleWindower,
    scheduler: Arc<ProcessingScheduler>,
    factory: Arc<dyn EngineFactory>,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        factory: Arc<dyn EngineFactory>,
        scheduler: Arc<ProcessingScheduler>,
        windower: WindowerConfig,
    ) -> Self {
        Self {
            id,
            state: SessionState::Connected,
            engine: None,
            windower: SampleWindower::with_config(windower),
            scheduler,
            factory,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The engine new windows are submitted against.
    pub fn engine(&self) -> Option<&EngineHandle> {
        self.engine.as_ref()
    }

    /// Samples held back waiting for a full window.
    pub fn buffered_samples(&self) -> usize {
        self.windower.buffered_samples()
    }

    /// Decode and handle one text frame, returning the immediate replies.
    ///
    /// Separated stems are not returned here; they arrive later through
    /// the scheduler's outbound channel.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        let result = match ClientMessage::from_json(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(reply) => reply.into_iter().collect(),
            Err(e) => {
                log::warn!("[{}] {}", self.id, e);
                vec![ServerMessage::error(&e)]
            }
        }
    }

    /// Handle one decoded message.
    ///
    /// # Errors
    /// Any error is meant to be reported to the client; the session stays
    /// usable afterwards.
    pub async fn handle(&mut self, message: ClientMessage) -> Result<Option<ServerMessage>> {
        if self.state == SessionState::Closed {
            return Err(RelayError::Transport {
                message: "session closed".to_string(),
            });
        }
        match message {
            ClientMessage::Configure { config } => self.configure(&config).await.map(Some),
            ClientMessage::AudioData {
                data,
                sample_rate,
                channels,
                timestamp,
            } => {
                self.audio(&data, sample_rate, channels, timestamp)?;
                Ok(None)
            }
        }
    }

    async fn configure(&mut self, options: &EngineOptions) -> Result<ServerMessage> {
        log::info!(
            "[{}] Configuring engine: model={}, real_time={}, aggressiveness={}",
            self.id,
            options.model.as_deref().unwrap_or("<default>"),
            options.real_time,
            options.aggressiveness
        );

        let engine = self.factory.configure(options).await.inspect_err(|e| {
            if self.engine.is_some() {
                log::warn!("[{}] {}; keeping previous engine", self.id, e);
            }
        })?;

        let reply = ServerMessage::configured(engine.model_name(), engine.bus_names());
        log::info!("[{}] Engine '{}' ready", self.id, engine.model_name());
        self.engine = Some(engine);
        self.state = SessionState::Configured;
        Ok(reply)
    }

    fn audio(&mut self, data: &[f32], sample_rate: u32, channels: u16, timestamp: f64) -> Result<()> {
        let Some(engine) = self.engine.clone() else {
            return Err(RelayError::NoEngineConfigured);
        };
        if data.is_empty() {
            return Err(RelayError::MalformedInput {
                message: "No audio data in payload".to_string(),
            });
        }

        let windows = self.windower.ingest(data, sample_rate, channels, timestamp)?;

        let mut first_error = None;
        let mut dropped = 0usize;
        for window in windows {
            if let Err(e) = self.scheduler.submit(window, engine.clone()) {
                dropped += 1;
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => {
                log::warn!("[{}] Dropped {} window(s): {}", self.id, dropped, e);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Enter the terminal state and abandon queued windows.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            self.engine = None;
            self.windower.reset();
            self.scheduler.cancel();
        }
    }
}
