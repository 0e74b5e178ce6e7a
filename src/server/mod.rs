//! WebSocket relay server.
//!
//! One reader task and one writer task per connection. The reader decodes
//! text frames and drives the [`Session`]; the writer drains the bounded
//! outbound channel that both the session replies and the scheduler's
//! stems flow through.

pub mod protocol;
pub mod registry;
pub mod session;

pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{ConnectionEntry, ConnectionId, ConnectionInfo, ConnectionRegistry};
pub use session::{Session, SessionState};

use crate::config::Config;
use crate::engine::{BuiltinEngineFactory, EngineFactory};
use crate::error::{RelayError, Result};
use crate::pipeline::post_processor::{PostProcessorConfig, StemPostProcessor};
use crate::pipeline::scheduler::ProcessingScheduler;
use crate::pipeline::windower::WindowerConfig;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// How long a closing connection may spend flushing queued replies.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// State for managing server shutdown.
#[derive(Debug, Clone)]
struct ServerState {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerState {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown: Arc::new(tx),
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Handle that stops a running server from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    state: ServerState,
}

impl ShutdownHandle {
    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.state.set_shutdown();
    }
}

/// Everything a connection task needs, cheap to clone.
#[derive(Clone)]
struct Shared {
    factory: Arc<dyn EngineFactory>,
    registry: ConnectionRegistry,
    workers: Arc<Semaphore>,
    post_processor: StemPostProcessor,
    windower: WindowerConfig,
    outbound_buffer: usize,
    max_queued_windows: usize,
}

/// WebSocket server relaying audio windows to separation engines.
pub struct RelayServer {
    host: String,
    port: u16,
    shared: Shared,
    state: ServerState,
}

impl RelayServer {
    /// Create a server using the built-in engines.
    pub fn new(config: &Config) -> Self {
        let factory = Arc::new(BuiltinEngineFactory::new(&config.engine.default_model));
        Self::with_factory(config, factory)
    }

    /// Create a server with a custom engine factory.
    pub fn with_factory(config: &Config, factory: Arc<dyn EngineFactory>) -> Self {
        let shared = Shared {
            factory,
            registry: ConnectionRegistry::new(),
            workers: Arc::new(Semaphore::new(config.engine.workers.max(1))),
            post_processor: StemPostProcessor::new(PostProcessorConfig {
                synthesize_stems: config.engine.synthesize_stems,
            }),
            windower: WindowerConfig {
                window_ms: config.window.duration_ms,
                max_payload_samples: config.window.max_payload_samples,
                max_sample_rate: config.window.max_sample_rate,
                max_channels: config.window.max_channels,
            },
            outbound_buffer: config.server.outbound_buffer.max(1),
            max_queued_windows: config.window.max_queued_windows,
        };
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            shared,
            state: ServerState::new(),
        }
    }

    /// Live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: self.state.clone(),
        }
    }

    /// Bind the configured address.
    ///
    /// # Errors
    /// Returns `Transport` if the address cannot be bound.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::Transport {
                message: format!("Failed to bind {}: {}", addr, e),
            })
    }

    /// Accept connections on `listener` until shutdown is requested.
    ///
    /// # Errors
    /// Returns `Transport` if accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Listening on ws://{}", addr);
        }

        loop {
            if self.state.is_shutdown() {
                break;
            }

            // Accept with timeout to check for shutdown
            let accept_result = tokio::time::timeout(ACCEPT_POLL, listener.accept()).await;

            match accept_result {
                Ok(Ok((stream, peer))) => {
                    let shared = self.shared.clone();
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, shared, state).await {
                            log::warn!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Ok(Err(e)) => {
                    return Err(RelayError::Transport {
                        message: format!("Failed to accept connection: {}", e),
                    });
                }
                Err(_) => continue,
            }
        }

        let closed = self.shared.registry.close_all().await;
        log::info!("Server stopped ({} connection(s) closed)", closed);
        Ok(())
    }

    /// Bind and serve until SIGINT or SIGTERM.
    ///
    /// # Returns
    /// Ok(()) on graceful shutdown, error otherwise
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        let handle = self.shutdown_handle();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received SIGINT, shutting down...");
                }
                res = wait_for_sigterm() => {
                    if let Err(e) = res {
                        log::error!("Error setting up signal handler: {}", e);
                    }
                    log::info!("Received SIGTERM, shutting down...");
                }
            }
            handle.shutdown();
        });

        self.serve(listener).await
    }
}

/// Wait for SIGTERM signal (used by systemd).
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| RelayError::Other(format!("Failed to register SIGTERM handler: {}", e)))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await
}

/// Serve one WebSocket connection until it closes or the server stops.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Shared,
    state: ServerState,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| RelayError::Transport {
            message: format!("WebSocket handshake failed: {}", e),
        })?;
    let (mut write, mut read) = ws.split();

    let id = shared.registry.next_id();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(shared.outbound_buffer);
    let scheduler = ProcessingScheduler::new(
        id,
        Arc::clone(&shared.workers),
        shared.post_processor.clone(),
        tx.clone(),
        shared.max_queued_windows,
    );
    shared
        .registry
        .add(Arc::new(ConnectionEntry::new(id, peer, Arc::clone(&scheduler))))
        .await;
    log::info!(
        "[{}] Client connected from {} ({} connected)",
        id,
        peer,
        shared.registry.len().await
    );

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    log::error!("[{}] Failed to serialize message: {}", id, e);
                    continue;
                }
            };
            if write.send(Message::text(json)).await.is_err() {
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    let mut session = Session::new(
        id,
        Arc::clone(&shared.factory),
        scheduler,
        shared.windower.clone(),
    );
    let mut shutdown = state.subscribe();

    if !state.is_shutdown() {
        'frames: loop {
            let frame = tokio::select! {
                frame = read.next() => frame,
                _ = shutdown.changed() => {
                    log::debug!("[{}] Closing for shutdown", id);
                    break;
                }
            };

            let replies = match frame {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(Message::Binary(_))) => {
                    vec![ServerMessage::error("Binary frames are not supported")]
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue, // ping/pong answered by the transport
                Some(Err(e)) => {
                    log::debug!("[{}] WebSocket error: {}", id, e);
                    break;
                }
            };

            for reply in replies {
                if tx.send(reply).await.is_err() {
                    break 'frames;
                }
            }
        }
    }

    session.close();
    let entry = shared.registry.remove(id).await;
    drop(session);
    drop(tx);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    let connected_for = entry.map(|e| e.age()).unwrap_or_default();
    log::info!(
        "[{}] Client disconnected after {:.1}s ({} connected)",
        id,
        connected_for.as_secs_f64(),
        shared.registry.len().await
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(config: Config) -> (SocketAddr, ShutdownHandle, ConnectionRegistry) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(&config);
        let handle = server.shutdown_handle();
        let registry = server.registry().clone();
        tokio::spawn(async move { server.serve(listener).await });
        (addr, handle, registry)
    }

    #[tokio::test]
    async fn test_bind_reports_transport_error() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.server.port = occupied.local_addr().unwrap().port();

        let result = RelayServer::new(&config).bind().await;
        assert!(matches!(result, Err(RelayError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_connections_are_registered_and_removed() {
        let (addr, handle, registry) = start(Config::default()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.len().await, 1);

        ws.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.is_empty().await);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_binary_frame_gets_error() {
        let (addr, handle, _registry) = start(Config::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();

        ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let message = ServerMessage::from_json(reply.to_text().unwrap()).unwrap();
        assert_eq!(
            message,
            ServerMessage::error("Binary frames are not supported")
        );

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = RelayServer::new(&Config::default());
        let handle = server.shutdown_handle();
        let task = tokio::spawn(async move { server.serve(listener).await });

        handle.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
