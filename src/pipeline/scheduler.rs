//! Per-connection single-flight processing scheduler.
//!
//! Windows from one connection are separated strictly in arrival order with
//! at most one engine call in flight. Enqueueing and the idle → active
//! transition happen under one mutex, so two near-simultaneous submissions
//! can never start two drain loops. The engine runs on tokio's blocking
//! pool behind a semaphore shared by all connections.

use crate::engine::EngineHandle;
use crate::error::{RelayError, Result};
use crate::pipeline::post_processor::StemPostProcessor;
use crate::pipeline::types::{AudioWindow, StemResult};
use crate::server::protocol::ServerMessage;
use crate::server::registry::ConnectionId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Semaphore, mpsc};

/// A window together with the engine it was submitted against.
struct Job {
    window: AudioWindow,
    engine: EngineHandle,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Job>,
    active: bool,
    closed: bool,
}

pub struct ProcessingScheduler {
    connection: ConnectionId,
    state: Mutex<QueueState>,
    workers: Arc<Semaphore>,
    post_processor: StemPostProcessor,
    outbound: mpsc::Sender<ServerMessage>,
    max_queued: usize,
    processed: AtomicU64,
}

impl ProcessingScheduler {
    /// Creates a scheduler for one connection.
    ///
    /// # Arguments
    /// * `connection` - Connection id used in log lines
    /// * `workers` - Worker pool shared by every connection
    /// * `post_processor` - Turns engine output into wire stems
    /// * `outbound` - The connection's outbound message channel
    /// * `max_queued` - Windows that may wait behind the one in flight
    pub fn new(
        connection: ConnectionId,
        workers: Arc<Semaphore>,
        post_processor: StemPostProcessor,
        outbound: mpsc::Sender<ServerMessage>,
        max_queued: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            state: Mutex::new(QueueState::default()),
            workers,
            post_processor,
            outbound,
            max_queued,
            processed: AtomicU64::new(0),
        })
    }

    /// Queue a window and start the drain loop if it is idle.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns `QueueFull` when the backlog is at capacity (the window is
    /// dropped) and `Transport` once the scheduler has been cancelled.
    pub fn submit(self: &Arc<Self>, window: AudioWindow, engine: EngineHandle) -> Result<()> {
        let start = {
            let mut state = self.lock();
            if state.closed {
                return Err(RelayError::Transport {
                    message: "connection closed".to_string(),
                });
            }
            if state.queue.len() >= self.max_queued {
                return Err(RelayError::QueueFull {
                    capacity: self.max_queued,
                });
            }
            state.queue.push_back(Job { window, engine });
            !std::mem::replace(&mut state.active, true)
        };

        if start {
            log::trace!("[{}] Starting drain loop", self.connection);
            tokio::spawn(Arc::clone(self).drain());
        }
        Ok(())
    }

    /// Stop processing: drop queued windows and discard any in-flight result.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let dropped = state.queue.len();
        state.queue.clear();
        if dropped > 0 {
            log::debug!(
                "[{}] Abandoned {} queued window(s)",
                self.connection,
                dropped
            );
        }
    }

    /// Windows waiting behind the one in flight.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether a drain loop is running.
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Whether `cancel` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Windows separated successfully so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the next job, or leave the active state when there is none.
    fn next_job(&self) -> Option<Job> {
        let mut state = self.lock();
        let job = if state.closed {
            state.queue.clear();
            None
        } else {
            state.queue.pop_front()
        };
        if job.is_none() {
            state.active = false;
        }
        job
    }

    async fn drain(self: Arc<Self>) {
        while let Some(job) = self.next_job() {
            let sequence = job.window.sequence;
            let result = self.run(job).await;

            if self.is_closed() {
                log::debug!(
                    "[{}] Discarding result of window {} after cancel",
                    self.connection,
                    sequence
                );
                continue;
            }

            match result {
                Ok(stems) => {
                    self.processed.fetch_add(1, Ordering::SeqCst);
                    log::trace!(
                        "[{}] Window {} separated into {} stems",
                        self.connection,
                        sequence,
                        stems.len()
                    );
                    for stem in stems {
                        if self.outbound.send(ServerMessage::from(stem)).await.is_err() {
                            self.cancel();
                            break;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[{}] Window {}: {}", self.connection, sequence, e);
                    if self.outbound.send(ServerMessage::error(&e)).await.is_err() {
                        self.cancel();
                    }
                }
            }
        }
        log::trace!("[{}] Drain loop idle", self.connection);
    }

    async fn run(&self, job: Job) -> Result<Vec<StemResult>> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| RelayError::engine_runtime("worker pool closed"))?;

        let Job { window, engine } = job;
        let post_processor = self.post_processor.clone();
        tokio::task::spawn_blocking(move || {
            let raw = engine.separate(&window)?;
            Ok(post_processor.process(raw, &window))
        })
        .await
        .map_err(|e| RelayError::engine_runtime(format!("engine task panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockSeparator, Separator};
    use crate::pipeline::post_processor::PostProcessorConfig;
    use crate::pipeline::types::StemMap;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn window(sequence: u64) -> AudioWindow {
        AudioWindow::new(vec![0.25, 0.5, -0.25, -0.5], 2, 1000, sequence as f64, sequence)
    }

    fn scheduler(
        max_queued: usize,
        workers: usize,
    ) -> (Arc<ProcessingScheduler>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let post_processor = StemPostProcessor::new(PostProcessorConfig {
            synthesize_stems: false,
        });
        let scheduler =
            ProcessingScheduler::new(1, Arc::new(Semaphore::new(workers)), post_processor, tx, max_queued);
        (scheduler, rx)
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_windows_processed_in_order() {
        let (scheduler, mut rx) = scheduler(8, 2);
        let engine: EngineHandle = Arc::new(MockSeparator::new("mock"));

        for i in 0..3 {
            scheduler.submit(window(i), engine.clone()).unwrap();
        }

        let mut timestamps = Vec::new();
        for _ in 0..6 {
            match recv(&mut rx).await {
                ServerMessage::SeparatedAudio { stem, timestamp, .. } => {
                    timestamps.push((stem, timestamp))
                }
                other => panic!("Expected separated_audio, got {:?}", other),
            }
        }

        assert_eq!(
            timestamps,
            vec![
                ("vocals".to_string(), 0.0),
                ("instrumental".to_string(), 0.0),
                ("vocals".to_string(), 1.0),
                ("instrumental".to_string(), 1.0),
                ("vocals".to_string(), 2.0),
                ("instrumental".to_string(), 2.0),
            ]
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.processed(), 3);
        assert!(!scheduler.is_active());
    }

    #[tokio::test]
    async fn test_queue_full_drops_window() {
        let (scheduler, _rx) = scheduler(2, 1);
        let engine: EngineHandle = Arc::new(MockSeparator::new("mock"));

        // The drain loop has not run yet on the current-thread runtime
        scheduler.submit(window(0), engine.clone()).unwrap();
        scheduler.submit(window(1), engine.clone()).unwrap();
        let result = scheduler.submit(window(2), engine);

        assert!(matches!(result, Err(RelayError::QueueFull { capacity: 2 })));
        assert_eq!(scheduler.queued(), 2);
        assert!(scheduler.is_active());
    }

    #[tokio::test]
    async fn test_engine_failure_reports_and_continues() {
        struct FailsOnSecond;

        impl Separator for FailsOnSecond {
            fn separate(&self, window: &AudioWindow) -> Result<StemMap> {
                if window.sequence == 1 {
                    return Err(RelayError::engine_runtime("bad window"));
                }
                MockSeparator::new("mock").separate(window)
            }

            fn model_name(&self) -> &str {
                "fails-on-second"
            }
        }

        let (scheduler, mut rx) = scheduler(8, 1);
        let engine: EngineHandle = Arc::new(FailsOnSecond);
        for i in 0..3 {
            scheduler.submit(window(i), engine.clone()).unwrap();
        }

        let mut kinds = Vec::new();
        for _ in 0..5 {
            kinds.push(match recv(&mut rx).await {
                ServerMessage::SeparatedAudio { timestamp, .. } => format!("stem@{}", timestamp),
                ServerMessage::Error { error } => error,
                other => panic!("unexpected {:?}", other),
            });
        }

        assert_eq!(
            kinds,
            vec![
                "stem@0",
                "stem@0",
                "Separation failed: bad window",
                "stem@2",
                "stem@2"
            ]
        );
    }

    #[tokio::test]
    async fn test_engine_panic_is_reported() {
        struct Panics;

        impl Separator for Panics {
            fn separate(&self, _window: &AudioWindow) -> Result<StemMap> {
                panic!("engine exploded");
            }

            fn model_name(&self) -> &str {
                "panics"
            }
        }

        let (scheduler, mut rx) = scheduler(8, 1);
        scheduler.submit(window(0), Arc::new(Panics)).unwrap();

        match recv(&mut rx).await {
            ServerMessage::Error { error } => assert!(error.contains("panicked"), "{}", error),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_abandons_queued_windows() {
        let (scheduler, mut rx) = scheduler(8, 1);
        let engine: EngineHandle = Arc::new(MockSeparator::new("mock"));
        for i in 0..4 {
            scheduler.submit(window(i), engine.clone()).unwrap();
        }

        scheduler.cancel();
        assert_eq!(scheduler.queued(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(!scheduler.is_active());
        assert_eq!(scheduler.processed(), 0);

        let result = scheduler.submit(window(9), engine);
        assert!(matches!(result, Err(RelayError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_result() {
        let (scheduler, mut rx) = scheduler(8, 1);
        let engine: EngineHandle =
            Arc::new(MockSeparator::new("mock").with_delay(Duration::from_millis(100)));
        scheduler.submit(window(0), engine).unwrap();

        // Let the drain loop pick the window up
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.queued(), 0);
        scheduler.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.processed(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_under_burst() {
        struct Instrumented {
            concurrent: Arc<AtomicU32>,
            max_concurrent: Arc<AtomicU32>,
        }

        impl Separator for Instrumented {
            fn separate(&self, window: &AudioWindow) -> Result<StemMap> {
                let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_concurrent.fetch_max(current, Ordering::SeqCst);

                std::thread::sleep(Duration::from_millis(20));

                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                MockSeparator::new("mock").separate(window)
            }

            fn model_name(&self) -> &str {
                "instrumented"
            }
        }

        let concurrent = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));
        let engine: EngineHandle = Arc::new(Instrumented {
            concurrent: concurrent.clone(),
            max_concurrent: max_concurrent.clone(),
        });

        // Plenty of workers: only the scheduler limits concurrency
        let (scheduler, mut rx) = scheduler(32, 8);

        let mut submitters = Vec::new();
        for i in 0..8 {
            let scheduler = scheduler.clone();
            let engine = engine.clone();
            submitters.push(tokio::spawn(async move {
                scheduler.submit(window(i), engine).unwrap();
            }));
        }
        for submitter in submitters {
            submitter.await.unwrap();
        }

        for _ in 0..16 {
            recv(&mut rx).await;
        }

        assert_eq!(
            max_concurrent.load(Ordering::SeqCst),
            1,
            "More than one engine call was in flight"
        );
    }
}
