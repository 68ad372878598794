// ============================================================================
// BACKGROUND WORKER
// ============================================================================
// Runs the realtime listener on a dedicated OS thread with its own
// current-thread runtime. The only state shared with callers is the event
// buffer and the listener's atomic connection state. Each start gets a fresh
// connection state, so a detached thread cannot report for its successor.
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buffer::{BufferStats, EventBuffer};
use crate::client::ConnectionParams;
use crate::config::RealtimeConfig;
use crate::error::VigilResult;
use crate::realtime::{EventSink, ListenerState, RealtimeListener, SharedState, StreamConnector};
use crate::types::BufferedEvent;

/// Name of the listener thread.
pub const WORKER_THREAD_NAME: &str = "vigil-realtime";

struct WorkerHandle {
    thread: JoinHandle<()>,
    cancel: CancellationToken,
    exited: Receiver<()>,
    state: SharedState,
}

/// Owns the realtime listener thread.
pub struct BackgroundWorker {
    connector: Arc<dyn StreamConnector>,
    config: RealtimeConfig,
    buffer: Arc<EventBuffer>,
    handle: Mutex<Option<WorkerHandle>>,
}

impl BackgroundWorker {
    pub fn new(connector: Arc<dyn StreamConnector>, config: RealtimeConfig) -> Self {
        let buffer = Arc::new(EventBuffer::new(config.buffer_capacity));
        Self {
            connector,
            config,
            buffer,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the listener thread and return immediately.
    ///
    /// Calling this while the thread is alive logs and does nothing.
    pub fn start(&self, params: ConnectionParams) -> VigilResult<()> {
        let mut guard = self.handle.lock();
        if let Some(existing) = guard.as_ref() {
            if !existing.thread.is_finished() {
                info!(target: "vigil::worker", "Realtime worker already running, ignoring start");
                return Ok(());
            }
        }

        let cancel = CancellationToken::new();
        let state = SharedState::default();
        let (exit_tx, exit_rx) = bounded::<()>(1);

        let buffer = Arc::clone(&self.buffer);
        let sink: EventSink = Arc::new(move |event| buffer.add(event));
        let listener = RealtimeListener::new(Arc::clone(&self.connector), params, sink, state.clone())
            .with_backoff(self.config.reconnect_backoff)
            .with_connect_timeout(self.config.connect_timeout);

        let thread_cancel = cancel.clone();
        let thread = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime.block_on(listener.run(thread_cancel)),
                    Err(e) => {
                        error!(target: "vigil::worker", error = %e, "Failed to build realtime runtime");
                    }
                }
                let _ = exit_tx.send(());
            })?;

        info!(target: "vigil::worker", thread = WORKER_THREAD_NAME, "Realtime worker started");
        *guard = Some(WorkerHandle {
            thread,
            cancel,
            exited: exit_rx,
            state,
        });
        Ok(())
    }

    /// Everything buffered since the last drain. Safe from any thread.
    pub fn drain_events(&self) -> Vec<BufferedEvent> {
        self.buffer.drain()
    }

    /// Cancel the listener, close its connection and wait for the thread.
    ///
    /// A thread that does not exit within the stop timeout is logged and
    /// left to finish on its own.
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };

        handle.cancel.cancel();
        match handle.exited.recv_timeout(self.config.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.thread.join().is_err() {
                    error!(target: "vigil::worker", "Realtime worker thread panicked");
                } else {
                    info!(target: "vigil::worker", "Realtime worker stopped");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(target: "vigil::worker",
                    timeout_ms = self.config.stop_timeout.as_millis() as u64,
                    "Realtime worker did not stop in time, detaching");
            }
        }
    }

    /// True only while the thread is alive and the stream is connected.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |h| !h.thread.is_finished() && h.state.get() == ListenerState::Connected)
    }

    /// Connection state of the current listener; `Disconnected` once stopped.
    pub fn state(&self) -> ListenerState {
        self.handle
            .lock()
            .as_ref()
            .map_or(ListenerState::Disconnected, |h| h.state.get())
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().as_ref() {
            handle.cancel.cancel();
        }
    }
}

impl fmt::Debug for BackgroundWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundWorker")
            .field("state", &self.state())
            .field("buffer", &self.buffer)
            .field("started", &self.handle.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::testing::*;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            reconnect_backoff: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(2),
            ..RealtimeConfig::default()
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_start_drain_stop() {
        let connector = ScriptedConnector::new(vec![Script::Open(vec![events_message(&[
            "EVT_AP_Lost_Contact",
            "EVT_WU_Roam",
        ])])]);
        let worker = BackgroundWorker::new(connector.clone(), config());
        assert!(!worker.is_running());

        worker.start(params()).unwrap();
        wait_until(|| worker.is_running() && worker.buffer_stats().current_len == 2);

        let drained = worker.drain_events();
        assert_eq!(drained.len(), 2);
        assert!(worker.drain_events().is_empty());

        worker.stop();
        assert!(!worker.is_running());
        assert_eq!(worker.state(), ListenerState::Disconnected);
        assert!(connector.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_second_start_is_noop() {
        let connector = ScriptedConnector::new(vec![Script::Open(Vec::new())]);
        let worker = BackgroundWorker::new(connector.clone(), config());

        worker.start(params()).unwrap();
        wait_until(|| worker.is_running());
        worker.start(params()).unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        worker.stop();
    }

    #[test]
    fn test_not_running_while_disconnected() {
        let connector = ScriptedConnector::new(vec![Script::Fail, Script::Fail, Script::Fail]);
        let worker = BackgroundWorker::new(connector.clone(), config());
        worker.start(params()).unwrap();

        wait_until(|| connector.attempts.load(Ordering::SeqCst) >= 2);
        assert!(!worker.is_running());
        worker.stop();
    }

    #[test]
    fn test_stop_without_start_and_restart() {
        let connector = ScriptedConnector::new(vec![Script::Open(Vec::new()), Script::Open(Vec::new())]);
        let worker = BackgroundWorker::new(connector.clone(), config());
        worker.stop();

        worker.start(params()).unwrap();
        wait_until(|| worker.is_running());
        worker.stop();
        assert!(!worker.is_running());

        worker.start(params()).unwrap();
        wait_until(|| worker.is_running());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        worker.stop();
    }

    #[test]
    fn test_stop_detaches_stuck_thread() {
        let connector = ScriptedConnector::new(vec![
            Script::Stall(Duration::from_millis(600)),
            Script::Open(Vec::new()),
        ]);
        let worker = BackgroundWorker::new(
            connector.clone(),
            RealtimeConfig {
                stop_timeout: Duration::from_millis(100),
                ..config()
            },
        );

        worker.start(params()).unwrap();
        wait_until(|| connector.attempts.load(Ordering::SeqCst) == 1);

        let begun = Instant::now();
        worker.stop();
        assert!(begun.elapsed() < Duration::from_millis(500));
        assert!(!worker.is_running());
        assert_eq!(worker.state(), ListenerState::Disconnected);

        worker.start(params()).unwrap();
        wait_until(|| worker.is_running());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_drain_from_many_threads() {
        let connector = ScriptedConnector::new(vec![Script::Open(
            (0..50).map(|i| events_message(&[format!("EVT_{}", i).as_str()])).collect(),
        )]);
        let worker = Arc::new(BackgroundWorker::new(connector, config()));
        worker.start(params()).unwrap();

        let total = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let drainers: Vec<_> = (0..4)
            .map(|_| {
                let worker = Arc::clone(&worker);
                let total = Arc::clone(&total);
                thread::spawn(move || {
                    let deadline = Instant::now() + Duration::from_secs(2);
                    while Instant::now() < deadline && total.load(Ordering::SeqCst) < 50 {
                        total.fetch_add(worker.drain_events().len(), Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                    }
                })
            })
            .collect();
        for d in drainers {
            d.join().unwrap();
        }

        assert_eq!(total.load(Ordering::SeqCst), 50);
        worker.stop();
    }
}
