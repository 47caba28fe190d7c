use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use stockroom_events::{EventBus, EventEnvelope, Subscription};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// Messages already queued on the subscription are drained first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!("projection worker thread panicked");
            }
        }
    }
}

/// Projection worker loop.
///
/// - Subscribes to the event bus at spawn time (nothing published afterwards is missed)
/// - Optionally keeps only envelopes of one aggregate type
/// - Feeds an idempotent handler; handler errors are logged, not fatal
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn a worker thread that processes envelopes from the bus subscription.
    pub fn spawn<B, H, E>(
        name: &'static str,
        bus: &B,
        aggregate_type: Option<&'static str>,
        mut handler: H,
    ) -> std::io::Result<WorkerHandle>
    where
        B: EventBus<EventEnvelope<JsonValue>>,
        H: FnMut(EventEnvelope<JsonValue>) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, aggregate_type, &mut handler))?;

        info!(worker = name, ?aggregate_type, "projection worker started");
        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<H, E>(
    name: &'static str,
    sub: Subscription<EventEnvelope<JsonValue>>,
    shutdown_rx: mpsc::Receiver<()>,
    aggregate_type: Option<&'static str>,
    handler: &mut H,
) where
    H: FnMut(EventEnvelope<JsonValue>) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(50);
    let mut stopping = false;

    loop {
        if !stopping && shutdown_rx.try_recv().is_ok() {
            stopping = true;
        }

        let next = if stopping {
            // Drain what is already queued, then exit.
            match sub.try_recv() {
                Ok(msg) => msg,
                Err(_) => break,
            }
        } else {
            match sub.recv_timeout(tick) {
                Ok(msg) => msg,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        };

        if let Some(wanted) = aggregate_type {
            if next.aggregate_type() != wanted {
                continue;
            }
        }

        let (aggregate_id, seq) = (next.aggregate_id(), next.sequence_number());
        match handler(next) {
            Ok(()) => debug!(worker = name, %aggregate_id, seq, "envelope projected"),
            Err(err) => {
                warn!(worker = name, %aggregate_id, seq, error = ?err, "projection worker handler failed")
            }
        }
    }

    info!(worker = name, "projection worker stopped");
}
