//! Buffered batch writer.
//!
//! Producers push items through a cheap [`BatchHandle`]; a single worker task
//! accumulates them and hands full batches to a [`BatchSink`]. Used for the
//! message log and for the latency exporters.

mod file;
mod http;

pub use file::FileLineSink;
pub use http::HttpJsonSink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SinkError;

pub const DEFAULT_BATCH_SIZE: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Destination of flushed batches. A failed flush drops the batch.
#[async_trait]
pub trait BatchSink<T>: Send + 'static {
    async fn flush(&mut self, batch: &[T]) -> Result<(), SinkError>;
}

/// Producer side of a [`BatchWriter`].
pub struct BatchHandle<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for BatchHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> BatchHandle<T> {
    /// Never blocks. Items submitted after the worker stopped are dropped.
    pub fn submit(&self, item: T) {
        if self.tx.send(item).is_err() {
            debug!("batch writer closed, item dropped");
        }
    }
}

struct Pending<T> {
    rx: mpsc::UnboundedReceiver<T>,
    sink: Box<dyn BatchSink<T>>,
}

pub struct BatchWriter<T> {
    name: String,
    batch_size: usize,
    enabled: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<T>,
    pending: Mutex<Option<Pending<T>>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T> BatchWriter<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, sink: impl BatchSink<T>, batch_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            batch_size: batch_size.max(1),
            enabled: Arc::new(AtomicBool::new(true)),
            tx,
            pending: Mutex::new(Some(Pending {
                rx,
                sink: Box::new(sink),
            })),
            shutdown,
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> BatchHandle<T> {
        BatchHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn submit(&self, item: T) {
        self.handle().submit(item);
    }

    /// When disabled, items are still drained but flushes write nothing.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Spawns the worker. Only the first call has an effect.
    pub fn start(&self) {
        let Some(Pending { rx, sink }) = self.pending.lock().take() else {
            warn!("batch writer {} already started", self.name);
            return;
        };

        let worker = Worker {
            name: self.name.clone(),
            batch_size: self.batch_size,
            enabled: Arc::clone(&self.enabled),
            sink,
            batch: Vec::with_capacity(self.batch_size),
        };
        let handle = tokio::spawn(worker.run(rx, self.shutdown.subscribe()));
        *self.worker.lock() = Some(handle);
        info!("batch writer {} started (batch size {})", self.name, self.batch_size);
    }

    /// Signals the worker, which drains what is queued and flushes the
    /// remainder. Waits at most `timeout` for it to finish.
    pub async fn stop(&self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        let Some(handle) = self.worker.lock().take() else {
            self.drain_unstarted(timeout).await;
            return;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => info!("batch writer {} stopped", self.name),
            Ok(Err(e)) => error!("batch writer {} worker failed: {}", self.name, e),
            Err(_) => warn!(
                "batch writer {} did not drain within {:?}",
                self.name, timeout
            ),
        }
    }
}

impl<T> BatchWriter<T>
where
    T: Send + Sync + 'static,
{
    /// Flushes what was submitted to a writer that never started.
    async fn drain_unstarted(&self, timeout: Duration) {
        let pending = self.pending.lock().take();
        let Some(Pending { mut rx, sink }) = pending else {
            return;
        };
        let worker = Worker {
            name: self.name.clone(),
            batch_size: self.batch_size,
            enabled: Arc::clone(&self.enabled),
            sink,
            batch: Vec::new(),
        };
        if tokio::time::timeout(timeout, worker.drain(&mut rx)).await.is_err() {
            warn!(
                "batch writer {} did not drain within {:?}",
                self.name, timeout
            );
        }
    }
}

struct Worker<T> {
    name: String,
    batch_size: usize,
    enabled: Arc<AtomicBool>,
    sink: Box<dyn BatchSink<T>>,
    batch: Vec<T>,
}

impl<T> Worker<T>
where
    T: Send + Sync + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<T>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                polled = tokio::time::timeout(POLL_INTERVAL, rx.recv()) => match polled {
                    Ok(Some(item)) => {
                        self.batch.push(item);
                        if self.batch.len() >= self.batch_size {
                            let batch = std::mem::take(&mut self.batch);
                            self.flush(&batch).await;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => continue,
                },
            }
        }

        self.drain(&mut rx).await;
    }

    /// Flushes the pending batch plus everything queued, in `batch_size` chunks.
    async fn drain(mut self, rx: &mut mpsc::UnboundedReceiver<T>) {
        while let Ok(item) = rx.try_recv() {
            self.batch.push(item);
        }
        let remainder = std::mem::take(&mut self.batch);
        for chunk in remainder.chunks(self.batch_size) {
            self.flush(chunk).await;
        }
        debug!("batch writer {} drained", self.name);
    }

    async fn flush(&mut self, batch: &[T]) {
        if batch.is_empty() || !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.sink.flush(batch).await {
            error!(
                "batch writer {} dropped {} items: {}",
                self.name,
                batch.len(),
                e
            );
        }
    }
}
