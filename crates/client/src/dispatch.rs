//! Dispatch pipeline
//!
//! A bounded queue plus one consumer task that runs user callbacks off the
//! read path. In synchronous mode there is no queue and the callback runs
//! inline on the submitting task. Either way each callback runs inside
//! `catch_unwind`, so a panicking handler is reported and never takes down
//! the consumer or the read loop.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::books::BookEvent;
use crate::frame::PushFrame;
use crate::metrics::ClientMetrics;
use crate::shutdown;
use crate::topics::TopicKind;

const DROP_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// What to do when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Discard the task and count it
    #[default]
    Drop,
    /// Wait for space or shutdown; stalls the read loop while waiting
    Block,
    /// Report overload so the connection gets closed
    Disconnect,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{pipeline} queue full at {capacity} tasks")]
    Overloaded {
        pipeline: &'static str,
        capacity: usize,
    },

    #[error("{pipeline} pipeline is closed")]
    Closed { pipeline: &'static str },

    #[error("{topic} callback panicked: {message}")]
    CallbackPanicked { topic: String, message: String },
}

/// Unit of work carried by a pipeline.
pub trait Task: Send + 'static {
    /// Topic label used when reporting a panicking callback.
    fn topic(&self) -> &'static str;
}

/// A raw inbound text frame.
#[derive(Debug, Clone)]
pub struct RawTask(pub String);

impl Task for RawTask {
    fn topic(&self) -> &'static str {
        "raw"
    }
}

/// A classified data push or a verified book state.
#[derive(Debug, Clone)]
pub enum TypedTask {
    Push(TopicKind, PushFrame),
    Book(BookEvent),
}

impl Task for TypedTask {
    fn topic(&self) -> &'static str {
        match self {
            TypedTask::Push(kind, _) => kind.label(),
            TypedTask::Book(_) => TopicKind::OrderBook.label(),
        }
    }
}

pub type Runner<T> = Arc<dyn Fn(T) + Send + Sync>;
pub type PanicReporter = Arc<dyn Fn(DispatchError) + Send + Sync>;

/// Pipeline settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    pub synchronous: bool,
}

struct Context<T> {
    name: &'static str,
    runner: Runner<T>,
    on_panic: PanicReporter,
    metrics: ClientMetrics,
}

impl<T: Task> Context<T> {
    fn invoke(&self, task: T) {
        let topic = task.topic();
        let runner = &self.runner;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| runner(task))) {
            let message = panic_message(payload.as_ref());
            error!(pipeline = self.name, topic, message = %message, "callback panicked");
            self.metrics.inc_callback_panic(topic);
            let report = DispatchError::CallbackPanicked {
                topic: topic.to_string(),
                message,
            };
            let on_panic = &self.on_panic;
            if catch_unwind(AssertUnwindSafe(|| on_panic(report))).is_err() {
                error!(pipeline = self.name, topic, "panic reporter panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct Pipeline<T: Task> {
    context: Arc<Context<T>>,
    options: PipelineOptions,
    queue: Option<mpsc::Sender<T>>,
    worker: Option<JoinHandle<()>>,
    dropped: AtomicU64,
    last_drop_warn: Mutex<Option<Instant>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Task> Pipeline<T> {
    /// Build a pipeline. Outside synchronous mode this spawns the consumer
    /// task, so it must be called from within a tokio runtime.
    pub fn new(
        name: &'static str,
        options: PipelineOptions,
        runner: Runner<T>,
        on_panic: PanicReporter,
        metrics: ClientMetrics,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let context = Arc::new(Context {
            name,
            runner,
            on_panic,
            metrics,
        });

        let (queue, worker) = if options.synchronous {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel(options.capacity.max(1));
            let worker = tokio::spawn(consume(Arc::clone(&context), rx, shutdown_rx.clone()));
            (Some(tx), Some(worker))
        };

        Self {
            context,
            options,
            queue,
            worker,
            dropped: AtomicU64::new(0),
            last_drop_warn: Mutex::new(None),
            shutdown_rx,
        }
    }

    pub fn name(&self) -> &'static str {
        self.context.name
    }

    /// Tasks discarded under the drop policy since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Hand a task to the consumer, or run it inline in synchronous mode.
    pub async fn submit(&self, task: T) -> Result<(), DispatchError> {
        let Some(queue) = &self.queue else {
            self.context.invoke(task);
            return Ok(());
        };

        let task = match queue.try_send(task) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(self.closed()),
            Err(mpsc::error::TrySendError::Full(task)) => task,
        };

        match self.options.overflow {
            OverflowPolicy::Drop => {
                self.record_drop();
                Ok(())
            }
            OverflowPolicy::Block => {
                let mut shutdown_rx = self.shutdown_rx.clone();
                tokio::select! {
                    sent = queue.send(task) => sent.map_err(|_| self.closed()),
                    _ = shutdown::cancelled(&mut shutdown_rx) => Err(self.closed()),
                }
            }
            OverflowPolicy::Disconnect => Err(DispatchError::Overloaded {
                pipeline: self.context.name,
                capacity: self.options.capacity,
            }),
        }
    }

    fn closed(&self) -> DispatchError {
        DispatchError::Closed {
            pipeline: self.context.name,
        }
    }

    fn record_drop(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        self.context.metrics.inc_dropped(self.context.name);

        let mut last = self
            .last_drop_warn
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let due = last.map_or(true, |at| at.elapsed() >= DROP_WARN_INTERVAL);
        if due {
            *last = Some(Instant::now());
            warn!(
                pipeline = self.context.name,
                capacity = self.options.capacity,
                dropped_total = total,
                "dispatch queue full, dropping tasks"
            );
        }
    }

    /// Stop accepting tasks and wait for the consumer to drain what is queued.
    pub async fn close(mut self) {
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(pipeline = self.context.name, error = %e, "dispatch worker failed");
            }
        }
    }
}

async fn consume<T: Task>(
    context: Arc<Context<T>>,
    mut rx: mpsc::Receiver<T>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            task = rx.recv() => match task {
                Some(task) => context.invoke(task),
                None => break,
            },
            _ = shutdown::cancelled(&mut shutdown_rx) => break,
        }
    }
    debug!(pipeline = context.name, "dispatch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[derive(Debug)]
    struct Job(u32);

    impl Task for Job {
        fn topic(&self) -> &'static str {
            "job"
        }
    }

    fn options(capacity: usize, overflow: OverflowPolicy, synchronous: bool) -> PipelineOptions {
        PipelineOptions {
            capacity,
            overflow,
            synchronous,
        }
    }

    fn silent() -> PanicReporter {
        Arc::new(|_| {})
    }

    /// Runner that reports each job it starts and then waits for a permit.
    fn gated() -> (
        Runner<Job>,
        std_mpsc::Receiver<u32>,
        std_mpsc::Sender<()>,
    ) {
        let (started_tx, started_rx) = std_mpsc::channel();
        let (permit_tx, permit_rx) = std_mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let permit_rx = Mutex::new(permit_rx);
        let runner: Runner<Job> = Arc::new(move |job: Job| {
            let _ = started_tx.lock().unwrap().send(job.0);
            let _ = permit_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
        });
        (runner, started_rx, permit_tx)
    }

    #[tokio::test]
    async fn test_synchronous_runs_inline() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (_tx, rx) = watch::channel(false);
        let pipeline = Pipeline::new(
            "typed",
            options(1, OverflowPolicy::Drop, true),
            Arc::new(move |job: Job| sink.lock().unwrap().push(job.0)),
            silent(),
            ClientMetrics::new("dispatch-test-inline"),
            rx,
        );

        for i in 0..5 {
            pipeline.submit(Job(i)).await.unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_policy_never_blocks() {
        let (runner, started, permits) = gated();
        let (_tx, rx) = watch::channel(false);
        let pipeline = Pipeline::new(
            "typed",
            options(1, OverflowPolicy::Drop, false),
            runner,
            silent(),
            ClientMetrics::new("dispatch-test-drop"),
            rx,
        );

        pipeline.submit(Job(1)).await.unwrap();
        assert_eq!(started.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        pipeline.submit(Job(2)).await.unwrap();

        for i in 3..10 {
            tokio::time::timeout(Duration::from_millis(100), pipeline.submit(Job(i)))
                .await
                .expect("drop policy must not block")
                .unwrap();
        }
        assert_eq!(pipeline.dropped(), 7);

        permits.send(()).unwrap();
        permits.send(()).unwrap();
        assert_eq!(started.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_policy_waits_for_space() {
        let (runner, started, permits) = gated();
        let (_tx, rx) = watch::channel(false);
        let pipeline = Arc::new(Pipeline::new(
            "typed",
            options(1, OverflowPolicy::Block, false),
            runner,
            silent(),
            ClientMetrics::new("dispatch-test-block"),
            rx,
        ));

        pipeline.submit(Job(1)).await.unwrap();
        assert_eq!(started.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        pipeline.submit(Job(2)).await.unwrap();

        let blocked = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.submit(Job(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        permits.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(pipeline.dropped(), 0);

        permits.send(()).unwrap();
        permits.send(()).unwrap();
        assert_eq!(started.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
        assert_eq!(started.recv_timeout(Duration::from_secs(1)).unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_policy_released_by_shutdown() {
        let (runner, started, permits) = gated();
        let (tx, rx) = watch::channel(false);
        let pipeline = Pipeline::new(
            "typed",
            options(1, OverflowPolicy::Block, false),
            runner,
            silent(),
            ClientMetrics::new("dispatch-test-block-shutdown"),
            rx,
        );

        pipeline.submit(Job(1)).await.unwrap();
        assert_eq!(started.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        pipeline.submit(Job(2)).await.unwrap();

        let submit = pipeline.submit(Job(3));
        tokio::pin!(submit);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut submit)
            .await
            .is_err());

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), submit)
            .await
            .unwrap();
        assert_eq!(result, Err(DispatchError::Closed { pipeline: "typed" }));
        permits.send(()).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_policy_reports_overload() {
        let (runner, started, permits) = gated();
        let (_tx, rx) = watch::channel(false);
        let pipeline = Pipeline::new(
            "raw",
            options(1, OverflowPolicy::Disconnect, false),
            runner,
            silent(),
            ClientMetrics::new("dispatch-test-disconnect"),
            rx,
        );

        pipeline.submit(Job(1)).await.unwrap();
        assert_eq!(started.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        pipeline.submit(Job(2)).await.unwrap();

        assert_eq!(
            pipeline.submit(Job(3)).await,
            Err(DispatchError::Overloaded {
                pipeline: "raw",
                capacity: 1
            })
        );
        permits.send(()).unwrap();
        permits.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let ran = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ran);
        let (_tx, rx) = watch::channel(false);

        let pipeline = Pipeline::new(
            "typed",
            options(8, OverflowPolicy::Drop, false),
            Arc::new(move |job: Job| {
                if job.0 == 1 {
                    panic!("boom");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |err| sink.lock().unwrap().push(err)),
            ClientMetrics::new("dispatch-test-panic"),
            rx,
        );

        pipeline.submit(Job(0)).await.unwrap();
        pipeline.submit(Job(1)).await.unwrap();
        pipeline.submit(Job(2)).await.unwrap();
        pipeline.close().await;

        assert_eq!(ran.load(Ordering::SeqCst), 2);
        let reports = reports.lock().unwrap();
        assert_eq!(
            *reports,
            vec![DispatchError::CallbackPanicked {
                topic: "job".to_string(),
                message: "boom".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (_tx, rx) = watch::channel(false);
        let pipeline = Pipeline::new(
            "raw",
            options(64, OverflowPolicy::Block, false),
            Arc::new(move |job: Job| sink.lock().unwrap().push(job.0)),
            silent(),
            ClientMetrics::new("dispatch-test-fifo"),
            rx,
        );
        for i in 0..32 {
            pipeline.submit(Job(i)).await.unwrap();
        }
        pipeline.close().await;
        assert_eq!(*seen.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }
}
