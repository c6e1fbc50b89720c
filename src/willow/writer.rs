//! Filesystem writer pool.
//!
//! Flush and delete jobs are pushed onto one bounded channel and drained by
//! a fixed set of worker tasks, so disk latency is absorbed behind the queue
//! instead of stalling the packet path. A full queue blocks submitters; that
//! backpressure is intentional. Jobs are attempted exactly once: a failed
//! write or delete is logged and counted, and the worker moves on.

use crate::buffer::{FileBuffer, FlushKind, FlushOpts};
use crate::metrics::{Metrics, KIND_DELETE, KIND_FILE};
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

enum Action {
    Write,
    Delete,
}

struct Job {
    buf: Arc<FileBuffer>,
    opts: FlushOpts,
    action: Action,
}

/// Handle for submitting filesystem jobs. Workers stop once every clone of
/// this handle has been dropped and the queue has drained.
#[derive(Clone)]
pub struct WriterPool {
    tx: mpsc::Sender<Job>,
}

impl WriterPool {
    /// Spawn `workers` drain tasks sharing one bounded queue of `capacity`.
    pub fn start(
        workers: usize,
        capacity: usize,
        metrics: Arc<Metrics>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (1..=workers)
            .map(|id| tokio::spawn(drain(id, rx.clone(), metrics.clone())))
            .collect();

        (Self { tx }, handles)
    }

    /// Queue a flush of `buf` to its path. Blocks while the queue is full.
    pub async fn submit_flush(&self, buf: Arc<FileBuffer>, opts: FlushOpts) {
        let _ = self
            .tx
            .send(Job {
                buf,
                opts,
                action: Action::Write,
            })
            .await;
    }

    /// Queue a recursive delete of `buf`'s path. Blocks while the queue is full.
    pub async fn submit_delete(&self, buf: Arc<FileBuffer>, opts: FlushOpts) {
        let _ = self
            .tx
            .send(Job {
                buf,
                opts,
                action: Action::Delete,
            })
            .await;
    }

    /// Jobs currently waiting in the channel.
    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Depth closure for the metrics gauge. Holds only a weak sender so the
    /// probe never keeps the queue open after shutdown.
    pub fn depth_probe(&self) -> impl Fn() -> usize + Send + Sync + 'static {
        let weak = self.tx.downgrade();
        move || {
            weak.upgrade()
                .map(|tx| tx.max_capacity() - tx.capacity())
                .unwrap_or(0)
        }
    }
}

async fn drain(id: usize, rx: Arc<Mutex<mpsc::Receiver<Job>>>, metrics: Arc<Metrics>) {
    loop {
        // Hold the lock only while waiting for one job so the other workers
        // can pick up the next one while this job runs.
        let job = { rx.lock().await.recv().await };

        match job {
            Some(job) => run_job(job, &metrics),
            None => break,
        }
    }

    debug!("filesystem writer {id} exiting");
}

fn run_job(job: Job, metrics: &Metrics) {
    let kind = match job.action {
        Action::Write => KIND_FILE,
        Action::Delete => KIND_DELETE,
    };

    metrics
        .ages
        .with_label_values(&[kind])
        .observe(job.buf.first_write().elapsed().as_secs_f64());

    let started = Instant::now();

    match job.action {
        Action::Delete => {
            if let Err(err) = job.buf.remove_tree() {
                error!("deleting {}: {err}", job.buf.path().display());
                metrics.errors.inc();
            }
        }
        Action::Write => match job.buf.flush(job.opts) {
            Ok(size) => {
                metrics.bytes.inc_by(size as u64);
                metrics.files.inc();
                if job.opts.kind == FlushKind::Expired {
                    metrics.expires.inc();
                }

                info!(
                    "wrote {size} bytes ({} writes) to '{}'",
                    job.buf.writes(),
                    job.buf.path().display()
                );
            }
            Err(err) => {
                error!("writing '{}': {err}", job.buf.path().display());
                metrics.errors.inc();
            }
        },
    }

    metrics
        .durations
        .with_label_values(&[kind])
        .observe(started.elapsed().as_secs_f64());
}
