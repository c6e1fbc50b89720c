//! The memory hole: single-owner custodian of the path -> buffer map.
//!
//! One task owns the map outright. Everything else talks to it through a
//! command channel, with replies carried on oneshot channels embedded in the
//! command, so reads, writes, and the periodic expiry sweep all observe one
//! total order and no locking is needed around the map itself.
//!
//! The same task runs the sweep ticker: any buffer older than the flush
//! interval is handed to the [`WriterPool`] and removed. Expiry keys off the
//! buffer's creation time, not its last write, so a path that is appended to
//! continuously still flushes within one flush interval of showing up.
//!
//! Dropping every [`Willow`] handle is the shutdown signal. Before the task
//! exits it force-flushes whatever is left in the map; the caller must keep
//! the writer pool running until the task has been awaited, or those final
//! jobs would be lost.

mod writer;

pub use writer::WriterPool;

use crate::buffer::{FileBuffer, FlushKind, FlushOpts};
use log::info;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Initial allocation for the buffer map.
const MEMORY_MAP_CAPACITY: usize = 300;

enum Command {
    Get {
        path: PathBuf,
        reply: oneshot::Sender<Option<Arc<FileBuffer>>>,
    },
    Set(Arc<FileBuffer>),
    Delete(PathBuf),
}

/// Handle to the memory hole task. Cheap to clone; the task exits once every
/// clone is gone.
#[derive(Clone)]
pub struct Willow {
    cmd_tx: mpsc::Sender<Command>,
    len: Arc<AtomicUsize>,
}

impl Willow {
    /// Spawn the memory hole. Expired buffers (and everything left at
    /// shutdown) are flushed through `writer`.
    pub fn start(
        flush_interval: Duration,
        group_interval: Duration,
        writer: WriterPool,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let len = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(memory_hole(
            cmd_rx,
            flush_interval,
            group_interval,
            writer,
            len.clone(),
        ));

        (Self { cmd_tx, len }, task)
    }

    /// Look up the buffer for `path`. Returns `None` for unknown paths and
    /// after the memory hole has stopped.
    pub async fn get(&self, path: &Path) -> Option<Arc<FileBuffer>> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Get {
            path: path.to_path_buf(),
            reply,
        };

        if self.cmd_tx.send(command).await.is_err() {
            return None;
        }

        rx.await.unwrap_or(None)
    }

    /// Store `buf` under its path, replacing any existing entry.
    pub async fn set(&self, buf: Arc<FileBuffer>) {
        let _ = self.cmd_tx.send(Command::Set(buf)).await;
    }

    /// Drop the entry for `path`. Absent paths are fine.
    pub async fn delete(&self, path: &Path) {
        let _ = self.cmd_tx.send(Command::Delete(path.to_path_buf())).await;
    }

    /// Number of buffers currently in the map.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Map-size closure for the metrics gauge. Holds only the counter, never
    /// the command channel, so it cannot keep the task alive.
    pub fn len_probe(&self) -> impl Fn() -> usize + Send + Sync + 'static {
        let len = self.len.clone();
        move || len.load(Ordering::Relaxed)
    }
}

/// The single task that owns the map. Keep it lean: nothing here may block
/// except submitting to the bounded writer queue.
async fn memory_hole(
    mut cmd_rx: mpsc::Receiver<Command>,
    flush_interval: Duration,
    group_interval: Duration,
    writer: WriterPool,
    len: Arc<AtomicUsize>,
) {
    let mut memory: HashMap<PathBuf, Arc<FileBuffer>> =
        HashMap::with_capacity(MEMORY_MAP_CAPACITY);

    let mut sweep = tokio::time::interval_at(
        tokio::time::Instant::now() + group_interval,
        group_interval,
    );
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Get { path, reply }) => {
                    let _ = reply.send(memory.get(&path).cloned());
                }
                Some(Command::Set(buf)) => {
                    memory.insert(buf.path().to_path_buf(), buf);
                    len.store(memory.len(), Ordering::Relaxed);
                }
                Some(Command::Delete(path)) => {
                    memory.remove(&path);
                    len.store(memory.len(), Ordering::Relaxed);
                }
                None => break,
            },
            _ = sweep.tick() => {
                wash(&mut memory, false, flush_interval, &writer, &len).await;
            }
        }
    }

    info!("writing {} files before exit", memory.len());
    wash(&mut memory, true, flush_interval, &writer, &len).await;
}

/// Flush every expired entry out of the map, or every entry when `force`.
async fn wash(
    memory: &mut HashMap<PathBuf, Arc<FileBuffer>>,
    force: bool,
    flush_interval: Duration,
    writer: &WriterPool,
    len: &AtomicUsize,
) {
    let now = Instant::now();
    let expired: Vec<PathBuf> = memory
        .iter()
        .filter(|(_, buf)| force || now.duration_since(buf.first_write()) >= flush_interval)
        .map(|(path, _)| path.clone())
        .collect();

    for path in expired {
        if let Some(buf) = memory.remove(&path) {
            writer
                .submit_flush(
                    buf,
                    FlushOpts {
                        truncate: false,
                        kind: FlushKind::Expired,
                    },
                )
                .await;
        }
    }

    len.store(memory.len(), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    fn pool(metrics: &Arc<Metrics>) -> (WriterPool, Vec<JoinHandle<()>>) {
        WriterPool::start(1, 16, metrics.clone())
    }

    async fn stop_pool(writer: WriterPool, handles: Vec<JoinHandle<()>>) {
        drop(writer);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn get_set_delete_round_trip() {
        let metrics = Arc::new(Metrics::new());
        let (writer, writer_tasks) = pool(&metrics);
        let (willow, task) =
            Willow::start(Duration::from_secs(60), Duration::from_secs(60), writer.clone());

        let path = PathBuf::from("/tmp/willow-test/a.log");
        assert!(willow.get(&path).await.is_none());

        let buf = Arc::new(FileBuffer::new(path.clone(), b"one"));
        willow.set(buf.clone()).await;

        let found = willow.get(&path).await.expect("buffer stored");
        assert!(Arc::ptr_eq(&found, &buf));
        assert_eq!(willow.len(), 1);

        willow.delete(&path).await;
        assert!(willow.get(&path).await.is_none());
        assert_eq!(willow.len(), 0);

        drop(willow);
        task.await.unwrap();
        stop_pool(writer, writer_tasks).await;
    }

    #[tokio::test]
    async fn sweep_flushes_expired_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let (writer, writer_tasks) = pool(&metrics);
        let (willow, task) = Willow::start(
            Duration::from_millis(50),
            Duration::from_millis(10),
            writer.clone(),
        );

        let path = dir.path().join("expired.log");
        willow
            .set(Arc::new(FileBuffer::new(path.clone(), b"aging\n")))
            .await;

        // Well past flush_interval + group_interval.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(willow.get(&path).await.is_none(), "entry evicted by sweep");
        assert_eq!(willow.len(), 0);

        drop(willow);
        task.await.unwrap();
        stop_pool(writer, writer_tasks).await;

        assert_eq!(std::fs::read(&path).unwrap(), b"aging\n");
        assert_eq!(metrics.expires.get(), 1);
    }

    #[tokio::test]
    async fn stop_force_flushes_remaining_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let (writer, writer_tasks) = pool(&metrics);
        let (willow, task) =
            Willow::start(Duration::from_secs(60), Duration::from_secs(60), writer.clone());

        let one = dir.path().join("one.log");
        let two = dir.path().join("two.log");
        willow.set(Arc::new(FileBuffer::new(one.clone(), b"1"))).await;
        willow.set(Arc::new(FileBuffer::new(two.clone(), b"2"))).await;

        // Dropping the only handle is the stop signal; the task must flush
        // both entries on the way out.
        drop(willow);
        task.await.unwrap();
        stop_pool(writer, writer_tasks).await;

        assert_eq!(std::fs::read(&one).unwrap(), b"1");
        assert_eq!(std::fs::read(&two).unwrap(), b"2");
        assert_eq!(metrics.files.get(), 2);
    }

    #[tokio::test]
    async fn clones_keep_the_task_alive() {
        let metrics = Arc::new(Metrics::new());
        let (writer, writer_tasks) = pool(&metrics);
        let (willow, task) =
            Willow::start(Duration::from_secs(60), Duration::from_secs(60), writer.clone());

        let survivor = willow.clone();
        drop(willow);
        // The task keeps serving while any clone exists.
        assert!(survivor.get(Path::new("/nope")).await.is_none());

        drop(survivor);
        task.await.unwrap();
        stop_pool(writer, writer_tasks).await;
    }
}
