//! Daemon assembly: the UDP socket, reader and processor tasks, and the
//! ordered shutdown sequence.
//!
//! Data flow:
//!
//! ```text
//! socket -> dispatch channel -> processor -> memory hole -> writer queue -> disk
//! ```
//!
//! Readers and processors are decoupled by a bounded dispatch channel; when
//! processors fall behind, readers block and the kernel's receive buffer
//! (sized by `buffer_udp`) absorbs the burst. The shutdown order is
//! load-bearing: readers stop first, processors drain, the memory hole
//! force-flushes into the writer queue, and only then do the writers stop.

use crate::buffer::{FileBuffer, FlushKind, FlushOpts};
use crate::config::Config;
use crate::metrics::{GaugeSources, Metrics, MetricsServer};
use crate::packet::{resolve_path, Packet};
use crate::willow::{Willow, WriterPool};
use anyhow::{Context, Result};
use log::{debug, error, info};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// The running daemon. Construct with [`Fog::new`], bring up with
/// [`Fog::start`], and stop with [`Fog::shutdown`].
pub struct Fog {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    shutdown_tx: watch::Sender<bool>,
    udp_addr: Option<SocketAddr>,
    dispatch_tx: Option<mpsc::Sender<Packet>>,
    readers: Vec<JoinHandle<()>>,
    processors: Vec<JoinHandle<()>>,
    willow: Option<Willow>,
    willow_task: Option<JoinHandle<()>>,
    writer: Option<WriterPool>,
    writer_tasks: Vec<JoinHandle<()>>,
    http: Option<MetricsServer>,
}

struct ProcessorCtx {
    config: Arc<Config>,
    willow: Willow,
    writer: WriterPool,
    metrics: Arc<Metrics>,
}

impl Fog {
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config: Arc::new(config),
            metrics: Arc::new(Metrics::new()),
            shutdown_tx,
            udp_addr: None,
            dispatch_tx: None,
            readers: Vec::new(),
            processors: Vec::new(),
            willow: None,
            willow_task: None,
            writer: None,
            writer_tasks: Vec::new(),
            http: None,
        }
    }

    /// Bind the sockets and spawn every task. Fails only on socket or
    /// address errors; after this returns the daemon is serving.
    pub async fn start(&mut self) -> Result<()> {
        let config = self.config.clone();

        let socket = Arc::new(bind_udp(&config)?);
        let udp_addr = socket.local_addr().context("reading udp local addr")?;
        self.udp_addr = Some(udp_addr);

        let (writer, writer_tasks) = WriterPool::start(
            config.writers,
            config.buffer_file_sys,
            self.metrics.clone(),
        );
        self.writer_tasks = writer_tasks;

        let (willow, willow_task) = Willow::start(
            config.flush_interval(),
            config.group_interval(),
            writer.clone(),
        );
        self.willow_task = Some(willow_task);

        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Packet>(config.buffer_chan);
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));

        let ctx = Arc::new(ProcessorCtx {
            config: config.clone(),
            willow: willow.clone(),
            writer: writer.clone(),
            metrics: self.metrics.clone(),
        });

        for id in 1..=config.processors {
            self.processors
                .push(tokio::spawn(packet_processor(id, dispatch_rx.clone(), ctx.clone())));
        }

        for id in 1..=config.listeners {
            self.readers.push(tokio::spawn(packet_reader(
                id,
                socket.clone(),
                dispatch_tx.clone(),
                self.shutdown_tx.subscribe(),
                config.buffer_packet,
                self.metrics.clone(),
            )));
        }

        let sources = GaugeSources {
            in_memory: {
                let probe = willow.len_probe();
                Box::new(move || probe() as i64)
            },
            dispatch_depth: {
                let weak = dispatch_tx.downgrade();
                Box::new(move || {
                    weak.upgrade()
                        .map(|tx| (tx.max_capacity() - tx.capacity()) as i64)
                        .unwrap_or(0)
                })
            },
            writer_depth: {
                let probe = writer.depth_probe();
                Box::new(move || probe() as i64)
            },
        };

        let http_addr: SocketAddr = config
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen_addr '{}'", config.listen_addr))?;
        self.http = Some(MetricsServer::start(http_addr, self.metrics.clone(), sources)?);

        self.dispatch_tx = Some(dispatch_tx);
        self.willow = Some(willow);
        self.writer = Some(writer);

        info!(
            "listening for packets on {udp_addr} with {} readers and {} processors",
            config.listeners, config.processors
        );

        Ok(())
    }

    /// Stop everything in dependency order, force-flushing buffered files.
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        // 1. Stop the readers; the socket closes when the last one exits.
        let _ = self.shutdown_tx.send(true);
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }

        // 2. Close the dispatch channel; processors drain what is left.
        self.dispatch_tx = None;
        for processor in self.processors.drain(..) {
            let _ = processor.await;
        }

        // 3. Stop the memory hole. Every other handle died with the
        //    processors, so dropping ours triggers the forced final sweep,
        //    which enqueues the remaining buffers on the writer queue.
        self.willow = None;
        if let Some(task) = self.willow_task.take() {
            let _ = task.await;
        }

        // 4. Close the writer queue and wait for the workers to finish
        //    writing, including the jobs from the final sweep.
        self.writer = None;
        for writer in self.writer_tasks.drain(..) {
            let _ = writer.await;
        }

        // 5. The metrics server goes last, with a one second deadline.
        if let Some(http) = self.http.take() {
            http.stop().await;
        }
    }

    /// Actual UDP address, useful when the configured port was 0.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// Actual metrics HTTP address.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(|http| http.addr())
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// File buffers currently held in memory.
    pub fn buffered_files(&self) -> usize {
        self.willow.as_ref().map(Willow::len).unwrap_or(0)
    }
}

/// Create the UDP socket with the configured kernel receive buffer.
fn bind_udp(config: &Config) -> Result<UdpSocket> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr '{}'", config.listen_addr))?;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .context("creating udp socket")?;

    if config.buffer_udp > 0 {
        socket
            .set_recv_buffer_size(config.buffer_udp)
            .with_context(|| format!("setting socket read buffer to {}", config.buffer_udp))?;
    }

    socket
        .bind(&addr.into())
        .with_context(|| format!("binding udp socket to {addr}"))?;
    socket
        .set_nonblocking(true)
        .context("setting udp socket nonblocking")?;

    UdpSocket::from_std(socket.into()).context("registering udp socket with the runtime")
}

/// Read datagrams from the shared socket and push them onto the dispatch
/// channel. A full channel blocks the reader; receive errors are counted and
/// the loop keeps going until shutdown is signaled.
async fn packet_reader(
    id: usize,
    socket: Arc<UdpSocket>,
    dispatch: mpsc::Sender<Packet>,
    mut shutdown: watch::Receiver<bool>,
    packet_size: usize,
    metrics: Arc<Metrics>,
) {
    let mut count: u64 = 0;

    loop {
        let mut data = vec![0u8; packet_size];

        tokio::select! {
            received = socket.recv_from(&mut data) => match received {
                Ok((size, addr)) => {
                    count += 1;
                    data.truncate(size);
                    debug!(
                        "got packet {count} from {addr} at {size} bytes; dispatch queue: {}",
                        dispatch.max_capacity() - dispatch.capacity()
                    );

                    if dispatch.send(Packet { data, addr, count }).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!("reading udp socket: {err}");
                    metrics.errors.inc();
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    info!("closing udp packet reader {id}");
}

/// Drain the dispatch channel until it closes.
async fn packet_processor(
    id: usize,
    dispatch: Arc<Mutex<mpsc::Receiver<Packet>>>,
    ctx: Arc<ProcessorCtx>,
) {
    loop {
        let packet = { dispatch.lock().await.recv().await };

        let Some(packet) = packet else { break };
        ctx.metrics.packets.inc();
        handle_packet(packet, &ctx).await;
    }

    info!("closing packet processor {id}");
}

/// Parse one packet, fold its body into the per-path buffer, and apply its
/// command flags. Delete wins over truncate, truncate over flush.
async fn handle_packet(packet: Packet, ctx: &ProcessorCtx) {
    let (settings, body) = match packet.parse() {
        Ok(parsed) => parsed,
        Err(err) => {
            error!("{err}");
            ctx.metrics.errors.inc();
            return;
        }
    };

    let filepath = match settings.validate(packet.addr, &ctx.config.password) {
        Ok(filepath) => filepath,
        Err(err) => {
            error!("{err}");
            ctx.metrics.errors.inc();
            return;
        }
    };

    let path = resolve_path(&ctx.config.output_path, filepath);

    let file = match ctx.willow.get(&path).await {
        Some(buf) => {
            buf.append(body);
            buf
        }
        None => {
            let buf = Arc::new(FileBuffer::new(path.clone(), body));
            ctx.willow.set(buf.clone()).await;
            buf
        }
    };

    if settings.delete() {
        ctx.willow.delete(&path).await;
        ctx.writer
            .submit_delete(
                file,
                FlushOpts {
                    truncate: false,
                    kind: FlushKind::Command,
                },
            )
            .await;
        ctx.metrics.deletes.inc();
    } else if settings.truncate() {
        ctx.willow.delete(&path).await;
        ctx.writer
            .submit_flush(
                file,
                FlushOpts {
                    truncate: true,
                    kind: FlushKind::Command,
                },
            )
            .await;
        ctx.metrics.truncates.inc();
    } else if settings.flush() {
        ctx.willow.delete(&path).await;
        ctx.writer
            .submit_flush(
                file,
                FlushOpts {
                    truncate: false,
                    kind: FlushKind::Command,
                },
            )
            .await;
        ctx.metrics.flushes.inc();
    }
}
