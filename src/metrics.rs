//! Prometheus metrics and the `/metrics` HTTP endpoint.
//!
//! Every series lives under the `fogwillow_` prefix. Counters and histograms
//! are incremented from the hot paths; the queue-depth gauges and the uptime
//! counter are refreshed from [`GaugeSources`] closures each time the
//! endpoint is scraped, so they always reflect the current state without a
//! background sampler.
//!
//! The registry is owned by the [`Metrics`] instance rather than being a
//! process-wide global, so every daemon (and every test) gets an isolated
//! set of series.

use anyhow::{Context, Result};
use log::{error, info};
use prometheus::{
    histogram_opts, register_counter_with_registry, register_histogram_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Counter, Encoder,
    HistogramVec, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Histogram label value for file writes.
pub const KIND_FILE: &str = "file";
/// Histogram label value for tree deletes.
pub const KIND_DELETE: &str = "delete";

/// Closures sampled at scrape time to fill the function-backed gauges.
pub struct GaugeSources {
    /// File buffers currently held in the memory map.
    pub in_memory: Box<dyn Fn() -> i64 + Send + Sync>,
    /// Packets waiting between the readers and the processors.
    pub dispatch_depth: Box<dyn Fn() -> i64 + Send + Sync>,
    /// Jobs waiting in the filesystem writer channel.
    pub writer_depth: Box<dyn Fn() -> i64 + Send + Sync>,
}

/// Application metrics in prometheus format.
pub struct Metrics {
    registry: Registry,
    start: Instant,
    uptime: Counter,
    in_memory: IntGauge,
    chan_buff: IntGauge,
    file_buff: IntGauge,
    pub packets: IntCounter,
    pub files: IntCounter,
    pub bytes: IntCounter,
    pub errors: IntCounter,
    pub deletes: IntCounter,
    pub truncates: IntCounter,
    pub flushes: IntCounter,
    pub expires: IntCounter,
    pub ages: HistogramVec,
    pub durations: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Register every series with the given registry.
    pub fn with_registry(registry: Registry) -> Self {
        let uptime = register_counter_with_registry!(
            "fogwillow_uptime_seconds_total",
            "Seconds Fog Willow has been running",
            registry
        )
        .expect("Failed to create uptime counter");

        let in_memory = register_int_gauge_with_registry!(
            "fogwillow_file_buffers_in_memory",
            "Count of file buffers currently stored in memory awaiting flush.",
            registry
        )
        .expect("Failed to create in_memory gauge");

        let chan_buff = register_int_gauge_with_registry!(
            "fogwillow_packet_processor_buffer",
            "Size of the buffer between the packet reader and packet processor.",
            registry
        )
        .expect("Failed to create chan_buff gauge");

        let file_buff = register_int_gauge_with_registry!(
            "fogwillow_filesystem_change_buffer",
            "Size of the file system change channel buffer.",
            registry
        )
        .expect("Failed to create file_buff gauge");

        let packets = register_int_counter_with_registry!(
            "fogwillow_packets_total",
            "Number of UDP packets processed. Often 1 packet per log line.",
            registry
        )
        .expect("Failed to create packets counter");

        let files = register_int_counter_with_registry!(
            "fogwillow_files_written_total",
            "Number of files flushed and written to disk.",
            registry
        )
        .expect("Failed to create files counter");

        let bytes = register_int_counter_with_registry!(
            "fogwillow_bytes_written_total",
            "Number of bytes written to disk.",
            registry
        )
        .expect("Failed to create bytes counter");

        let errors = register_int_counter_with_registry!(
            "fogwillow_app_errors_total",
            "Number of errors the application has generated.",
            registry
        )
        .expect("Failed to create errors counter");

        let deletes = register_int_counter_with_registry!(
            "fogwillow_file_buffer_deletes_total",
            "Number of delete commands issued.",
            registry
        )
        .expect("Failed to create deletes counter");

        let truncates = register_int_counter_with_registry!(
            "fogwillow_file_buffer_truncates_total",
            "Number of files truncated on command.",
            registry
        )
        .expect("Failed to create truncates counter");

        let flushes = register_int_counter_with_registry!(
            "fogwillow_file_buffer_flushes_total",
            "Number of file buffers that were flushed on command.",
            registry
        )
        .expect("Failed to create flushes counter");

        let expires = register_int_counter_with_registry!(
            "fogwillow_file_buffer_expires_total",
            "Number of file buffers that were flushed due to expiry.",
            registry
        )
        .expect("Failed to create expires counter");

        let ages = register_histogram_vec_with_registry!(
            histogram_opts!(
                "fogwillow_file_buffer_ages_seconds",
                "The age of file buffers in memory when they are flushed to disk.",
                vec![0.001, 0.01, 0.2, 1.2, 8.0, 30.0]
            ),
            &["kind"],
            registry
        )
        .expect("Failed to create ages histogram");

        let durations = register_histogram_vec_with_registry!(
            histogram_opts!(
                "fogwillow_file_write_duration_seconds",
                "The length of time it takes to delete or write a file buffer to disk.",
                vec![0.001, 0.1, 1.0, 5.0, 15.0]
            ),
            &["kind"],
            registry
        )
        .expect("Failed to create durations histogram");

        Self {
            registry,
            start: Instant::now(),
            uptime,
            in_memory,
            chan_buff,
            file_buff,
            packets,
            files,
            bytes,
            errors,
            deletes,
            truncates,
            flushes,
            expires,
            ages,
            durations,
        }
    }

    /// Bring the function-backed series up to date before a scrape.
    fn refresh(&self, sources: &GaugeSources) {
        self.in_memory.set((sources.in_memory)());
        self.chan_buff.set((sources.dispatch_depth)());
        self.file_buff.set((sources.writer_depth)());

        // Counters only move forward, so feed the uptime counter the delta
        // since the last scrape.
        let delta = self.start.elapsed().as_secs_f64() - self.uptime.get();
        if delta > 0.0 {
            self.uptime.inc_by(delta);
        }
    }

    /// Render the registry in prometheus text format.
    pub fn render(&self, sources: &GaugeSources) -> Vec<u8> {
        self.refresh(sources);

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("encoding metrics: {err}");
        }

        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Running metrics HTTP server. Stopping it triggers a graceful shutdown
/// bounded by a one second deadline.
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl MetricsServer {
    /// Bind `addr` and serve GET `/metrics` until stopped.
    pub fn start(
        addr: SocketAddr,
        metrics: Arc<Metrics>,
        sources: GaugeSources,
    ) -> Result<Self> {
        let sources = Arc::new(sources);

        let make_service = hyper::service::make_service_fn(move |_conn| {
            let metrics = metrics.clone();
            let sources = sources.clone();
            async move {
                Ok::<_, Infallible>(hyper::service::service_fn(move |req| {
                    handle_request(req, metrics.clone(), sources.clone())
                }))
            }
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server = hyper::Server::try_bind(&addr)
            .with_context(|| format!("binding metrics server to {addr}"))?
            .http1_header_read_timeout(Duration::from_secs(1))
            .tcp_keepalive(Some(Duration::from_secs(20)))
            .serve(make_service);

        let local_addr = server.local_addr();
        info!("serving metrics at http://{local_addr}/metrics");

        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                error!("metrics server: {err}");
            }
        });

        Ok(Self {
            addr: local_addr,
            shutdown_tx,
            handle,
        })
    }

    /// The bound address, useful when the configured port was 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = tokio::time::timeout(Duration::from_secs(1), self.handle).await;
    }
}

async fn handle_request(
    req: hyper::Request<hyper::Body>,
    metrics: Arc<Metrics>,
    sources: Arc<GaugeSources>,
) -> Result<hyper::Response<hyper::Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/metrics") => hyper::Response::builder()
            .status(200)
            .header("Content-Type", TextEncoder::new().format_type())
            .body(hyper::Body::from(metrics.render(&sources))),
        _ => hyper::Response::builder()
            .status(404)
            .body(hyper::Body::from("Not Found")),
    };

    // Builder errors are impossible for these fixed inputs.
    Ok(response.unwrap_or_default())
}
