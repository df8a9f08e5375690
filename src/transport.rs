//! Byte-level transport for Modbus/TCP
//!
//! [`TcpTransport`] owns one persistent socket to a device and keeps it alive:
//! a reader task connects (throttled by `WaitAfterConnectError`), polls the
//! socket and feeds received bytes into a bounded queue; a writer task drains a
//! bounded queue of outbound chunks onto the socket. Failed reads and writes
//! tear the socket down so the reader reconnects on its next pass.
//!
//! Consumers only see the [`ModbusTransport`] trait: enqueue a chunk, dequeue a
//! byte, take the advisory lock.
//!
//! # Queue sizes
//!
//! | Queue | Element | Capacity |
//! |-------|---------|----------|
//! | outbound | `Bytes` chunk | 128 |
//! | inbound | single `u8` | 128 |
//!
//! Producers suspend on a full queue; nothing is dropped.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DeviceConfig;
use crate::constants::{
    DISCONNECTED_WRITER_WAIT, READ_BLOCKING_DURATION, READ_BUFFER_SIZE,
    TRANSPORT_READ_QUEUE_CAPACITY, TRANSPORT_WRITE_QUEUE_CAPACITY,
};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{log_packet, PacketDirection};
use crate::metrics::{
    MetricDimensions, MetricUnit, MetricsEmitter, MetricsSink, METRICS_BYTES_RECEIVED,
    METRICS_BYTES_SENT, METRICS_CONNECTIONS, METRICS_CONNECTION_ERRORS,
};

// ============================================================================
// Transport abstraction
// ============================================================================

/// Advisory lock over a transport, released on drop.
///
/// Holders get exclusive use of the request/response stream for a read cycle.
/// Nothing in the transport itself checks for it.
#[derive(Debug)]
pub struct TransportGuard {
    _guard: OwnedMutexGuard<()>,
}

impl TransportGuard {
    pub fn new(guard: OwnedMutexGuard<()>) -> Self {
        Self { _guard: guard }
    }
}

/// Byte stream contract used by the protocol pump.
pub trait ModbusTransport: Send + Sync + 'static {
    /// Enqueue a chunk for transmission. Suspends while the outbound queue is full.
    fn write(&self, chunk: Bytes) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Dequeue one received byte. Suspends until one is available and fails
    /// with [`ModbusError::Closed`] once the receive side is gone.
    fn read(&self) -> impl Future<Output = ModbusResult<u8>> + Send;

    /// Acquire the advisory lock.
    fn lock(&self) -> impl Future<Output = TransportGuard> + Send;
}

/// Read exactly `count` bytes within `timeout`.
///
/// `Ok(None)` means the timeout expired; bytes consumed before that are lost.
pub async fn read_bytes<T: ModbusTransport>(
    transport: &T,
    count: usize,
    timeout: Duration,
) -> ModbusResult<Option<Bytes>> {
    let mut buf = BytesMut::with_capacity(count);
    let filled = tokio::time::timeout(timeout, async {
        while buf.len() < count {
            buf.put_u8(transport.read().await?);
        }
        Ok::<(), ModbusError>(())
    })
    .await;

    match filled {
        Ok(Ok(())) => Ok(Some(buf.freeze())),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}

/// Read a single byte within `timeout`; `Ok(None)` on timeout.
pub async fn read_byte<T: ModbusTransport>(
    transport: &T,
    timeout: Duration,
) -> ModbusResult<Option<u8>> {
    match tokio::time::timeout(timeout, transport.read()).await {
        Ok(byte) => byte.map(Some),
        Err(_) => Ok(None),
    }
}

// ============================================================================
// Socket factory
// ============================================================================

/// Creates the byte stream a [`TcpTransport`] runs on.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP client sockets with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub connections: u64,
    pub connection_errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    connections: AtomicU64,
    connection_errors: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            connections: self.connections.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Connection state shared by the reader and writer tasks
// ============================================================================

enum ReadOutcome {
    Data(usize),
    Idle,
    Disconnected,
    Failed(io::Error),
}

struct Link<C: Connector> {
    config: DeviceConfig,
    endpoint: String,
    adapter_id: String,
    connector: C,
    /// Connect mutex; holds the instant of the previous attempt.
    last_attempt: Mutex<Option<Instant>>,
    reader: Mutex<Option<ReadHalf<C::Stream>>>,
    writer: Mutex<Option<WriteHalf<C::Stream>>>,
    connected: AtomicBool,
    packet_logging: AtomicBool,
    stats: StatsCounters,
    metrics: MetricsEmitter,
}

impl<C: Connector> Link<C> {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Establish the socket if it is not already up.
    ///
    /// Attempts are spaced at least `wait_after_connect_error` apart, measured
    /// from the start of the previous attempt. Failures are logged here and
    /// returned as [`ModbusError::Connection`] or [`ModbusError::Timeout`].
    async fn connect(&self) -> ModbusResult<()> {
        let mut last_attempt = self.last_attempt.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        if let Some(previous) = *last_attempt {
            let resume_at = previous + self.config.wait_after_connect_error();
            let now = Instant::now();
            if resume_at > now {
                debug!(
                    "Waiting {:?} before connecting to {}",
                    resume_at - now,
                    self.endpoint
                );
                sleep(resume_at - now).await;
            }
        }
        *last_attempt = Some(Instant::now());

        debug!("Connecting to {}", self.endpoint);
        let attempt = tokio::time::timeout(
            self.config.connect_timeout(),
            self.connector.connect(&self.config.address, self.config.port),
        )
        .await;

        match attempt {
            Ok(Ok(stream)) => {
                let (read_half, write_half) = tokio::io::split(stream);
                *self.reader.lock().await = Some(read_half);
                *self.writer.lock().await = Some(write_half);
                self.connected.store(true, Ordering::Release);
                self.stats.connections.fetch_add(1, Ordering::Relaxed);
                self.metrics.count(METRICS_CONNECTIONS);
                info!(
                    "Adapter {} connected to Modbus device at {}",
                    self.adapter_id, self.endpoint
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                self.metrics.count(METRICS_CONNECTION_ERRORS);
                let err = ModbusError::connection(format!("{}: {}", self.endpoint, e));
                error!("Error connecting: {}", err);
                Err(err)
            }
            Err(_) => {
                self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                self.metrics.count(METRICS_CONNECTION_ERRORS);
                warn!(
                    "Timeout connecting to {} after {}ms",
                    self.endpoint, self.config.connect_timeout_ms
                );
                Err(ModbusError::timeout(
                    format!("connect to {}", self.endpoint),
                    self.config.connect_timeout_ms,
                ))
            }
        }
    }

    /// Drop the socket so the reader reconnects on its next pass.
    async fn flag_for_reconnect(&self) {
        let _connecting = self.last_attempt.lock().await;
        self.connected.store(false, Ordering::Release);
        self.writer.lock().await.take();
        self.reader.lock().await.take();
        debug!("Socket to {} flagged for reconnect", self.endpoint);
    }

    async fn read_once(&self, buf: &mut [u8]) -> ReadOutcome {
        if !self.is_connected() && self.connect().await.is_err() {
            return ReadOutcome::Disconnected;
        }

        let mut reader = self.reader.lock().await;
        let Some(half) = reader.as_mut() else {
            return ReadOutcome::Disconnected;
        };

        match tokio::time::timeout(READ_BLOCKING_DURATION, half.read(buf)).await {
            Err(_) => ReadOutcome::Idle,
            Ok(Ok(0)) => ReadOutcome::Failed(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by device",
            )),
            Ok(Ok(n)) => ReadOutcome::Data(n),
            Ok(Err(e)) => ReadOutcome::Failed(e),
        }
    }

    async fn write_chunk(&self, chunk: &[u8]) -> ModbusResult<()> {
        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or_else(|| {
            ModbusError::connection(format!("socket to {} not connected", self.endpoint))
        })?;
        half.write_all(chunk).await?;
        half.flush().await?;
        Ok(())
    }

    fn record_received(&self, data: &[u8]) {
        self.stats
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.metrics
            .emit(METRICS_BYTES_RECEIVED, data.len() as f64, MetricUnit::Bytes);
        if self.packet_logging.load(Ordering::Relaxed) {
            log_packet(PacketDirection::Rx, &self.endpoint, data);
        }
    }

    fn record_sent(&self, data: &[u8]) {
        self.stats
            .bytes_sent
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.metrics
            .emit(METRICS_BYTES_SENT, data.len() as f64, MetricUnit::Bytes);
        if self.packet_logging.load(Ordering::Relaxed) {
            log_packet(PacketDirection::Tx, &self.endpoint, data);
        }
    }
}

async fn run_reader<C: Connector>(
    link: Arc<Link<C>>,
    inbound: mpsc::Sender<u8>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = link.read_once(&mut buf) => outcome,
        };

        match outcome {
            ReadOutcome::Idle | ReadOutcome::Disconnected => {}
            ReadOutcome::Data(n) => {
                link.record_received(&buf[..n]);
                for &byte in &buf[..n] {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = inbound.send(byte) => {
                            if sent.is_err() {
                                debug!("Receive queue for {} dropped", link.endpoint);
                                return;
                            }
                        }
                    }
                }
            }
            ReadOutcome::Failed(e) => {
                link.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                error!("Error reading from {}: {}", link.endpoint, e);
                link.flag_for_reconnect().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(link.config.wait_after_read_error()) => {}
                }
            }
        }
    }
    debug!("Reader for {} stopped", link.endpoint);
}

async fn run_writer<C: Connector>(
    link: Arc<Link<C>>,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        if !link.is_connected() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(DISCONNECTED_WRITER_WAIT) => continue,
            }
        }

        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = outbound.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = link.write_chunk(&chunk) => written,
        };

        match written {
            Ok(()) => link.record_sent(&chunk),
            Err(e) => {
                link.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                error!("Error writing to {}: {}", link.endpoint, e);
                link.flag_for_reconnect().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(link.config.wait_after_write_error()) => {}
                }
            }
        }
    }
    debug!("Writer for {} stopped", link.endpoint);
}

/// Wait for every handle to finish; a zero timeout only checks.
pub(crate) async fn join_within(handles: &mut [JoinHandle<()>], timeout: Duration) -> bool {
    if timeout.is_zero() {
        return handles.iter().all(JoinHandle::is_finished);
    }
    tokio::time::timeout(timeout, async {
        for handle in handles.iter_mut() {
            let _ = handle.await;
        }
    })
    .await
    .is_ok()
}

// ============================================================================
// TcpTransport
// ============================================================================

/// Reconnecting Modbus/TCP byte transport.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use bytes::Bytes;
/// use modbus_link::{DeviceConfig, ModbusTransport, TcpTransport};
///
/// # async fn example() -> modbus_link::ModbusResult<()> {
/// let transport = TcpTransport::new(
///     DeviceConfig::new("127.0.0.1"),
///     "tcp-adapter",
///     Default::default(),
///     None,
/// );
/// transport.start()?;
/// transport.write(Bytes::from_static(&[0x00, 0x01])).await?;
/// transport.close(Duration::from_secs(10)).await;
/// # Ok(())
/// # }
/// ```
pub struct TcpTransport<C: Connector = TcpConnector> {
    link: Arc<Link<C>>,
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<mpsc::Receiver<u8>>,
    /// Queue ends handed to the tasks by `start`.
    pending: parking_lot::Mutex<Option<(mpsc::Receiver<Bytes>, mpsc::Sender<u8>)>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    guard: Arc<Mutex<()>>,
}

impl TcpTransport<TcpConnector> {
    /// Create a transport for `config`; nothing connects until [`start`](Self::start).
    pub fn new(
        config: DeviceConfig,
        adapter_id: impl Into<String>,
        dimensions: MetricDimensions,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        Self::with_connector(TcpConnector, config, adapter_id, dimensions, metrics)
    }
}

impl<C: Connector> TcpTransport<C> {
    /// Create a transport that obtains its socket from `connector`.
    pub fn with_connector(
        connector: C,
        config: DeviceConfig,
        adapter_id: impl Into<String>,
        dimensions: MetricDimensions,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        let adapter_id = adapter_id.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(TRANSPORT_WRITE_QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(TRANSPORT_READ_QUEUE_CAPACITY);

        let link = Link {
            endpoint: config.endpoint(),
            metrics: MetricsEmitter::new(adapter_id.clone(), dimensions, metrics),
            adapter_id,
            config,
            connector,
            last_attempt: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            packet_logging: AtomicBool::new(false),
            stats: StatsCounters::default(),
        };

        Self {
            link: Arc::new(link),
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            pending: parking_lot::Mutex::new(Some((outbound_rx, inbound_tx))),
            tasks: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Spawn the reader and writer tasks. Must be called from a Tokio runtime.
    pub fn start(&self) -> ModbusResult<()> {
        let (outbound_rx, inbound_tx) = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| ModbusError::protocol("transport already started or closed"))?;

        let reader = tokio::spawn(run_reader(
            Arc::clone(&self.link),
            inbound_tx,
            self.cancel.clone(),
        ));
        let writer = tokio::spawn(run_writer(
            Arc::clone(&self.link),
            outbound_rx,
            self.cancel.clone(),
        ));
        self.tasks.lock().extend([reader, writer]);

        debug!("Transport for {} started", self.link.endpoint);
        Ok(())
    }

    /// Cancel both tasks and wait up to `timeout` for them to finish.
    ///
    /// Returns `false` if they did not finish in time; they are aborted then.
    /// Either way the socket is shut and cancellation stays in effect.
    pub async fn close(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        self.pending.lock().take();
        let mut handles = std::mem::take(&mut *self.tasks.lock());

        let joined = join_within(&mut handles, timeout).await;
        if !joined {
            for handle in &handles {
                handle.abort();
            }
            // Aborted tasks release the socket halves once they are dropped.
            for handle in handles {
                if !handle.is_finished() {
                    let _ = handle.await;
                }
            }
            warn!(
                "Transport for {} did not close within {:?}",
                self.link.endpoint, timeout
            );
        }

        self.link.flag_for_reconnect().await;
        debug!("Transport for {} closed", self.link.endpoint);
        joined
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn endpoint(&self) -> &str {
        &self.link.endpoint
    }

    pub fn stats(&self) -> TransportStats {
        self.link.stats.snapshot()
    }

    /// Log every chunk sent and received as hex at trace level.
    pub fn set_packet_logging(&self, enabled: bool) {
        self.link.packet_logging.store(enabled, Ordering::Relaxed);
    }
}

impl<C: Connector> ModbusTransport for TcpTransport<C> {
    async fn write(&self, chunk: Bytes) -> ModbusResult<()> {
        self.outbound
            .send(chunk)
            .await
            .map_err(|_| ModbusError::Closed)
    }

    async fn read(&self) -> ModbusResult<u8> {
        self.inbound.lock().await.recv().await.ok_or(ModbusError::Closed)
    }

    async fn lock(&self) -> TransportGuard {
        TransportGuard::new(Arc::clone(&self.guard).lock_owned().await)
    }
}

impl<C: Connector> Drop for TcpTransport<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
