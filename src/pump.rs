//! Modbus/TCP protocol pump
//!
//! [`ModbusTcp`] multiplexes requests and responses over one transport. Two
//! tasks run per pump:
//!
//! - **writer**: takes requests off a bounded queue, assigns a transaction id
//!   when none is set, prefixes the MBAP header and hands the frame to the
//!   transport as a single chunk.
//! - **reader**: a two-state machine over the transport's byte stream.
//!
//! ```text
//!          byte read            header complete
//! ReadHeader ────────▶ MbapHeader::read ────────▶ ReadFunction(header)
//!     ▲                      │ framing error            │
//!     │◀─────────────────────┘                          │ body read, response pushed
//!     │◀────────────────────────────────────────────────┘ or frame discarded
//! ```
//!
//! Framing errors are logged and the frame is discarded; callers only notice
//! through a missing response.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use crate::constants::{EXCEPTION_FLAG, MBAP_HEADER_LEN, PROTOCOL_QUEUE_CAPACITY};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::hex_byte;
use crate::mbap::MbapHeader;
use crate::protocol::{decode_response_shell, is_exception_code, Request, Response};
use crate::transport::{join_within, read_byte, read_bytes, ModbusTransport};

/// Reader state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    ReadHeader,
    ReadFunction(MbapHeader),
}

/// Request/response pump over a shared transport.
pub struct ModbusTcp<T: ModbusTransport> {
    transport: Arc<T>,
    requests: mpsc::Sender<Request>,
    responses: Mutex<mpsc::Receiver<Response>>,
    transaction_ids: Arc<AtomicU16>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: ModbusTransport> ModbusTcp<T> {
    /// Create the pump and spawn its tasks.
    ///
    /// `read_timeout` bounds every single read the reader makes: the first
    /// header byte, each header sub-field, the function byte and each body field.
    pub fn new(transport: Arc<T>, read_timeout: Duration) -> Self {
        Self::with_capacity(transport, read_timeout, PROTOCOL_QUEUE_CAPACITY)
    }

    /// Like [`new`](Self::new) with explicit queue capacities.
    pub fn with_capacity(transport: Arc<T>, read_timeout: Duration, capacity: usize) -> Self {
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (response_tx, response_rx) = mpsc::channel(capacity);
        let transaction_ids = Arc::new(AtomicU16::new(1));
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(
            run_writer(
                Arc::clone(&transport),
                request_rx,
                Arc::clone(&transaction_ids),
                cancel.clone(),
            )
            .in_current_span(),
        );
        let reader = tokio::spawn(
            run_reader(
                Arc::clone(&transport),
                response_tx,
                read_timeout,
                cancel.clone(),
            )
            .in_current_span(),
        );

        Self {
            transport,
            requests: request_tx,
            responses: Mutex::new(response_rx),
            transaction_ids,
            cancel,
            tasks: parking_lot::Mutex::new(vec![writer, reader]),
        }
    }

    /// Queue a request. Suspends while the request queue is full.
    pub async fn send(&self, request: Request) -> ModbusResult<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ModbusError::Closed)
    }

    /// Sender half of the request queue
    pub fn requests(&self) -> mpsc::Sender<Request> {
        self.requests.clone()
    }

    /// Next response in wire-arrival order; `None` once the reader has stopped.
    pub async fn receive(&self) -> Option<Response> {
        self.responses.lock().await.recv().await
    }

    /// Allocate a transaction id (wraps at 16 bits).
    pub fn next_transaction_id(&self) -> u16 {
        self.transaction_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Cancel both tasks and wait up to `timeout` for them; `false` on timeout.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let mut handles = std::mem::take(&mut *self.tasks.lock());
        let stopped = join_within(&mut handles, timeout).await;
        if !stopped {
            for handle in &handles {
                handle.abort();
            }
            warn!("Protocol tasks did not stop within {:?}", timeout);
        }
        stopped
    }
}

impl<T: ModbusTransport> Drop for ModbusTcp<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Writer
// ============================================================================

fn encode_frame(request: &Request) -> ModbusResult<bytes::Bytes> {
    let header = MbapHeader::create(request)?;
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + request.payload.len());
    frame.put_slice(&header.encode());
    frame.put_slice(&request.payload);
    Ok(frame.freeze())
}

async fn run_writer<T: ModbusTransport>(
    transport: Arc<T>,
    mut requests: mpsc::Receiver<Request>,
    transaction_ids: Arc<AtomicU16>,
    cancel: CancellationToken,
) {
    loop {
        let mut request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        if request.transaction_id.is_none() {
            request.transaction_id = Some(transaction_ids.fetch_add(1, Ordering::Relaxed));
        }
        let frame = match encode_frame(&request) {
            Ok(frame) => frame,
            Err(e) => {
                error!(
                    "Dropping request TID={:04X}: {}",
                    request.transaction_id.unwrap_or_default(),
                    e
                );
                continue;
            }
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = transport.write(frame) => written,
        };
        match written {
            Ok(()) => debug!(
                "Request queued: TID={:04X}, unit={}",
                request.transaction_id.unwrap_or_default(),
                request.device_id
            ),
            Err(ModbusError::Closed) => {
                debug!("Transport closed, request writer stopping");
                break;
            }
            Err(e) => {
                error!("Error writing request: {}", e);
                break;
            }
        }
    }
    debug!("Request writer stopped");
}

// ============================================================================
// Reader
// ============================================================================

/// Advance the reader one state. Only transport closure is returned as an error.
async fn step<T: ModbusTransport>(
    transport: &T,
    state: FrameState,
    timeout: Duration,
) -> ModbusResult<(FrameState, Option<Response>)> {
    match state {
        FrameState::ReadHeader => {
            let Some(transaction_id_high) = read_byte(transport, timeout).await? else {
                return Ok((FrameState::ReadHeader, None));
            };
            match MbapHeader::read(transport, timeout, transaction_id_high).await {
                Ok(header) => Ok((FrameState::ReadFunction(header), None)),
                Err(e) if e.is_framing() => {
                    error!("{} whilst reading header", e);
                    Ok((FrameState::ReadHeader, None))
                }
                Err(e) => Err(e),
            }
        }

        FrameState::ReadFunction(header) => {
            let Some(function_byte) = read_byte(transport, timeout).await? else {
                error!(
                    "timeout reading function code whilst reading response or error, TID={:04X}",
                    header.transaction_id
                );
                return Ok((FrameState::ReadHeader, None));
            };

            let Some(shell) = decode_response_shell(
                function_byte & !EXCEPTION_FLAG,
                header.unit_id,
                header.transaction_id,
            ) else {
                error!(
                    "{} is not a recognized function/error code",
                    hex_byte(function_byte)
                );
                discard_frame(transport, &header, timeout).await?;
                return Ok((FrameState::ReadHeader, None));
            };

            let body = if is_exception_code(function_byte) {
                shell.read_error_body(transport, function_byte, timeout).await
            } else {
                shell.read_normal_body(transport, timeout).await
            };
            match body {
                Ok(response) => Ok((FrameState::ReadHeader, Some(response))),
                Err(e) if e.is_framing() => {
                    error!("{} whilst reading response or error", e);
                    Ok((FrameState::ReadHeader, None))
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Drop the rest of a frame; the length field counts unit id and function byte.
async fn discard_frame<T: ModbusTransport>(
    transport: &T,
    header: &MbapHeader,
    timeout: Duration,
) -> ModbusResult<()> {
    let remaining = (header.length as usize).saturating_sub(2);
    if remaining > 0 && read_bytes(transport, remaining, timeout).await?.is_none() {
        debug!(
            "Frame TID={:04X} ended before {} trailing bytes",
            header.transaction_id, remaining
        );
    }
    Ok(())
}

async fn run_reader<T: ModbusTransport>(
    transport: Arc<T>,
    responses: mpsc::Sender<Response>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut state = FrameState::ReadHeader;
    loop {
        let advanced = tokio::select! {
            _ = cancel.cancelled() => break,
            advanced = step(&*transport, state, timeout) => advanced,
        };

        match advanced {
            Ok((next, None)) => state = next,
            Ok((next, Some(response))) => {
                state = next;
                let sent = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = responses.send(response) => sent,
                };
                if sent.is_err() {
                    debug!("Response queue dropped, response reader stopping");
                    break;
                }
            }
            Err(ModbusError::Closed) => {
                debug!("Transport closed, response reader stopping");
                break;
            }
            Err(e) => {
                error!("Error reading response: {}", e);
                break;
            }
        }
    }
    debug!("Response reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::ChannelTransport;
    use crate::transport::TransportGuard;
    use bytes::Bytes;
    use tokio::sync::Semaphore;
    use tokio::time::sleep;
    use tokio_test::{assert_pending, assert_ready_ok};
    use tracing_test::traced_test;

    const TIMEOUT: Duration = Duration::from_millis(100);

    /// FC03 response carrying one register
    fn register_frame(tid: u16, value: u16) -> Vec<u8> {
        let tid = tid.to_be_bytes();
        let value = value.to_be_bytes();
        vec![
            tid[0], tid[1], 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, value[0], value[1],
        ]
    }

    fn first_register(response: &Response) -> Option<u16> {
        match response {
            Response::Normal(normal) => normal.registers()?.first().copied(),
            Response::Exception(_) => None,
        }
    }

    // ========================================================================
    // Writer
    // ========================================================================

    #[tokio::test]
    async fn test_writer_frames_requests() {
        let (transport, mut peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);

        pump.send(Request::read_holding_registers(1, 0, 1).unwrap().with_transaction_id(7))
            .await
            .unwrap();
        let frame = peer.from_transport.recv().await.unwrap();
        assert_eq!(
            &frame[..],
            &[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]
        );
        assert!(pump.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_writer_assigns_missing_transaction_ids() {
        let (transport, mut peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);

        for _ in 0..2 {
            pump.send(Request::read_coils(1, 0, 8).unwrap()).await.unwrap();
        }
        let first = peer.from_transport.recv().await.unwrap();
        let second = peer.from_transport.recv().await.unwrap();
        assert_eq!(&first[..2], &[0x00, 0x01]);
        assert_eq!(&second[..2], &[0x00, 0x02]);
        assert_eq!(pump.next_transaction_id(), 3);
        assert!(pump.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_writer_drops_oversized_request() {
        let (transport, mut peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);

        pump.send(Request::new(1, vec![0x10; 65_535]).with_transaction_id(1))
            .await
            .unwrap();
        pump.send(Request::read_coils(1, 0, 8).unwrap().with_transaction_id(2))
            .await
            .unwrap();

        let frame = peer.from_transport.recv().await.unwrap();
        assert_eq!(&frame[..2], &[0x00, 0x02]);
        assert_eq!(&frame[4..6], &[0x00, 0x06]);
        assert!(logs_contain("Dropping request TID=0001"));
        assert!(pump.stop(Duration::from_secs(1)).await);
    }

    /// Transport whose writes wait for a permit
    struct GatedTransport {
        gate: Semaphore,
        inner: ChannelTransport,
    }

    impl ModbusTransport for GatedTransport {
        async fn write(&self, chunk: Bytes) -> ModbusResult<()> {
            self.gate
                .acquire()
                .await
                .map_err(|_| ModbusError::Closed)?
                .forget();
            self.inner.write(chunk).await
        }

        async fn read(&self) -> ModbusResult<u8> {
            self.inner.read().await
        }

        async fn lock(&self) -> TransportGuard {
            self.inner.lock().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_request_queue_suspends_sender() {
        let (inner, _peer) = ChannelTransport::pair();
        let transport = Arc::new(GatedTransport {
            gate: Semaphore::new(0),
            inner,
        });
        let pump = ModbusTcp::with_capacity(Arc::clone(&transport), TIMEOUT, 2);
        let request = Request::read_holding_registers(1, 0, 1).unwrap();

        // One request in flight inside the blocked write, two queued.
        pump.send(request.clone()).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        pump.send(request.clone()).await.unwrap();
        pump.send(request.clone()).await.unwrap();

        let mut blocked = tokio_test::task::spawn(pump.send(request.clone()));
        assert_pending!(blocked.poll());

        transport.gate.add_permits(1);
        sleep(Duration::from_millis(10)).await;
        assert!(blocked.is_woken());
        assert_ready_ok!(blocked.poll());
        drop(blocked);

        assert!(pump.stop(Duration::from_secs(1)).await);
    }

    // ========================================================================
    // Reader
    // ========================================================================

    #[tokio::test]
    async fn test_reader_decodes_in_arrival_order() {
        let (transport, peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);

        peer.feed(&register_frame(2, 200)).await;
        peer.feed(&register_frame(1, 100)).await;

        let first = pump.receive().await.unwrap();
        let second = pump.receive().await.unwrap();
        assert_eq!(first.transaction_id(), 2);
        assert_eq!(first_register(&first), Some(200));
        assert_eq!(second.transaction_id(), 1);
        assert_eq!(first_register(&second), Some(100));
        assert!(pump.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_reader_delivers_exceptions() {
        let (transport, peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);

        peer.feed(&[0x00, 0x05, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02])
            .await;
        let response = pump.receive().await.unwrap();
        assert!(response.is_exception());
        assert_eq!(response.transaction_id(), 5);
        assert!(pump.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_short_header_is_discarded_and_reader_resyncs() {
        let (transport, peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);

        // Transaction id and half a protocol id, then silence.
        peer.feed(&[0x00, 0x01, 0x00]).await;
        sleep(TIMEOUT * 5).await;
        assert!(logs_contain(
            "timeout reading MBAP protocol ID whilst reading header"
        ));

        peer.feed(&register_frame(2, 42)).await;
        let response = pump.receive().await.unwrap();
        assert_eq!(response.transaction_id(), 2);
        assert_eq!(first_register(&response), Some(42));
        assert!(pump.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_foreign_protocol_id_is_logged() {
        let (transport, peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);

        peer.feed(&[0x00, 0x01, 0x01, 0x00]).await;
        peer.feed(&register_frame(3, 7)).await;

        let response = pump.receive().await.unwrap();
        assert_eq!(response.transaction_id(), 3);
        assert!(logs_contain(
            "0x01 0x00 is not the expected protocol ID 0x00 0x00 whilst reading header"
        ));
        assert!(pump.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unrecognized_function_code_is_dropped() {
        let (transport, peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);

        // FC 0x2B with two trailing bytes, then a valid frame.
        peer.feed(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x2B, 0xAA, 0xBB])
            .await;
        peer.feed(&register_frame(2, 9)).await;

        let response = pump.receive().await.unwrap();
        assert_eq!(response.transaction_id(), 2);
        assert_eq!(first_register(&response), Some(9));
        assert!(logs_contain("0x2B is not a recognized function/error code"));
        assert!(pump.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_reader_stops_when_transport_closes() {
        let (transport, peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);

        drop(peer);
        assert_eq!(pump.receive().await, None);
        assert!(pump.stop(Duration::from_secs(1)).await);
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    #[tokio::test]
    async fn test_stop_closes_queues() {
        let (transport, _peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);

        assert!(pump.stop(Duration::from_secs(1)).await);
        assert_eq!(
            pump.send(Request::read_coils(1, 0, 1).unwrap()).await,
            Err(ModbusError::Closed)
        );
        assert_eq!(pump.receive().await, None);
    }

    #[tokio::test]
    async fn test_stop_with_zero_timeout_returns_false() {
        let (transport, _peer) = ChannelTransport::pair();
        let pump = ModbusTcp::new(Arc::new(transport), TIMEOUT);
        assert!(!pump.stop(Duration::ZERO).await);
    }
}
