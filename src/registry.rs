//! Device registry and source read cycles
//!
//! The registry is built once from a [`ModbusTcpConfig`]: every device that a
//! source refers to gets one [`TcpTransport`] and one [`ModbusTcp`] pump,
//! shared by all sources reading from it. The maps never change after
//! construction.
//!
//! A read cycle on a [`ModbusSource`] holds the transport lock, keeps at most
//! `RequestDepth` requests in flight and matches responses to requests by
//! transaction id. Responses left over from an earlier, timed-out cycle are
//! discarded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, ModbusTcpConfig, SourceConfig};
use crate::constants::DEFAULT_READ_TIMEOUT;
use crate::error::{ModbusError, ModbusResult};
use crate::metrics::{
    device_dimensions, MetricUnit, MetricsEmitter, MetricsSink, DIMENSION_SOURCE,
    METRICS_READS, METRICS_READ_DURATION, METRICS_READ_ERRORS,
};
use crate::protocol::{DeviceId, Request, Response};
use crate::pump::ModbusTcp;
use crate::transport::{ModbusTransport, TcpTransport};

/// Transport and pump of one device
pub struct DeviceChannel {
    adapter_id: String,
    name: String,
    config: DeviceConfig,
    transport: Arc<TcpTransport>,
    pump: ModbusTcp<TcpTransport>,
}

impl DeviceChannel {
    fn open(
        adapter_id: &str,
        name: &str,
        config: &DeviceConfig,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> ModbusResult<Self> {
        let transport = Arc::new(TcpTransport::new(
            config.clone(),
            adapter_id,
            device_dimensions(adapter_id, name),
            metrics,
        ));
        transport.start()?;
        let pump = ModbusTcp::new(Arc::clone(&transport), DEFAULT_READ_TIMEOUT);

        info!(
            "Device {} of adapter {} opened for {}",
            name,
            adapter_id,
            config.endpoint()
        );
        Ok(Self {
            adapter_id: adapter_id.to_string(),
            name: name.to_string(),
            config: config.clone(),
            transport,
            pump,
        })
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<TcpTransport> {
        &self.transport
    }

    pub fn pump(&self) -> &ModbusTcp<TcpTransport> {
        &self.pump
    }

    async fn close(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let pump_stopped = self.pump.stop(timeout).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let transport_closed = self.transport.close(remaining).await;
        pump_stopped && transport_closed
    }
}

/// A named source reading from one device
pub struct ModbusSource {
    name: String,
    config: SourceConfig,
    device: Arc<DeviceChannel>,
    metrics: MetricsEmitter,
}

impl ModbusSource {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit id configured for the source's device
    pub fn device_id(&self) -> DeviceId {
        self.device.config.device_id
    }

    pub fn request_depth(&self) -> usize {
        self.device.config.request_depth
    }

    /// Read timeout configured for this source
    pub fn read_timeout(&self) -> Duration {
        self.config.read_timeout()
    }

    pub fn device(&self) -> &Arc<DeviceChannel> {
        &self.device
    }

    /// Run one read cycle.
    ///
    /// Responses are returned in request order. Requests without a
    /// transaction id get one from the pump. The whole cycle, including
    /// waiting for the transport lock, is bounded by `timeout`.
    pub async fn read(
        &self,
        requests: Vec<Request>,
        timeout: Duration,
    ) -> ModbusResult<Vec<Response>> {
        let started = Instant::now();
        let cycle = async {
            let _guard = self.device.transport.lock().await;
            self.exchange(requests).await
        };

        let outcome = match tokio::time::timeout(timeout, cycle).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ModbusError::timeout(
                format!("read of source {}", self.name),
                timeout.as_millis() as u64,
            )),
        };

        match &outcome {
            Ok(responses) => {
                let elapsed = started.elapsed();
                self.metrics.count(METRICS_READS);
                self.metrics.emit(
                    METRICS_READ_DURATION,
                    elapsed.as_secs_f64() * 1000.0,
                    MetricUnit::Milliseconds,
                );
                debug!(
                    "Source {} read {} responses in {:?}",
                    self.name,
                    responses.len(),
                    elapsed
                );
            }
            Err(e) => {
                self.metrics.count(METRICS_READ_ERRORS);
                warn!("Read of source {} failed: {}", self.name, e);
            }
        }
        outcome
    }

    async fn exchange(&self, mut requests: Vec<Request>) -> ModbusResult<Vec<Response>> {
        let pump = &self.device.pump;

        let mut pending: HashMap<u16, usize> = HashMap::with_capacity(requests.len());
        for (index, request) in requests.iter_mut().enumerate() {
            let tid = *request
                .transaction_id
                .get_or_insert_with(|| pump.next_transaction_id());
            if pending.insert(tid, index).is_some() {
                return Err(ModbusError::invalid_data(format!(
                    "duplicate transaction id {} in read cycle",
                    tid
                )));
            }
        }

        let in_flight = Semaphore::new(self.request_depth().max(1));
        let mut results: Vec<Option<Response>> = vec![None; requests.len()];

        let send_all = async {
            for request in requests {
                in_flight
                    .acquire()
                    .await
                    .map_err(|_| ModbusError::Closed)?
                    .forget();
                pump.send(request).await?;
            }
            Ok::<(), ModbusError>(())
        };

        let receive_all = async {
            while !pending.is_empty() {
                let response = pump.receive().await.ok_or(ModbusError::Closed)?;
                match pending.remove(&response.transaction_id()) {
                    Some(index) => {
                        results[index] = Some(response);
                        in_flight.add_permits(1);
                    }
                    None => debug!(
                        "Discarding response TID={:04X} not requested by source {}",
                        response.transaction_id(),
                        self.name
                    ),
                }
            }
            Ok::<(), ModbusError>(())
        };

        tokio::try_join!(send_all, receive_all)?;
        Ok(results.into_iter().flatten().collect())
    }
}

/// Devices and sources built from one configuration
pub struct DeviceRegistry {
    devices: BTreeMap<(String, String), Arc<DeviceChannel>>,
    sources: BTreeMap<String, ModbusSource>,
}

impl DeviceRegistry {
    /// Validate `config`, open every device a source refers to and start its transport.
    ///
    /// Must be called from a Tokio runtime.
    pub fn new(
        config: &ModbusTcpConfig,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> ModbusResult<Self> {
        config.validate()?;

        let mut devices: BTreeMap<(String, String), Arc<DeviceChannel>> = BTreeMap::new();
        let mut sources = BTreeMap::new();

        for (source_name, source) in &config.sources {
            let key = (
                source.protocol_adapter.clone(),
                source.adapter_device.clone(),
            );
            let device = match devices.get(&key) {
                Some(device) => Arc::clone(device),
                None => {
                    let device_config = config
                        .source_device(source_name)
                        .ok_or_else(|| ModbusError::device_not_found(&source.adapter_device))?;
                    let device = Arc::new(DeviceChannel::open(
                        &source.protocol_adapter,
                        &source.adapter_device,
                        device_config,
                        metrics.clone(),
                    )?);
                    devices.insert(key, Arc::clone(&device));
                    device
                }
            };

            let mut dimensions =
                device_dimensions(&source.protocol_adapter, &source.adapter_device);
            dimensions.insert(DIMENSION_SOURCE.to_string(), source_name.clone());

            sources.insert(
                source_name.clone(),
                ModbusSource {
                    name: source_name.clone(),
                    config: source.clone(),
                    device,
                    metrics: MetricsEmitter::new(
                        source.protocol_adapter.clone(),
                        dimensions,
                        metrics.clone(),
                    ),
                },
            );
        }

        Ok(Self { devices, sources })
    }

    pub fn source(&self, name: &str) -> ModbusResult<&ModbusSource> {
        self.sources
            .get(name)
            .ok_or_else(|| ModbusError::device_not_found(name))
    }

    pub fn sources(&self) -> impl Iterator<Item = &ModbusSource> {
        self.sources.values()
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<DeviceChannel>> {
        self.devices.values()
    }

    /// Number of concurrent requests allowed for a source's device
    pub fn request_depth(&self, source: &str) -> ModbusResult<usize> {
        self.source(source).map(ModbusSource::request_depth)
    }

    /// Stop every pump and close every transport within `timeout` overall.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut all_stopped = true;
        for device in self.devices.values() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !device.close(remaining).await {
                warn!(
                    "Device {} of adapter {} did not stop in time",
                    device.name, device.adapter_id
                );
                all_stopped = false;
            }
        }
        all_stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::metrics::MetricsBuffer;
    use tokio::net::TcpListener;

    fn config_for(port: u16) -> ModbusTcpConfig {
        let device = DeviceConfig::new("127.0.0.1")
            .with_port(port)
            .with_device_id(1)
            .with_request_depth(3);
        ModbusTcpConfig::default()
            .with_adapter("tcp", AdapterConfig::default().with_device("plc-1", device))
            .with_source("line-1", SourceConfig::new("tcp", "plc-1"))
            .with_source("line-2", SourceConfig::new("tcp", "plc-1"))
    }

    #[tokio::test]
    async fn test_sources_share_one_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let registry = DeviceRegistry::new(&config_for(port), None).unwrap();
        assert_eq!(registry.devices().count(), 1);
        assert_eq!(registry.sources().count(), 2);
        assert_eq!(registry.request_depth("line-2").unwrap(), 3);
        assert_eq!(registry.source("line-1").unwrap().device_id(), 1);
        assert!(Arc::ptr_eq(
            registry.source("line-1").unwrap().device(),
            registry.source("line-2").unwrap().device()
        ));
        assert!(matches!(
            registry.request_depth("missing"),
            Err(ModbusError::DeviceNotFound { .. })
        ));

        assert!(registry.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_rejected() {
        let config = ModbusTcpConfig::default()
            .with_source("line-1", SourceConfig::new("tcp", "plc-1"));
        assert!(matches!(
            DeviceRegistry::new(&config, None),
            Err(ModbusError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_times_out_against_silent_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await });

        let metrics = MetricsBuffer::new();
        let registry = DeviceRegistry::new(&config_for(port), Some(metrics.clone())).unwrap();
        let source = registry.source("line-1").unwrap();

        let request = Request::read_holding_registers(source.device_id(), 0, 1).unwrap();
        let err = source
            .read(vec![request], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(metrics.count(METRICS_READ_ERRORS), 1);
        assert_eq!(metrics.count(METRICS_READS), 0);

        assert!(registry.stop(Duration::from_secs(5)).await);
        accept.abort();
    }

    #[tokio::test]
    async fn test_duplicate_transaction_ids_are_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = DeviceRegistry::new(&config_for(port), None).unwrap();
        let source = registry.source("line-1").unwrap();

        let request = Request::read_coils(1, 0, 1).unwrap().with_transaction_id(9);
        let err = source
            .read(vec![request.clone(), request], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));

        assert!(registry.stop(Duration::from_secs(5)).await);
    }
}
