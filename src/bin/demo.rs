//! Modbus Link Demo
//!
//! Polls a Modbus/TCP device through the registry:
//! - Builds an adapter configuration for one device and one source
//! - Runs read cycles of holding registers and coils
//! - Writes a register and shows transport statistics and metrics
//!
//! Usage: cargo run --bin demo [host[:port]] [unit_id]
//! Example: RUST_LOG=modbus_link=debug cargo run --bin demo 127.0.0.1:502 1

use std::time::Duration;

use modbus_link::constants::DEFAULT_CLOSE_TIMEOUT;
use modbus_link::metrics::{METRICS_BYTES_RECEIVED, METRICS_BYTES_SENT, METRICS_READS};
use modbus_link::{
    AdapterConfig, DeviceConfig, DeviceRegistry, MetricsBuffer, ModbusTcpConfig, Request,
    Response, SourceConfig,
};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modbus_link=info")),
        )
        .init();

    println!("🚀 {}", modbus_link::info());
    println!("=============================\n");

    // =========================================================================
    // Part 1: Configuration
    // =========================================================================
    println!("🎛️  Part 1: Adapter Configuration");
    println!("---------------------------------");

    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:502".to_string());
    let unit_id: u8 = std::env::args()
        .nth(2)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(1);
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse()?),
        None => (target.clone(), modbus_link::DEFAULT_TCP_PORT),
    };

    let device = DeviceConfig::new(host)
        .with_port(port)
        .with_device_id(unit_id)
        .with_request_depth(2)
        .with_connect_timeout_ms(2_000)
        .with_wait_after_connect_error_ms(2_000);
    let config = ModbusTcpConfig::default()
        .with_adapter("demo-adapter", AdapterConfig::default().with_device("plc", device))
        .with_source("demo-source", SourceConfig::new("demo-adapter", "plc").with_read_timeout_ms(3_000));

    println!("  {}", serde_json::to_string_pretty(&config)?);

    let metrics = MetricsBuffer::new();
    let registry = DeviceRegistry::new(&config, Some(metrics.clone()))?;
    let source = registry.source("demo-source")?;
    source.device().transport().set_packet_logging(true);

    // =========================================================================
    // Part 2: Read cycles
    // =========================================================================
    println!("\n📖 Part 2: Read Cycles against {}", target);
    println!("-----------------------------------");

    for cycle in 1..=3 {
        let requests = vec![
            Request::read_holding_registers(source.device_id(), 0, 5)?,
            Request::read_coils(source.device_id(), 0, 8)?,
        ];
        match source.read(requests, source.read_timeout()).await {
            Ok(responses) => {
                for response in responses {
                    print_response(cycle, &response);
                }
            }
            Err(e) => {
                println!("  ⚠️  Cycle {} failed: {}", cycle, e);
                println!("  (This is expected if no Modbus server is running)");
            }
        }
        sleep(Duration::from_millis(500)).await;
    }

    // =========================================================================
    // Part 3: Write
    // =========================================================================
    println!("\n✏️  Part 3: Write Operations");
    println!("----------------------------");

    let write = Request::write_single_register(source.device_id(), 100, 0x1234)?;
    match source.read(vec![write], source.read_timeout()).await {
        Ok(responses) => match responses.into_iter().next().map(Response::into_result) {
            Some(Ok(normal)) => println!(
                "    FC06 Wrote register {:?} = {:?}",
                normal.address(),
                normal.value()
            ),
            Some(Err(e)) => println!("    FC06 Error: {}", e),
            None => println!("    FC06 no response"),
        },
        Err(e) => println!("    FC06 Error: {}", e),
    }

    // =========================================================================
    // Part 4: Statistics
    // =========================================================================
    let stats = source.device().transport().stats();
    println!("\n📊 Part 4: Statistics");
    println!("---------------------");
    println!(
        "    Connections: {}, connection errors: {}",
        stats.connections, stats.connection_errors
    );
    println!(
        "    Bytes sent: {}, received: {}",
        stats.bytes_sent, stats.bytes_received
    );
    println!(
        "    Metrics: {} reads, {} bytes sent, {} bytes received",
        metrics.count(METRICS_READS),
        metrics.total(METRICS_BYTES_SENT),
        metrics.total(METRICS_BYTES_RECEIVED)
    );

    if !registry.stop(DEFAULT_CLOSE_TIMEOUT).await {
        eprintln!("  ⚠️  Registry did not stop in time");
    }

    println!("\n🎉 Demo completed!");
    Ok(())
}

fn print_response(cycle: u32, response: &Response) {
    match response {
        Response::Normal(normal) => {
            if let Some(registers) = normal.registers() {
                println!(
                    "    [{}] TID {} {}: {:?}",
                    cycle, normal.transaction_id, normal.function, registers
                );
            } else if let Some(coils) = normal.coils(8) {
                let states: Vec<&str> = coils.iter().map(|&c| if c { "ON" } else { "OFF" }).collect();
                println!(
                    "    [{}] TID {} {}: {:?}",
                    cycle, normal.transaction_id, normal.function, states
                );
            }
        }
        Response::Exception(exception) => println!(
            "    [{}] TID {} {} exception: {}",
            cycle, exception.transaction_id, exception.function, exception.exception
        ),
    }
}
