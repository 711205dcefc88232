//! Loopback throughput check
//!
//! Builds one circuit inside a single transport, produces messages from one
//! thread, consumes them on another and dispatches on the main thread.
//!
//! Usage:
//!   dp_loopback --messages 100000 --size 4096 --consumers 2
//!   dp_loopback --fan-out least-busy --consumers 4 --config dataplane.toml

use dataplane::circuit::{CircuitSpec, PortSetSpec};
use dataplane::config::TransportConfig;
use dataplane::port::{Distribution, SubPolicy};
use dataplane::transport::Transport;
use dataplane::CircuitId;

use clap::{Parser, ValueEnum};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FanOut {
    RoundRobin,
    Random,
    LeastBusy,
}

impl From<FanOut> for SubPolicy {
    fn from(value: FanOut) -> Self {
        match value {
            FanOut::RoundRobin => SubPolicy::RoundRobin,
            FanOut::Random => SubPolicy::Random,
            FanOut::LeastBusy => SubPolicy::LeastBusy,
        }
    }
}

/// Loopback producer/consumer over one circuit
#[derive(Parser)]
#[command(name = "dp_loopback")]
#[command(about = "Move messages through a single-transport circuit and report throughput")]
struct Args {
    /// Configuration file (TOML); defaults are used when absent
    #[arg(long)]
    config: Option<String>,

    /// Number of messages to produce
    #[arg(long, default_value = "10000")]
    messages: u64,

    /// Bytes written into each message
    #[arg(long, default_value = "1024")]
    size: usize,

    /// Consumer ports
    #[arg(long, default_value = "1")]
    consumers: usize,

    /// Send each message to one consumer instead of all of them
    #[arg(long, value_enum)]
    fan_out: Option<FanOut>,

    /// Endpoint protocol (local, dma, shm)
    #[arg(long)]
    protocol: Option<String>,

    /// Log level, overriding the configuration
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match TransportConfig::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => TransportConfig::default(),
    };
    if let Some(protocol) = &args.protocol {
        config.endpoints.default_protocol = protocol.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    dataplane::logging::init(&config.logging);

    if let Err(e) = run(&args, config) {
        eprintln!("Loopback failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args, config: TransportConfig) -> Result<(), Box<dyn std::error::Error>> {
    if args.size > config.ports.buffer_size {
        return Err(format!(
            "message size {} exceeds buffer size {}",
            args.size, config.ports.buffer_size
        )
        .into());
    }

    let distribution = match args.fan_out {
        Some(policy) => Distribution::sequential(policy.into()),
        None => Distribution::parallel(),
    };
    let spec = CircuitSpec::new(
        PortSetSpec::producer(&config.ports, 1),
        vec![PortSetSpec::consumer(&config.ports, args.consumers).with_distribution(distribution)],
    );

    let transport = Transport::with_defaults(config);
    let id = transport.create_circuit(&spec)?;
    tracing::info!(
        "Circuit {} ready: roles {:?}, controllers {:?}",
        id,
        transport.roles(id)?,
        transport.controller_kinds(id)?
    );

    let expected = match args.fan_out {
        Some(_) => args.messages,
        None => args.messages * args.consumers as u64,
    };
    let received = AtomicU64::new(0);
    let done = AtomicBool::new(false);

    let start = Instant::now();
    std::thread::scope(|s| -> Result<(), Box<dyn std::error::Error>> {
        let producer = s.spawn(|| {
            let result = produce_all(&transport, id, args);
            if result.is_err() {
                done.store(true, Ordering::Release);
            }
            result
        });
        let consumer = s.spawn(|| {
            let result = consume_all(&transport, id, args.consumers, expected, &received, &done);
            done.store(true, Ordering::Release);
            result
        });

        while !done.load(Ordering::Acquire) {
            if transport.dispatch() == 0 {
                transport.wait(Duration::from_millis(1));
            }
        }

        producer
            .join()
            .map_err(|_| "producer thread panicked")??;
        consumer
            .join()
            .map_err(|_| "consumer thread panicked")??;
        Ok(())
    })?;
    let elapsed = start.elapsed();

    let total = received.load(Ordering::Acquire);
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    tracing::info!(
        "Received {} messages in {:.3}s: {:.0} msg/s, {:.2} MiB/s",
        total,
        secs,
        total as f64 / secs,
        (total as f64 * args.size as f64) / secs / (1024.0 * 1024.0)
    );

    transport.close_circuit(id)?;
    while transport.retiring() > 0 {
        transport.dispatch();
    }
    Ok(())
}

fn produce_all(transport: &Transport, id: CircuitId, args: &Args) -> dataplane::Result<()> {
    let payload = vec![0xA5u8; args.size];
    let mut sent = 0u64;
    while sent < args.messages {
        let Some(mut buffer) = transport.get_empty_buffer(id, 0)? else {
            transport.wait(Duration::from_millis(1));
            continue;
        };
        let n = buffer.fill(&payload);
        buffer.data_mut()[..8.min(n)].copy_from_slice(&sent.to_le_bytes()[..8.min(n)]);
        sent += 1;
        if sent == args.messages {
            transport.produce_end_of_stream(buffer, sent as u32, n)?;
        } else {
            transport.produce(buffer, sent as u32, n)?;
        }
    }
    tracing::debug!("Producer finished after {} messages", sent);
    Ok(())
}

fn consume_all(
    transport: &Transport,
    id: CircuitId,
    consumers: usize,
    expected: u64,
    received: &AtomicU64,
    done: &AtomicBool,
) -> dataplane::Result<()> {
    while received.load(Ordering::Acquire) < expected && !done.load(Ordering::Acquire) {
        let mut idle = true;
        for ordinal in 0..consumers {
            if let Some(buffer) = transport.get_full_buffer(id, 0, ordinal)? {
                idle = false;
                tracing::trace!(
                    "Consumer {} got opcode {} ({} bytes)",
                    ordinal,
                    buffer.opcode(),
                    buffer.length()
                );
                transport.release(buffer)?;
                received.fetch_add(1, Ordering::AcqRel);
            }
        }
        if idle {
            transport.wait(Duration::from_millis(1));
        }
    }
    Ok(())
}
