use clap::Parser;
use multipath_shim::{MultipathConnector, PathRegistry, TcpPathStack};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::filter::EnvFilter;

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let subscriber = subscriber.finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> multipath_shim::Result<()> {
    // Initialize log bridge to capture log crate messages - MUST be first!
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to set logger: {e}");
    }

    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    let registry = PathRegistry::new();
    for i in 0..args.paths {
        registry.register(format!("path-{i}"), Arc::new(TcpPathStack::new()));
    }

    println!("Starting multipath client");
    let mut stream = MultipathConnector::new(registry).connect(
        args.ip,
        args.port,
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        0,
        Duration::from_secs(2),
    )?;
    println!("Connected successfully over {:?}", stream.connected_paths());

    for i in 0..args.count {
        let msg = format!("hello #{i} from a multipath client");
        let n = stream.send(msg.as_bytes())?;
        println!("Wrote {n} bytes");
        let echo = stream.receive(n)?;
        println!("Echo: {}", String::from_utf8_lossy(&echo));
        std::thread::sleep(Duration::from_micros(args.period));
    }
    for (path, stats) in stream.stats() {
        println!("{path}: sent {} recv {}", stats.sent, stats.recv);
    }
    stream.close();
    Ok(())
}

/// A simple client illustrating multipath connections.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The server IP
    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,
    /// The port of the first path
    #[arg(short, long, default_value = "7890")]
    port: u16,
    /// The number of paths; must match the server
    #[arg(short = 'n', long, default_value = "3")]
    paths: usize,
    /// The number of messages to send
    #[arg(short, long, default_value = "10")]
    count: usize,
    /// Pause between messages in micro-sec
    #[arg(long, default_value = "100000")]
    period: u64,
}
