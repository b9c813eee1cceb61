use clap::Parser;
use multipath_shim::{MultipathBinder, PathRegistry, TcpPathStack};
use std::net::IpAddr;
use std::sync::Arc;
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

    println!("Starting multipath server on {}:{} over {} paths", args.ip, args.port, args.paths);
    let mut listener = MultipathBinder::new(registry).listen(args.ip, args.port)?;
    let (ip, port, mut stream) = listener.accept_timeout(None)?;
    println!("Accepted connection from: {ip}:{port}");

    loop {
        let msg = match stream.receive(4096) {
            Ok(msg) => msg,
            Err(multipath_shim::Error::ClosedRemotely) => break,
            Err(e) => return Err(e),
        };
        println!("Received {} bytes: {}", msg.len(), String::from_utf8_lossy(&msg));
        stream.send(&msg)?;
    }
    for (path, stats) in stream.stats() {
        println!("{path}: sent {} recv {}", stats.sent, stats.recv);
    }
    Ok(())
}

/// A simple echo server illustrating multipath listening.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The IP to listen on
    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,
    /// The port of the first path; path i listens on port + i
    #[arg(short, long, default_value = "7890")]
    port: u16,
    /// The number of paths
    #[arg(short = 'n', long, default_value = "3")]
    paths: usize,
}
