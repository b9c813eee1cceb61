use clap::Parser;
use multipath_shim::{MultipathBinder, MultipathConnector, PathRegistry, TcpPathStack};
use std::{
    io::{Read, Write},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing_subscriber::filter::EnvFilter;

fn build_registry(args: &Args) -> PathRegistry {
    let registry = PathRegistry::new();
    if args.interface.is_empty() {
        for i in 0..args.paths {
            registry.register(format!("path-{i:02}"), Arc::new(TcpPathStack::new()));
        }
    } else {
        for (i, ip) in args.interface.iter().enumerate() {
            registry.register(format!("path-{i:02}-{ip}"), Arc::new(TcpPathStack::with_local_ip(*ip)));
        }
    }
    registry
}

fn run_client_mode(args: Args) -> multipath_shim::Result<()> {
    let registry = build_registry(&args);
    let local_ip = if args.addr.is_ipv4() {
        IpAddr::from([0, 0, 0, 0])
    } else {
        IpAddr::from([0u16; 8])
    };
    let mut stream = MultipathConnector::new(registry).connect(
        args.addr.ip(),
        args.addr.port(),
        local_ip,
        0,
        Duration::from_secs(args.timeout),
    )?;
    println!("Connected successfully to {} over {:?}", args.addr, stream.connected_paths());

    let mut buf = vec![0u8; args.size];
    buf.fill(42);

    let mut start = Instant::now();
    let sampling_period = Duration::from_secs(args.period);
    loop {
        let n = stream.write(&buf)?;
        if n == 0 {
            println!("Connection closed by remote peer");
            break;
        }
        if start.elapsed() >= sampling_period {
            for (path, stats) in stream.stats() {
                println!("  {path}: sent {} bytes", stats.sent);
            }
            start = Instant::now();
        }
    }
    Ok(())
}

fn run_server_mode(args: Args) -> multipath_shim::Result<()> {
    let registry = build_registry(&args);
    let mut listener = MultipathBinder::new(registry).listen(args.addr.ip(), args.addr.port())?;
    println!("Listening on {} (paths: {:?})", args.addr, listener.bound_paths());
    let mut sid = 0;
    loop {
        match listener.accept_timeout(None) {
            Ok((ip, port, mut stream)) => {
                println!("Accepted connection from: {ip}:{port}");
                let mut buf = vec![0u8; args.size];
                let mut start = Instant::now();
                let mut total_recv = 0;
                let sampling_period = Duration::from_secs(args.period);
                let cid = sid;
                sid += 1;
                std::thread::spawn(move || {
                    loop {
                        let n = match stream.read(&mut buf) {
                            Ok(n) => n,
                            Err(e) => {
                                println!("[{cid}]: read failed: {e}");
                                break;
                            }
                        };
                        if n == 0 {
                            println!("Socket close from remote party...");
                            break;
                        }
                        total_recv += n;
                        let delta = start.elapsed();
                        if delta >= sampling_period {
                            let throughput =
                                ((total_recv * 8) as f32 / delta.as_secs_f32()) / (10u64.pow(6) as f32);
                            println!("[{cid}]: {throughput} Mbps");
                            for (path, stats) in stream.stats() {
                                println!("[{cid}]   {path}: recv {} bytes", stats.recv);
                            }
                            start = Instant::now();
                            total_recv = 0;
                        }
                    }
                });
            }
            Err(e) => println!("Failed to accept connection: {e}"),
        }
    }
}

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
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to set logger: {e}");
    }

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    if args.client {
        run_client_mode(args)
    } else {
        run_server_mode(args)
    }
}

/// The performance benchmarking application for multipath streams
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Set the client mode for the application
    #[arg(short, long)]
    client: bool,
    /// The address <ip:port> to listen or connect, depending on the mode.
    /// Path `i` uses port + i.
    #[arg(short, long)]
    addr: SocketAddr,
    /// The read/write buffer size
    #[arg(short, long)]
    size: usize,
    /// The number of paths when no interface is given
    #[arg(short = 'n', long, default_value = "4")]
    paths: usize,
    /// Local interface IP to pin a path to; repeat for one path per interface
    #[arg(short, long)]
    interface: Vec<IpAddr>,
    /// Connect timeout of the first pass, in seconds
    #[arg(short, long, default_value = "5")]
    timeout: u64,
    /// The sampling period
    #[arg(short, long, default_value = "1")]
    period: u64,
}
