//! Pty broker server binary
//!
//! Provides commands to start, stop, and inspect the broker.

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use ptybroker::broker::config::{default_socket_path, pid_file_path, BrokerConfig};
use ptybroker::broker::BrokerServer;
use std::env;
use std::fs;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "-h" | "--help" => {
            print_usage();
            return Ok(());
        }
        "start" | "stop" | "status" | "restart" => {}
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(1);
        }
    }

    init_logging();
    let socket_path = socket_path_from_args(&args[1..])?;

    match command.as_str() {
        "start" => start_broker(socket_path),
        "stop" => stop_broker(&socket_path),
        "status" => check_status(&socket_path),
        _ => restart_broker(socket_path),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("PTYBROKER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// `--socket PATH`, then the config file and environment, then the default
fn socket_path_from_args(args: &[String]) -> Result<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--socket" => {
                let path = iter.next().ok_or_else(|| anyhow!("--socket requires a path"))?;
                return Ok(PathBuf::from(path));
            }
            other => return Err(anyhow!("Unexpected argument '{}'", other)),
        }
    }

    match BrokerConfig::load().socket_path {
        Some(path) => Ok(path),
        None => default_socket_path().context("resolving default socket path"),
    }
}

fn start_broker(socket_path: PathBuf) -> Result<()> {
    // Check if the broker is already running
    if socket_path.exists() {
        if UnixStream::connect(&socket_path).is_ok() {
            eprintln!("Error: Broker is already running at {}", socket_path.display());
            eprintln!("Use 'ptybrokerd stop' to stop it first, or 'ptybrokerd restart' to restart.");
            process::exit(1);
        }
        // Stale socket file
        fs::remove_file(&socket_path)?;
    }

    if let Some(dir) = socket_path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
    }

    let mut server = BrokerServer::new(socket_path);
    server.start()
}

fn read_pid(socket_path: &std::path::Path) -> Result<Option<i32>> {
    let pid_path = pid_file_path(socket_path);
    if !pid_path.exists() {
        return Ok(None);
    }
    let pid_str = fs::read_to_string(&pid_path)?;
    let pid = pid_str
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid PID in {}", pid_path.display()))?;
    Ok(Some(pid))
}

fn stop_broker(socket_path: &std::path::Path) -> Result<()> {
    if !socket_path.exists() {
        println!("Broker is not running (socket not found).");
        return Ok(());
    }

    if UnixStream::connect(socket_path).is_err() {
        println!("Removing stale socket file.");
        fs::remove_file(socket_path)?;
        return Ok(());
    }

    let Some(pid) = read_pid(socket_path)? else {
        eprintln!("Warning: PID file not found. Cannot send signal to broker.");
        eprintln!("You may need to manually kill the broker process.");
        return Ok(());
    };

    kill(Pid::from_raw(pid), Signal::SIGTERM).with_context(|| format!("signalling broker {}", pid))?;
    println!("Sent shutdown signal to broker (PID {}).", pid);

    // Wait for socket to be removed (up to 5 seconds)
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(100));
        if !socket_path.exists() {
            println!("Broker stopped.");
            return Ok(());
        }
    }

    eprintln!("Warning: Broker may not have stopped cleanly.");
    let _ = fs::remove_file(pid_file_path(socket_path));
    Ok(())
}

fn check_status(socket_path: &std::path::Path) -> Result<()> {
    if !socket_path.exists() {
        println!("Broker is not running (socket not found).");
        return Ok(());
    }

    match UnixStream::connect(socket_path) {
        Ok(_stream) => {
            println!("Broker is running at {}", socket_path.display());
            if let Ok(Some(pid)) = read_pid(socket_path) {
                println!("PID: {}", pid);
            }
        }
        Err(_) => {
            println!("Socket file exists but the broker is not responding.");
            println!("This may be a stale socket. Try 'ptybrokerd start' to restart.");
        }
    }

    Ok(())
}

fn restart_broker(socket_path: PathBuf) -> Result<()> {
    println!("Stopping broker...");
    stop_broker(&socket_path)?;

    // Brief pause to ensure cleanup
    thread::sleep(Duration::from_millis(500));

    println!("Starting broker...");
    start_broker(socket_path)
}

fn print_usage() {
    println!("ptybrokerd {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: ptybrokerd <command> [--socket PATH]");
    println!();
    println!("Commands:");
    println!("  start      Run the broker in the foreground");
    println!("  stop       Stop a running broker");
    println!("  status     Check broker status");
    println!("  restart    Restart the broker");
    println!("  -h, --help Show this help message");
    println!();
    println!("Environment:");
    println!("  PTYBROKER_SOCKET   Socket path (default ~/.ptybroker/broker.sock)");
    println!("  PTYBROKER_LOG      Log filter (default info)");
}
