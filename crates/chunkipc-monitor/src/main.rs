//! chunkipc-monitor - reclaims what crashed chunkipc processes leave behind
//!
//! Run one per server instance before starting databases and clients:
//!
//! ```text
//! chunkipc-monitor --server-name personal --data-dir /var/lib/chunkipc
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `chunkipc=info`).

use chunkipc_core::{Monitor, MonitorConfig};
use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{error, info};

static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "chunkipc-monitor", version, about = "Crash-recovery monitor for chunkipc segments")]
struct Args {
    /// Server instance name
    #[arg(long, short = 's')]
    server_name: Option<String>,

    /// Directory for the active databases file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Liveness check interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Time allowed to notify one scheduler, in milliseconds
    #[arg(long)]
    notify_timeout_ms: Option<u64>,

    /// Poll ticks before a stuck clean-up is reported
    #[arg(long)]
    cleanup_retries: Option<u32>,

    /// Time a registering process waits for an answer, in milliseconds
    #[arg(long)]
    registration_timeout_ms: Option<u64>,
}

impl Args {
    fn into_config(self) -> MonitorConfig {
        let mut config = MonitorConfig::default();
        if let Some(name) = self.server_name {
            config.server_name = name;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.notify_timeout_ms {
            config.notify_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.cleanup_retries {
            config.cleanup_retries = n;
        }
        if let Some(ms) = self.registration_timeout_ms {
            config.registration_timeout = Duration::from_millis(ms);
        }
        config
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chunkipc=info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

extern "C" fn on_signal(_: nix::libc::c_int) {
    STOP.store(true, Ordering::Release);
}

fn install_signal_handlers() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::SA_RESTART, SigSet::empty());
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // SAFETY: the handler only stores to an atomic
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let config = Args::parse().into_config();

    if let Err(e) = install_signal_handlers() {
        error!(error = %e, "failed to install signal handlers");
        return ExitCode::FAILURE;
    }

    let monitor = match Monitor::start(config) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!(error = %e, "failed to start monitor");
            return ExitCode::FAILURE;
        }
    };
    info!(
        server = %monitor.config().server_name,
        interface = monitor.link().name(),
        pid = std::process::id(),
        "monitor ready"
    );

    while !STOP.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(100));
    }

    info!(
        processes = monitor.processes().len(),
        pending_clean_ups = monitor.pending_clean_ups(),
        "shutting down"
    );
    monitor.stop();
    ExitCode::SUCCESS
}
