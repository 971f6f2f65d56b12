//! irqbridge - host an interrupt forwarding session against a QEMU monitor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use irqbridge::commands::InterruptCommands;
use irqbridge::{
    EmulatorTarget, ForwardedExitEvent, InterruptProtocol, ProtocolConfig, QmpMonitor, QueuePair,
    TargetKind,
};

#[derive(Parser, Debug)]
#[command(name = "irqbridge")]
#[command(version, about = "ARMv7-M interrupt forwarding for emulated targets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enable forwarding and print every interrupt exit as a JSON line.
    Forward(ForwardArgs),
    /// Inject a single interrupt.
    Inject(InjectArgs),
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// QMP monitor address: unix:/path, tcp:host:port or host:port.
    #[arg(long, env = "IRQBRIDGE_QMP")]
    qmp: String,

    /// Name reported as the origin of forwarded exits.
    #[arg(long, default_value = "qemu")]
    target_name: String,

    /// Kind of target behind the monitor.
    #[arg(long, default_value = "qemu")]
    target_kind: TargetKind,
}

#[derive(Args, Debug)]
struct ForwardArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Queue this side receives exits on (generated when omitted).
    #[arg(long, requires = "tx_queue")]
    rx_queue: Option<String>,

    /// Queue this side sends acknowledgements on (generated when omitted).
    #[arg(long, requires = "rx_queue")]
    tx_queue: Option<String>,

    /// Remote-memory queue this side receives on.
    #[arg(long, env = "IRQBRIDGE_RMEM_RX")]
    rmem_rx_queue: String,

    /// Remote-memory queue this side sends on.
    #[arg(long, env = "IRQBRIDGE_RMEM_TX")]
    rmem_tx_queue: String,

    /// Acknowledge every exit as successful right after printing it.
    #[arg(long)]
    auto_ack: bool,

    /// Bound for each receive on the inbound queue, in milliseconds.
    #[arg(
        long,
        env = "IRQBRIDGE_POLL_INTERVAL_MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_interval_ms: u64,

    /// Longest wait for room in the event queue, in milliseconds.
    #[arg(long, env = "IRQBRIDGE_PUSH_TIMEOUT_MS", default_value_t = 250)]
    push_timeout_ms: u64,

    /// Consecutive bad reads tolerated before giving up (0 = unlimited).
    #[arg(long, default_value_t = irqbridge::DEFAULT_MAX_CONSECUTIVE_FAILURES)]
    max_consecutive_failures: u32,

    /// Capacity of the local event queue.
    #[arg(long, default_value_t = 64)]
    queue_depth: usize,
}

#[derive(Args, Debug)]
struct InjectArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Interrupt number.
    #[arg(long)]
    irq: u32,

    /// Destination virtual CPU.
    #[arg(long, default_value_t = 0)]
    cpu: u32,
}

/// Filter directive for an `IRQBRIDGE_LOG` value.
///
/// The library and this binary share the `irqbridge` target prefix.
fn default_directive(irqbridge_log: Option<&str>) -> String {
    let level = match irqbridge_log {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("irqbridge={level}")
}

/// Initialize tracing with IRQBRIDGE_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let irqbridge_log = std::env::var("IRQBRIDGE_LOG").ok();
        EnvFilter::new(default_directive(irqbridge_log.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn connect_target(args: &TargetArgs) -> anyhow::Result<EmulatorTarget> {
    let monitor = QmpMonitor::connect(&args.qmp)
        .await
        .with_context(|| format!("failed to connect to QMP monitor at {}", args.qmp))?;
    Ok(EmulatorTarget::new(
        args.target_name.clone(),
        args.target_kind,
        Arc::new(monitor),
    ))
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

async fn forward(args: ForwardArgs) -> anyhow::Result<()> {
    let target = connect_target(&args.target)
        .await?
        .with_remote_memory(QueuePair::new(args.rmem_rx_queue, args.rmem_tx_queue));

    let queues = match (args.rx_queue, args.tx_queue) {
        (Some(rx), Some(tx)) => QueuePair::new(rx, tx),
        (None, None) => QueuePair::generate("avatar_irq"),
        _ => bail!("--rx-queue and --tx-queue must be given together"),
    };

    let poll_interval = Duration::from_millis(args.poll_interval_ms);
    let config = ProtocolConfig::new()
        .with_poll_interval(poll_interval)
        .with_push_timeout(Duration::from_millis(args.push_timeout_ms))
        .with_max_consecutive_failures(args.max_consecutive_failures);

    let (events_tx, mut events_rx) = mpsc::channel::<ForwardedExitEvent>(args.queue_depth.max(1));
    let mut protocol =
        InterruptProtocol::new(Arc::new(target), Arc::new(events_tx), queues, config);

    protocol
        .enable()
        .await
        .context("failed to enable interrupt forwarding")?;
    info!(rx = %protocol.queues().rx, tx = %protocol.queues().tx, "Forwarding interrupt exits");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut health = tokio::time::interval(poll_interval);

    let result = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            event = events_rx.recv() => {
                let Some(event) = event else {
                    break Ok(());
                };
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, id = event.id, "Failed to serialize event"),
                }
                if args.auto_ack {
                    if let Err(e) = protocol.send_interrupt_exit_response(event.id, true) {
                        warn!(id = event.id, error = %e, "Failed to acknowledge exit");
                    }
                }
            }
            _ = health.tick() => {
                if !protocol.is_listening() {
                    break Err(anyhow::anyhow!("exit listener stopped unexpectedly"));
                }
            }
        }
    };

    if let Some(report) = protocol.shutdown().await {
        info!(
            forwarded = report.stats.forwarded,
            malformed = report.stats.malformed,
            dropped = report.stats.dropped,
            "Session finished"
        );
    }
    result
}

async fn inject(args: InjectArgs) -> anyhow::Result<()> {
    let target = connect_target(&args.target).await?;
    InterruptCommands::new(Arc::new(target))
        .inject_interrupt(args.irq, args.cpu)
        .await
        .with_context(|| format!("failed to inject interrupt {}", args.irq))?;
    info!(irq = args.irq, cpu = args.cpu, "Done");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    info!("irqbridge {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Forward(args) => forward(args).await,
        Command::Inject(args) => inject(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn forward_requires_both_irq_queues() {
        let result = Cli::try_parse_from([
            "irqbridge",
            "forward",
            "--qmp",
            "127.0.0.1:4444",
            "--rmem-rx-queue",
            "/rmem_rx",
            "--rmem-tx-queue",
            "/rmem_tx",
            "--rx-queue",
            "/irq_rx",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_poll_interval_is_refused() {
        let result = Cli::try_parse_from([
            "irqbridge",
            "forward",
            "--qmp",
            "127.0.0.1:4444",
            "--rmem-rx-queue",
            "/rmem_rx",
            "--rmem-tx-queue",
            "/rmem_tx",
            "--poll-interval-ms",
            "0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn log_level_maps_to_single_directive() {
        assert_eq!(default_directive(None), "irqbridge=info");
        assert_eq!(default_directive(Some("warning")), "irqbridge=warn");
        assert_eq!(default_directive(Some("trace")), "irqbridge=trace");
        assert_eq!(default_directive(Some("bogus")), "irqbridge=info");
    }

    #[test]
    fn inject_parses_kind_and_defaults_cpu() {
        let cli = Cli::try_parse_from([
            "irqbridge",
            "inject",
            "--qmp",
            "unix:/tmp/qmp.sock",
            "--target-kind",
            "panda",
            "--irq",
            "7",
        ])
        .unwrap();
        match cli.command {
            Command::Inject(args) => {
                assert_eq!(args.target.target_kind, TargetKind::Panda);
                assert_eq!(args.irq, 7);
                assert_eq!(args.cpu, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
