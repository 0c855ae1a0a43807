use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use stalkerhunt::{
    engine::{Hunter, RunOptions},
    error::EngineError,
    hunters::{BannerHunter, HuntRecord, PortHunter, ResolveHunter},
    probe::TcpProber,
    report::{FindingFormatter, JsonFormatter, PlainFormatter},
    target::{Target, TargetFile, TargetList, TargetSource},
    worker::Worker,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stalkerhunt")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hunt a set of hosts with bounded concurrency, jittered pacing and per-host timeouts")]
struct Cli {
    #[command(subcommand)]
    hunt: Hunt,

    #[command(flatten)]
    run: RunArgs,

    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Hunt {
    /// TCP connect sweep over a port list
    Ports {
        /// Ports to check, e.g. `22,80,443` or `1-1024`
        #[arg(short = 'p', long = "ports", value_name = "PORTS", default_value = "135,139,445,3389")]
        ports: String,

        /// Connect timeout per port, in milliseconds
        #[arg(long = "connect-timeout", value_name = "MS", default_value = "500")]
        connect_timeout: u64,
    },
    /// Connect to one port and read the service banner
    Banner {
        #[arg(short = 'p', long = "port", value_name = "PORT")]
        port: u16,

        /// Text sent right after connecting (escape sequences \r and \n are expanded)
        #[arg(long = "greeting", value_name = "TEXT")]
        greeting: Option<String>,

        /// Read timeout, in milliseconds
        #[arg(long = "read-timeout", value_name = "MS", default_value = "2000")]
        read_timeout: u64,
    },
    /// Resolve every target name
    Resolve,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Comma-separated targets
    #[arg(short = 't', long = "targets", value_name = "TARGETS", global = true)]
    targets: Option<String>,

    /// File with one target per line (`#` comments allowed)
    #[arg(short = 'f', long = "target-file", value_name = "FILE", global = true)]
    target_file: Option<PathBuf>,

    /// Maximum number of hosts worked on at the same time
    #[arg(long = "throttle", value_name = "NUM", default_value = "20", global = true)]
    throttle: usize,

    /// Per-host timeout in seconds, 0 waits forever
    #[arg(long = "timeout", value_name = "SECONDS", default_value = "0", global = true)]
    timeout: u64,

    /// Pause between two dispatches, in seconds
    #[arg(long = "delay", value_name = "SECONDS", default_value = "0", global = true)]
    delay: f64,

    /// Spread applied to the delay (0.3 = +/-30%)
    #[arg(long = "jitter", value_name = "RATIO", default_value = "0.3", global = true)]
    jitter: f64,

    /// Do not probe hosts before working on them
    #[arg(long = "no-ping", global = true)]
    no_ping: bool,

    /// Port used by the liveness probe
    #[arg(long = "probe-port", value_name = "PORT", default_value = "445", global = true)]
    probe_port: u16,

    /// Stop dispatching after the first host that yields a result
    #[arg(long = "stop-on-success", global = true)]
    stop_on_success: bool,

    /// Abandon timed out hosts instead of rebuilding their execution context
    #[arg(long = "no-close-on-timeout", global = true)]
    no_close_on_timeout: bool,

    /// How often running hosts are checked, in milliseconds
    #[arg(long = "poll-interval", value_name = "MS", default_value = "100", global = true)]
    poll_interval: u64,

    /// Seed for the target shuffle and the jitter
    #[arg(long = "seed", value_name = "SEED", global = true)]
    seed: Option<u64>,

    /// Output format
    #[arg(short = 'o', long = "format", value_enum, default_value = "plain", global = true)]
    format: OutputFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Plain,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);
    debug!("CLI arguments: {:?}", cli);

    let targets = collect_targets(&cli.run)?;
    let options = run_options(&cli.run)?;
    let prober = TcpProber::new(cli.run.probe_port, Duration::from_millis(500));
    let formatter: Box<dyn FindingFormatter<HuntRecord>> = match cli.run.format {
        OutputFormat::Plain => Box::new(PlainFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    };

    match cli.hunt {
        Hunt::Ports {
            ports,
            connect_timeout,
        } => {
            let worker = PortHunter::new(parse_ports(&ports)?)
                .with_connect_timeout(Duration::from_millis(connect_timeout));
            hunt(worker, options, prober, &targets, formatter.as_ref()).await
        }
        Hunt::Banner {
            port,
            greeting,
            read_timeout,
        } => {
            let mut worker = BannerHunter::new(port)
                .with_timeouts(Duration::from_millis(500), Duration::from_millis(read_timeout));
            if let Some(greeting) = greeting {
                worker = worker.with_greeting(unescape(&greeting));
            }
            hunt(worker, options, prober, &targets, formatter.as_ref()).await
        }
        Hunt::Resolve => hunt(ResolveHunter, options, prober, &targets, formatter.as_ref()).await,
    }
}

/// Logs go to stderr so stdout only carries findings.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn collect_targets(args: &RunArgs) -> Result<TargetList> {
    let mut targets: Vec<Target> = Vec::new();

    if let Some(list) = &args.targets {
        let list: TargetList = list.parse()?;
        targets.extend(list.supply()?);
    }
    if let Some(path) = &args.target_file {
        targets.extend(TargetFile::new(path).supply()?);
    }
    if targets.is_empty() {
        anyhow::bail!("no targets specified, use --targets or --target-file");
    }

    Ok(TargetList::new(targets))
}

fn run_options(args: &RunArgs) -> Result<RunOptions> {
    let delay = Duration::try_from_secs_f64(args.delay)
        .with_context(|| format!("invalid delay {} => must be a positive number of seconds", args.delay))?;

    let mut options = RunOptions::default()
        .with_throttle(args.throttle)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_delay(delay, args.jitter)
        .with_probe(!args.no_ping)
        .with_stop_on_first_match(args.stop_on_success)
        .with_close_on_timeout(!args.no_close_on_timeout)
        .with_poll_interval(Duration::from_millis(args.poll_interval));
    if let Some(seed) = args.seed {
        options = options.with_seed(seed);
    }

    options.validate()?;
    Ok(options)
}

/// Parses `22,80,8000-8010`.
fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let mut ports = BTreeSet::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u16 = start.trim().parse().with_context(|| format!("invalid start port in {part}"))?;
                let end: u16 = end.trim().parse().with_context(|| format!("invalid end port in {part}"))?;
                if start > end {
                    anyhow::bail!("invalid port range {part}");
                }
                ports.extend(start..=end);
            }
            None => {
                ports.insert(part.parse().with_context(|| format!("invalid port {part}"))?);
            }
        }
    }
    if ports.is_empty() {
        anyhow::bail!("no ports specified");
    }
    Ok(ports.into_iter().collect())
}

fn unescape(text: &str) -> String {
    text.replace("\\r", "\r").replace("\\n", "\n")
}

async fn hunt<W>(
    worker: W,
    options: RunOptions,
    prober: TcpProber,
    targets: &TargetList,
    formatter: &dyn FindingFormatter<HuntRecord>,
) -> Result<()>
where
    W: Worker<Record = HuntRecord>,
{
    let hunter = Hunter::new(worker)
        .with_options(options)
        .with_prober(prober);
    let mut run = hunter.start(targets)?;

    let stop = run.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, waiting for running hosts to finish");
            stop.cancel();
        }
    });

    while let Some(finding) = run.next().await {
        println!("{}", formatter.format_finding(&finding)?);
    }

    match run.finish().await {
        Ok(summary) => {
            println!("{}", formatter.format_summary(&summary)?);
            info!("done");
            Ok(())
        }
        Err(EngineError::Aborted { reason, summary }) => {
            println!("{}", formatter.format_summary(&summary)?);
            Err(anyhow::anyhow!("hunt aborted: {reason}"))
        }
        Err(e) => Err(e.into()),
    }
}
