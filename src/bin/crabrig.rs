// crabrig capture module
// Speaks the line protocol on stdin/stdout; logs go to stderr.

use anyhow::{bail, Context};
use crabrig::backend::{BackendSet, MockBackend};
use crabrig::cache::{CapabilityCache, FileStore};
use crabrig::protocol::{ChannelSettings, CommandChannel, WriterSink};
use crabrig::registry::{DeviceRegistry, RegistrySettings};
use crabrig::{BackendKind, RigConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

struct Args {
    config: PathBuf,
    backends: Vec<BackendKind>,
    mock_devices: usize,
}

fn print_usage() {
    eprintln!("crabrig {}", crabrig::VERSION);
    eprintln!();
    eprintln!("Usage: crabrig [--config PATH] [--backend KIND]... [--mock-devices N]");
    eprintln!();
    eprintln!("  --config PATH      configuration file (default: crabrig.toml)");
    eprintln!("  --backend KIND     usb, csi or mock; repeatable, overrides the config");
    eprintln!("  --mock-devices N   plug N synthetic devices into the mock backend");
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args {
        config: RigConfig::default_path(),
        backends: Vec::new(),
        mock_devices: 0,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                args.config = iter.next().context("--config needs a path")?.into();
            }
            "--backend" => {
                let value = iter.next().context("--backend needs a kind")?;
                let kind = value.parse::<BackendKind>().map_err(anyhow::Error::msg)?;
                args.backends.push(kind);
            }
            "--mock-devices" => {
                let value = iter.next().context("--mock-devices needs a count")?;
                args.mock_devices = value
                    .parse()
                    .with_context(|| format!("invalid device count: {}", value))?;
            }
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            other => {
                print_usage();
                bail!("unknown argument: {}", other);
            }
        }
    }
    Ok(Some(args))
}

/// How long runtime shutdown waits for blocking work, such as a stdin read
/// that will never complete, before leaving it behind.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    crabrig::init_logging();
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;
    let result = runtime.block_on(serve(args));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

/// Backends requested by the command line, falling back to the config.
/// Synthetic devices alone select the mock backend only.
fn resolve_backends(args: &Args, configured: &[BackendKind]) -> Vec<BackendKind> {
    let mut backends = if !args.backends.is_empty() {
        args.backends.clone()
    } else if args.mock_devices > 0 {
        Vec::new()
    } else {
        configured.to_vec()
    };
    if args.mock_devices > 0 && !backends.contains(&BackendKind::Mock) {
        backends.push(BackendKind::Mock);
    }
    backends
}

async fn serve(args: Args) -> anyhow::Result<()> {
    let mut config = RigConfig::load_validated(&args.config)
        .with_context(|| format!("loading {:?}", args.config))?;
    config.runtime.backends = resolve_backends(&args, &config.runtime.backends);
    let mock = (args.mock_devices > 0).then(|| MockBackend::with_reference_devices(args.mock_devices));

    let backends = BackendSet::from_kinds(&config.runtime.backends, mock)
        .context("configuring capture backends")?;
    let cache = Arc::new(CapabilityCache::new(Arc::new(FileStore::new(
        config.storage.cache_directory.clone(),
    ))));
    let backend_names: Vec<String> = backends.names().iter().map(|n| n.to_string()).collect();

    let (registry, events) =
        DeviceRegistry::spawn(RegistrySettings::from_config(&config), backends, cache);
    let channel = CommandChannel::new(
        registry,
        events,
        WriterSink::stdout(),
        ChannelSettings::from_config(&config),
    )
    .with_backends(backend_names);

    let interrupt = channel.interrupt_handle();
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl-C");
        interrupt.notify_one();
    })
    .context("installing Ctrl-C handler")?;

    channel
        .run(BufReader::new(tokio::io::stdin()))
        .await
        .context("command channel failed")?;
    Ok(())
}
