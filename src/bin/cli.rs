use crabrig::backend::{BackendSet, MockBackend};
use crabrig::cache::{CapabilityCache, FileStore};
use crabrig::registry::{DeviceRegistry, RegistryEvent, RegistrySettings};
use crabrig::{BackendKind, DeviceCapabilities, RigConfig};
use std::env;
use std::sync::Arc;
use std::time::Duration;

type CliResult = Result<(), Box<dyn std::error::Error>>;

const USAGE: &str = "Usage: crabrig-cli <list-devices|probe <device_id>|cache <device_id>> \
                     [--config PATH] [--mock-devices N] [--json]";

struct Options {
    config: RigConfig,
    mock_devices: usize,
    json: bool,
}

fn parse_options(args: &[String]) -> Result<Options, Box<dyn std::error::Error>> {
    let mut config_path = RigConfig::default_path();
    let mut mock_devices = 0;
    let mut json = false;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = args.get(i).ok_or("--config needs a path")?.into();
            }
            "--mock-devices" => {
                i += 1;
                mock_devices = args.get(i).ok_or("--mock-devices needs a count")?.parse()?;
            }
            "--json" => json = true,
            _ => {}
        }
        i += 1;
    }
    let mut config = RigConfig::load_validated(&config_path)?;
    if mock_devices > 0 {
        config.runtime.backends = vec![BackendKind::Mock];
    }
    // one-shot commands enumerate on demand
    config.discovery.poll_interval_ms = 0;
    Ok(Options {
        config,
        mock_devices,
        json,
    })
}

fn main() -> CliResult {
    crabrig::init_logging();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let command = &args[1];
    match command.as_str() {
        "list-devices" => runtime.block_on(cmd_list_devices(&args[2..])),
        "probe" => runtime.block_on(cmd_probe(&args[2..])),
        "cache" => cmd_cache(&args[2..]),
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    }
}

fn start_registry(
    options: &Options,
) -> Result<(DeviceRegistry, tokio::sync::mpsc::UnboundedReceiver<RegistryEvent>), Box<dyn std::error::Error>>
{
    let mock = (options.mock_devices > 0)
        .then(|| MockBackend::with_reference_devices(options.mock_devices));
    let backends = BackendSet::from_kinds(&options.config.runtime.backends, mock)?;
    let cache = Arc::new(CapabilityCache::new(Arc::new(FileStore::new(
        options.config.storage.cache_directory.clone(),
    ))));
    Ok(DeviceRegistry::spawn(
        RegistrySettings::from_config(&options.config),
        backends,
        cache,
    ))
}

async fn cmd_list_devices(args: &[String]) -> CliResult {
    let options = parse_options(args)?;
    let (registry, _events) = start_registry(&options)?;
    registry.discover_now().await?;
    let devices = registry.devices().await?;
    registry.shutdown().await?;

    if options.json {
        println!("{}", serde_json::to_string(&devices)?);
    } else if devices.is_empty() {
        println!("No devices found");
    } else {
        for d in devices {
            println!(
                "{}: {} [{}]",
                d.identity.stable_id,
                d.identity.display_name(),
                d.identity.backend
            );
        }
    }
    Ok(())
}

async fn cmd_probe(args: &[String]) -> CliResult {
    let Some(device_id) = args.first().filter(|a| !a.starts_with("--")) else {
        eprintln!("Usage: crabrig-cli probe <device_id> [--json]");
        std::process::exit(1);
    };
    let options = parse_options(&args[1..])?;
    let (registry, mut events) = start_registry(&options)?;
    registry.discover_now().await?;
    registry.device(device_id).await?;

    let limit = options.config.discovery.probe_timeout() + Duration::from_secs(1);
    let ready = tokio::time::timeout(limit, async {
        while let Some(event) = events.recv().await {
            if let RegistryEvent::CapabilitiesReady { stable_id, .. } = &event {
                if stable_id == device_id {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    let device = registry.device(device_id).await?;
    registry.shutdown().await?;

    let Some(capabilities) = device.capabilities.filter(|_| ready) else {
        return Err(format!("no capabilities for {} within {:?}", device_id, limit).into());
    };
    print_capabilities(&capabilities, options.json)
}

fn cmd_cache(args: &[String]) -> CliResult {
    let Some(device_id) = args.first().filter(|a| !a.starts_with("--")) else {
        eprintln!("Usage: crabrig-cli cache <device_id> [--json]");
        std::process::exit(1);
    };
    let options = parse_options(&args[1..])?;
    let cache = CapabilityCache::new(Arc::new(FileStore::new(
        options.config.storage.cache_directory.clone(),
    )));
    let Some(cached) = cache.load(device_id) else {
        println!("No cache entry for {}", device_id);
        return Ok(());
    };

    println!("Saved at: {}", cached.saved_at.to_rfc3339());
    if let Some(selected) = &cached.selected_config {
        println!(
            "Selected: preview {} / record {}",
            selected.preview_mode, selected.record_mode
        );
    }
    match &cached.capabilities {
        Some(capabilities) => print_capabilities(capabilities, options.json),
        None => {
            println!("No capabilities cached");
            Ok(())
        }
    }
}

fn print_capabilities(capabilities: &DeviceCapabilities, json: bool) -> CliResult {
    if json {
        println!("{}", serde_json::to_string(capabilities)?);
        return Ok(());
    }
    for mode in &capabilities.modes {
        let key = mode.key();
        let mut markers = Vec::new();
        if key == capabilities.default_preview_mode {
            markers.push("preview");
        }
        if key == capabilities.default_record_mode {
            markers.push("record");
        }
        if markers.is_empty() {
            println!("{}", key);
        } else {
            println!("{} ({})", key, markers.join(", "));
        }
    }
    for (size, fps) in &capabilities.limits {
        println!("limit {} <= {} fps", size, fps);
    }
    Ok(())
}
