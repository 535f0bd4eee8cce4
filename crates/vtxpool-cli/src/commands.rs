use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use vtxpool::enumerate::EnumerateOptions;
use vtxpool::monitor::{self, DeviceSnapshot};
use vtxpool::registrar::Registrar;
use vtxpool::session::sim::SimSession;
use vtxpool::shm::Namespace;
use vtxpool::types::DeviceType;
use vtxpool::PoolError;

use crate::cli::{Cli, Commands};

pub fn run(cli: Cli) -> Result<()> {
    let ns = Namespace::new(cli.namespace.clone());
    let session = load_session(&cli)?;
    let opts = EnumerateOptions {
        dev_dir: cli.dev_dir.clone(),
        prefix: cli.dev_prefix.clone(),
        ..EnumerateOptions::default()
    };
    let registrar = Registrar::new(ns.clone(), &session, opts);

    match &cli.command {
        Commands::Init(args) => {
            let timeout = Duration::from_secs(args.timeout_secs);
            match registrar.init(!args.skip_fw_check, timeout) {
                Ok(()) => Ok(()),
                // Someone else won the race; the pool is usable either way.
                Err(PoolError::AlreadyInitialized) => {
                    info!("pool already initialized, nothing to do");
                    Ok(())
                }
                Err(e) => Err(e).context("failed to initialize pool"),
            }
        }
        Commands::Refresh(args) => {
            let summary = registrar
                .refresh(!args.skip_fw_check)
                .context("failed to refresh pool")?;
            if summary.is_noop() {
                info!("pool unchanged");
            } else {
                info!(
                    added = summary.added.len(),
                    removed = summary.removed.len(),
                    deferred = summary.deferred.len(),
                    "pool refreshed"
                );
            }
            Ok(())
        }
        Commands::Add(args) => {
            let guid = registrar
                .add_device(&args.device, !args.skip_fw_check)
                .with_context(|| format!("failed to add {}", args.device.display()))?;
            info!(guid, device = %args.device.display(), "device registered");
            Ok(())
        }
        Commands::Remove(args) => {
            registrar
                .remove_device(&args.device)
                .with_context(|| format!("failed to remove {}", args.device.display()))?;
            info!(device = %args.device.display(), "device unregistered");
            Ok(())
        }
        Commands::RemoveAll => registrar
            .remove_all()
            .context("failed to remove pool state"),
        Commands::List(args) => {
            print_pool(&ns, args.device_type.map(Into::into), args.json)
        }
        Commands::Monitor(args) => loop {
            print_pool(&ns, None, args.json)?;
            std::thread::sleep(Duration::from_secs(args.interval_secs.max(1)));
        },
    }
}

fn load_session(cli: &Cli) -> Result<SimSession> {
    match &cli.sim_fixture {
        Some(path) => {
            let session = SimSession::from_json_file(path)
                .with_context(|| format!("failed to load fixture {}", path.display()))?;
            info!(fixture = %path.display(), cards = session.device_paths().len(), "loaded simulated cards");
            Ok(session)
        }
        None => {
            warn!("no --sim-fixture given, device scans will come up empty");
            Ok(SimSession::default())
        }
    }
}

fn print_pool(ns: &Namespace, device_type: Option<DeviceType>, json: bool) -> Result<()> {
    let selected: Vec<(DeviceType, Vec<DeviceSnapshot>)> = match device_type {
        Some(ty) => vec![(ty, monitor::list_devices(ns, ty)?)],
        None => {
            let all = monitor::list_all(ns)?;
            vec![
                (DeviceType::Decoder, all.decoders),
                (DeviceType::Encoder, all.encoders),
            ]
        }
    };

    if json {
        let flat: Vec<&DeviceSnapshot> = selected.iter().flat_map(|(_, d)| d).collect();
        println!("{}", serde_json::to_string_pretty(&flat)?);
        return Ok(());
    }

    for (ty, devices) in selected {
        println!("{ty}s ({}):", devices.len());
        println!(
            "  {:<5} {:<16} {:<10} {:>5} {:>6} {:>6} {:>10} {:>14}",
            "guid", "device", "firmware", "load", "model", "inst", "max inst", "pixels"
        );
        for d in devices {
            println!(
                "  {:<5} {:<16} {:<10} {:>4}% {:>5}% {:>6} {:>10} {:>14}{}",
                d.guid,
                d.device_path,
                d.fw_rev,
                d.current_load,
                d.model_load,
                d.active_instances,
                d.max_instances,
                d.xcode_load_pixel,
                if d.fw_compat_warning { "  (fw warning)" } else { "" }
            );
        }
    }
    Ok(())
}
