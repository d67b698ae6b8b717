mod cli;
mod config;
mod error;
mod ifb;
mod logging;
mod reconcile;
mod registry;
mod resolver;
mod runner;
mod speedtest;
mod tc;
mod teardown;
mod topology;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Args;
use config::GlobalConfig;
use registry::FilterRegistry;
use resolver::CompiledGroup;
use runner::Runner;
use teardown::TeardownStack;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.logging_level);

    let loaded = config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    let global = if args.speed_test {
        apply_speed_test(&loaded.global)
    } else {
        loaded.global
    };

    let groups: Vec<CompiledGroup> = loaded
        .groups
        .iter()
        .map(CompiledGroup::compile)
        .collect::<Result<_>>()
        .context("failed to compile group match conditions")?;

    let runner = Runner::new();
    let mut teardown = TeardownStack::new();

    let topology = topology::build(
        &runner,
        &mut teardown,
        topology::BuildParams {
            device: &args.device,
            global: &global,
            groups: &loaded.groups,
        },
    )
    .context("failed to build kernel shaping topology")?;

    log::info!(
        "topology ready on {} (ifb {}); entering reconciliation loop",
        topology.device,
        topology.ifb_device
    );

    let tc_driver = tc::TcDriver::new(&runner);
    let mut registry = FilterRegistry::new();
    let mut group_ports = reconcile::GroupPortState::new();
    let delay = Duration::from_secs_f64(args.delay.max(0.0));

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                reconcile::tick(&tc_driver, &topology, &groups, &mut registry, &mut group_ports);
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("received interrupt, tearing down");
                break;
            }
            _ = terminate() => {
                log::info!("received termination signal, tearing down");
                break;
            }
        }
    }

    teardown.run();
    Ok(())
}

/// Resolves once SIGTERM is received, so a service manager's stop request
/// drains teardown the same way an interactive Ctrl+C does.
async fn terminate() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

/// Measures the link and substitutes the measured rates for the
/// configured global download/upload rate, falling back to the
/// configured values (or leaving them unset) if the measurement fails.
fn apply_speed_test(global: &GlobalConfig) -> GlobalConfig {
    let runner = Runner::new();
    match speedtest::measure(&runner) {
        Ok(measured) => {
            log::info!(
                "speed test measured {:.0} bps down / {:.0} bps up",
                measured.download_bps,
                measured.upload_bps
            );
            let mut global = global.clone();
            global.download_rate = Some(config::Rate(format!("{}bps", measured.download_bps as u64)));
            global.upload_rate = Some(config::Rate(format!("{}bps", measured.upload_bps as u64)));
            global
        }
        Err(e) => {
            log::warn!("speed test failed, falling back to configured rates: {e}");
            global.clone()
        }
    }
}
