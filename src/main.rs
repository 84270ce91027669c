use actix::Actor;
use clap::Parser;
use colored::Colorize;
use std::time::Duration;

use reservation_fabric::config::{ActorType, Config};
use reservation_fabric::handler::NoopHandler;
use reservation_fabric::kernel::{ActorRole, Kernel, KernelState, Tick};
use reservation_fabric::logger;
use reservation_fabric::policy::{AuthorityPolicy, BrokerPolicy, OrchestratorPolicy};
use reservation_fabric::runtime::Runtime;
use std::sync::Arc;

/// Reservation fabric actor process: runs exactly one of orchestrator,
/// broker, or authority, selected by `actor.type` in the config file
/// (spec §6 "Config surface").
#[derive(Parser, Debug)]
#[command(name = "reservation-fabric", about = "Calendar-based reservation arbitration kernel")]
struct Cli {
    /// Path to the TOML config file (spec §6 config surface).
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

fn role_for(actor_type: ActorType, runtime: &Runtime) -> ActorRole {
    match actor_type {
        ActorType::Orchestrator => ActorRole::Orchestrator(OrchestratorPolicy::default()),
        ActorType::Broker => ActorRole::Broker(BrokerPolicy::new(runtime.config.actor_controls.clone())),
        ActorType::Authority => ActorRole::Authority(AuthorityPolicy::new(runtime.config.actor_controls.oversubscription_factor)),
    }
}

#[actix_rt::main]
async fn main() {
    logger::init();

    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} failed to load config '{}': {e}", "error:".red().bold(), cli.config);
            std::process::exit(1);
        }
    };

    let runtime = match Runtime::bootstrap(config) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{} failed to bootstrap runtime: {e}", "error:".red().bold());
            std::process::exit(1);
        }
    };

    println!(
        "{} {} actor starting ({})",
        "reservation-fabric".green().bold(),
        format!("{:?}", runtime.config.actor_type).to_lowercase(),
        runtime.config.actor_guid.cyan()
    );

    let actor_guid = reservation_fabric::id::ActorGuid::new();
    let callback_topic = format!("{}-in", runtime.config.actor_guid);
    let role = role_for(runtime.config.actor_type, &runtime);
    let cycle = Duration::from_millis(runtime.config.time.cycle_millis.max(1) as u64);

    let mut state = KernelState::new(actor_guid, callback_topic, role, runtime.clock.clone(), runtime.store.clone(), runtime.metrics.clone())
        .with_commit_batch_size(runtime.config.transport.commit_batch_size)
        .with_rpc_retries(runtime.config.transport.rpc_retries)
        .with_peers(runtime.peers.clone());
    // Demo wiring: `actor.controls.resources` names a handler module key per
    // resource type; this binary only bundles the no-op handler, so every
    // configured key resolves to it until a real substrate adapter is
    // registered (spec §4.5, §9 redesign flag: compile-time registry, no
    // dynamic class loading).
    for key in runtime.config.actor_controls.resources.values() {
        state.handler_registry.register(key.clone(), Arc::new(NoopHandler));
    }
    state.resource_map = runtime.config.actor_controls.resources.clone();

    // Replay-on-restart (spec §4.1, §8 scenario 6): repopulate slices,
    // reservations, delegations, and calendar buckets from the last
    // committed snapshot before the first tick is ever driven.
    if let Err(e) = state.hydrate(runtime.store.as_ref()).await {
        eprintln!("{} failed to hydrate state from store: {e}", "error:".red().bold());
        std::process::exit(1);
    }

    let provisioning_pool = Arc::new(tokio::sync::Semaphore::new(runtime.config.actor_controls.provisioning_pool_size.max(1)));
    let kernel = Kernel { state, bus: runtime.bus.clone(), provisioning_pool }.start();

    log::info!("kernel started; driving ticks every {:?}", cycle);

    let clock_manual = runtime.config.time.manual;
    let tick_kernel = kernel.clone();
    let ticker = tokio::spawn(async move {
        if clock_manual {
            // A manual clock is stepped by a test harness / external driver,
            // not by this loop (spec §4.1 "Clock ... stepped, ticks driven
            // by test harness"); the process still runs so the mailbox can
            // be fed externally.
            return;
        }
        loop {
            tokio::time::sleep(cycle).await;
            tick_kernel.do_send(Tick);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown signal received");
        }
        _ = ticker => {}
    }

    runtime.shutdown();
    println!("{}", "reservation-fabric stopped".yellow());
}
