use clap::{Parser, Subcommand};
use rpc_reactor::config::Settings;
use rpc_reactor::{
    BridgeResult, CallRegistry, MemChannel, ReadDecision, Reactor, RunMode, Scheduler, Status,
    StreamCallbacks, StreamReactor, UnaryReactor,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Weak};

const LIST_FEATURES: &str = "ListFeatures";
const GET_FEATURE: &str = "GetFeature";

/// Drive reactor-based RPC calls through a single-threaded scheduler
#[derive(Parser)]
#[command(name = "rpc-reactor")]
#[command(version)]
#[command(about = "Drive reactor-based RPC calls through a single-threaded scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream features one at a time, then fetch the last one with a unary call
    Demo {
        /// Number of features the stream produces
        #[arg(long, default_value_t = 5)]
        items: u32,

        /// Transport latency per response, overriding the settings file
        #[arg(long)]
        latency_ms: Option<u64>,

        /// Cancel the stream after the second feature
        #[arg(long)]
        cancel: bool,

        /// Settings file (default: $XDG_CONFIG_HOME/rpc-reactor/rpc-reactor.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective settings as TOML
    PrintConfig {
        /// Settings file (default: $XDG_CONFIG_HOME/rpc-reactor/rpc-reactor.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone)]
struct Feature {
    id: u32,
    name: String,
}

impl Feature {
    fn new(id: u32) -> Self {
        Self {
            id,
            name: format!("feature-{id}"),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Demo {
            items,
            latency_ms,
            cancel,
            config,
        } => Settings::load_or_default(config.as_deref()).and_then(|mut settings| {
            if let Some(latency_ms) = latency_ms {
                settings.transport.latency_ms = latency_ms;
            }
            init_logging(&settings);
            run_demo(&settings, items, cancel)
        }),
        Commands::PrintConfig { config } => Settings::load_or_default(config.as_deref())
            .and_then(|settings| settings.to_toml_string())
            .map(|rendered| print!("{rendered}")),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(settings: &Settings) {
    let env = env_logger::Env::default().default_filter_or(settings.logging.filter.clone());
    env_logger::Builder::from_env(env).init();
}

fn run_demo(settings: &Settings, items: u32, cancel: bool) -> BridgeResult<()> {
    let scheduler = Arc::new(Scheduler::new(settings.scheduler.clone()));
    let registry: Arc<CallRegistry<&'static str>> = Arc::new(CallRegistry::new());
    let channel = MemChannel::new(&settings.transport)?;

    let list_features =
        channel.stream(|limit: u32| Ok((1..=limit).map(Feature::new).collect::<Vec<_>>()));
    let get_feature = channel.unary(|id: u32| {
        if id == 0 {
            Err(Status::not_found("feature 0 does not exist"))
        } else {
            Ok(Feature::new(id))
        }
    });

    // Stream items: take each one, which also resumes the stream.
    let mut received = 0u32;
    scheduler.register_handler("ListFeaturesOnItem", move |event| {
        let Some(reactor) = event.payload::<StreamReactor<Feature>>() else {
            return Err("ListFeaturesOnItem without a stream reactor".into());
        };
        if let Some(feature) = reactor.take_response() {
            received += 1;
            log::info!(
                target: "rpc_reactor::demo::list_features",
                "Received {} ({}/{})",
                feature.name,
                feature.id,
                items
            );
        }
        if cancel && received == 2 {
            log::info!(target: "rpc_reactor::demo::list_features", "Cancelling stream");
            reactor.try_cancel();
        }
        Ok(())
    })?;

    // Stream end: release the key, then issue the unary call.
    {
        let registry = registry.clone();
        let sender = scheduler.sender();
        scheduler.register_handler("ListFeaturesOnEnd", move |event| {
            if let Some(call_id) = event.call_id() {
                registry.release_call(&LIST_FEATURES, call_id);
            }
            let status = event
                .payload::<StreamReactor<Feature>>()
                .and_then(|reactor| reactor.status())
                .unwrap_or_else(|| Status::internal("stream ended without status"));
            log::info!(
                target: "rpc_reactor::demo::list_features",
                "Stream finished: {}",
                status
            );

            let slot = registry.try_acquire(GET_FEATURE)?;
            let sender = sender.clone();
            let reactor = Arc::new(UnaryReactor::<Feature>::new(move |reactor| {
                if let Err(err) = sender.enqueue_call("GetFeatureOnDone", reactor) {
                    log::warn!(target: "rpc_reactor::demo::get_feature", "{}", err);
                }
            }));
            reactor.start(&get_feature, items)?;
            slot.occupy(reactor);

            if let Err(err) = registry.try_acquire(GET_FEATURE) {
                log::info!(
                    target: "rpc_reactor::demo::get_feature",
                    "Second request rejected: {}",
                    err
                );
            }
            Ok(())
        })?;
    }

    // Unary completion: report and stop the loop.
    {
        let registry = registry.clone();
        let scheduler_ref: Weak<Scheduler> = Arc::downgrade(&scheduler);
        scheduler.register_handler("GetFeatureOnDone", move |event| {
            if let Some(call_id) = event.call_id() {
                registry.release_call(&GET_FEATURE, call_id);
            }
            if let Some(reactor) = event.payload::<UnaryReactor<Feature>>() {
                match reactor.take_response() {
                    Some(feature) => log::info!(
                        target: "rpc_reactor::demo::get_feature",
                        "Fetched {:?}",
                        feature
                    ),
                    None => log::warn!(
                        target: "rpc_reactor::demo::get_feature",
                        "Fetch failed: {}",
                        reactor
                            .status()
                            .unwrap_or_else(|| Status::internal("no status"))
                    ),
                }
            }
            if let Some(scheduler) = scheduler_ref.upgrade() {
                scheduler.halt();
            }
            Ok(())
        })?;
    }

    let slot = registry.try_acquire(LIST_FEATURES)?;
    let item_sender = scheduler.sender();
    let end_sender = scheduler.sender();
    let callbacks = StreamCallbacks::new(
        move |reactor, _: &Feature| {
            if let Err(err) = item_sender.enqueue_call("ListFeaturesOnItem", reactor) {
                log::warn!(target: "rpc_reactor::demo::list_features", "{}", err);
            }
            ReadDecision::Hold
        },
        move |reactor| {
            if let Err(err) = end_sender.enqueue_call("ListFeaturesOnEnd", reactor) {
                log::warn!(target: "rpc_reactor::demo::list_features", "{}", err);
            }
        },
    );
    let stream = Arc::new(StreamReactor::new(callbacks));
    stream.start(&list_features, items)?;
    let call_id = slot.occupy(stream);
    log::info!(
        target: "rpc_reactor::demo",
        "Started {} as call {}",
        LIST_FEATURES,
        call_id
    );

    scheduler.run(RunMode::Blocking)?;

    let cancelled = registry.cancel_all();
    log::info!(
        target: "rpc_reactor::demo",
        "Demo finished ({} call(s) still live)",
        cancelled
    );
    Ok(())
}
