//! `netaudit` - operator CLI for the analysis scheduler

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use netaudit_core::{
    init_tracing, AnalysisKind, AnalysisTarget, BackendError, Callbacks, FileFlagStore, FlagStore,
    LoggingConfig, MemoryFlagStore, Outcome, ResourceId, RunRequest, SchedulerConfig,
    SchedulerServices, Script, SimulatedBackend, SystemNotice,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Jobs queued by `simulate`, in request order
const SIMULATED_KINDS: [AnalysisKind; 3] = [
    AnalysisKind::NetworkOverview,
    AnalysisKind::Recommendations,
    AnalysisKind::Topology,
];

fn cli() -> Command {
    Command::new("netaudit")
        .version(netaudit_core::VERSION)
        .about("Background analysis scheduler")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("simulate")
                .about("Run a project's analyses against the simulated backend")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Scheduler config file (TOML)"),
                )
                .arg(
                    Arg::new("project")
                        .long("project")
                        .default_value("P1")
                        .help("Project to analyse"),
                )
                .arg(
                    Arg::new("polls")
                        .long("polls")
                        .default_value("3")
                        .value_parser(value_parser!(u32))
                        .help("Not-ready answers before each result"),
                )
                .arg(
                    Arg::new("interval-ms")
                        .long("interval-ms")
                        .value_parser(value_parser!(u64))
                        .help("Override the poll interval"),
                )
                .arg(
                    Arg::new("fail-status")
                        .long("fail-status")
                        .action(ArgAction::SetTrue)
                        .help("Make the topology status check fail"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print system notices as JSON lines"),
                ),
        )
        .subcommand(
            Command::new("flags")
                .about("Inspect or repair the in-flight flag store")
                .subcommand_required(true)
                .subcommand(
                    Command::new("list")
                        .about("List in-flight flags")
                        .arg(store_arg()),
                )
                .subcommand(
                    Command::new("clear")
                        .about("Clear one flag or all of them")
                        .arg(store_arg())
                        .arg(
                            Arg::new("key")
                                .long("key")
                                .conflicts_with("all")
                                .help("Flag key to clear"),
                        )
                        .arg(
                            Arg::new("all")
                                .long("all")
                                .action(ArgAction::SetTrue)
                                .help("Clear every flag"),
                        ),
                ),
        )
}

fn store_arg() -> Arg {
    Arg::new("store")
        .long("store")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Path to the flag store file")
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let passed = simulate(args).await?;
            std::process::exit(if passed { 0 } else { 1 });
        }
        Some(("flags", args)) => {
            init_tracing(&LoggingConfig::default());
            match args.subcommand() {
                Some(("list", args)) => list_flags(args),
                Some(("clear", args)) => clear_flags(args),
                _ => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

fn load_config(args: &ArgMatches) -> Result<SchedulerConfig> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => SchedulerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SchedulerConfig::new(),
    };
    if let Some(ms) = args.get_one::<u64>("interval-ms") {
        config = config.with_poll_interval(Duration::from_millis(*ms));
    }
    config.validate()?;
    Ok(config)
}

/// Queue every simulated kind for one project and wait for all outcomes
///
/// Returns whether every job succeeded.
async fn simulate(args: &ArgMatches) -> Result<bool> {
    let config = load_config(args)?;
    init_tracing(&config.logging);

    let project = args
        .get_one::<String>("project")
        .map_or("P1", String::as_str);
    let polls = args.get_one::<u32>("polls").copied().unwrap_or(3);
    let fail_status = args.get_flag("fail-status");
    let json = args.get_flag("json");

    let resource = ResourceId::project(project);
    let backend = Arc::new(SimulatedBackend::new());
    for kind in SIMULATED_KINDS {
        let target = AnalysisTarget::new(kind, resource.clone())?;
        let script = if fail_status && kind == AnalysisKind::Topology {
            Script::fail_after(polls, BackendError::Transport("simulated status failure".into()))
        } else {
            Script::ready_after(polls)
        };
        backend.script(&target, script);
    }

    let services = SchedulerServices::new(
        Arc::new(MemoryFlagStore::new()),
        backend,
        config.clone(),
    );
    let mut sink = services.bus().mount_sink();
    let (tx, mut rx) = mpsc::unbounded_channel::<(AnalysisKind, Outcome)>();

    let mut expected = 0usize;
    for kind in SIMULATED_KINDS {
        let coordinator = services.coordinator(kind, resource.clone())?;
        let (ok, err) = (tx.clone(), tx.clone());
        let callbacks = Callbacks::new(
            move |payload| {
                let _ = ok.send((kind, Outcome::Success(payload.clone())));
            },
            move |message| {
                let _ = err.send((kind, Outcome::Failure(message.to_string())));
            },
        );

        match coordinator.request_analysis(callbacks) {
            RunRequest::Started(id) => {
                expected += 1;
                println!("{kind}: started ({id})");
            }
            RunRequest::Queued { position, .. } => {
                expected += 1;
                println!("{kind}: queued at position {position}");
            }
            RunRequest::AlreadyInFlight => println!("{kind}: already in flight"),
        }
    }
    drop(tx);

    let per_job = config.poll_interval() * (polls + 2) + config.start_timeout();
    let budget = per_job * u32::try_from(expected).unwrap_or(u32::MAX);
    let deadline = tokio::time::sleep(budget);
    tokio::pin!(deadline);

    let (mut settled, mut failed) = (0usize, 0usize);
    while settled < expected {
        tokio::select! {
            Some((kind, outcome)) = rx.recv() => {
                settled += 1;
                match outcome {
                    Outcome::Success(payload) => println!("{kind}: ready {payload}"),
                    Outcome::Failure(error) => {
                        failed += 1;
                        println!("{kind}: failed: {error}");
                    }
                }
            }
            Some(notice) = sink.recv() => print_notice(&notice, json)?,
            () = &mut deadline => {
                bail!("timed out after {budget:?} with {} job(s) unsettled", expected - settled);
            }
        }
    }
    while let Some(notice) = sink.try_recv() {
        print_notice(&notice, json)?;
    }

    println!("{settled} job(s) settled, {failed} failed");
    Ok(failed == 0)
}

fn print_notice(notice: &SystemNotice, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(notice)?);
    } else {
        println!("[notice] {}: {}", notice.title, notice.message);
    }
    Ok(())
}

fn list_flags(args: &ArgMatches) -> Result<()> {
    let store = open_store(args)?;
    let keys = store.keys();
    if keys.is_empty() {
        println!("no in-flight flags");
    }
    for key in keys {
        println!("{key}");
    }
    Ok(())
}

fn clear_flags(args: &ArgMatches) -> Result<()> {
    let store = open_store(args)?;

    let keys = if args.get_flag("all") {
        store.keys()
    } else if let Some(key) = args.get_one::<String>("key") {
        if !store.get(key) {
            bail!("flag {key} is not set");
        }
        vec![key.clone()]
    } else {
        bail!("pass --key KEY or --all");
    };

    for key in &keys {
        store
            .clear(key)
            .with_context(|| format!("clearing {key}"))?;
        tracing::info!(%key, "flag cleared");
    }
    println!("cleared {} flag(s)", keys.len());
    Ok(())
}

fn open_store(args: &ArgMatches) -> Result<FileFlagStore> {
    let path = args
        .get_one::<PathBuf>("store")
        .context("--store is required")?;
    FileFlagStore::open(path).with_context(|| format!("opening flag store {}", path.display()))
}
