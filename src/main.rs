//! Quicktier CLI
//!
//! Runs the canned tiering scenarios and prints what happened across tiers.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use quicktier::scenarios::{self, ScenarioReport};
use quicktier::{CompileMode, EngineConfig, VERSION};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quicktier")]
#[command(author, version, about = "Tiered execution and deoptimization engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List the canned scenarios
    List,

    /// Run a scenario and print its checks and tiering stats
    Run {
        /// Scenario name, or "all"
        name: String,

        /// Compile mode: synchronous or concurrent
        #[arg(short, long)]
        mode: Option<CompileMode>,

        /// Engine configuration file (JSON)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a scenario, then print each function's bytecode and compiled LIR
    Disasm {
        /// Scenario name
        name: String,

        /// Compile mode: synchronous or concurrent
        #[arg(short, long)]
        mode: Option<CompileMode>,

        /// Engine configuration file (JSON)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::List => {
            list();
            Ok(true)
        }
        Commands::Run { name, mode, config, json } => run(&name, mode, config, json),
        Commands::Disasm { name, mode, config } => disasm(&name, mode, config).map(|_| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over `-v`
fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn list() {
    println!("Quicktier v{} scenarios:", VERSION);
    for scenario in scenarios::all() {
        println!("  {:<18} {}", scenario.name, scenario.description);
    }
}

fn load_config(path: Option<PathBuf>, mode: Option<CompileMode>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(mode) = mode {
        config = config.with_compile_mode(mode);
    }
    config.validate()?;
    Ok(config)
}

fn run(name: &str, mode: Option<CompileMode>, config: Option<PathBuf>, json: bool) -> anyhow::Result<bool> {
    let config = load_config(config, mode)?;
    let selected: Vec<_> = if name == "all" {
        scenarios::all().iter().collect()
    } else {
        match scenarios::find(name) {
            Some(scenario) => vec![scenario],
            None => bail!("unknown scenario '{}' (try `quicktier list`)", name),
        }
    };

    let reports = selected
        .into_iter()
        .map(|scenario| {
            scenario
                .run(config.clone())
                .with_context(|| format!("running scenario {}", scenario.name))
        })
        .collect::<anyhow::Result<Vec<ScenarioReport>>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("{}", report);
        }
    }
    Ok(reports.iter().all(ScenarioReport::passed))
}

fn disasm(name: &str, mode: Option<CompileMode>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config, mode)?;
    let Some(scenario) = scenarios::find(name) else {
        bail!("unknown scenario '{}' (try `quicktier list`)", name);
    };
    let listing = scenario
        .disassemble(config)
        .with_context(|| format!("running scenario {}", scenario.name))?;
    print!("{}", listing);
    Ok(())
}
