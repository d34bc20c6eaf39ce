//! seqctl CLI - Command-line interface for sequence tooling
//!
//! Validates and compiles sequences, runs them against a simulated
//! controller, and serves the NDJSON request protocol over stdio.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use seqctl::compiler::{FaultInjector, Tier, compile};
use seqctl::runtime::storage::{self, ProjectStore};
use seqctl::runtime::{
    DeviceRegistry, Engine, RuntimeConfig, SimulatedConnector, SimulatedPlc, endpoint,
};
use seqctl::sequence::{inventory, parse_sequence, validate};
use seqctl::service::Service;
use seqctl::tags::ProjectConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

#[derive(Parser)]
#[command(name = "seqctl")]
#[command(about = "Validate, compile and run pneumatic actuator sequences", long_about = None)]
struct Cli {
    /// Root directory for configuration and projects
    #[arg(short, long, default_value = ".seqctl")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration
    Init,

    /// Check a sequence and list every problem
    Validate {
        /// Sequence text, e.g. "A+,B+,(A-,B-)"
        sequence: String,
    },

    /// Compile a sequence to structured text
    Compile {
        /// Sequence text
        sequence: String,

        /// Faulted variant request, "<0|1>,<none|easy|medium|hard>"
        #[arg(long, default_value = "0,none")]
        errors: String,

        /// Project configuration file binding tag names
        #[arg(long)]
        project: Option<PathBuf>,

        /// Seed for the fault injector
        #[arg(long)]
        seed: Option<u64>,

        /// Print the tag table
        #[arg(long)]
        tags: bool,
    },

    /// List the components a sequence needs
    Components {
        /// Sequence text
        sequence: String,

        /// Project configuration file to check against
        #[arg(long)]
        project: Option<PathBuf>,
    },

    /// Run a sequence against a simulated controller
    Simulate {
        /// Sequence text
        sequence: String,

        /// Actuator travel time in milliseconds
        #[arg(long, default_value = "200")]
        travel_ms: u64,
    },

    /// Serve NDJSON requests on stdin/stdout
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries program text and protocol responses
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let config = RuntimeConfig {
                root: cli.root.clone(),
                ..RuntimeConfig::default()
            };
            storage::init_storage(&config.root)?;
            storage::write_config(&config)?;
            println!("Initialized seqctl at {:?}", cli.root);
        }

        Commands::Validate { sequence } => {
            let errors = validate(&sequence);
            if errors.is_empty() {
                println!("Sequence is valid");
            } else {
                for error in &errors {
                    println!("  {}", error);
                }
                bail!("{} problem(s) found", errors.len());
            }
        }

        Commands::Compile {
            sequence,
            errors,
            project,
            seed,
            tags,
        } => {
            let tier = Tier::parse_errors_spec(&errors)?;
            let config = project.as_deref().map(ProjectConfig::load).transpose()?;
            let parsed = parse_sequence(&sequence)?;
            let program = compile(&parsed, config.as_ref())?;

            print!("{}", program.code());
            if let Some(tier) = tier {
                let mut injector = match seed {
                    Some(seed) => FaultInjector::seeded(seed),
                    None => FaultInjector::from_entropy(),
                };
                let faulted =
                    injector.inject(&program.body_lines(), tier, &parsed.actuator_labels());
                println!();
                println!("// Faulted variant ({}, {} faults)", tier, faulted.faults.len());
                print!("{}", faulted.code());
            }
            if tags {
                println!();
                print!("{}", program.tag_table_xml());
            }
        }

        Commands::Components { sequence, project } => {
            let config = project.as_deref().map(ProjectConfig::load).transpose()?;
            let parsed = parse_sequence(&sequence)?;
            let required = inventory(&parsed);
            let missing = config
                .as_ref()
                .map(|config| config.missing(&required))
                .unwrap_or_default();
            for component in &required {
                let status = if config.is_none() {
                    "auto"
                } else if missing.contains(&component.id) {
                    "unassigned"
                } else {
                    "assigned"
                };
                println!("  {:<12} {:?} (step {}) {}", component.id, component.kind, component.first_step, status);
            }
        }

        Commands::Simulate {
            sequence,
            travel_ms,
        } => {
            let parsed = parse_sequence(&sequence)?;
            let config = RuntimeConfig {
                root: cli.root.clone(),
                ..storage::load_or_default(&cli.root)?
            };
            config.validate()?;
            let device = config
                .devices
                .first()
                .map(|device| device.address.clone())
                .context("no devices configured")?;

            let plc = SimulatedPlc::new(Duration::from_millis(travel_ms))
                .with_actuators(parsed.actuator_labels());
            let connector = SimulatedConnector::new();
            connector.insert(endpoint(&device, config.endpoint_port), plc.clone());
            let registry = Arc::new(DeviceRegistry::from_devices(&config.devices));
            let engine = Engine::new(registry, Arc::new(connector), config);

            let report = engine.run(&sequence, &device).await?;
            println!("Run {} on {}: {:?}", report.run_id, report.device, report.outcome);
            println!("  actuation writes: {}", report.actuation_writes);
            println!("  passes: {}", report.passes);
            println!("  T_VARIABLE={} N_VARIABLE={}", report.t_variable, report.n_variable);
            println!("  total writes seen by controller: {}", plc.write_count());
        }

        Commands::Serve => {
            let config = storage::load_or_default(&cli.root)?;
            config.validate()?;
            // Real transports plug in through FieldConnector; the CLI serves
            // simulated controllers at every configured address.
            let connector = SimulatedConnector::new();
            for device in &config.devices {
                connector.insert(
                    endpoint(&device.address, config.endpoint_port),
                    SimulatedPlc::new(Duration::from_millis(200))
                        .with_actuators('A'..='Z'),
                );
            }
            let registry = Arc::new(DeviceRegistry::from_devices(&config.devices));
            let projects = ProjectStore::new(config.root.clone());
            let service = Service::new(Engine::new(registry, Arc::new(connector), config))
                .with_projects(projects);

            let stdin = BufReader::new(tokio::io::stdin());
            service
                .handle(stdin, tokio::io::stdout())
                .await
                .context("service connection failed")?;
        }
    }

    Ok(())
}
