use std::fs;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use menu_builders_toolkit::config::{ConfigLoader, ResolvedConfig};
use menu_builders_toolkit::document::{Document, NodeSnapshot, SharedDocument};
use menu_builders_toolkit::domain::ItemId;
use menu_builders_toolkit::error::MbtError;
use menu_builders_toolkit::merge::merge_groups;
use menu_builders_toolkit::output::{AnnotateResult, CardResult, GroupLine, GroupsResult, JsonOutput};
use menu_builders_toolkit::pipeline::{Activation, Toolkit};
use menu_builders_toolkit::query::{DishResolver, Resolution};
use menu_builders_toolkit::render::find_slot;

#[derive(Parser)]
#[command(name = "mbt")]
#[command(about = "Menu Builders' Toolkit: modifier-group tags for menu item cards")]
#[command(version, author)]
struct Cli {
    /// Path to mbt.json (defaults to ./mbt.json, then the user config directory)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run both query tiers for one item and print the raw responses")]
    Probe(ItemArgs),
    #[command(about = "Resolve one item and print its merged modifier groups")]
    Groups(ItemArgs),
    #[command(about = "Annotate the cards of a JSON document snapshot")]
    Annotate(AnnotateArgs),
}

#[derive(Args)]
struct ItemArgs {
    item_id: String,
}

#[derive(Args)]
struct AnnotateArgs {
    snapshot: String,

    /// Override the startup gate's attempt count
    #[arg(long)]
    attempts: Option<u32>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(mbt) = report.downcast_ref::<MbtError>() {
            return ExitCode::from(map_exit_code(mbt));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MbtError) -> u8 {
    match error {
        MbtError::MissingConfig
        | MbtError::ConfigRead(_)
        | MbtError::ConfigParse(_)
        | MbtError::InvalidConfig(_) => 2,
        MbtError::QueryHttp(_) | MbtError::QueryStatus { .. } | MbtError::QueryDecode(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    match cli.command {
        Commands::Probe(args) => runtime.block_on(run_probe(args, &config)),
        Commands::Groups(args) => runtime.block_on(run_groups(args, &config)),
        Commands::Annotate(args) => runtime.block_on(run_annotate(args, config)),
    }
}

async fn run_probe(args: ItemArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let item_id: ItemId = args.item_id.parse()?;
    let toolkit = Toolkit::from_config(config, SharedDocument::default())?;
    let report = toolkit.probe(item_id).await;
    JsonOutput::print_probe(&report).into_diagnostic()?;
    Ok(())
}

async fn run_groups(args: ItemArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let item_id: ItemId = args.item_id.parse()?;
    let toolkit = Toolkit::from_config(config, SharedDocument::default())?;
    let resolution = toolkit.pipeline().resolver().resolve(item_id).await;
    let groups = merge_groups(resolution.record());
    let (outcome, source) = match &resolution {
        Resolution::Found(_, tier) if groups.is_empty() => ("empty", Some(*tier)),
        Resolution::Found(_, tier) => ("found", Some(*tier)),
        Resolution::Missing => ("missing", None),
        Resolution::Unavailable => ("unavailable", None),
    };
    let result = GroupsResult {
        item_id,
        dish_name: resolution.record().and_then(|record| record.name.clone()),
        source,
        outcome: outcome.to_string(),
        groups: groups.iter().map(GroupLine::from).collect(),
    };
    JsonOutput::print_groups(&result).into_diagnostic()?;
    if resolution == Resolution::Unavailable {
        return Err(MbtError::QueryHttp(format!("no query tier answered for item {item_id}")).into());
    }
    Ok(())
}

async fn run_annotate(args: AnnotateArgs, mut config: ResolvedConfig) -> miette::Result<()> {
    let content = fs::read_to_string(&args.snapshot)
        .map_err(|err| MbtError::Snapshot(format!("{}: {err}", args.snapshot)))?;
    let snapshot = NodeSnapshot::from_json(&content)?;
    if let Some(attempts) = args.attempts {
        config.startup.max_attempts = attempts.max(1);
    }

    let document = SharedDocument::new(Document::from_snapshot(&snapshot));
    let toolkit = Toolkit::from_config(&config, document.clone())?;
    let result = match toolkit.start().await? {
        Activation::NotStarted => AnnotateResult {
            started: false,
            cards: Vec::new(),
        },
        Activation::Started(sweep) => {
            let states = sweep.finished().await;
            toolkit.stop();
            let cards = document.read(|doc| {
                states
                    .into_iter()
                    .map(|(card, annotation)| CardResult {
                        node: card,
                        identity: doc.attribute(card, "id").map(str::to_string),
                        annotation,
                        text: find_slot(doc, card)
                            .map(|slot| doc.text_content(slot))
                            .unwrap_or_default(),
                    })
                    .collect()
            });
            AnnotateResult {
                started: true,
                cards,
            }
        }
    };
    JsonOutput::print_annotate(&result).into_diagnostic()?;
    Ok(())
}
