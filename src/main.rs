//! groundwork CLI: administer an atom store and inspect archived job runs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use groundwork::atom::{AtomTemplate, JobId, PartitionId};
use groundwork::coordinator::{Coordinator, CoordinatorConfig};
use groundwork::sensitivity::export::SensitivityReport;
use groundwork::store::SourcePartitions;

#[derive(Parser)]
#[command(name = "groundwork", version, about = "Multi-job inference coordination")]
struct Cli {
    /// Data directory for persistent storage.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML configuration file. Command-line flags take precedence.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new groundwork data directory.
    Init,

    /// Declare a predicate with a fixed arity.
    Declare {
        name: String,
        arity: usize,
    },

    /// Add or update a ground atom, e.g. `add "Friends(ann, bob)" 1.0`.
    Add {
        atom: String,
        value: f64,
        /// Job the atom is recorded for in the reverse index.
        #[arg(long, default_value = "cli")]
        job: String,
    },

    /// List the rows of a predicate.
    List {
        predicate: String,
        /// Restrict to these partition ids.
        #[arg(long, value_delimiter = ',')]
        partition: Vec<u32>,
    },

    /// Delete rows matching a template; `?` matches any argument.
    Delete {
        template: String,
        /// Also blacklist the template so it is never re-added.
        #[arg(long)]
        permanent: bool,
    },

    /// Delete rows of a predicate whose value is below a threshold.
    Prune {
        predicate: String,
        #[arg(long)]
        below: f64,
        /// Auxiliary predicate whose paired rows are deleted too.
        #[arg(long)]
        aux: Option<String>,
    },

    /// Move rows matching a template between partitions.
    Move {
        template: String,
        /// Source partition ids (comma-separated).
        #[arg(long, value_delimiter = ',', required = true)]
        from: Vec<u32>,
        #[arg(long)]
        to: u32,
    },

    /// Show the sensitivity graph of a job's latest archived run.
    Explain {
        job: String,
        /// Only list groundings whose distance exceeds this threshold.
        #[arg(long)]
        violated: Option<f64>,
        /// Emit JSON instead of the text export.
        #[arg(long)]
        json: bool,
    },
}

fn partition(raw: u32) -> Result<PartitionId> {
    PartitionId::new(raw).ok_or_else(|| miette::miette!("partition ids start at 1"))
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CoordinatorConfig::from_toml_file(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }
    if config.data_dir.is_none() {
        config.data_dir = Some(PathBuf::from(".groundwork"));
    }

    let coord = Coordinator::new(config)?;
    let store = coord.store();

    match cli.command {
        Commands::Init => {
            if let Some(dir) = &coord.config().data_dir {
                println!("Initialized groundwork data directory: {}", dir.display());
            }
        }

        Commands::Declare { name, arity } => {
            store.declare_predicate(&name, arity)?;
            println!("{name}/{arity}");
        }

        Commands::Add { atom, value, job } => {
            let atom: AtomTemplate = atom.parse().into_diagnostic()?;
            if store.add_atom(&JobId::new(job), &atom, value)? {
                println!("{atom} = {value}");
            } else {
                println!("{atom} is blacklisted, not added");
            }
        }

        Commands::List {
            predicate,
            partition: ids,
        } => {
            let ids = ids.into_iter().map(partition).collect::<Result<Vec<_>>>()?;
            let rows = store.get_all(&predicate, &ids)?;
            for row in &rows {
                println!("{}\t{}\t{}", row.atom, row.value, row.partition);
            }
            println!("{} row(s)", rows.len());
        }

        Commands::Delete {
            template,
            permanent,
        } => {
            let template: AtomTemplate = template.parse().into_diagnostic()?;
            let deleted = if permanent {
                store.delete_atom_permanently(&template)?
            } else {
                store.delete_atoms(std::slice::from_ref(&template))?
            };
            println!("Deleted {deleted} row(s)");
        }

        Commands::Prune {
            predicate,
            below,
            aux,
        } => {
            let deleted = store.delete_batch_below_threshold(&predicate, below, aux.as_deref())?;
            println!("Deleted {deleted} row(s)");
        }

        Commands::Move { template, from, to } => {
            let template: AtomTemplate = template.parse().into_diagnostic()?;
            let from = from.into_iter().map(partition).collect::<Result<_>>()?;
            let moved = store.move_to_partition(&SourcePartitions::AnyOf(from), partition(to)?, &template)?;
            println!("Moved {moved} row(s)");
        }

        Commands::Explain {
            job,
            violated,
            json,
        } => {
            let graph = coord.explain(&JobId::new(job))?;
            if let Some(threshold) = violated {
                for (name, distance) in graph.most_violated(threshold) {
                    println!("{name}\t{distance}");
                }
            } else if json {
                let report = SensitivityReport::from_graph(&graph);
                let text = serde_json::to_string_pretty(&report).into_diagnostic()?;
                println!("{text}");
            } else {
                print!("{}", graph.to_text());
            }
        }
    }

    Ok(())
}
