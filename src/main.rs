use clap::{Parser, Subcommand, ValueEnum};
use labgate::config::Config;
use labgate::labs::LabCatalog;
use labgate::lock::StoreLock;
use labgate::provision::{CreateOutcome, Provisioner};
use labgate::store::{RouteStore, Selector};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "labgate", version, about = "Provision student lab environments behind nginx")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "LABGATE_CONFIG", default_value = "labgate.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a lab for a student and publish its routes
    Create {
        /// Student id, or the id prefix when --count is given
        student: String,
        lab: String,
        /// Create this many students named <student><n>; 0 creates <student> alone
        #[arg(long)]
        count: Option<u32>,
        /// First number used with --count
        #[arg(long, default_value_t = 1)]
        start: u32,
        #[arg(long)]
        no_reload: bool,
    },
    /// Stop labs and remove their routes ("*" matches everything)
    Delete {
        #[arg(default_value = "*")]
        student: String,
        #[arg(default_value = "*")]
        lab: String,
        #[arg(long)]
        no_reload: bool,
    },
    /// Show labs or routes
    List {
        #[arg(value_enum)]
        target: ListTarget,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Delete and recreate every active lab
    Recreate {
        /// Seconds to wait between stopping and starting each lab
        #[arg(long, default_value_t = 8)]
        pause: u64,
        #[arg(long)]
        no_reload: bool,
    },
    /// Print the proxy configuration that would be written
    Render,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ListTarget {
    Available,
    Active,
    Routes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so listings on stdout stay machine-readable
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("labgate={}", level).parse()?),
        )
        .init();

    let config = Config::load(&cli.config).map_err(|e| {
        error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %cli.config.display(), "Configuration loaded");

    // Listing labs never touches the proxy configuration
    if let Command::List {
        target: ListTarget::Available,
        format,
    } = cli.command
    {
        return print_available(&config.lab_catalog(), format);
    }

    let config_path = config.proxy.config_path();
    let _lock = if config.proxy.lock {
        Some(StoreLock::acquire(&config_path)?)
    } else {
        None
    };

    let store = RouteStore::load(&config_path, config.synthesizer()?)?
        .with_reloader(config.reloader()?);
    let mut provisioner = Provisioner::new(
        store,
        config.lab_catalog(),
        config.port_allocator(),
        config.compose_runner()?,
        &config.domain,
    )
    .with_target_address(&config.ports.target_address);

    if let Err(e) = run(cli.command, &mut provisioner).await {
        match e.downcast_ref::<labgate::Error>() {
            Some(err) => error!(code = err.kind().as_str(), error = %err, "Command failed"),
            None => error!(error = %e, "Command failed"),
        }
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command, provisioner: &mut Provisioner) -> anyhow::Result<()> {
    match command {
        Command::Create {
            student,
            lab,
            count,
            start,
            no_reload,
        } => match bulk_count(count) {
            Some(count) => {
                let created = provisioner
                    .create_many(&student, &lab, count, start, no_reload)
                    .await?;
                for student_id in created {
                    println!("Created {} for {}", lab, student_id);
                }
            }
            None => match provisioner.create(&student, &lab, no_reload).await? {
                CreateOutcome::Created(routes) => {
                    for route in routes {
                        println!("{}", route.route_map());
                    }
                }
                CreateOutcome::AlreadyExists => {
                    println!("{} already has lab {}", student, lab);
                }
            },
        },
        Command::Delete {
            student,
            lab,
            no_reload,
        } => {
            let removed = provisioner
                .delete(&Selector::parse(&student), &Selector::parse(&lab), no_reload)
                .await?;
            for route in removed {
                println!("Removed {}", route.route_map());
            }
        }
        Command::List { target, format } => match target {
            ListTarget::Available => print_available(provisioner.catalog(), format)?,
            ListTarget::Active => print_active(&provisioner.active_labs(), format)?,
            ListTarget::Routes => {
                let routes = provisioner.store().routes();
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(routes)?),
                    OutputFormat::Text => {
                        for route in routes {
                            println!("{}", route.route_map());
                        }
                    }
                }
            }
        },
        Command::Recreate { pause, no_reload } => {
            let summary = provisioner
                .recreate_all(Duration::from_secs(pause), no_reload)
                .await?;
            println!(
                "Recreated {} labs ({} failed)",
                summary.recreated, summary.failed
            );
        }
        Command::Render => {
            print!("{}", provisioner.store().render()?);
        }
    }
    Ok(())
}

/// `--count` of zero or absent means a single student
fn bulk_count(count: Option<u32>) -> Option<u32> {
    count.filter(|n| *n > 0)
}

fn print_available(catalog: &LabCatalog, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let labs: Vec<serde_json::Value> = catalog
                .iter()
                .map(|(id, lab)| {
                    serde_json::json!({
                        "id": id,
                        "description": lab.description,
                        "subdomains": lab.subdomain_routes.keys().collect::<Vec<_>>(),
                        "websockets": lab.features.websockets,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&labs)?);
        }
        OutputFormat::Text => {
            if catalog.is_empty() {
                println!("No labs configured");
            }
            for (id, lab) in catalog.iter() {
                match &lab.description {
                    Some(description) => println!("{}: {}", id, description),
                    None => println!("{}", id),
                }
            }
        }
    }
    Ok(())
}

fn print_active(active: &BTreeMap<String, Vec<String>>, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(active)?),
        OutputFormat::Text => {
            if active.is_empty() {
                println!("No active labs");
            }
            for (lab, students) in active {
                println!("{}: {}", lab, students.join(", "));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recreate_pauses_by_default() {
        let cli = Cli::try_parse_from(["labgate", "recreate"]).unwrap();
        match cli.command {
            Command::Recreate { pause, no_reload } => {
                assert_eq!(pause, 8);
                assert!(!no_reload);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from(["labgate", "recreate", "--pause", "0"]).unwrap();
        assert!(matches!(cli.command, Command::Recreate { pause: 0, .. }));
    }

    #[test]
    fn test_zero_count_is_a_single_create() {
        let cli = Cli::try_parse_from(["labgate", "create", "alice", "xss101", "--count", "0"]).unwrap();
        let Command::Create { count, .. } = cli.command else {
            panic!("expected create");
        };
        assert_eq!(count, Some(0));
        assert_eq!(bulk_count(count), None);

        assert_eq!(bulk_count(None), None);
        assert_eq!(bulk_count(Some(3)), Some(3));
    }
}
