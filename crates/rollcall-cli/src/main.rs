use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::inspect::{self, DatasetReport};
use rollcall_core::{DatasetBuilder, DirectorySource, IdentityRegistry, RecognitionLog};
use std::path::PathBuf;

// `#[zbus::proxy]` generates `RollcallProxy` (async) for the daemon interface.
#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn start_collection(&self, person_id: u32, name: &str, num_images: u32) -> zbus::Result<String>;
    async fn start_training(&self) -> zbus::Result<String>;
    async fn start_recognition(
        &self,
        model_path: &str,
        names_path: &str,
        log_path: &str,
        location: &str,
        confidence: f64,
    ) -> zbus::Result<String>;
    async fn stop_recognition(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face roll-call: identities, datasets and recognition jobs")]
struct Cli {
    /// Identity registry (person id -> name)
    #[arg(long, global = true, default_value = "person_names.json")]
    registry: PathBuf,
    /// Root of the person<id>/ sample directories
    #[arg(long, global = true, default_value = "face_data")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or edit registry names
    Names {
        #[command(subcommand)]
        action: NamesAction,
    },
    /// Build the train/test dataset and label names without the daemon
    Build {
        #[arg(long, default_value = "face_dataset.bin")]
        dataset: PathBuf,
        /// Label-name output (defaults to the registry path)
        #[arg(long)]
        names: Option<PathBuf>,
    },
    /// Report sample counts, label assignment and registry problems
    Inspect {
        #[arg(long)]
        json: bool,
    },
    /// Rewrite the registry from the person directories present
    RebuildNames,
    /// Print the recognition log
    Log {
        #[arg(long, default_value = "recognition_log.csv")]
        path: PathBuf,
        /// Only the last N events
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Ask the daemon to collect face samples
    Collect {
        person_id: u32,
        name: String,
        /// Images to capture (0 = daemon default)
        #[arg(short = 'n', long, default_value_t = 0)]
        count: u32,
    },
    /// Ask the daemon to build the dataset and train
    Train,
    /// Ask the daemon to start a recognition session
    Recognize {
        #[arg(long, default_value = "")]
        model: String,
        #[arg(long, default_value = "")]
        names: String,
        #[arg(long, default_value = "")]
        log: String,
        #[arg(long, default_value = "")]
        location: String,
        /// Confidence threshold in [0, 1]; negative = daemon default
        #[arg(long, default_value_t = -1.0, allow_negative_numbers = true)]
        confidence: f64,
    },
    /// Stop the running recognition session
    Stop,
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum NamesAction {
    List,
    Set { person_id: u32, name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let samples = DirectorySource::new(&cli.data_dir);

    match cli.command {
        Commands::Names { action } => {
            let mut registry = IdentityRegistry::load(&cli.registry);
            match action {
                NamesAction::List => {
                    if registry.is_empty() {
                        println!("No names registered");
                    }
                    for (id, name) in registry.iter() {
                        println!("{id:>6}  {name}");
                    }
                }
                NamesAction::Set { person_id, name } => {
                    registry.set(person_id, &name)?;
                    println!("person {person_id} -> {name}");
                }
            }
        }
        Commands::Build { dataset, names } => {
            let registry = IdentityRegistry::load(&cli.registry);
            let names = names.unwrap_or_else(|| cli.registry.clone());
            let output = DatasetBuilder::default()
                .build_and_persist(&samples, &registry, &dataset, &names)
                .context("dataset build failed")?;
            println!(
                "{} samples, {} classes: {} train / {} test",
                output.dataset.len(),
                output.label_map.num_classes(),
                output.dataset.train_labels.len(),
                output.dataset.test_labels.len()
            );
            for (label, name) in output.names.iter() {
                println!("  label {label:>3}  {name}");
            }
            if output.report.unreadable > 0 {
                println!("{} unreadable samples skipped", output.report.unreadable);
            }
        }
        Commands::Inspect { json } => {
            let registry = IdentityRegistry::load(&cli.registry);
            let report = inspect::inspect(&samples, &registry)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render_report(&report));
            }
        }
        Commands::RebuildNames => {
            let mut registry = IdentityRegistry::load(&cli.registry);
            let count = inspect::rebuild_registry(&samples, &mut registry)?;
            println!("registry rewritten with {count} persons");
        }
        Commands::Log { path, tail } => {
            let events = RecognitionLog::read_all(&path)?;
            let skip = tail.map_or(0, |n| events.len().saturating_sub(n));
            for e in &events[skip..] {
                println!(
                    "{}  {:>4}  {:<20} {:.2}  {}",
                    e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    e.person_id,
                    e.display_name,
                    e.confidence,
                    e.location
                );
            }
        }
        daemon => run_daemon_command(daemon).await?,
    }

    Ok(())
}

async fn run_daemon_command(command: Commands) -> Result<()> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot reach the session bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not running")?;
    tracing::debug!("connected to rollcalld");

    match command {
        Commands::Collect { person_id, name, count } => {
            let id = proxy.start_collection(person_id, &name, count).await?;
            println!("collection job {id} started");
        }
        Commands::Train => {
            let id = proxy.start_training().await?;
            println!("training job {id} started");
        }
        Commands::Recognize {
            model,
            names,
            log,
            location,
            confidence,
        } => {
            let id = proxy
                .start_recognition(&model, &names, &log, &location, confidence)
                .await?;
            println!("recognition job {id} started");
        }
        Commands::Stop => {
            if proxy.stop_recognition().await? {
                println!("stop requested");
            } else {
                bail!("no recognition session is running");
            }
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        _ => bail!("not a daemon command"),
    }
    Ok(())
}

fn render_report(report: &DatasetReport) -> String {
    let mut out = String::new();
    for p in &report.persons {
        let label = p.label_index.map_or_else(|| "-".to_string(), |l| l.to_string());
        out.push_str(&format!(
            "person{:<6} label {:>3}  {:>5} samples  {}\n",
            p.person_id, label, p.samples, p.display_name
        ));
        if p.unreadable > 0 {
            out.push_str(&format!("  {} unreadable samples skipped\n", p.unreadable));
        }
    }
    out.push_str(&format!(
        "{} samples across {} classes\n",
        report.total_samples(),
        report.num_classes()
    ));
    for issue in &report.issues {
        out.push_str(&format!("warning: {issue}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["rollcall", "--registry", "r.json", "names", "set", "3", "Carol"]).unwrap();
        assert_eq!(cli.registry, PathBuf::from("r.json"));
        assert!(matches!(
            cli.command,
            Commands::Names {
                action: NamesAction::Set { person_id: 3, .. }
            }
        ));

        let cli = Cli::try_parse_from(["rollcall", "recognize", "--location", "Lobby"]).unwrap();
        match cli.command {
            Commands::Recognize { location, confidence, .. } => {
                assert_eq!(location, "Lobby");
                assert!(confidence < 0.0);
            }
            _ => panic!("expected recognize"),
        }
    }

    #[test]
    fn test_render_report() {
        let dir = tempfile::tempdir().unwrap();
        let samples = DirectorySource::new(dir.path());
        std::fs::create_dir_all(samples.person_dir(2)).unwrap();
        let registry = IdentityRegistry::empty(dir.path().join("names.json"));
        let report = inspect::inspect(&samples, &registry).unwrap();
        let text = render_report(&report);

        assert!(text.contains("0 samples across 0 classes"));
        assert!(text.contains("warning:"));
    }
}
