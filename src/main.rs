use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use constellation::command::ConstellationEditor;
use constellation::config::Config;
use constellation::core::Constellation;
use constellation::device::WsConnector;
use constellation::orchestration::{DeviceManager, SelectionCriteria};
use constellation::Result;

/// Constellation - task DAG editor and multi-device task orchestrator
#[derive(Parser, Debug)]
#[command(name = "constellation")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONSTELLATION_DEBUG=1     Enable debug logging (alternative to --debug)\n    RUST_LOG=<filter>         Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.constellation/constellation.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.constellation/constellation.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a constellation file for structural errors
    Validate {
        /// Constellation JSON file
        file: PathBuf,
    },

    /// List tasks whose dependencies are satisfied
    Ready {
        /// Constellation JSON file
        file: PathBuf,
    },

    /// Apply one named editing command and print the resulting constellation
    Edit {
        /// Constellation JSON file (created if missing)
        file: PathBuf,

        /// Command name, e.g. add_task
        command: String,

        /// Command parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,

        /// Write the result back to the file
        #[arg(long)]
        save: bool,
    },

    /// List the available editing commands
    Commands,

    /// Connect to configured devices and show their status
    Devices,

    /// Send one request to a device and wait for the result
    Dispatch {
        /// The request text
        request: String,

        /// Target device (selected by capability if omitted)
        #[arg(long)]
        device: Option<String>,

        /// Required capabilities, comma separated
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,

        /// Timeout in seconds (config task_timeout_secs if omitted)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Execute a constellation across configured devices
    Run {
        /// Constellation JSON file; updated with the outcome
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on debug flag
    constellation::log::init_with_debug(cli.debug);
    info!(command = ?cli.command, "constellation starting");

    match cli.command {
        Command::Validate { file } => run_validate(&file),
        Command::Ready { file } => run_ready(&file),
        Command::Edit {
            file,
            command,
            params,
            save,
        } => run_edit(&file, &command, &params, save),
        Command::Commands => run_commands(),
        Command::Devices => run_devices(cli.config.as_deref()),
        Command::Dispatch {
            request,
            device,
            capabilities,
            timeout,
        } => run_dispatch(
            cli.config.as_deref(),
            &request,
            device.as_deref(),
            capabilities,
            timeout,
        ),
        Command::Run { file } => run_constellation(cli.config.as_deref(), &file),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_validate(file: &Path) -> Result<()> {
    let constellation = Constellation::load_from_file(file)?;
    let (valid, errors) = constellation.validate_dag();
    let order = if valid {
        constellation.get_topological_order()?
    } else {
        Vec::new()
    };
    print_json(&json!({
        "valid": valid,
        "errors": errors,
        "topological_order": order,
        "statistics": constellation.get_statistics(),
    }))
}

fn run_ready(file: &Path) -> Result<()> {
    let constellation = Constellation::load_from_file(file)?;
    let ready: Vec<&str> = constellation
        .get_ready_tasks()
        .into_iter()
        .map(|t| t.id.as_str())
        .collect();
    print_json(&json!({ "ready": ready }))
}

fn run_edit(file: &Path, command: &str, params: &str, save: bool) -> Result<()> {
    let constellation = if file.exists() {
        Constellation::load_from_file(file)?
    } else {
        Constellation::new(&file.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default())
    };
    let params: Value = serde_json::from_str(params)?;

    let mut editor = ConstellationEditor::new(constellation);
    let snapshot = editor.execute_by_name(command, params)?;
    if save {
        editor.constellation().save_to_file(file)?;
    }
    print_json(&snapshot)
}

fn run_commands() -> Result<()> {
    let editor = ConstellationEditor::new(Constellation::default());
    for spec in editor.registry().specs() {
        println!(
            "{:<24} {:<24} {}{}",
            spec.name,
            format!("{:?}", spec.category),
            spec.description,
            if spec.undoable { "" } else { " (not undoable)" }
        );
    }
    Ok(())
}

async fn start_manager(config: &Config) -> Arc<DeviceManager> {
    let manager = DeviceManager::from_config(config, Arc::new(WsConnector));
    for spec in &config.devices {
        manager.register_device(spec.clone()).await;
    }
    for (device_id, outcome) in manager.connect_all().await {
        if let Err(e) = outcome {
            eprintln!("  {} failed to connect: {}", device_id, e);
        }
    }
    manager
}

fn run_devices(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let manager = start_manager(&config).await;
        println!("Devices:");
        for device in manager.registry().get_all_devices().await {
            let caps: Vec<&str> = device.capabilities.iter().map(String::as_str).collect();
            println!(
                "  {:<16} {:<12} {:<32} [{}]",
                device.device_id,
                device.status.to_string(),
                device.server_url,
                caps.join(", ")
            );
        }
        manager.shutdown().await;
        Ok(())
    })
}

fn run_dispatch(
    config_path: Option<&Path>,
    request: &str,
    device: Option<&str>,
    capabilities: Vec<String>,
    timeout: Option<u64>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let criteria = SelectionCriteria {
        required_capabilities: capabilities,
        preferred_device_type: None,
    };
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let manager = start_manager(&config).await;
        let outcome = manager
            .dispatch(request, device, &criteria, timeout.map(Duration::from_secs))
            .await;
        manager.shutdown().await;
        print_json(&serde_json::to_value(outcome?)?)
    })
}

fn run_constellation(config_path: Option<&Path>, file: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let mut constellation = Constellation::load_from_file(file)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let manager = start_manager(&config).await;
        let outcome = manager.parallel().execute_constellation(&mut constellation).await;
        manager.shutdown().await;
        let results = outcome?;

        constellation.save_to_file(file)?;
        print_json(&json!({
            "state": constellation.state,
            "statistics": constellation.get_statistics(),
            "results": results,
        }))
    })
}
