use std::path::PathBuf;
use std::process::Command as StdCommand;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};

mod config;
mod errors;
mod monitor;
mod network;
mod orchestrator;
mod recommend;
mod resources;
mod settings;
mod supervisor;

use config::NewVm;
use monitor::Monitor;
use orchestrator::{LifecycleOrchestrator, StatusOutput, StopOutcome};
use recommend::SuggestionResult;
use settings::{expand_home, Settings};

const AVM_BANNER: &str = r#"

   __ ___   ___ __ ___
  / _` \ \ / / '_ ` _ \
 | (_| |\ V /| | | | | |
  \__,_| \_/ |_| |_| |_|
"#;

#[derive(Parser, Debug)]
#[command(version, about = "avm - local VM manager", long_about = None)]
struct Args {
    /// Registry path (defaults to ~/.avm/config.json)
    #[arg(long, global = true, env = "AVM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a VM (the default VM when no name is given)
    Start {
        vm: Option<String>,
        /// Run without a display
        #[arg(long)]
        headless: bool,
    },
    /// Stop a VM
    Stop { vm: Option<String> },
    /// Show live status of one VM, or all of them
    Status {
        vm: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Open an SSH session into a running VM
    Ssh { vm: Option<String> },
    /// Watch resource usage of a running VM
    Monitor {
        vm: Option<String>,
        /// Keep sampling until interrupted or the VM stops
        #[arg(short, long)]
        continuous: bool,
        /// Seconds between samples
        #[arg(short, long, default_value_t = 2)]
        interval: u64,
        /// Stop after this many samples
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
    /// Ask the assistant to interpret a free-form request
    AiAssist {
        #[arg(required = true, num_args = 1..)]
        request: Vec<String>,
    },
    /// Ask the assistant a question
    Suggest {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
    /// List the AI providers and whether they can be used
    Providers,
    /// Manage the registry file
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Manage VM definitions
    Vm {
        #[command(subcommand)]
        action: VmCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Write the starter registry
    Init,
    /// Check the registry for errors
    Validate,
}

#[derive(Subcommand, Debug)]
enum VmCommands {
    List,
    Create {
        name: String,
        #[arg(long, default_value_t = 2048)]
        ram: u32,
        #[arg(long, default_value_t = 2)]
        cpu: u32,
        #[arg(long, default_value_t = 2222)]
        ssh_port: u16,
        #[arg(long)]
        image: String,
    },
    Delete { name: String },
    /// Make a VM the default target
    Switch { name: String },
    Resources {
        #[command(subcommand)]
        action: ResourceCommands,
    },
    Network {
        #[command(subcommand)]
        action: NetworkCommands,
    },
    Ai {
        #[command(subcommand)]
        action: AiCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ResourceCommands {
    /// Change RAM and/or CPU within the VM's limits
    Scale {
        name: String,
        #[arg(long)]
        ram: Option<u32>,
        #[arg(long)]
        cpu: Option<u32>,
    },
    Monitor {
        name: String,
        #[arg(short, long)]
        continuous: bool,
        #[arg(short, long, default_value_t = 2)]
        interval: u64,
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum NetworkCommands {
    /// Only allow the listed sources to reach the VM's SSH port
    Isolate {
        name: String,
        /// IP address or CIDR, repeatable
        #[arg(long = "allow")]
        allow: Vec<String>,
        #[arg(long)]
        vpn: bool,
    },
    Status { name: String },
}

#[derive(Subcommand, Debug)]
enum AiCommands {
    Optimize {
        name: String,
        /// Apply recognised scaling hints
        #[arg(long)]
        auto_apply: bool,
    },
    Predict {
        name: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    Diagnose { name: String },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if !matches!(args.command, Commands::Status { json: true, .. }) {
        println!("{}", AVM_BANNER);
    }

    let mut settings = Settings::from_env();
    if let Some(path) = &args.config {
        settings.config_path = expand_home(path);
    }
    let orchestrator =
        LifecycleOrchestrator::from_settings(&settings).with_monitor(monitor_for(&args.command));

    if let Err(e) = run(&orchestrator, args.command).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Sampling cadence requested by a monitor command.
fn monitor_for(command: &Commands) -> Monitor {
    let (interval, count) = match command {
        Commands::Monitor { interval, count, .. } => (*interval, *count),
        Commands::Vm {
            action:
                VmCommands::Resources {
                    action: ResourceCommands::Monitor { interval, count, .. },
                },
        } => (*interval, *count),
        _ => return Monitor::default(),
    };

    let monitor = Monitor::new(Duration::from_secs(interval.max(1)));
    match count {
        Some(count) => monitor.with_max_ticks(count),
        None => monitor,
    }
}

async fn run(orchestrator: &LifecycleOrchestrator, command: Commands) -> Result<()> {
    match command {
        Commands::Start { vm, headless } => {
            let name = orchestrator.resolve_target(vm.as_deref())?;
            let pid = orchestrator
                .start(Some(&name), headless)
                .with_context(|| format!("failed to start VM '{}'", name))?;
            info!("✔ VM '{}' started with PID: {}", name, pid);
        }
        Commands::Stop { vm } => {
            let name = orchestrator.resolve_target(vm.as_deref())?;
            match orchestrator
                .stop(Some(&name))
                .with_context(|| format!("failed to stop VM '{}'", name))?
            {
                StopOutcome::Stopped => info!("✔ VM '{}' stopped", name),
                StopOutcome::AlreadyStopped => info!("VM '{}' was not running", name),
            }
        }
        Commands::Status { vm, json } => {
            match orchestrator
                .status(vm.as_deref(), json)
                .await
                .context("failed to read VM status")?
            {
                StatusOutput::Json(text) => println!("{}", text),
                StatusOutput::Report(reports) => {
                    for report in reports {
                        let marker = if report.is_default { "*" } else { " " };
                        let state = if report.runtime.is_running { "running" } else { "stopped" };
                        println!(
                            "{} {:<16} {:<8} {:>6} MB {:>3} CPU  ssh:{}",
                            marker, report.name, state, report.ram_mb, report.cpu_cores, report.ssh_port
                        );
                        if let Some(pid) = report.runtime.pid {
                            println!("    PID: {}", pid);
                        }
                        if let Some(uptime) = &report.runtime.uptime {
                            println!("    Uptime: {}", uptime);
                        }
                        if report.stale {
                            println!("    Warning: recorded as running but no live process was found");
                        }
                    }
                }
            }
        }
        Commands::Ssh { vm } => {
            let name = orchestrator.resolve_target(vm.as_deref())?;
            let argv = orchestrator
                .ssh_command(Some(&name))
                .with_context(|| format!("cannot open SSH session to VM '{}'", name))?;
            info!("Running: {}", argv.join(" "));
            let status = StdCommand::new(&argv[0])
                .args(&argv[1..])
                .status()
                .context("failed to run ssh")?;
            if !status.success() {
                bail!("ssh exited with {}", status);
            }
        }
        Commands::Monitor { vm, continuous, .. } => watch(orchestrator, vm.as_deref(), continuous).await?,
        Commands::AiAssist { request } => {
            let result = orchestrator
                .ai_assist(&request.join(" "))
                .await
                .context("assistant request failed")?;
            print_suggestions(&result);
        }
        Commands::Suggest { query } => {
            let result = orchestrator
                .get_suggestions(&query.join(" "))
                .await
                .context("assistant request failed")?;
            print_suggestions(&result);
        }
        Commands::Providers => {
            for provider in orchestrator.provider_overview() {
                println!(
                    "{} {:<10} {:<14} {:<28} {}",
                    if provider.active { "*" } else { " " },
                    provider.id.as_str(),
                    provider.display_name,
                    provider.default_model,
                    if provider.usable { "ready" } else { "missing credentials" }
                );
                println!("    {}", provider.description);
            }
        }
        Commands::Config { action } => match action {
            ConfigCommands::Init => {
                let registry = orchestrator.init_config().context("failed to initialise config")?;
                println!(
                    "Wrote {:?} with default VM '{}'",
                    orchestrator.config_path(),
                    registry.default_vm
                );
            }
            ConfigCommands::Validate => {
                let count = orchestrator.validate_config().context("config is invalid")?;
                println!("✔ Config is valid ({} VMs)", count);
            }
        },
        Commands::Vm { action } => vm_command(orchestrator, action).await?,
    }
    Ok(())
}

async fn vm_command(orchestrator: &LifecycleOrchestrator, action: VmCommands) -> Result<()> {
    match action {
        VmCommands::List => {
            for entry in orchestrator.list_vms().context("failed to list VMs")? {
                println!(
                    "{} {:<16} {:<8} {:>6} MB {:>3} CPU  ssh:{}",
                    if entry.is_default { "*" } else { " " },
                    entry.name,
                    if entry.running { "running" } else { "stopped" },
                    entry.ram_mb,
                    entry.cpu_cores,
                    entry.ssh_port
                );
            }
        }
        VmCommands::Create {
            name,
            ram,
            cpu,
            ssh_port,
            image,
        } => {
            let def = orchestrator
                .create(NewVm {
                    name,
                    ram_mb: ram,
                    cpu_cores: cpu,
                    ssh_port,
                    image_path: image,
                })
                .context("failed to create VM")?;
            println!(
                "Created '{}': {} MB RAM, {} CPU, SSH port {}",
                def.name, def.ram_mb, def.cpu_cores, def.ssh_port
            );
        }
        VmCommands::Delete { name } => {
            orchestrator.delete(&name).context("failed to delete VM")?;
        }
        VmCommands::Switch { name } => {
            orchestrator
                .switch_default(&name)
                .context("failed to switch default VM")?;
        }
        VmCommands::Resources { action } => match action {
            ResourceCommands::Scale { name, ram, cpu } => {
                let outcome = orchestrator
                    .scale_resources(&name, ram, cpu)
                    .context("failed to scale VM")?;
                println!(
                    "'{}' now has {} MB RAM and {} CPU cores",
                    outcome.vm.name, outcome.vm.ram_mb, outcome.vm.cpu_cores
                );
                if outcome.restart_required {
                    println!("Restart the VM for the change to take effect");
                }
            }
            ResourceCommands::Monitor { name, continuous, .. } => {
                watch(orchestrator, Some(&name), continuous).await?
            }
        },
        VmCommands::Network { action } => match action {
            NetworkCommands::Isolate { name, allow, vpn } => {
                let report = orchestrator
                    .isolate_network(&name, &allow, vpn)
                    .await
                    .context("failed to isolate VM network")?;
                println!(
                    "'{}' is {} on port {}",
                    report.vm, report.mode, report.forwarded_port
                );
                for rule in &report.applied {
                    println!("  + {}", rule);
                }
                for warning in &report.warnings {
                    println!("  Warning: {}", warning);
                }
            }
            NetworkCommands::Status { name } => {
                let status = orchestrator
                    .network_status(&name)
                    .await
                    .context("failed to read firewall rules")?;
                println!("'{}' is {} on port {}", status.vm, status.mode, status.forwarded_port);
                for rule in &status.active_rules {
                    println!("  {}", rule);
                }
            }
        },
        VmCommands::Ai { action } => match action {
            AiCommands::Optimize { name, auto_apply } => {
                let outcome = orchestrator
                    .optimize(&name, auto_apply)
                    .await
                    .context("optimisation failed")?;
                print_suggestions(&outcome.recommendations);
                for change in &outcome.applied {
                    println!("Applied: {}", change);
                }
                if !outcome.applied.is_empty() {
                    println!(
                        "'{}' now has {} MB RAM and {} CPU cores",
                        outcome.vm.name, outcome.vm.ram_mb, outcome.vm.cpu_cores
                    );
                }
                if outcome.restart_required {
                    println!("Restart the VM for the change to take effect");
                }
            }
            AiCommands::Predict { name, days } => {
                let prediction = orchestrator
                    .predict(&name, days)
                    .await
                    .context("prediction failed")?;
                println!(
                    "'{}' in {} days: {} MB RAM (now {} MB), {} CPU cores",
                    prediction.vm,
                    prediction.horizon_days,
                    prediction.predicted_ram_mb,
                    prediction.current_ram_mb,
                    prediction.predicted_cpu_cores
                );
                if prediction.upgrade_recommended {
                    println!("Upgrade recommended");
                }
                print_suggestions(&prediction.recommendations);
            }
            AiCommands::Diagnose { name } => {
                let diagnosis = orchestrator.diagnose(&name).await.context("diagnosis failed")?;
                println!("{}", diagnosis.context);
                match diagnosis.runtime.pid {
                    Some(pid) => println!(
                        "'{}' is running (PID: {}, uptime {})",
                        diagnosis.vm,
                        pid,
                        diagnosis.runtime.uptime.as_deref().unwrap_or("-")
                    ),
                    None => println!("'{}' has no live process", diagnosis.vm),
                }
                if diagnosis.stale {
                    println!("Warning: the registry still records '{}' as running", diagnosis.vm);
                }
                print_suggestions(&diagnosis.recommendations);
            }
        },
    }
    Ok(())
}

async fn watch(orchestrator: &LifecycleOrchestrator, vm: Option<&str>, continuous: bool) -> Result<()> {
    if continuous {
        let token = orchestrator.monitor_shutdown();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });
    }

    let samples = orchestrator
        .monitor_resources(vm, continuous, |def, tick, status| {
            let cpu = status
                .cpu_usage_percent
                .map_or_else(|| "-".to_string(), |c| format!("{:.1}%", c));
            let mem = status
                .mem_usage_mb
                .map_or_else(|| "-".to_string(), |m| format!("{:.1} MB", m));
            println!(
                "[{}] {} running={} cpu={} mem={} uptime={}",
                tick,
                def.name,
                status.is_running,
                cpu,
                mem,
                status.uptime.as_deref().unwrap_or("-")
            );
        })
        .await
        .context("failed to monitor VM")?;
    info!("Collected {} samples", samples);
    Ok(())
}

fn print_suggestions(result: &SuggestionResult) {
    for warning in &result.warnings {
        println!("Warning: {}", warning);
    }
    if !result.suggestions.is_empty() {
        println!("Suggestions:");
        for suggestion in &result.suggestions {
            println!("  • {}", suggestion);
        }
    }
    if !result.commands.is_empty() {
        println!("Commands:");
        for command in &result.commands {
            println!("  $ {}", command);
        }
    }
}
