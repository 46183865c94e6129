//! Command-line interface for the RuleVM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rulevm_bus::{dispatch, Envelope};
use rulevm_core::TracingStatusSink;
use rulevm_engine::{parse_from_string, Vm};
use rulevm_store::{DocumentStore, MemoryStore, RedbStore};

/// Reactive rule engine for an IoT device fleet.
#[derive(Parser, Debug)]
#[command(name = "rulevm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the VM against a document store.
    Run {
        /// Path to the store database file.
        #[arg(long, default_value = "rulevm.redb")]
        store: PathBuf,
        /// Use an in-memory store instead of a database file.
        #[arg(long)]
        memory: bool,
    },
    /// Compile a rule script and print what it would evaluate.
    Check {
        /// Path to the rule script.
        #[arg(required = true)]
        script: PathBuf,
    },
    /// Feed device events from stdin (`<deviceId> <json>` per line)
    /// through the bus dispatcher. For local debugging.
    Simulate {
        /// Path to the store database file.
        #[arg(long, default_value = "rulevm.redb")]
        store: PathBuf,
    },
}

fn open_store(path: &PathBuf, memory: bool) -> Result<Arc<dyn DocumentStore>> {
    if memory {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        let store = RedbStore::open(path)
            .with_context(|| format!("opening store at {}", path.display()))?;
        Ok(Arc::new(store))
    }
}

async fn start_vm(store: Arc<dyn DocumentStore>) -> Result<Arc<Vm>> {
    let vm = Arc::new(Vm::new(store.clone()).with_status_sink(Arc::new(TracingStatusSink)));
    vm.start()?;

    let restored = vm.restore_snapshot().await;
    let loaded = vm.load_rules_from_store().await?;
    tracing::info!(loaded, restored, "VM is up");

    // Forward rule-store changes into the registry.
    let mut changes = store.watch_rules();
    let watcher_vm = vm.clone();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            watcher_vm.rule_changed_callback(vec![change]).await;
        }
    });

    Ok(vm)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match args.command {
        Command::Run { store, memory } => {
            let store = open_store(&store, memory)?;
            let vm = start_vm(store).await?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("Interrupt received; draining running tasks");
            vm.waited_stop().await;
        }
        Command::Check { script } => {
            let text = std::fs::read_to_string(&script)
                .with_context(|| format!("reading {}", script.display()))?;
            let rule = parse_from_string(&text)?;
            println!("instructions (postfix):");
            for instruction in &rule.instruction_stream {
                println!("  {}", instruction.opcode());
            }
            println!("dependent devices: {:?}", rule.dependent_devices);
        }
        Command::Simulate { store } => {
            let store = open_store(&store, false)?;
            let vm = start_vm(store).await?;

            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                if stdin.read_line(&mut line)? == 0 {
                    break;
                }
                let Some((device_id, payload)) = line.trim().split_once(' ') else {
                    tracing::warn!("expected `<deviceId> <json>`");
                    continue;
                };
                let envelope = Envelope::new(payload.as_bytes().to_vec(), device_id);
                let disposition = dispatch(&vm, &envelope).await;
                tracing::info!(device_id, ?disposition, "Dispatched");
            }
            vm.waited_stop().await;
        }
    }

    Ok(())
}
