//! Paxos simulation console
//!
//! Runs a single-decree Paxos cluster that ticks in the background while
//! commands typed at the prompt propose values and crash or revive nodes.

mod repl;

use std::time::Duration;

use clap::Parser;
use paxos_sim::{NodeId, ProposerConfig, Simulation, SimulationConfig};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::info;

use crate::repl::ReplContext;

/// Interactive single-decree Paxos simulation
#[derive(Parser, Debug)]
#[command(name = "paxos")]
#[command(about = "Interactive single-decree Paxos simulation")]
struct Args {
    /// Acceptor ids, comma separated (default A1..A5)
    #[arg(long, value_delimiter = ',')]
    acceptors: Vec<String>,

    /// Learner ids, comma separated (default L1,L2)
    #[arg(long, value_delimiter = ',')]
    learners: Vec<String>,

    /// Proposer and its initial value as ID=VALUE; repeatable
    /// (default P1=AZUL and P2=VERMELHO)
    #[arg(long = "proposer", value_parser = parse_proposer)]
    proposers: Vec<ProposerConfig<String>>,

    /// Milliseconds between background ticks; 0 only ticks on `tick`
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Seed for message and node ordering (random if not provided)
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    /// The demo cluster, with every role given on the command line replaced.
    fn config(&self) -> SimulationConfig<String> {
        let mut config = SimulationConfig::demo();
        if !self.acceptors.is_empty() {
            config.acceptors = self.acceptors.iter().map(NodeId::new).collect();
        }
        if !self.learners.is_empty() {
            config.learners = self.learners.iter().map(NodeId::new).collect();
        }
        if !self.proposers.is_empty() {
            config.proposers.clone_from(&self.proposers);
        }
        config.seed = self.seed;
        config
    }
}

fn parse_proposer(arg: &str) -> Result<ProposerConfig<String>, String> {
    let (id, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected ID=VALUE, got {arg:?}"))?;
    if id.is_empty() {
        return Err(format!("missing proposer id in {arg:?}"));
    }
    Ok(ProposerConfig {
        id: NodeId::from(id),
        initial_value: value.to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("paxos_sim=info")),
        )
        .init();

    let args = Args::parse();
    let simulation = Simulation::new(args.config()).map_err(|report| format!("{report:?}"))?;

    let ticker = (args.tick_ms > 0).then(|| {
        info!(tick_ms = args.tick_ms, "ticking in the background");
        simulation.spawn(Duration::from_millis(args.tick_ms))
    });

    let mut context = ReplContext::new(simulation);

    println!("Paxos simulation console");
    println!("{}", context.simulation.status());
    println!("Type 'help' for available commands.\n");

    let mut rl = DefaultEditor::new()?;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(1);
    let (resp_tx, mut resp_rx) = tokio::sync::mpsc::channel::<Result<String, String>>(1);

    tokio::task::spawn_blocking(move || {
        loop {
            match rl.readline("paxos> ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    if repl::is_exit(line) {
                        break;
                    }

                    let _ = rl.add_history_entry(line);
                    if tx.blocking_send(line.to_string()).is_err() {
                        break;
                    }

                    match resp_rx.blocking_recv() {
                        Some(Ok(output)) if !output.is_empty() => println!("{output}"),
                        Some(Err(e)) => eprintln!("Error: {e}"),
                        _ => {}
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("Interrupted. Use 'exit' to quit.");
                }
                Err(ReadlineError::Eof) => {
                    println!("Goodbye!");
                    break;
                }
                Err(e) => {
                    eprintln!("Readline error: {e}");
                    break;
                }
            }
        }
    });

    // Ticking happens on the background task; this loop only runs commands.
    while let Some(line) = rx.recv().await {
        let res = context.execute(&line);
        let _ = resp_tx.send(res).await;
    }

    if let Some(ticker) = ticker {
        ticker.shutdown().await;
    }
    println!("{}", context.simulation.status());

    Ok(())
}
