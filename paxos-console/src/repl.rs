//! REPL command handling for the simulation console

use std::fmt::Write;

use paxos_sim::Simulation;
use tracing::info;

/// Whether `line` asks the console to exit.
///
/// Checked by the prompt loop before a line is handed to [`ReplContext`].
#[must_use]
pub fn is_exit(line: &str) -> bool {
    matches!(line.trim(), "exit" | "quit")
}

/// REPL context holding all state
pub struct ReplContext {
    /// The run being driven; shared with the background ticker
    pub simulation: Simulation<String>,
}

impl ReplContext {
    #[must_use]
    pub fn new(simulation: Simulation<String>) -> Self {
        Self { simulation }
    }

    /// Execute a REPL command
    pub fn execute(&mut self, line: &str) -> Result<String, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            return Ok(String::new());
        }

        match parts[0] {
            "help" | "?" => Ok(Self::help()),
            "propose" => {
                if parts.len() < 2 {
                    return Err("Usage: propose <proposer> [value]".to_string());
                }
                let value = (parts.len() > 2).then(|| parts[2..].join(" "));
                self.cmd_propose(parts[1], value)
            }
            "value" => {
                if parts.len() < 3 {
                    return Err("Usage: value <proposer> <value>".to_string());
                }
                self.cmd_value(parts[1], parts[2..].join(" "))
            }
            "kill" => {
                if parts.len() < 2 {
                    return Err("Usage: kill <node>".to_string());
                }
                self.cmd_kill(parts[1])
            }
            "revive" => {
                if parts.len() < 2 {
                    return Err("Usage: revive <node>".to_string());
                }
                self.cmd_revive(parts[1])
            }
            "status" => Ok(self.simulation.status().to_string()),
            "tick" => {
                let count = match parts.get(1) {
                    Some(n) => n
                        .parse::<u64>()
                        .map_err(|e| format!("Invalid tick count {n}: {e}"))?,
                    None => 1,
                };
                Ok(self.cmd_tick(count))
            }
            other => Err(format!(
                "Unknown command: {other}. Type 'help' for available commands."
            )),
        }
    }

    fn help() -> String {
        r"Available commands:
  propose <proposer> [value]   - Start a new round (optionally with a new value)
  value <proposer> <value>     - Set the value used from the next round on
  kill <node>                  - Crash a node; its state and inbox are kept
  revive <node>                - Bring a crashed node back
  status                       - Show every node, pending messages and the decision
  tick [n]                     - Run n ticks right now (default 1)
  help                         - Show this help
  exit / quit                  - Exit the console

Nodes keep ticking in the background unless started with --tick-ms 0.
"
        .to_string()
    }

    fn cmd_propose(&mut self, proposer: &str, value: Option<String>) -> Result<String, String> {
        let proposal = self
            .simulation
            .propose(proposer, value)
            .map_err(|e| format!("Failed to propose: {e:?}"))?;
        info!(%proposer, %proposal, "proposal started from console");
        Ok(format!("{proposer} started proposal {proposal}"))
    }

    fn cmd_value(&mut self, proposer: &str, value: String) -> Result<String, String> {
        self.simulation
            .set_value(proposer, value.clone())
            .map_err(|e| format!("Failed to set value: {e:?}"))?;
        Ok(format!("{proposer} will propose {value:?} next"))
    }

    fn cmd_kill(&mut self, node: &str) -> Result<String, String> {
        self.simulation
            .fail(node)
            .map_err(|e| format!("Failed to kill node: {e:?}"))?;
        Ok(format!("{node} is down"))
    }

    fn cmd_revive(&mut self, node: &str) -> Result<String, String> {
        self.simulation
            .recover(node)
            .map_err(|e| format!("Failed to revive node: {e:?}"))?;
        Ok(format!("{node} is up"))
    }

    fn cmd_tick(&mut self, count: u64) -> String {
        let mut handled = 0;
        let mut output = String::new();
        for _ in 0..count {
            let report = self.simulation.tick();
            handled += report.handled;
            if !report.faulted.is_empty() {
                let _ = writeln!(output, "tick {}: faulted {:?}", report.tick, report.faulted);
            }
        }
        let _ = write!(output, "{count} tick(s), {handled} message(s) handled");
        if let Some(value) = self.simulation.decided_value() {
            let _ = write!(output, ", decided {value:?}");
        }
        output
    }
}
