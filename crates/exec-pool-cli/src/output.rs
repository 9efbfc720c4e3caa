// Output formatting for the CLI

use anyhow::Result;
use exec_pool::{ExecutionResult, PoolError, PoolStats};
use serde::Serialize;
use serde_json::json;

#[derive(Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }

    pub fn print_value<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }

    /// Print one task outcome
    pub fn print_outcome(&self, index: usize, outcome: &Result<ExecutionResult, PoolError>) -> Result<()> {
        match (self, outcome) {
            (OutputFormat::Json, Ok(result)) => self.print_value(result),
            (OutputFormat::Json, Err(e)) => self.print_value(&json!({
                "error": e.kind(),
                "message": e.to_string(),
            })),
            (OutputFormat::Text, Ok(result)) => {
                let code = result
                    .exit_code
                    .map_or_else(|| "killed".to_string(), |c| c.to_string());
                print_field("task", &format!("#{index} {}", result.task_id));
                print_field("exit code", &code);
                print_field("duration", &format!("{}ms", result.duration.as_millis()));
                if !result.stdout.is_empty() {
                    println!("{}", result.stdout.trim_end());
                }
                if !result.stderr.is_empty() {
                    eprintln!("{}", result.stderr.trim_end());
                }
                Ok(())
            }
            (OutputFormat::Text, Err(e)) => {
                print_field("task", &format!("#{index}"));
                print_field("error", &format!("[{}] {e}", e.kind()));
                Ok(())
            }
        }
    }

    pub fn print_stats(&self, stats: &PoolStats) -> Result<()> {
        if !self.is_text() {
            return self.print_value(stats);
        }
        println!();
        print_field("workers", &format!("{} ({} busy)", stats.total_workers, stats.busy_workers));
        print_field("queued", &stats.queued_tasks.to_string());
        print_field("completed", &stats.completed_tasks.to_string());
        print_field("failed", &stats.failed_tasks.to_string());
        print_field("avg duration", &format!("{}ms", stats.average_duration.as_millis()));
        Ok(())
    }
}

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    println!("{:<14} {}", format!("{}:", label), value);
}
