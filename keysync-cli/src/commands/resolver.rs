//! Conflict handling driven by `--on-conflict`.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use clap::ValueEnum;
use colored::Colorize;

use keysync_core::EnvironmentName;
use keysync_sync::{Conflict, ConflictDecision, ConflictResolver, KeyDecision};

/// What `push` does with keys the remote already holds with another value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OnConflict {
    /// Replace every conflicting remote value.
    Overwrite,
    /// Keep every remote value.
    Skip,
    /// Prompt for each key on stdin.
    Ask,
    /// Stop before writing anything.
    #[default]
    Abort,
}

/// Resolver for interactive pushes. Values are never printed, only keys.
#[derive(Debug, Clone, Copy)]
pub struct PromptResolver {
    strategy: OnConflict,
}

impl PromptResolver {
    pub fn new(strategy: OnConflict) -> Self {
        Self { strategy }
    }
}

#[async_trait]
impl ConflictResolver for PromptResolver {
    async fn decide(
        &self,
        environment: &EnvironmentName,
        conflicts: &[Conflict],
    ) -> ConflictDecision {
        eprintln!(
            "{} {} key(s) in '{environment}' differ from the remote:",
            "!".yellow().bold(),
            conflicts.len()
        );
        for conflict in conflicts {
            eprintln!("  ~ {}", conflict.key);
        }
        match self.strategy {
            OnConflict::Overwrite => ConflictDecision::OverwriteAll,
            OnConflict::Skip => ConflictDecision::SkipAll,
            OnConflict::Ask => ConflictDecision::PerKey,
            OnConflict::Abort => ConflictDecision::Cancel,
        }
    }

    async fn confirm(&self, conflict: &Conflict) -> KeyDecision {
        let key = conflict.key.clone();
        tokio::task::spawn_blocking(move || prompt(&key))
            .await
            .unwrap_or(KeyDecision::Cancel)
    }
}

fn prompt(key: &str) -> KeyDecision {
    eprint!("overwrite {key}? [y/N/q] ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(0) | Err(_) => KeyDecision::Cancel,
        Ok(_) => parse_answer(&answer),
    }
}

fn parse_answer(answer: &str) -> KeyDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => KeyDecision::Overwrite,
        "q" | "quit" => KeyDecision::Cancel,
        _ => KeyDecision::Skip,
    }
}
