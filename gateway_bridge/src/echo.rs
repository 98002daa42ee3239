//! Colored echo of stdio traffic, enabled with `--colored-output`.
//!
//! Frames written to the process are cyan, frames it prints are green and its
//! stderr is red. JSON is pretty-printed when it parses.

use chrono::Local;
use owo_colors::OwoColorize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Stdin,
    Stdout,
    Stderr,
}

fn pretty(line: &str) -> String {
    match serde_json::from_str::<Value>(line) {
        Ok(parsed) => serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| line.to_string()),
        Err(_) => line.to_string(),
    }
}

/// Print one line of traffic to stderr. `label` identifies the process or
/// session (only its first 8 characters are shown).
pub fn echo(direction: Direction, label: &str, line: &str) {
    let timestamp = format!("[{}]", Local::now().format("%H:%M:%S%.3f"));
    let label: String = label.chars().take(8).collect();
    let tag = format!("[{}]", label);
    let body = pretty(line);
    match direction {
        Direction::Stdin => eprintln!("{} {} {}\n{}", timestamp, tag.cyan(), "→ STDIN:".cyan(), body.cyan()),
        Direction::Stdout => eprintln!("{} {} {}\n{}", timestamp, tag.green(), "← STDOUT:".green(), body.green()),
        Direction::Stderr => eprintln!("{} {} {}\n{}", timestamp, tag.red(), "⚠ STDERR:".red(), body.red()),
    }
}
