//! Console output helpers.
//!
//! Operator-facing messages go through here so every step reads the same
//! way; structured diagnostics go through `tracing`.

use colored::Colorize;

/// Print the tool banner.
pub fn print_banner(vg: &str) {
    println!();
    println!("{}", "Portworx thin-pool metadata recovery".cyan().bold());
    println!("  {} {}", "volume group:".bright_black(), vg.green());
    println!();
}

const RULE_WIDTH: usize = 70;

fn rule(ch: char) -> String {
    ch.to_string().repeat(RULE_WIDTH)
}

/// Print a section header between two rules.
pub fn print_section(title: &str) {
    let rule = rule('═');
    println!("\n{}\n{}\n{}\n", rule.bright_black(), title.cyan().bold(), rule.bright_black());
}

/// Print `[n/N] ▶ message` for a recovery step.
pub fn print_progress_step(current: u8, total: u8, message: &str) {
    let counter = format!("[{current:>2}/{total}]");
    println!("{} {} {}", counter.bright_black(), "▶".cyan(), message.bold());
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Errors go to stderr so they survive stdout redirection.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a block that must not be skimmed.
pub fn print_critical(lines: &[&str]) {
    let rule = rule('!');
    eprintln!();
    eprintln!("{}", rule.red().bold());
    for line in lines {
        eprintln!("{} {}", "!!".red().bold(), line.red().bold());
    }
    eprintln!("{}", rule.red().bold());
    eprintln!();
}

/// Text of a pre-flight check line, without colour.
fn check_text(name: &str, detail: Option<&str>) -> String {
    match detail {
        Some(detail) => format!("{name}: {detail}"),
        None => name.to_string(),
    }
}

/// Print one pre-flight check with a pass/fail mark.
pub fn print_check_result(name: &str, passed: bool, detail: Option<&str>) {
    let mark = if passed { "✓".green() } else { "✗".red() };
    println!("  {mark} {}", check_text(name, detail));
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Print a unified diff with +/- lines coloured.
pub fn print_diff(diff: &str) {
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            println!("  {}", line.bold());
        } else if line.starts_with('+') {
            println!("  {}", line.green());
        } else if line.starts_with('-') {
            println!("  {}", line.red());
        } else if line.starts_with("@@") {
            println!("  {}", line.cyan());
        } else {
            println!("  {}", line.bright_black());
        }
    }
}
