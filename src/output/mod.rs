use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::model::deployment::{LogEntry, LogStream};

pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let spinner_style = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(spinner_style);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn success(msg: &str) {
    println!("{} {}", style("✓").bold().green(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", style("✗").bold().red(), msg);
}

pub fn warning(msg: &str) {
    eprintln!("{} {}", style("!").bold().yellow(), msg);
}

pub fn info(msg: &str) {
    println!("{} {}", style("→").bold().blue(), msg);
}

pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold().underlined());
}

/// One line of a deployment log, styled by stream.
pub fn log_line(entry: &LogEntry) {
    let time = entry.timestamp.format("%H:%M:%S");
    match entry.stream {
        LogStream::Stdout => println!("{} {}", style(time).dim(), entry.text),
        LogStream::Stderr => println!("{} {}", style(time).dim(), style(&entry.text).red()),
        LogStream::Info => {
            if let Some(stage) = entry.text.strip_prefix("Stage: ") {
                println!("{} {}", style(time).dim(), style(stage).bold().cyan());
            } else {
                println!("{} {} {}", style(time).dim(), style("→").blue(), entry.text);
            }
        }
        LogStream::Warning => {
            println!("{} {} {}", style(time).dim(), style("!").bold().yellow(), entry.text)
        }
    }
}
