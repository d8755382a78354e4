//! Status report printing

use colored::*;
use vm::StatusReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// One JSON object per line, for editor integrations
    Json,
    Text,
}

pub struct Printer {
    format: Format,
}

impl Printer {
    pub fn new(format: Format) -> Self {
        Self { format }
    }

    pub fn render(&self, report: &StatusReport) -> String {
        match self.format {
            Format::Json => match report.to_json() {
                Ok(json) => json,
                Err(e) => {
                    log::error!("failed to encode status report: {}", e);
                    String::new()
                }
            },
            Format::Text => render_text(report),
        }
    }

    pub fn print(&self, report: &StatusReport) {
        let line = self.render(report);
        if !line.is_empty() {
            println!("{}", line);
        }
    }
}

fn render_text(report: &StatusReport) -> String {
    match report {
        StatusReport::Ready => format!("{} sandbox ready", "●".green()),
        StatusReport::RunOk { timestamp } => {
            format!("{} run ok {}", "✓".green(), format!("@{}", timestamp).dimmed())
        }
        StatusReport::RunError(error) => {
            let location = match (error.line, error.column) {
                (Some(line), Some(column)) => format!(" at {}:{}", line, column),
                (Some(line), None) => format!(" at line {}", line),
                _ => String::new(),
            };
            let mut text = format!(
                "{} {}{}: {}",
                "✗".red(),
                error.kind.as_str(),
                location,
                error.message.red()
            );
            if let Some(stack) = &error.stack {
                for frame in stack.lines() {
                    text.push_str(&format!("\n    {}", frame.dimmed()));
                }
            }
            text
        }
        StatusReport::SoftError { source, message } => {
            format!("{} {}: {}", "!".yellow(), source, message.yellow())
        }
    }
}
