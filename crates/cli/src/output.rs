//! Output formatting for CLI

use clap::ValueEnum;
use colored::{ColoredString, Colorize};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use runcast_common::{Run, RunStatus, StepResult, StepStatus};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Plain text format
    Plain,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table<T: TableDisplay>(rows: impl IntoIterator<Item = Vec<String>>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(T::headers());
    for row in rows {
        table.add_row(row);
    }
    table
}

fn print_serialized<T: Serialize + ?Sized>(value: &T, format: OutputFormat) {
    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value).map_err(|e| e.to_string()),
        _ => serde_json::to_string_pretty(value).map_err(|e| e.to_string()),
    };
    match rendered {
        Ok(text) => println!("{}", text.trim_end()),
        Err(e) => print_error(&format!("Cannot render output: {}", e)),
    }
}

fn print_plain<T: TableDisplay>(item: &T) {
    for (header, value) in T::headers().iter().zip(item.row()) {
        println!("{}: {}", header, value);
    }
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => println!("{}", table::<T>([item.row()])),
        OutputFormat::Json | OutputFormat::Yaml => print_serialized(item, format),
        OutputFormat::Plain => print_plain(item),
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    if items.is_empty() && matches!(format, OutputFormat::Table | OutputFormat::Plain) {
        println!("No items found.");
        return;
    }

    match format {
        OutputFormat::Table => println!("{}", table::<T>(items.iter().map(T::row))),
        OutputFormat::Json | OutputFormat::Yaml => print_serialized(items, format),
        OutputFormat::Plain => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    println!("---");
                }
                print_plain(item);
            }
        }
    }
}

/// Print any serializable value; tables fall back to pretty JSON
pub fn print_value<T: Serialize + ?Sized>(value: &T, format: OutputFormat) {
    print_serialized(value, format);
}

/// Full run report: the run row followed by its steps
pub fn print_run(run: &Run, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Yaml => print_serialized(run, format),
        OutputFormat::Plain => {
            print_plain(run);
            for step in &run.step_results {
                println!("---");
                print_plain(step);
            }
        }
        OutputFormat::Table => {
            println!("{}", table::<Run>([run.row()]));
            if !run.step_results.is_empty() {
                println!("{}", table::<StepResult>(run.step_results.iter().map(TableDisplay::row)));
            }
            for step in &run.step_results {
                if let Some(error) = &step.error {
                    print_error(&format!("{}: {}", step.step_id, error.message));
                }
            }
            if !run.video_url.is_empty() {
                println!("Video: {}", run.video_url);
            }
            if !run.trace_url.is_empty() {
                println!("Trace: {}", run.trace_url);
            }
        }
    }
}

pub fn run_status(status: RunStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        RunStatus::Passed => label.green(),
        RunStatus::Failed => label.red(),
        RunStatus::Error => label.red().bold(),
        RunStatus::Running => label.cyan(),
        RunStatus::Pending => label.dimmed(),
    }
}

pub fn step_status(status: StepStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        StepStatus::Passed => label.green(),
        StepStatus::Failed => label.red(),
        StepStatus::Error => label.red().bold(),
        StepStatus::Running => label.cyan(),
        StepStatus::Skipped => label.yellow(),
        StepStatus::Pending => label.dimmed(),
    }
}

/// Milliseconds since the epoch as local time
pub fn format_time(millis: Option<i64>) -> String {
    millis
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_duration(millis: u64) -> String {
    if millis < 1_000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.1}s", millis as f64 / 1_000.0)
    } else {
        format!("{}m{:02}s", millis / 60_000, (millis % 60_000) / 1_000)
    }
}

impl TableDisplay for Run {
    fn headers() -> Vec<&'static str> {
        vec!["Run", "Scenario", "Status", "Started", "Steps", "Duration"]
    }

    fn row(&self) -> Vec<String> {
        let summary = self.summary.clone().unwrap_or_else(|| self.summarize(self.start_time));
        vec![
            self.id.clone(),
            self.scenario_id.clone(),
            run_status(self.status).to_string(),
            format_time(Some(self.start_time)),
            format!(
                "{}/{} passed, {} failed, {} skipped, {} error",
                summary.passed, summary.total, summary.failed, summary.skipped, summary.error
            ),
            format_duration(summary.duration_ms),
        ]
    }
}

impl TableDisplay for StepResult {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Step", "Name", "Status", "Duration", "Screenshots"]
    }

    fn row(&self) -> Vec<String> {
        let duration = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => format_duration(end.saturating_sub(start).max(0) as u64),
            _ => "-".to_string(),
        };
        vec![
            self.index.map_or_else(|| "-".to_string(), |i| (i + 1).to_string()),
            self.step_id.clone(),
            self.name.clone().unwrap_or_default(),
            step_status(self.status).to_string(),
            duration,
            self.screenshots.len().to_string(),
        ]
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✔".green(), message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✖".red(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow(), message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use runcast_common::{Job, StepAction, StepDefinition};

    fn run() -> Run {
        let job = Job {
            run_id: "run-1".into(),
            scenario_id: "login".into(),
            base_url: None,
            steps: vec![StepDefinition {
                id: "open".into(),
                name: "Open".into(),
                action: StepAction::Sleep { ms: 1 },
            }],
            attempt: 1,
        };
        Run::pending(&job, 1_700_000_000_000)
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(1_500), "1.5s");
        assert_eq!(format_duration(125_000), "2m05s");
    }

    #[test]
    fn test_format_time_missing() {
        assert_eq!(format_time(None), "-");
        assert_ne!(format_time(Some(1_700_000_000_000)), "-");
    }

    #[test]
    fn test_run_row() {
        colored::control::set_override(false);
        let row = run().row();
        assert_eq!(row.len(), Run::headers().len());
        assert_eq!(row[0], "run-1");
        assert_eq!(row[2], "PENDING");
        assert_eq!(row[4], "0/1 passed, 0 failed, 0 skipped, 0 error");
    }

    #[test]
    fn test_step_row_is_one_based() {
        colored::control::set_override(false);
        let run = run();
        let row = run.step_results[0].row();
        assert_eq!(row[0], "1");
        assert_eq!(row[2], "Open");
        assert_eq!(row[3], "PENDING");
        assert_eq!(row[4], "-");
    }
}
