//! Terminal rendering of a run's event stream.
//!
//! Three output modes:
//! - `full`: colored, one block per stage with its output and selection
//! - `minimal`: one plain line per stage transition
//! - `json`: one JSON object per event, then a final `end` object

use std::io::Write;
use std::time::{Duration, Instant};

use conductor_common::{EventBody, RunEvent, RunId, StageRecord};
use console::{Term, style};

use crate::ui::icons::{CHECK, CHOICE, CROSS, PAUSE, PLAN, RUNNING, SPARKLE, STOP};

/// Longest stage output shown in full mode before eliding.
const PREVIEW_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    #[default]
    Full,
    Minimal,
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

pub struct RunView {
    mode: UiMode,
    verbose: bool,
    term: Term,
    started: Instant,
}

impl RunView {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        Self {
            mode,
            verbose,
            term: Term::stdout(),
            started: Instant::now(),
        }
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    pub fn handle_event(&self, event: &RunEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => {
                if let Some(line) = summary_line(&event.body) {
                    let _ = writeln!(&self.term, "{}", line);
                }
            }
            UiMode::Full => self.handle_full(&event.body),
        }
    }

    /// Print the stream terminator. Only JSON mode emits one.
    pub fn finish(&self, run_id: RunId) {
        if self.mode == UiMode::Json {
            let _ = writeln!(&self.term, "{}", crate::server::end_frame(run_id));
        }
    }

    /// Print a notice outside the event stream. Suppressed in JSON mode.
    pub fn notice(&self, message: &str) {
        if self.mode != UiMode::Json {
            let _ = writeln!(&self.term, "{}", style(message).yellow());
        }
    }

    fn handle_json(&self, event: &RunEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_full(&self, body: &EventBody) {
        let mut term = &self.term;
        match body {
            EventBody::Workflow { mode, steps, .. } => {
                let names: Vec<&str> = steps.iter().map(|s| s.stage.as_str()).collect();
                let _ = writeln!(
                    term,
                    "{}{} run: {}",
                    PLAN,
                    style(mode).bold(),
                    style(names.join(" → ")).cyan()
                );
            }
            EventBody::Enter { node } => {
                let _ = writeln!(term);
                let _ = writeln!(term, "{}{}", RUNNING, style(node).yellow().bold());
            }
            EventBody::Segment { output, .. } => {
                if let Some(text) = record_preview(output) {
                    let _ = writeln!(term, "  {}", style(text).dim());
                }
                if self.verbose
                    && let Ok(json) = serde_json::to_string(output)
                {
                    let _ = writeln!(term, "  {}", style(json).dim());
                }
            }
            EventBody::Options { options, .. } | EventBody::AwaitingSelection { options, .. } => {
                if matches!(body, EventBody::AwaitingSelection { .. }) {
                    let _ = writeln!(term, "  {}{}", CHOICE, style("Waiting for a selection").magenta());
                }
                if matches!(body, EventBody::Options { .. }) {
                    for (i, option) in options.iter().enumerate() {
                        let _ = writeln!(term, "  {} {}", style(format!("[{}]", i)).cyan(), preview(option));
                    }
                }
            }
            EventBody::Selection {
                choice_index,
                chosen,
                automatic,
                ..
            } => {
                let how = if *automatic { "auto" } else { "operator" };
                match choice_index {
                    Some(i) => {
                        let _ = writeln!(
                            term,
                            "  {} #{} ({}): {}",
                            style("Selected").green(),
                            i,
                            how,
                            preview(chosen)
                        );
                    }
                    None => {
                        let _ = writeln!(term, "  {}", style("No candidates to select").dim());
                    }
                }
            }
            EventBody::Exit { node } => {
                let _ = writeln!(term, "  {}{}", CHECK, style(node).dim());
            }
            EventBody::Paused { .. } => {
                let _ = writeln!(term, "{}{}", PAUSE, style("Paused").yellow());
            }
            EventBody::Resumed { .. } => {
                let _ = writeln!(term, "{}{}", RUNNING, style("Resumed").green());
            }
            EventBody::Stopping { .. } => {
                let _ = writeln!(term, "{}{}", STOP, style("Stopping").yellow());
            }
            EventBody::Done {
                final_text,
                stopped,
            } => {
                let _ = writeln!(term);
                let elapsed = format_duration(self.started.elapsed());
                if *stopped {
                    let _ = writeln!(term, "{}{} after {}", STOP, style("Run stopped").yellow().bold(), elapsed);
                } else {
                    let _ = writeln!(term, "{}{} in {}", SPARKLE, style("Run complete").green().bold(), elapsed);
                }
                if let Some(text) = final_text {
                    let _ = writeln!(term);
                    let _ = writeln!(term, "{}", text);
                }
            }
            EventBody::Error { node, message } => {
                let at = node.as_deref().unwrap_or("controller");
                let _ = writeln!(
                    term,
                    "{}{} {}: {}",
                    CROSS,
                    style("Error in").red().bold(),
                    style(at).yellow(),
                    message
                );
            }
        }
    }
}

/// One plain line per transition, or `None` for events minimal mode skips.
pub fn summary_line(body: &EventBody) -> Option<String> {
    match body {
        EventBody::Workflow { steps, .. } => {
            let names: Vec<&str> = steps.iter().map(|s| s.stage.as_str()).collect();
            Some(format!("plan: {}", names.join(", ")))
        }
        EventBody::Enter { node } => Some(format!("> {}", node)),
        EventBody::AwaitingSelection { node, options } => {
            Some(format!("? {} ({} options)", node, options.len()))
        }
        EventBody::Selection {
            node,
            choice_index: Some(i),
            ..
        } => Some(format!("= {} #{}", node, i)),
        EventBody::Exit { node } => Some(format!("✓ {}", node)),
        EventBody::Paused { .. } => Some("paused".to_string()),
        EventBody::Resumed { .. } => Some("resumed".to_string()),
        EventBody::Stopping { .. } => Some("stopping".to_string()),
        EventBody::Done { stopped: true, .. } => Some("done (stopped)".to_string()),
        EventBody::Done { .. } => Some("done".to_string()),
        EventBody::Error { node, message } => Some(format!(
            "✗ {}: {}",
            node.as_deref().unwrap_or("controller"),
            message
        )),
        _ => None,
    }
}

fn record_preview(record: &StageRecord) -> Option<String> {
    match record {
        StageRecord::Validation(report) => Some(format!(
            "consistent: {}, confidence: {:.2}",
            report.is_consistent, report.confidence
        )),
        StageRecord::Intake(intake) => Some(format!("query: {}", preview(&intake.normalized_query))),
        other => other.carry().map(preview),
    }
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > PREVIEW_CHARS {
        let cut: String = line.chars().take(PREVIEW_CHARS).collect();
        format!("{}…", cut)
    } else if line.len() < text.len() {
        format!("{}…", line)
    } else {
        line.to_string()
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::ValidationReport;

    #[test]
    fn test_ui_mode_parse() {
        assert_eq!(UiMode::parse("json"), UiMode::Json);
        assert_eq!(UiMode::parse("JSON"), UiMode::Json);
        assert_eq!(UiMode::parse("minimal"), UiMode::Minimal);
        assert_eq!(UiMode::parse("anything_else"), UiMode::Full);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0ms");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
    }

    #[test]
    fn test_summary_lines() {
        let enter = EventBody::Enter {
            node: "research".into(),
        };
        assert_eq!(summary_line(&enter).as_deref(), Some("> research"));

        let done = EventBody::Done {
            final_text: None,
            stopped: true,
        };
        assert_eq!(summary_line(&done).as_deref(), Some("done (stopped)"));

        let fault = EventBody::Error {
            node: None,
            message: "boom".into(),
        };
        assert_eq!(summary_line(&fault).as_deref(), Some("✗ controller: boom"));

        let options = EventBody::Options {
            node: "research".into(),
            options: vec!["a".into()],
        };
        assert!(summary_line(&options).is_none());
    }

    #[test]
    fn test_preview_elides_long_and_multiline_text() {
        assert_eq!(preview("short"), "short");
        assert_eq!(preview("first\nsecond"), "first…");
        let long = "x".repeat(PREVIEW_CHARS + 10);
        assert_eq!(preview(&long).chars().count(), PREVIEW_CHARS + 1);
    }

    #[test]
    fn test_record_preview() {
        let report = StageRecord::Validation(ValidationReport::new(true, 0.8, "fine"));
        assert_eq!(
            record_preview(&report).as_deref(),
            Some("consistent: true, confidence: 0.80")
        );
        assert_eq!(record_preview(&StageRecord::candidates(vec![])), None);
    }

    #[test]
    fn test_full_mode_renders_every_stage_transition() {
        let view = RunView::new(UiMode::Full, true);
        let selection = conductor_common::Selection {
            index: Some(0),
            chosen: "a".into(),
            rationale: "Operator choice [-1] is out of range; using option [0].".into(),
            automatic: false,
        };
        let bodies = vec![
            EventBody::Enter {
                node: "research".into(),
            },
            EventBody::Options {
                node: "research".into(),
                options: vec!["a".into(), "b".into()],
            },
            EventBody::selection("research", &selection),
            EventBody::Exit {
                node: "research".into(),
            },
            EventBody::Done {
                final_text: Some("answer".into()),
                stopped: false,
            },
        ];
        for (seq, body) in bodies.into_iter().enumerate() {
            view.handle_event(&RunEvent {
                seq: seq as u64,
                ts: chrono::Utc::now(),
                body,
            });
        }
        assert_eq!(view.mode(), UiMode::Full);
    }
}
