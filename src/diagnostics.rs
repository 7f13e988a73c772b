use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};

use console::style;
use petgraph::graph::NodeIndex;

use crate::engine::{Engine, Revision, TaskExecution};
use crate::error::{EngineError, RegistryError};
use crate::sink::EmitSummary;

/// Something that went wrong without stopping the session.
#[derive(Debug, Clone)]
pub enum Fault {
    /// A task could not be built; whatever depends on it is unavailable.
    Task(RegistryError),
    /// An output provider could not be evaluated. It emitted nothing this
    /// pass and its artifacts from the last successful pass stay in the sink.
    Output { stage: String, error: EngineError },
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Task(err) => write!(f, "{err}"),
            Fault::Output { stage, error } => write!(f, "output '{stage}': {error}"),
        }
    }
}

/// What a single [`Session::run`](crate::Session::run) did.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    pub revision: Revision,
    /// Stages whose transform actually ran, with their timings.
    pub execution_times: HashMap<NodeIndex, TaskExecution>,
    /// Stages skipped because none of their dependencies changed.
    pub reused: usize,
    /// Stages that ran but produced an output equal to the previous one.
    pub unchanged: usize,
    pub emitted: EmitSummary,
    pub faults: Vec<Fault>,
}

impl Diagnostics {
    pub fn is_ok(&self) -> bool {
        self.faults.is_empty()
    }

    /// Renders the stage graph as a Mermaid diagram, color-coded by execution
    /// duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cached (skipped)
    pub fn render_mermaid(&self, engine: &Engine) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let (min_time, max_time) = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(None, |acc: Option<(f64, f64)>, secs| match acc {
                Some((lo, hi)) => Some((lo.min(secs), hi.max(secs))),
                None => Some((secs, secs)),
            })
            .unwrap_or((0.0, 0.0));

        // All stages took the same time
        let span = if (max_time - min_time).abs() < f64::EPSILON {
            1.0
        } else {
            max_time - min_time
        };

        for index in engine.graph.node_indices() {
            let name = engine.graph[index].name.replace('"', "\\\"");

            let (label, color) = match times.get(&index) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / span;
                    (format!("{:.2?}", exec.duration), gradient(t))
                }
                None => ("Cached".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for output in engine.outputs() {
            let _ = writeln!(f, "    {} --> Output", output.index().index());
        }

        if !engine.outputs().is_empty() {
            let _ = writeln!(f, "    Output[Output]");
        }

        for edge in engine.graph.raw_edges() {
            let _ = writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            );
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);

    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let total = self
            .execution_times
            .values()
            .map(|t| t.duration)
            .sum::<std::time::Duration>();

        writeln!(
            f,
            "revision {}: {}, {}, {} in {:.2?}",
            self.revision.0,
            style(format!("{} executed", self.execution_times.len())).green(),
            style(format!("{} reused", self.reused)).cyan(),
            style(format!("{} unchanged", self.unchanged)).blue(),
            total,
        )?;

        writeln!(
            f,
            "artifacts: {} added, {} replaced, {} unchanged, {} removed",
            self.emitted.added,
            self.emitted.replaced,
            self.emitted.unchanged,
            self.emitted.removed,
        )?;

        for fault in &self.faults {
            writeln!(f, "{} {}", style("fault:").red().bold(), fault)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn test_gradient() {
        assert_eq!(gradient(0.0), "#00FF00");
        assert_eq!(gradient(0.5), "#FFFF00");
        assert_eq!(gradient(1.0), "#FF0000");
    }

    #[test]
    fn test_render_mermaid() {
        let mut engine = Engine::new();
        let input = engine.input::<i32>("numbers");
        let copy = engine.select(input, |n| *n);

        let mut diagnostics = Diagnostics::default();
        diagnostics.execution_times.insert(
            copy.index(),
            TaskExecution {
                start: Instant::now(),
                duration: Duration::from_millis(3),
            },
        );

        let rendered = diagnostics.render_mermaid(&engine);

        assert!(rendered.starts_with("graph LR"));
        assert!(rendered.contains("Cached"));
        assert!(rendered.contains("style 0 fill:#ADD8E6"));
        assert!(rendered.contains("style 1 fill:#00FF00"));
        assert!(rendered.contains("0 --> 1"));
    }

    #[test]
    fn test_display() {
        let diagnostics = Diagnostics {
            reused: 4,
            faults: vec![Fault::Output {
                stage: String::from("render"),
                error: EngineError::Cancelled,
            }],
            ..Default::default()
        };

        let rendered = diagnostics.to_string();
        assert!(rendered.contains("4 reused"));
        assert!(rendered.contains("output 'render'"));
        assert!(!diagnostics.is_ok());
    }
}
