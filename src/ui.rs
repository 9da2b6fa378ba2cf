//! Terminal output: a progress bar over all jobs and colored state lines.
//!
//! [`RunProgress`] is registered as a [`JobListener`], so it is driven by the
//! core's event dispatcher rather than by polling.

use std::collections::HashMap;
use std::time::Duration;

use batchflow::{JobListener, JobSnapshot, State};
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use uuid::Uuid;

pub struct RunProgress {
    pb: ProgressBar,
    names: Mutex<HashMap<Uuid, String>>,
    green: Style,
    red: Style,
    yellow: Style,
    cyan: Style,
    dim: Style,
}

impl RunProgress {
    pub fn start(total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{pos}/{len}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_message("starting");
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            names: Mutex::new(HashMap::new()),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            cyan: Style::new().cyan(),
            dim: Style::new().dim(),
        }
    }

    /// Remember a job's name so its lines are readable.
    pub fn track(&self, id: Uuid, name: &str) {
        self.names.lock().insert(id, name.to_string());
    }

    fn label(&self, id: Uuid) -> String {
        self.names
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    /// Clear the bar and print one line per job.
    pub fn finish(&self, snapshots: &[JobSnapshot]) {
        self.pb.finish_and_clear();
        for snapshot in snapshots {
            let mark = match snapshot.state {
                State::Finished => self.green.apply_to("✓"),
                State::Error => self.red.apply_to("✗"),
                _ => self.yellow.apply_to("■"),
            };
            println!("  {mark} {} {}", snapshot.name, self.dim.apply_to(snapshot.state));
        }
    }
}

impl JobListener for RunProgress {
    fn on_state_changed(&self, id: Uuid, state: State) {
        let name = self.label(id);
        let styled = match state {
            State::Finished => self.green.apply_to(state.to_string()),
            State::Error => self.red.apply_to(state.to_string()),
            State::Stop | State::Restarting => self.yellow.apply_to(state.to_string()),
            state if state.is_batch() => self.cyan.apply_to(state.to_string()),
            _ => self.dim.apply_to(state.to_string()),
        };
        self.pb.println(format!("  {name} → {styled}"));
        self.pb.set_message(format!("{name}: {state}"));
        if matches!(state, State::Finished | State::Error | State::Stop) {
            self.pb.inc(1);
        }
    }

    fn job_updated(&self, id: Uuid) {
        tracing::trace!(job_id = %id, "parameters changed");
    }
}
