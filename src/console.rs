use std::collections::BTreeMap;

use indicatif::{ProgressBar, ProgressStyle};

fn progress_bar(len: usize, color: &str) -> ProgressBar {
    let template = format!(
        "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.{}/blue}}] {{pos}}/{{len}} ({{eta}}) - {{msg}}",
        color
    );
    let style = ProgressStyle::default_bar()
        .template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    let bar = ProgressBar::new(len as u64);
    bar.set_style(style);
    bar
}

/// `name: value (avg)` lines, averages looked up under `avg_<name>`
pub fn format_step_values(values: &[(&str, f64)], averages: &BTreeMap<String, f64>) -> Vec<String> {
    values
        .iter()
        .map(|(name, value)| match averages.get(&format!("avg_{}", name)) {
            Some(avg) => format!("     | > {}: {:.5}  ({:.5})", name, value, avg),
            None => format!("     | > {}: {:.5}", name, value),
        })
        .collect()
}

/// `name: value` lines with the change since the previous report
pub fn format_with_delta(values: &BTreeMap<String, f64>, previous: &BTreeMap<String, f64>) -> Vec<String> {
    values
        .iter()
        .map(|(name, value)| match previous.get(name) {
            Some(old) => format!("     | > {}: {:.5}  ({:+.5})", name, value, value - old),
            None => format!("     | > {}: {:.5}", name, value),
        })
        .collect()
}

/// Human readable progress of the run, silent on every rank but 0
pub struct ConsoleLogger {
    enabled: bool,
    bar: Option<ProgressBar>,
    previous_eval: BTreeMap<String, f64>,
}

impl ConsoleLogger {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            bar: None,
            previous_eval: BTreeMap::new(),
        }
    }

    fn print(&self, line: &str) {
        if !self.enabled {
            return;
        }
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{}", line),
        }
    }

    fn finish_bar(&mut self, message: String) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(message);
        }
    }

    pub fn print_epoch_start(&self, epoch: usize, max_epochs: usize) {
        self.print(&format!("\n > EPOCH: {}/{}", epoch, max_epochs));
    }

    pub fn print_train_start(&mut self, num_batches: usize) {
        self.print("\n > TRAINING");
        if self.enabled {
            self.bar = Some(progress_bar(num_batches, "cyan"));
        }
    }

    /// Advance the progress bar by one batch
    pub fn step(&self, message: String) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
            bar.set_message(message);
        }
    }

    pub fn print_train_step(
        &self,
        num_batches: usize,
        step: usize,
        global_step: usize,
        log: &[(&str, f64)],
        losses: &[(&str, f64)],
        averages: &BTreeMap<String, f64>,
    ) {
        let mut lines = vec![format!(
            "   --> STEP: {}/{} -- GLOBAL_STEP: {}",
            step, num_batches, global_step
        )];
        lines.extend(format_step_values(losses, averages));
        lines.extend(log.iter().map(|(name, value)| format!("     | > {}: {:.5}", name, value)));
        self.print(&lines.join("\n"));
    }

    pub fn print_train_epoch_end(
        &mut self,
        global_step: usize,
        epoch: usize,
        epoch_time: f64,
        averages: &BTreeMap<String, f64>,
    ) {
        self.finish_bar(format!("Epoch {} done", epoch));
        let mut lines = vec![format!(
            "\n   --> TRAIN PERFORMANCE -- EPOCH TIME: {:.2} sec -- GLOBAL_STEP: {}",
            epoch_time, global_step
        )];
        lines.extend(averages.iter().map(|(name, value)| format!("     | > {}: {:.5}", name, value)));
        self.print(&lines.join("\n"));
    }

    pub fn print_eval_start(&mut self, num_batches: usize) {
        self.print("\n > EVALUATION");
        if self.enabled && num_batches > 0 {
            self.bar = Some(progress_bar(num_batches, "yellow"));
        }
    }

    pub fn print_eval_step(&self, step: usize, losses: &[(&str, f64)], averages: &BTreeMap<String, f64>) {
        let mut lines = vec![format!("   --> EVAL STEP: {}", step)];
        lines.extend(format_step_values(losses, averages));
        self.print(&lines.join("\n"));
    }

    /// Evaluation summary, each value with its change since the last epoch
    pub fn print_epoch_end(&mut self, epoch: usize, averages: &BTreeMap<String, f64>) {
        self.finish_bar(format!("Evaluation {} done", epoch));
        let mut lines = vec![format!("\n   --> EVAL PERFORMANCE -- EPOCH: {}", epoch)];
        lines.extend(format_with_delta(averages, &self.previous_eval));
        self.print(&lines.join("\n"));
        self.previous_eval = averages.clone();
    }
}
