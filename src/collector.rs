use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::audio::write_wav;
use crate::errors::Result;
use crate::params::ParamStats;
use crate::visual::Figure;

/// Part of the run a metric belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    TrainIter,
    TrainEpoch,
    Eval,
    Test,
    Params,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::TrainIter => "train_iter",
            Scope::TrainEpoch => "train_epoch",
            Scope::Eval => "eval",
            Scope::Test => "test",
            Scope::Params => "params",
        }
    }
}

/// Sink for scalars, figures and audio produced by rank 0
pub trait MetricsCollector: Send {
    fn scalars(&mut self, scope: Scope, step: usize, values: &BTreeMap<String, f64>) -> Result<()>;

    fn figures(&mut self, scope: Scope, step: usize, figures: &[(String, Figure)]) -> Result<()>;

    fn audios(
        &mut self,
        scope: Scope,
        step: usize,
        audios: &[(String, Vec<f32>)],
        sample_rate: u32,
    ) -> Result<()>;

    /// Per-parameter statistics, flattened into scalars by default
    fn param_stats(&mut self, step: usize, stats: &[ParamStats]) -> Result<()> {
        let mut values = BTreeMap::new();
        for stat in stats {
            let prefix = format!("param_{}", stat.index);
            values.insert(format!("{}/min", prefix), stat.min);
            values.insert(format!("{}/max", prefix), stat.max);
            values.insert(format!("{}/mean", prefix), stat.mean);
            values.insert(format!("{}/std", prefix), stat.std);
        }
        self.scalars(Scope::Params, step, &values)
    }
}

#[derive(Serialize)]
struct ScalarEvent<'a> {
    scope: Scope,
    step: usize,
    name: &'a str,
    value: f64,
}

#[derive(Serialize)]
struct FileEvent<'a> {
    scope: Scope,
    step: usize,
    name: &'a str,
    path: &'a Path,
}

/// Writes `events.jsonl` plus figure and WAV files under one directory
pub struct EventLogCollector {
    dir: PathBuf,
    events: BufWriter<File>,
}

impl EventLogCollector {
    pub const EVENTS_FILE: &'static str = "events.jsonl";

    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(Self::EVENTS_FILE))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            events: BufWriter::new(file),
        })
    }

    fn artifact_path(&self, kind: &str, scope: Scope, step: usize, name: &str, ext: &str) -> Result<PathBuf> {
        let dir = self.dir.join(kind).join(scope.as_str()).join(step.to_string());
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{}.{}", name.replace('/', "_"), ext)))
    }

    fn write_event<T: Serialize>(&mut self, event: &T) -> Result<()> {
        serde_json::to_writer(&mut self.events, event)?;
        self.events.write_all(b"\n")?;
        Ok(())
    }
}

impl MetricsCollector for EventLogCollector {
    fn scalars(&mut self, scope: Scope, step: usize, values: &BTreeMap<String, f64>) -> Result<()> {
        for (name, value) in values {
            self.write_event(&ScalarEvent {
                scope,
                step,
                name,
                value: *value,
            })?;
        }
        self.events.flush()?;
        Ok(())
    }

    fn figures(&mut self, scope: Scope, step: usize, figures: &[(String, Figure)]) -> Result<()> {
        for (name, figure) in figures {
            let path = self.artifact_path("figures", scope, step, name, "json")?;
            serde_json::to_writer(BufWriter::new(File::create(&path)?), figure)?;
            self.write_event(&FileEvent {
                scope,
                step,
                name,
                path: &path,
            })?;
        }
        self.events.flush()?;
        Ok(())
    }

    fn audios(
        &mut self,
        scope: Scope,
        step: usize,
        audios: &[(String, Vec<f32>)],
        sample_rate: u32,
    ) -> Result<()> {
        for (name, wav) in audios {
            let path = self.artifact_path("audio", scope, step, name, "wav")?;
            write_wav(wav, sample_rate, &path)?;
            self.write_event(&FileEvent {
                scope,
                step,
                name,
                path: &path,
            })?;
        }
        self.events.flush()?;
        Ok(())
    }
}

/// Discards everything, used by every rank but 0
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCollector;

impl MetricsCollector for NullCollector {
    fn scalars(&mut self, _scope: Scope, _step: usize, _values: &BTreeMap<String, f64>) -> Result<()> {
        Ok(())
    }

    fn figures(&mut self, _scope: Scope, _step: usize, _figures: &[(String, Figure)]) -> Result<()> {
        Ok(())
    }

    fn audios(
        &mut self,
        _scope: Scope,
        _step: usize,
        _audios: &[(String, Vec<f32>)],
        _sample_rate: u32,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visual::FigureKind;
    use tempfile::TempDir;

    fn lines(dir: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(dir.join(EventLogCollector::EVENTS_FILE))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_scalars_become_json_lines() {
        let dir = TempDir::new().unwrap();
        let mut collector = EventLogCollector::new(dir.path()).unwrap();
        let values = BTreeMap::from([("loss".to_string(), 1.5), ("lr".to_string(), 1e-3)]);
        collector.scalars(Scope::TrainIter, 10, &values).unwrap();

        let events = lines(dir.path());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["scope"], "train_iter");
        assert_eq!(events[0]["name"], "loss");
        assert_eq!(events[0]["value"], 1.5);
        assert_eq!(events[1]["step"], 10);
    }

    #[test]
    fn test_figures_and_audio_are_written() {
        let dir = TempDir::new().unwrap();
        let mut collector = EventLogCollector::new(dir.path()).unwrap();
        let figure = Figure {
            kind: FigureKind::Alignment,
            rows: 1,
            cols: 2,
            values: vec![0.0, 1.0],
        };
        collector
            .figures(Scope::Eval, 3, &[("alignment".to_string(), figure)])
            .unwrap();
        collector
            .audios(Scope::Test, 3, &[("0-audio".to_string(), vec![0.0; 8])], 8000)
            .unwrap();

        assert!(dir.path().join("figures/eval/3/alignment.json").exists());
        assert!(dir.path().join("audio/test/3/0-audio.wav").exists());
        assert_eq!(lines(dir.path()).len(), 2);
    }

    #[test]
    fn test_param_stats_are_flattened() {
        let dir = TempDir::new().unwrap();
        let mut collector = EventLogCollector::new(dir.path()).unwrap();
        let stats = [ParamStats {
            index: 0,
            shape: vec![2],
            min: -1.0,
            max: 1.0,
            mean: 0.0,
            std: 1.0,
        }];
        collector.param_stats(5, &stats).unwrap();
        let names: Vec<String> = lines(dir.path())
            .iter()
            .map(|e| e["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["param_0/max", "param_0/mean", "param_0/min", "param_0/std"]);
    }
}
