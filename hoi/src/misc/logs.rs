use std::{fs::{self, OpenOptions}, io::Write, path::Path};

use serde_json::{Map, Value};

use super::metrics::EpochStats;
use crate::{distributed::DistributedContext, error::Result};

pub const LOG_FILE: &str = "log.txt";
pub const EVAL_DIR: &str = "eval";

/// Raw evaluator output persisted next to the epoch log.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalArtifacts {
    pub file_name: String,
    pub payload: Value,
}

impl EvalArtifacts {
    pub fn write(&self, output_dir: &Path) -> Result<()> {
        let dir = output_dir.join(EVAL_DIR);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(&self.file_name), serde_json::to_vec(&self.payload)?)?;
        Ok(())
    }
}

pub fn log_entry(train_stats: &EpochStats, test_stats: &EpochStats, epoch: usize, n_parameters: usize) -> Map<String, Value> {
    let mut entry = train_stats.prefixed("train");
    entry.extend(test_stats.prefixed("test"));
    entry.insert("epoch".to_string(), Value::from(epoch));
    entry.insert("n_parameters".to_string(), Value::from(n_parameters));
    entry
}

/// Appends one JSON line per epoch to `log.txt`. Only the main process writes.
pub fn save_logs(
    dist: &DistributedContext,
    train_stats: &EpochStats,
    test_stats: &EpochStats,
    epoch: usize,
    n_parameters: usize,
    output_dir: &Path,
    coco_evaluator: Option<&EvalArtifacts>,
) -> Result<()> {
    if !dist.is_main_process() {
        return Ok(());
    }
    fs::create_dir_all(output_dir)?;

    let line = serde_json::to_string(&log_entry(train_stats, test_stats, epoch, n_parameters))?;
    let mut file = OpenOptions::new().create(true).append(true).open(output_dir.join(LOG_FILE))?;
    writeln!(file, "{line}")?;

    if let Some(artifacts) = coco_evaluator {
        artifacts.write(output_dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let dist = DistributedContext::single_process("env://");
        let train = EpochStats::new().with("loss", 2.0);
        let test = EpochStats::new().with("mAP", 0.1);

        save_logs(&dist, &train, &test, 0, 10, dir.path(), None).unwrap();
        save_logs(&dist, &train, &test, 1, 10, dir.path(), None).unwrap();

        let text = fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        let lines: Vec<Value> = text.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["epoch"], 1);
        assert_eq!(lines[0]["train_loss"], 2.0);
        assert_eq!(lines[0]["test_mAP"], 0.1);
        assert_eq!(lines[0]["n_parameters"], 10);
        assert!(!dir.path().join(EVAL_DIR).exists());
    }

    #[test]
    fn non_main_process_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dist = DistributedContext { rank: 1, world_size: 2, enabled: true, ..DistributedContext::single_process("env://") };
        save_logs(&dist, &EpochStats::new(), &EpochStats::new(), 0, 1, dir.path(), None).unwrap();
        assert!(!dir.path().join(LOG_FILE).exists());
    }

    #[test]
    fn evaluator_artifacts_land_in_eval_dir() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = EvalArtifacts { file_name: "latest.json".to_string(), payload: serde_json::json!([1, 2]) };
        let dist = DistributedContext::single_process("env://");
        save_logs(&dist, &EpochStats::new(), &EpochStats::new(), 0, 1, dir.path(), Some(&artifacts)).unwrap();
        assert!(dir.path().join(EVAL_DIR).join("latest.json").exists());
    }
}
