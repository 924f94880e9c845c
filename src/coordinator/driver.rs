//! Job driver: shard, Map, Reduce, clean up
//!
//! The driver owns the worker set for the whole job. Workers lost during Map
//! are not used for Reduce.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::phase::{PhaseController, PhaseReport};
use super::registry::{Phase, WorkItem};
use crate::config::JobConfig;
use crate::error::{Error, Result};
use crate::shard::shard_files;
use crate::worker::client::ProxyConfig;
use crate::worker::executor::output_file_name;
use crate::worker::{HttpWorkerProxy, WorkerProxy};

/// Summary of a finished job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub task: String,
    pub shards: usize,
    pub reducers: usize,
    pub map: PhaseReport,
    pub reduce: PhaseReport,
    pub output_files: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Human-readable multi-line summary
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Job {} ({}) finished in {:.1}s\n",
            self.job_id,
            self.task,
            self.duration().num_milliseconds() as f64 / 1000.0
        );
        for report in [&self.map, &self.reduce] {
            out.push_str(&format!(
                "  {:<6} items={} accepted={} duplicates={} speculative={} retried={} lost_workers={} elapsed={}ms\n",
                report.phase.as_str(),
                report.items,
                report.stats.accepted,
                report.stats.duplicates_discarded,
                report.stats.speculative_requeues,
                report.stats.failure_requeues,
                report.stats.workers_lost,
                report.elapsed.as_millis()
            ));
        }
        out.push_str(&format!("  output: {} file(s)", self.output_files.len()));
        out
    }
}

/// Runs one configured job against a set of workers
pub struct JobDriver {
    config: JobConfig,
    controller: PhaseController,
}

impl JobDriver {
    /// Validate `config` and connect one HTTP proxy per configured worker
    pub fn from_config(config: JobConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::config(format!("{e:#}")))?;

        let mut workers: Vec<Arc<dyn WorkerProxy>> = Vec::with_capacity(config.workers.len());
        for address in &config.workers {
            let proxy_config =
                ProxyConfig::new(address.as_str()).with_call_timeout(config.scheduler.call_timeout());
            workers.push(Arc::new(HttpWorkerProxy::new(proxy_config)?));
        }

        Ok(Self::build(config, workers))
    }

    /// Use caller-supplied workers instead of HTTP proxies
    pub fn with_workers(config: JobConfig, workers: Vec<Arc<dyn WorkerProxy>>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::config(format!("{e:#}")))?;
        Ok(Self::build(config, workers))
    }

    fn build(config: JobConfig, workers: Vec<Arc<dyn WorkerProxy>>) -> Self {
        let controller = PhaseController::new(workers, config.scheduler.clone(), config.task.clone());
        Self { config, controller }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn controller(&self) -> &PhaseController {
        &self.controller
    }

    /// Run the job to completion
    pub async fn run(&mut self) -> Result<JobReport> {
        let started_at = Utc::now();
        let job_root = self.config.job_root();
        let output_dir = self.config.output_dir.clone();
        let reducers = self.config.n_output_files;

        tracing::info!(
            job_id = %self.config.job_id,
            task = %self.config.task,
            workers = self.controller.worker_count(),
            inputs = self.config.input_files.len(),
            reducers,
            "Starting job"
        );

        reset_dir(&output_dir).await?;

        let inputs = self.config.input_files.clone();
        let map_kilobytes = self.config.map_kilobytes;
        let shards = tokio::task::spawn_blocking(move || shard_files(&inputs, map_kilobytes))
            .await
            .map_err(|e| Error::with_source("sharding task failed", e))??;
        let shard_count = shards.len();
        tracing::info!(job_id = %self.config.job_id, shards = shard_count, "Input sharded");

        let map_items = shards
            .into_iter()
            .enumerate()
            .map(|(id, shard)| WorkItem::map(id, shard, reducers, job_root.join(id.to_string())))
            .collect();
        let map = self.controller.run_phase(Phase::Map, map_items).await?;

        let map_dirs: Arc<[PathBuf]> = map.accepted_locations.into_iter().flatten().collect();
        let reduce_items = (0..reducers)
            .map(|id| WorkItem::reduce(id, map_dirs.clone(), output_dir.clone()))
            .collect();
        let reduce = self.controller.run_phase(Phase::Reduce, reduce_items).await?;

        match tokio::fs::remove_dir_all(&job_root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                dir = %job_root.display(),
                error = %e,
                "Failed to remove intermediate files"
            ),
        }

        let report = JobReport {
            job_id: self.config.job_id.clone(),
            task: self.config.task.clone(),
            shards: shard_count,
            reducers,
            map: map.report,
            reduce: reduce.report,
            output_files: (0..reducers)
                .map(|r| output_dir.join(output_file_name(r)))
                .collect(),
            started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(
            job_id = %report.job_id,
            duration_ms = report.duration().num_milliseconds(),
            workers_alive = report.reduce.workers_alive,
            "Job complete"
        );
        Ok(report)
    }
}

/// Remove `dir` if present and recreate it empty
async fn reset_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::PhaseStats;
    use std::time::Duration;

    fn job_config(output_dir: PathBuf) -> JobConfig {
        JobConfig::from_toml_str(&format!(
            r#"
            job_id = "unit"
            workers = ["127.0.0.1:1"]
            input_files = ["missing.txt"]
            output_dir = "{}"
            n_output_files = 2
            map_kilobytes = 1
            "#,
            output_dir.display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_reset_dir_clears_contents() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(out.join("nested")).unwrap();
        std::fs::write(out.join("output_0.txt"), "stale 1\n").unwrap();

        reset_dir(&out).await.unwrap();
        assert!(out.is_dir());
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);

        let fresh = dir.path().join("fresh");
        reset_dir(&fresh).await.unwrap();
        assert!(fresh.is_dir());
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let mut config = job_config(PathBuf::from("out"));
        config.n_output_files = 0;
        let err = JobDriver::from_config(config).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("n_output_files"));
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_map() {
        let dir = tempfile::tempdir().unwrap();
        let config = job_config(dir.path().join("out"));
        let mut driver = JobDriver::from_config(config).unwrap();

        let err = driver.run().await.unwrap_err();
        assert!(matches!(err, Error::Shard(_)));
        // output dir is reset before sharding
        assert!(dir.path().join("out").is_dir());
    }

    #[test]
    fn test_summary() {
        let phase = |phase, items| PhaseReport {
            phase,
            items,
            stats: PhaseStats {
                accepted: items,
                ..Default::default()
            },
            elapsed: Duration::from_millis(1200),
            workers_alive: 2,
        };
        let started_at = Utc::now();
        let report = JobReport {
            job_id: "wc".into(),
            task: "wordcount".into(),
            shards: 3,
            reducers: 2,
            map: phase(Phase::Map, 3),
            reduce: phase(Phase::Reduce, 2),
            output_files: vec![PathBuf::from("out/output_0.txt"), PathBuf::from("out/output_1.txt")],
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(2500),
        };

        let summary = report.summary();
        assert!(summary.starts_with("Job wc (wordcount) finished in 2.5s"));
        assert!(summary.contains("map    items=3 accepted=3"));
        assert!(summary.ends_with("output: 2 file(s)"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["map"]["elapsed"], 1200);
        assert_eq!(json["reduce"]["phase"], "reduce");
    }
}
