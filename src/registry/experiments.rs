use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::{read_json, write_json, ArtifactStore, FileStore};
use super::version::ModelVersion;
use crate::error::Result;

pub const EXPERIMENT_INDEX_KEY: &str = "experiments/index.json";

const EXPERIMENT_PREFIX: &str = "experiments/";

fn experiment_key(id: &str) -> String {
    format!("{}{}.json", EXPERIMENT_PREFIX, id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExperimentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One training run. Moves `pending -> running -> completed | failed` and
/// never leaves a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub experiment_type: String,
    pub status: ExperimentStatus,
    pub config: serde_json::Value,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub model_version: Option<ModelVersion>,
}

impl Experiment {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Wall-clock run time once the experiment has finished.
    pub fn duration_secs(&self) -> Option<i64> {
        Some((self.completed_at? - self.started_at?).num_seconds())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ExperimentIndex {
    ids: Vec<String>,
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentFilter {
    pub experiment_type: Option<String>,
    pub status: Option<ExperimentStatus>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
}

impl ExperimentFilter {
    fn matches(&self, e: &Experiment) -> bool {
        self.experiment_type.as_deref().map_or(true, |t| e.experiment_type == t)
            && self.status.map_or(true, |s| e.status == s)
            && self.tag.as_deref().map_or(true, |t| e.tags.iter().any(|x| x == t))
    }
}

#[derive(Debug, Clone)]
pub struct NewExperiment {
    pub name: String,
    pub experiment_type: String,
    pub config: serde_json::Value,
    pub tags: Vec<String>,
}

impl NewExperiment {
    pub fn new(name: impl Into<String>, experiment_type: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            experiment_type: experiment_type.into(),
            config,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Persists experiments as one JSON file each plus an id index.
pub struct ExperimentTracker {
    store: Arc<dyn ArtifactStore>,
    write_lock: Mutex<()>,
}

impl ExperimentTracker {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(FileStore::open(root.as_ref())?)))
    }

    fn insert(&self, request: NewExperiment, status: ExperimentStatus) -> Result<Experiment> {
        let _guard = self.write_lock.lock();
        let now = Utc::now();
        let experiment = Experiment {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            experiment_type: request.experiment_type,
            status,
            config: request.config,
            metrics: BTreeMap::new(),
            tags: request.tags,
            created_at: now,
            started_at: (status == ExperimentStatus::Running).then_some(now),
            completed_at: None,
            error: None,
            model_version: None,
        };
        write_json(self.store.as_ref(), &experiment_key(&experiment.id), &experiment)?;

        let mut index: ExperimentIndex = read_json(self.store.as_ref(), EXPERIMENT_INDEX_KEY)?.unwrap_or_default();
        index.ids.push(experiment.id.clone());
        index.last_updated = Some(now);
        write_json(self.store.as_ref(), EXPERIMENT_INDEX_KEY, &index)?;

        info!(
            "Experiment {} ({}) created as {}",
            experiment.id, experiment.experiment_type, experiment.status
        );
        Ok(experiment)
    }

    /// New experiment that is already running.
    pub fn create_experiment(&self, request: NewExperiment) -> Result<Experiment> {
        self.insert(request, ExperimentStatus::Running)
    }

    /// New experiment waiting for `start_experiment`.
    pub fn queue_experiment(&self, request: NewExperiment) -> Result<Experiment> {
        self.insert(request, ExperimentStatus::Pending)
    }

    pub fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        if Uuid::parse_str(id).is_err() {
            return Ok(None);
        }
        read_json(self.store.as_ref(), &experiment_key(id))
    }

    /// Apply `change` under the write lock. Unknown ids, terminal experiments
    /// and rejected changes yield `false` without writing.
    fn mutate<F>(&self, id: &str, operation: &str, change: F) -> Result<bool>
    where
        F: FnOnce(&mut Experiment) -> bool,
    {
        let _guard = self.write_lock.lock();
        let Some(mut experiment) = self.get_experiment(id)? else {
            warn!("{}: experiment {} not found", operation, id);
            return Ok(false);
        };
        if experiment.status.is_terminal() {
            warn!("{}: experiment {} is already {}", operation, id, experiment.status);
            return Ok(false);
        }
        if !change(&mut experiment) {
            warn!("{}: not allowed while experiment {} is {}", operation, id, experiment.status);
            return Ok(false);
        }
        write_json(self.store.as_ref(), &experiment_key(id), &experiment)?;
        Ok(true)
    }

    pub fn start_experiment(&self, id: &str) -> Result<bool> {
        self.mutate(id, "start_experiment", |e| {
            if e.status != ExperimentStatus::Pending {
                return false;
            }
            e.status = ExperimentStatus::Running;
            e.started_at = Some(Utc::now());
            true
        })
    }

    /// Merge `metrics` into the experiment, overwriting names already present.
    pub fn log_metrics(&self, id: &str, metrics: &BTreeMap<String, f64>) -> Result<bool> {
        let logged = self.mutate(id, "log_metrics", |e| {
            e.metrics.extend(metrics.iter().map(|(k, v)| (k.clone(), *v)));
            true
        })?;
        if logged {
            debug!("Experiment {}: logged {} metrics", id, metrics.len());
        }
        Ok(logged)
    }

    /// Finish a running experiment, optionally recording the registry version
    /// it produced. This is the last write an experiment accepts.
    pub fn complete_experiment(
        &self,
        id: &str,
        final_metrics: &BTreeMap<String, f64>,
        model_version: Option<ModelVersion>,
    ) -> Result<bool> {
        let done = self.mutate(id, "complete_experiment", |e| {
            e.metrics.extend(final_metrics.iter().map(|(k, v)| (k.clone(), *v)));
            let now = Utc::now();
            e.started_at.get_or_insert(now);
            e.status = ExperimentStatus::Completed;
            e.completed_at = Some(now);
            if model_version.is_some() {
                e.model_version = model_version;
            }
            true
        })?;
        if done {
            match model_version {
                Some(v) => info!("Experiment {} completed with model {}", id, v),
                None => info!("Experiment {} completed", id),
            }
        }
        Ok(done)
    }

    pub fn fail_experiment(&self, id: &str, error: &str) -> Result<bool> {
        let failed = self.mutate(id, "fail_experiment", |e| {
            e.status = ExperimentStatus::Failed;
            e.completed_at = Some(Utc::now());
            e.error = Some(error.to_string());
            true
        })?;
        if failed {
            warn!("Experiment {} failed: {}", id, error);
        }
        Ok(failed)
    }

    /// Record the registry version of a still-open experiment. Finished
    /// experiments take their version through `complete_experiment`.
    pub fn link_model_version(&self, id: &str, version: ModelVersion) -> Result<bool> {
        let linked = self.mutate(id, "link_model_version", |e| {
            e.model_version = Some(version);
            true
        })?;
        if linked {
            info!("Experiment {} linked to model {}", id, version);
        }
        Ok(linked)
    }

    /// Ids from the index plus any experiment file the index missed.
    fn known_ids(&self) -> Result<Vec<String>> {
        let index: ExperimentIndex = read_json(self.store.as_ref(), EXPERIMENT_INDEX_KEY)?.unwrap_or_default();
        let mut ids = index.ids;
        let indexed: BTreeSet<String> = ids.iter().cloned().collect();
        for key in self.store.list(EXPERIMENT_PREFIX)? {
            if key == EXPERIMENT_INDEX_KEY {
                continue;
            }
            let Some(id) = key
                .strip_prefix(EXPERIMENT_PREFIX)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            if Uuid::parse_str(id).is_ok() && !indexed.contains(id) {
                warn!("Experiment {} is missing from the index", id);
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Matching experiments, newest first.
    pub fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        let ids = self.known_ids()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.get_experiment(id)? {
                Some(e) if filter.matches(&e) => out.push(e),
                Some(_) => {}
                None => warn!("Experiment index lists missing id {}", id),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Completed experiment of `experiment_type` with the best value of `metric`.
    pub fn best_experiment(
        &self,
        experiment_type: &str,
        metric: &str,
        higher_is_better: bool,
    ) -> Result<Option<Experiment>> {
        let filter = ExperimentFilter {
            experiment_type: Some(experiment_type.to_string()),
            status: Some(ExperimentStatus::Completed),
            ..Default::default()
        };
        let best = self
            .list_experiments(&filter)?
            .into_iter()
            .filter_map(|e| e.metric(metric).filter(|v| v.is_finite()).map(|v| (v, e)))
            .max_by(|(a, _), (b, _)| {
                let ord = a.total_cmp(b);
                if higher_is_better {
                    ord
                } else {
                    ord.reverse()
                }
            })
            .map(|(_, e)| e);
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::super::store::MemoryStore;
    use super::*;

    fn tracker() -> ExperimentTracker {
        ExperimentTracker::new(Arc::new(MemoryStore::new()))
    }

    fn request(kind: &str) -> NewExperiment {
        NewExperiment::new("run", kind, serde_json::json!({"num_trees": 100}))
    }

    fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_lifecycle_and_metric_merge() {
        let t = tracker();
        let e = t.create_experiment(request("gbm")).unwrap();
        assert_eq!(e.status, ExperimentStatus::Running);
        assert!(e.started_at.is_some());

        assert!(t.log_metrics(&e.id, &metrics(&[("auc", 0.7), ("f1", 0.6)])).unwrap());
        assert!(t.log_metrics(&e.id, &metrics(&[("auc", 0.72)])).unwrap());
        assert!(t.complete_experiment(&e.id, &metrics(&[("log_loss", 0.5)]), None).unwrap());

        let done = t.get_experiment(&e.id).unwrap().unwrap();
        assert_eq!(done.status, ExperimentStatus::Completed);
        assert_eq!(done.metric("auc"), Some(0.72));
        assert_eq!(done.metric("f1"), Some(0.6));
        assert_eq!(done.metric("log_loss"), Some(0.5));
        assert!(done.completed_at.is_some());
        assert!(done.duration_secs().unwrap() >= 0);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let t = tracker();
        let e = t.create_experiment(request("gbm")).unwrap();
        assert!(t.fail_experiment(&e.id, "diverged").unwrap());
        assert!(!t.complete_experiment(&e.id, &BTreeMap::new(), None).unwrap());
        assert!(!t.log_metrics(&e.id, &metrics(&[("auc", 0.9)])).unwrap());
        assert!(!t.fail_experiment(&e.id, "again").unwrap());
        assert!(!t.link_model_version(&e.id, ModelVersion::initial()).unwrap());

        let stored = t.get_experiment(&e.id).unwrap().unwrap();
        assert_eq!(stored.status, ExperimentStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("diverged"));
        assert!(stored.metrics.is_empty());

        let done = t.create_experiment(request("gbm")).unwrap();
        assert!(t.complete_experiment(&done.id, &metrics(&[("auc", 0.7)]), None).unwrap());
        assert!(!t.complete_experiment(&done.id, &metrics(&[("auc", 0.9)]), None).unwrap());
        assert!(!t.log_metrics(&done.id, &metrics(&[("auc", 0.9)])).unwrap());
        assert!(!t.fail_experiment(&done.id, "late").unwrap());
        assert!(!t.link_model_version(&done.id, ModelVersion::initial()).unwrap());

        let stored = t.get_experiment(&done.id).unwrap().unwrap();
        assert_eq!(stored.status, ExperimentStatus::Completed);
        assert_eq!(stored.metric("auc"), Some(0.7));
        assert!(stored.model_version.is_none());
        assert!(stored.error.is_none());
    }

    #[test]
    fn test_queue_then_start() {
        let t = tracker();
        let e = t.queue_experiment(request("linear")).unwrap();
        assert_eq!(e.status, ExperimentStatus::Pending);
        assert!(e.started_at.is_none());
        assert!(t.start_experiment(&e.id).unwrap());
        assert!(!t.start_experiment(&e.id).unwrap());
        assert_eq!(t.get_experiment(&e.id).unwrap().unwrap().status, ExperimentStatus::Running);
    }

    #[test]
    fn test_unknown_ids() {
        let t = tracker();
        assert!(t.get_experiment("nope").unwrap().is_none());
        assert!(t.get_experiment(&Uuid::new_v4().to_string()).unwrap().is_none());
        assert!(!t.log_metrics("nope", &BTreeMap::new()).unwrap());
    }

    #[test]
    fn test_list_filter_and_best() {
        let t = tracker();
        for (kind, auc) in [("gbm", 0.70), ("gbm", 0.76), ("linear", 0.90), ("gbm", 0.73)] {
            let e = t.create_experiment(request(kind).with_tags(["nightly"])).unwrap();
            t.complete_experiment(&e.id, &metrics(&[("auc", auc), ("log_loss", 1.0 - auc)]), None)
                .unwrap();
        }
        let running = t.create_experiment(request("gbm")).unwrap();
        t.log_metrics(&running.id, &metrics(&[("auc", 0.99)])).unwrap();

        let gbm = ExperimentFilter {
            experiment_type: Some("gbm".to_string()),
            ..Default::default()
        };
        assert_eq!(t.list_experiments(&gbm).unwrap().len(), 4);
        let tagged = ExperimentFilter {
            tag: Some("nightly".to_string()),
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(t.list_experiments(&tagged).unwrap().len(), 2);

        let best = t.best_experiment("gbm", "auc", true).unwrap().unwrap();
        assert_eq!(best.metric("auc"), Some(0.76));
        let lowest_loss = t.best_experiment("gbm", "log_loss", false).unwrap().unwrap();
        assert_eq!(lowest_loss.metric("auc"), Some(0.76));
        assert!(t.best_experiment("stacked", "auc", true).unwrap().is_none());
    }

    #[test]
    fn test_model_version_recorded_on_completion() {
        let t = tracker();
        let e = t.create_experiment(request("gbm")).unwrap();
        assert!(t
            .complete_experiment(&e.id, &BTreeMap::new(), Some(ModelVersion::new(1, 2, 0)))
            .unwrap());
        let stored = t.get_experiment(&e.id).unwrap().unwrap();
        assert_eq!(stored.model_version.map(|v| v.to_string()).as_deref(), Some("v1.2.0"));

        let open = t.create_experiment(request("gbm")).unwrap();
        assert!(t.link_model_version(&open.id, ModelVersion::new(1, 3, 0)).unwrap());
        assert!(t.complete_experiment(&open.id, &BTreeMap::new(), None).unwrap());
        let stored = t.get_experiment(&open.id).unwrap().unwrap();
        assert_eq!(stored.model_version, Some(ModelVersion::new(1, 3, 0)));
    }

    #[test]
    fn test_list_includes_experiments_missing_from_index() {
        let store = Arc::new(MemoryStore::new());
        let t = ExperimentTracker::new(store.clone());
        let indexed = t.create_experiment(request("gbm")).unwrap();
        let orphan = t.create_experiment(request("gbm")).unwrap();

        let index = ExperimentIndex {
            ids: vec![indexed.id.clone()],
            last_updated: None,
        };
        write_json(store.as_ref(), EXPERIMENT_INDEX_KEY, &index).unwrap();

        let ids: BTreeSet<String> = t
            .list_experiments(&ExperimentFilter::default())
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, BTreeSet::from([indexed.id, orphan.id]));
    }

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let t = ExperimentTracker::open(dir.path()).unwrap();
        let e = t.create_experiment(request("gbm")).unwrap();
        assert!(dir.path().join("experiments").join(format!("{}.json", e.id)).exists());
        assert!(dir.path().join("experiments").join("index.json").exists());
    }
}
