//! Task manifest and task ordering.

use std::collections::BTreeSet;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ExperimentConfig;
use crate::error::{CoreError, CoreResult};

/// Class groups introduced one task at a time.
///
/// ```yaml
/// tasks:
///   - [0, 1, 2]
///   - [3, 4]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskManifest {
    pub tasks: Vec<Vec<usize>>,
}

impl TaskManifest {
    /// Load a YAML or JSON manifest.
    ///
    /// Python pickles are rejected; convert them to YAML first.
    pub fn from_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let content = match ext.as_deref() {
            Some("pkl") | Some("pickle") => {
                return Err(CoreError::config(format!(
                    "pickle task manifests are not supported ({}); provide a YAML or JSON manifest",
                    path.display()
                )))
            }
            Some("yaml") | Some("yml") | Some("json") => std::fs::read_to_string(path)?,
            _ => {
                return Err(CoreError::config(format!(
                    "unsupported task manifest extension: {}",
                    path.display()
                )))
            }
        };
        if ext.as_deref() == Some("json") {
            Ok(serde_json::from_str(&content)?)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    pub fn from_yaml_str(content: &str) -> CoreResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Every class must be known and belong to exactly one non-empty task.
    pub fn validate(&self, num_classes: usize) -> CoreResult<()> {
        if self.tasks.is_empty() {
            return Err(CoreError::config("task manifest has no tasks"));
        }
        let mut seen = BTreeSet::new();
        for (i, classes) in self.tasks.iter().enumerate() {
            if classes.is_empty() {
                return Err(CoreError::config(format!("task {i} has no classes")));
            }
            for &c in classes {
                if c >= num_classes {
                    return Err(CoreError::config(format!(
                        "task {i} lists class {c} but num_classes is {num_classes}"
                    )));
                }
                if !seen.insert(c) {
                    return Err(CoreError::config(format!(
                        "class {c} appears in more than one task"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One step of the continual sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinualTask {
    pub index: usize,
    pub classes: Vec<usize>,
}

/// Resolved task order with a cursor on the task being trained.
#[derive(Debug, Clone)]
pub struct TaskSchedule {
    tasks: Vec<ContinualTask>,
    current: usize,
}

impl TaskSchedule {
    /// Order the manifest's tasks, shuffling them with `seed` when requested.
    pub fn new(
        manifest: TaskManifest,
        num_classes: usize,
        random_order: bool,
        seed: u64,
    ) -> CoreResult<Self> {
        manifest.validate(num_classes)?;
        let mut groups = manifest.tasks;
        if random_order {
            let mut rng = StdRng::seed_from_u64(seed);
            groups.shuffle(&mut rng);
        }
        let tasks = groups
            .into_iter()
            .enumerate()
            .map(|(index, classes)| ContinualTask { index, classes })
            .collect();
        Ok(Self { tasks, current: 0 })
    }

    /// Load `cl_cfg.pkl_file`, resolved relative to `base_dir` when relative.
    pub fn from_config(config: &ExperimentConfig, base_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let path = if config.cl_cfg.pkl_file.is_absolute() {
            config.cl_cfg.pkl_file.clone()
        } else {
            base_dir.as_ref().join(&config.cl_cfg.pkl_file)
        };
        let manifest = TaskManifest::from_file(&path)?;
        let schedule = Self::new(
            manifest,
            config.dataset.num_classes,
            config.cl_cfg.random_order,
            config.init_rand_seed,
        )?;
        info!(
            manifest = %path.display(),
            num_tasks = schedule.len(),
            random_order = config.cl_cfg.random_order,
            "Resolved continual task order"
        );
        Ok(schedule)
    }

    pub fn tasks(&self) -> &[ContinualTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &ContinualTask {
        &self.tasks[self.current]
    }

    pub fn is_last(&self) -> bool {
        self.current + 1 == self.tasks.len()
    }

    /// Move to the next task.
    pub fn advance(&mut self) -> CoreResult<&ContinualTask> {
        if self.is_last() {
            return Err(CoreError::TaskSequencing(format!(
                "task {} is the last of {}; there is no next task",
                self.current,
                self.tasks.len()
            )));
        }
        self.current += 1;
        Ok(&self.tasks[self.current])
    }

    /// Classes introduced by the current task or an earlier one.
    pub fn seen_classes(&self) -> BTreeSet<usize> {
        self.tasks[..=self.current]
            .iter()
            .flat_map(|t| t.classes.iter().copied())
            .collect()
    }

    /// Fail if a batch references a class not introduced yet.
    pub fn validate_labels(&self, labels: impl IntoIterator<Item = usize>) -> CoreResult<()> {
        let seen = self.seen_classes();
        for label in labels {
            if !seen.contains(&label) {
                return Err(CoreError::TaskSequencing(format!(
                    "class {label} is not introduced by task {} or any earlier task",
                    self.current
                )));
            }
        }
        Ok(())
    }
}
