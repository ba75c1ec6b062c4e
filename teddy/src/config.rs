//! Scheduler configuration file.
//!
//! ```json
//! { "target_mode": 0, "tgid": 1234,
//!   "tasks": [ { "tid": 1235, "prio": 0, "slice": 5000000, "on_ecore": 0 } ] }
//! ```
//!
//! The whole file is validated before anything is handed to the registry.

use std::path::Path;

use config::{Config, File, FileFormat};
use serde::Deserialize;
use teddy_common::{TARGET_TIDS_MAX, TargetCtx, TargetFilter, TargetMode, Tier};

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    pub tid: i64,
    pub prio: i64,
    pub slice: i64,
    #[serde(default)]
    pub on_ecore: i64,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SchedConfig {
    #[serde(default)]
    pub target_mode: i64,
    pub tgid: Option<i64>,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

/// A validated target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetTask {
    pub tid: i32,
    pub ctx: TargetCtx,
}

/// Validated configuration, ready to populate a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSet {
    pub mode: TargetMode,
    /// Zero when not configured.
    pub tgid: i32,
    pub tasks: Vec<TargetTask>,
}

fn to_id(value: i64) -> Option<i32> {
    i32::try_from(value).ok().filter(|id| *id > 0)
}

impl SchedConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path).format(FileFormat::Json).required(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|source| ConfigError::Load {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn validate(&self) -> Result<TargetSet, ConfigError> {
        let mode = i32::try_from(self.target_mode)
            .ok()
            .and_then(|m| TargetMode::try_from(m).ok())
            .ok_or(ConfigError::InvalidMode(self.target_mode))?;

        let tgid = match self.tgid {
            None | Some(0) => 0,
            Some(raw) => to_id(raw).ok_or(ConfigError::InvalidTgid(raw))?,
        };

        if self.tasks.len() > TARGET_TIDS_MAX {
            return Err(ConfigError::TooManyTasks {
                count: self.tasks.len(),
                max: TARGET_TIDS_MAX,
            });
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for entry in &self.tasks {
            let tid = to_id(entry.tid).ok_or(ConfigError::InvalidTid(entry.tid))?;
            let tier = i32::try_from(entry.prio)
                .ok()
                .and_then(|p| Tier::try_from(p).ok())
                .ok_or(ConfigError::InvalidPrio {
                    tid,
                    prio: entry.prio,
                })?;
            if entry.slice <= 0 {
                return Err(ConfigError::InvalidSlice { tid });
            }
            let on_ecore = match entry.on_ecore {
                0 => false,
                1 => true,
                value => return Err(ConfigError::InvalidOnEcore { tid, value }),
            };
            tasks.push(TargetTask {
                tid,
                ctx: TargetCtx::new(tier, entry.slice as u64, on_ecore),
            });
        }

        // The scheduler only classifies through the single-id fast path.
        match mode {
            TargetMode::Tid if tgid == 0 && tasks.len() != 1 => {
                return Err(ConfigError::UnmatchedTids(tasks.len()));
            }
            TargetMode::Tgid if tgid == 0 => return Err(ConfigError::MissingTgid),
            _ => {}
        }

        Ok(TargetSet { mode, tgid, tasks })
    }
}

impl TargetSet {
    /// Scheduler fast-path identifiers. Task-id mode only gets a single
    /// task id when exactly one task is configured.
    pub fn filter(&self) -> TargetFilter {
        match self.mode {
            TargetMode::Tgid => TargetFilter::new(TargetMode::Tgid, 0, self.tgid),
            TargetMode::Tid => {
                let single_tid = match self.tasks.as_slice() {
                    [only] => only.tid,
                    _ => 0,
                };
                TargetFilter::new(TargetMode::Tid, single_tid, self.tgid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    fn entry(tid: i64, prio: i64, slice: i64, on_ecore: i64) -> TaskEntry {
        TaskEntry {
            tid,
            prio,
            slice,
            on_ecore,
        }
    }

    #[test]
    fn loads_single_critical_task() {
        let file = write_config(
            r#"{"target_mode": 0, "tasks": [{"tid": 100, "prio": 0, "slice": 5000000, "on_ecore": 0}]}"#,
        );
        let cfg = SchedConfig::load(file.path()).unwrap();
        let set = cfg.validate().unwrap();

        assert_eq!(set.mode, TargetMode::Tid);
        assert_eq!(set.tasks.len(), 1);
        assert_eq!(set.tasks[0].tid, 100);
        assert_eq!(set.tasks[0].ctx.tier(), Some(Tier::Critical));
        assert_eq!(set.tasks[0].ctx.slice, 5_000_000);
        assert_eq!(set.filter(), TargetFilter::new(TargetMode::Tid, 100, 0));
    }

    #[test]
    fn process_mode_uses_tgid() {
        let file = write_config(
            r#"{"target_mode": 1, "tgid": 4000, "tasks": [{"tid": 4001, "prio": 1, "slice": 1000000, "on_ecore": 1}]}"#,
        );
        let set = SchedConfig::load(file.path()).unwrap().validate().unwrap();
        assert_eq!(set.filter(), TargetFilter::new(TargetMode::Tgid, 0, 4000));
        assert!(set.tasks[0].ctx.on_ecore());
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let err = SchedConfig::load(Path::new("/nonexistent/teddy.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
    }

    #[test]
    fn malformed_json_is_a_load_error() {
        let file = write_config(r#"{"target_mode": 0, "tasks": [ {"tid": }"#);
        assert!(matches!(
            SchedConfig::load(file.path()),
            Err(ConfigError::Load { .. })
        ));
    }

    #[test]
    fn rejects_bad_fields() {
        let base = SchedConfig::default();

        let cfg = SchedConfig {
            target_mode: 2,
            ..base.clone()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidMode(2))));

        let cases = [
            (entry(1, 3, 10, 0), "prio"),
            (entry(1, -1, 10, 0), "prio"),
            (entry(1, 0, 0, 0), "slice"),
            (entry(1, 0, 10, 2), "on_ecore"),
            (entry(0, 0, 10, 0), "tid"),
            (entry(-5, 0, 10, 0), "tid"),
        ];
        for (task, field) in cases {
            let cfg = SchedConfig {
                tasks: vec![entry(9, 0, 10, 0), task],
                ..base.clone()
            };
            let err = cfg.validate().unwrap_err();
            let ok = match field {
                "prio" => matches!(err, ConfigError::InvalidPrio { .. }),
                "slice" => matches!(err, ConfigError::InvalidSlice { .. }),
                "on_ecore" => matches!(err, ConfigError::InvalidOnEcore { .. }),
                _ => matches!(err, ConfigError::InvalidTid(_)),
            };
            assert!(ok, "{field}: unexpected {err}");
        }
    }

    #[test]
    fn rejects_too_many_tasks() {
        let cfg = SchedConfig {
            tasks: (1..=TARGET_TIDS_MAX as i64 + 1)
                .map(|tid| entry(tid, 2, 10, 0))
                .collect(),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TooManyTasks { .. })
        ));
    }

    #[test]
    fn rejects_configs_that_match_nothing() {
        let several = SchedConfig {
            tasks: vec![entry(100, 0, 10, 0), entry(101, 1, 10, 0)],
            ..Default::default()
        };
        assert!(matches!(
            several.validate(),
            Err(ConfigError::UnmatchedTids(2))
        ));

        let empty = SchedConfig::default();
        assert!(matches!(
            empty.validate(),
            Err(ConfigError::UnmatchedTids(0))
        ));

        let no_tgid = SchedConfig {
            target_mode: 1,
            tasks: vec![entry(100, 0, 10, 0)],
            ..Default::default()
        };
        assert!(matches!(no_tgid.validate(), Err(ConfigError::MissingTgid)));
    }

    #[test]
    fn multiple_tids_disable_single_tid_fast_path() {
        let cfg = SchedConfig {
            tgid: Some(77),
            tasks: vec![entry(1, 0, 10, 0), entry(2, 1, 10, 0)],
            ..Default::default()
        };
        let set = cfg.validate().unwrap();
        assert_eq!(set.filter(), TargetFilter::new(TargetMode::Tid, 0, 77));
    }
}
