use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::dispatch::{self, ReminderDispatcher, ReminderSettings};
use crate::engine::Engine;
use crate::limits::*;
use crate::mailer::Mailer;

/// Everything a study's background loops need besides the engine itself.
#[derive(Clone)]
pub struct StudyDefaults {
    pub compact_threshold: u64,
    pub reminder_interval: Duration,
    pub reminders: ReminderSettings,
    pub mailer: Arc<dyn Mailer>,
}

/// Manages per-study engines. Each study gets its own Engine, WAL file,
/// reminder dispatcher and compactor. Study = database name from the
/// pgwire connection.
pub struct StudyManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    defaults: StudyDefaults,
}

impl StudyManager {
    pub fn new(data_dir: PathBuf, defaults: StudyDefaults) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            defaults,
        }
    }

    /// Get or lazily create the engine for `study`.
    pub fn get_or_create(&self, study: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(study) {
            return Ok(engine.value().clone());
        }
        if study.len() > MAX_STUDY_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "study name too long",
            ));
        }

        // The name is the WAL file stem, so it must already be file-safe.
        if study.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty study name",
            ));
        }
        if !study.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid study name {study:?}: use letters, digits, '_' or '-'"),
            ));
        }

        if self.engines.len() >= MAX_STUDIES {
            return Err(std::io::Error::other("too many studies"));
        }

        // Entry lock: two first connections to one study must not open the WAL twice.
        let entry = match self.engines.entry(study.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => v,
        };

        let wal_path = self.data_dir.join(format!("{study}.wal"));
        let engine = Arc::new(Engine::new(wal_path)?);

        let dispatcher = Arc::new(ReminderDispatcher::new(
            engine.clone(),
            self.defaults.mailer.clone(),
            self.defaults.reminders.clone(),
        ));
        tokio::spawn(dispatch::run_dispatcher(dispatcher, self.defaults.reminder_interval));
        tokio::spawn(dispatch::run_compactor(engine.clone(), self.defaults.compact_threshold));

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::STUDIES_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened study {study}");
        Ok(engine)
    }
}
