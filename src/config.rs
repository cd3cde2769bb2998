//! Settings for the two subsystems, with defaults that can be overridden by
//! a JSON document carried in an environment variable.

use std::env;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

const ENV_FILE_SOURCE_SPEC: &str = "LINEFLOW_FILE_SOURCE_SPEC";
const ENV_TASKLET_SPEC: &str = "LINEFLOW_TASKLET_SPEC";

const DEFAULT_CHARSET: &str = "utf-8";
const DEFAULT_GLOB: &str = "*";
const DEFAULT_LINES_PER_BATCH: usize = 64;
const DEFAULT_WATCH_POLL_SECS: u64 = 1;
// -1 retains watermarks indefinitely
const DEFAULT_MAX_WATERMARK_RETAIN_MILLIS: i64 = -1;

/// Settings for one [`crate::source::FileTailSource`] instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileSourceSettings {
    /// Directory to watch.
    pub directory: PathBuf,
    /// Named character encoding of the tailed files.
    pub charset: String,
    /// Glob matched against file names, not full paths.
    pub glob: String,
    /// Total number of sibling instances.
    pub parallelism: usize,
    /// This instance's index, `0..parallelism`.
    pub id: usize,
    /// Complete lines read per batch before polling the watcher again.
    pub lines_per_batch: usize,
    /// Longest the watcher poll may block when the source is otherwise idle.
    pub watch_poll_secs: u64,
}

impl Default for FileSourceSettings {
    fn default() -> Self {
        FileSourceSettings {
            directory: PathBuf::from("."),
            charset: DEFAULT_CHARSET.to_string(),
            glob: DEFAULT_GLOB.to_string(),
            parallelism: 1,
            id: 0,
            lines_per_batch: DEFAULT_LINES_PER_BATCH,
            watch_poll_secs: DEFAULT_WATCH_POLL_SECS,
        }
    }
}

impl FileSourceSettings {
    /// Defaults overridden by the JSON document in
    /// `LINEFLOW_FILE_SOURCE_SPEC`, when set.
    pub fn load() -> Result<Self> {
        let settings = match env::var(ENV_FILE_SOURCE_SPEC) {
            Ok(spec) => serde_json::from_str::<FileSourceSettings>(&spec).map_err(|e| {
                Error::Config(format!("failed to parse file source spec: {}", e))
            })?,
            Err(_) => FileSourceSettings::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::Config("parallelism must be at least 1".to_string()));
        }
        if self.id >= self.parallelism {
            return Err(Error::Config(format!(
                "id {} out of range for parallelism {}",
                self.id, self.parallelism
            )));
        }
        if self.lines_per_batch == 0 {
            return Err(Error::Config(
                "linesPerBatch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for one [`crate::tasklet::WatermarkingTasklet`].
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskletSettings {
    /// After this many milliseconds without a watermark from some inbound
    /// stream, the minimum among the other streams may be emitted. Negative
    /// means retain indefinitely.
    pub max_watermark_retain_millis: i64,
}

impl Default for TaskletSettings {
    fn default() -> Self {
        TaskletSettings {
            max_watermark_retain_millis: DEFAULT_MAX_WATERMARK_RETAIN_MILLIS,
        }
    }
}

impl TaskletSettings {
    /// Defaults overridden by the JSON document in `LINEFLOW_TASKLET_SPEC`,
    /// when set.
    pub fn load() -> Result<Self> {
        match env::var(ENV_TASKLET_SPEC) {
            Ok(spec) => serde_json::from_str(&spec)
                .map_err(|e| Error::Config(format!("failed to parse tasklet spec: {}", e))),
            Err(_) => Ok(TaskletSettings::default()),
        }
    }
}
