use crate::QueueError;
use num_cpus::get as get_cpu_count;
use std::env;

pub const WORKERS_VAR: &str = "PROMISE_JOBS_WORKERS";
pub const INLINE_VAR: &str = "PROMISE_JOBS_INLINE";

/// Settings for building a job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    workers: usize,
    name_prefix: String,
    stack_size: Option<usize>,
    inline: bool,
}

impl QueueConfig {
    pub fn count_logical_cores() -> usize {
        get_cpu_count()
    }

    /// The default configuration with `PROMISE_JOBS_WORKERS` and
    /// `PROMISE_JOBS_INLINE` applied on top.
    pub fn from_env() -> Result<Self, QueueError> {
        let mut config = Self::default();

        if let Ok(raw) = env::var(WORKERS_VAR) {
            config.workers = parse_workers(&raw)?;
        }
        if let Ok(raw) = env::var(INLINE_VAR) {
            config.inline = parse_flag(INLINE_VAR, &raw)?;
        }

        Ok(config)
    }

    /// Number of worker threads. Clamped to at least one.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Run every job on the enqueuing thread instead of on workers.
    pub fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn thread_name(&self, index: usize) -> String {
        format!("{}-{index}", self.name_prefix)
    }

    pub fn thread_stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    pub fn is_inline(&self) -> bool {
        self.inline
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: Self::count_logical_cores().max(1),
            name_prefix: String::from("promise-jobs"),
            stack_size: None,
            inline: false,
        }
    }
}

fn parse_workers(raw: &str) -> Result<usize, QueueError> {
    match raw.trim().parse::<usize>() {
        Ok(workers) if workers > 0 => Ok(workers),
        _ => Err(QueueError::InvalidConfig(format!(
            "{WORKERS_VAR} must be a positive integer, got {raw:?}"
        ))),
    }
}

fn parse_flag(var: &str, raw: &str) -> Result<bool, QueueError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(QueueError::InvalidConfig(format!(
            "{var} must be a boolean, got {raw:?}"
        ))),
    }
}
