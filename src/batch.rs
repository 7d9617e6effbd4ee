use std::{
    any::Any,
    fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    time::Instant,
};

use crossbeam::channel;

use crate::pipeline::{FileStage, StageError};

/// Fixed number of worker threads that drain a shared job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    workers: usize,
}

/// A task panicked instead of returning a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task panicked: {0}")]
pub struct TaskPanic(pub String);

impl TaskPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            message.to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskPanic(message)
    }
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` on every item and hand each outcome to `collect`.
    ///
    /// `collect` runs on the calling thread, in completion order, and receives the submission
    /// index of the item alongside its result. A panicking task is reported as [`TaskPanic`] and
    /// does not disturb the other tasks.
    pub fn run<T, R, F, C>(&self, items: impl IntoIterator<Item = T>, task: F, mut collect: C)
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
        C: FnMut(usize, Result<R, TaskPanic>),
    {
        let (job_tx, job_rx) = channel::unbounded::<(usize, T)>();
        let (result_tx, result_rx) = channel::unbounded::<(usize, Result<R, TaskPanic>)>();

        let mut total = 0;
        for job in items.into_iter().enumerate() {
            // cannot fail, `job_rx` is alive
            let _ = job_tx.send(job);
            total += 1;
        }
        drop(job_tx);

        let task = &task;
        std::thread::scope(|scope| {
            for _ in 0..self.workers.min(total) {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for (index, item) in job_rx.iter() {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| task(item)))
                            .map_err(TaskPanic::from_payload);
                        if result_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for (index, result) in result_rx.iter() {
                collect(index, result);
            }
        });
    }

    /// Like [`WorkerPool::run`], but returns the results in submission order.
    pub fn map<T, R, F>(&self, items: impl IntoIterator<Item = T>, task: F) -> Vec<Result<R, TaskPanic>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
    {
        let mut results = Vec::new();
        self.run(items, task, |index, result| results.push((index, result)));
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub input_dir: PathBuf,
    /// Extension without the leading dot, e.g. `jsonl`
    pub extension: String,
    pub output_dir: PathBuf,
    pub workers: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("failed to list input directory `{}`", .path.display())]
    Discover {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create output directory `{}`", .path.display())]
    CreateOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct FileFailure {
    pub input: PathBuf,
    pub error: StageError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Artifacts written, in completion order
    pub written: Vec<PathBuf>,
    pub failures: Vec<FileFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// All regular files in `dir` whose name ends with `.<extension>`, sorted by path.
pub fn discover_files(dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let suffix = format!(".{}", extension.trim_start_matches('.'));

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(&suffix));
        if matches && entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }

    files.sort();
    Ok(files)
}

/// `<output_dir>/<base><suffix>`, where `base` is the file stem of `input` with `strip_suffix`
/// removed from its end.
pub fn output_path(output_dir: &Path, input: &Path, strip_suffix: &str, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();
    let stem: &str = &stem;
    let base = stem.strip_suffix(strip_suffix).unwrap_or(stem);

    output_dir.join(format!("{base}{suffix}"))
}

fn write_artifact(path: &Path, contents: &[u8]) -> Result<(), StageError> {
    fs::write(path, contents).map_err(|source| StageError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Run `stage` over every matching file of `config.input_dir`.
///
/// Files are processed on a pool of `config.workers` threads; every artifact is written once,
/// completely, by the calling thread as soon as its file is done. A failing file is logged and
/// recorded in the report, the others are unaffected.
pub fn run_batch<S: FileStage>(config: &BatchConfig, stage: &S) -> Result<BatchReport, BatchError> {
    let files = discover_files(&config.input_dir, &config.extension).map_err(|source| {
        BatchError::Discover {
            path: config.input_dir.clone(),
            source,
        }
    })?;

    fs::create_dir_all(&config.output_dir).map_err(|source| BatchError::CreateOutput {
        path: config.output_dir.clone(),
        source,
    })?;

    let pool = WorkerPool::new(config.workers);
    tracing::info!(
        message = "Starting batch",
        stage = stage.name(),
        files = files.len(),
        workers = pool.workers(),
        input_dir = %config.input_dir.display(),
        output_dir = %config.output_dir.display()
    );

    let start = Instant::now();
    let mut report = BatchReport::default();

    pool.run(
        files.iter().map(PathBuf::as_path),
        |input| stage.process(input),
        |index, result| {
            let input = &files[index];
            let outcome = result
                .unwrap_or_else(|panic| Err(StageError::Panicked(panic.0)))
                .and_then(|artifact| {
                    let path = stage.output_path(&config.output_dir, input);
                    write_artifact(&path, &artifact.contents)?;
                    Ok((path, artifact))
                });

            match outcome {
                Ok((path, artifact)) => {
                    tracing::info!(
                        message = "Processed file",
                        stage = stage.name(),
                        input = %input.display(),
                        output = %path.display(),
                        records = artifact.summary.records,
                        classified = artifact.summary.classified,
                        failed_calls = artifact.summary.failed_calls
                    );
                    report.written.push(path);
                }
                Err(error) => {
                    tracing::error!(
                        message = "Failed to process file",
                        stage = stage.name(),
                        input = %input.display(),
                        error = %crate::pipeline::error_chain(&error)
                    );
                    report.failures.push(FileFailure {
                        input: input.clone(),
                        error,
                    });
                }
            }
        },
    );

    tracing::info!(
        message = "Finished batch",
        stage = stage.name(),
        written = report.written.len(),
        failed = report.failures.len(),
        elapsed_ms = start.elapsed().as_millis() as u64
    );

    Ok(report)
}
