use {
    std::{
        collections::{BTreeMap, HashMap},
        io,
        os::unix::fs::MetadataExt,
        path::{Path, PathBuf},
        sync::{Arc, Mutex, PoisonError},
        time::Duration,
    },
    serde::{Serialize, Deserialize},
    chrono::{DateTime, Utc},
    futures::Stream,
    async_stream::stream,
    tokio::{
        fs::{self, File, OpenOptions},
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        time::sleep,
    },
    fnctl_core::{Context, Event, HttpResponse},
    crate::error::LogError,
};

const BODY_PREVIEW_BYTES: usize = 256;
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One line of `<logs_dir>/<function>.log`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InvocationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub invocation_id: String,
    pub function: String,
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub status: u16,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body_preview: String,
}

impl InvocationLogEntry {
    pub fn new(context: &Context, event: &Event, response: &HttpResponse, duration: Duration, error: Option<String>) -> Self {
        let preview_len = response.body.len().min(BODY_PREVIEW_BYTES);
        Self {
            timestamp: context.timestamp,
            invocation_id: context.invocation_id.clone(),
            function: context.function.clone(),
            method: event.method.clone(),
            path: event.path.clone(),
            query: event.query.clone(),
            status: response.status.as_u16(),
            duration_ms: duration.as_millis() as u64,
            error,
            response_headers: response.headers.iter().cloned().collect(),
            body_preview: String::from_utf8_lossy(&response.body[..preview_len]).into_owned(),
        }
    }
}

/// Appends invocation entries to per-function JSON lines files.
///
/// Appends for one function are serialized, appends for different functions do not wait for each other.
pub struct InvocationLogger {
    logs_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InvocationLogger {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn log_path(&self, function: &str) -> PathBuf {
        self.logs_dir.join(format!("{function}.log"))
    }

    pub async fn append(&self, entry: &InvocationLogEntry) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let lock = self.lock_for(&entry.function);
        let _guard = lock.lock().await;

        fs::create_dir_all(&self.logs_dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&entry.function))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        Ok(())
    }

    /// Streams entries from the start of the log. With `follow`, waits for the log to appear and
    /// keeps polling for new entries until the stream is dropped.
    pub fn tail(&self, function: &str, follow: bool) -> impl Stream<Item = Result<InvocationLogEntry, LogError>> + Send + 'static {
        let path = self.log_path(function);

        stream! {
            'open: loop {
                let file = match File::open(&path).await {
                    Ok(v) => v,
                    Err(err) if err.kind() == io::ErrorKind::NotFound && follow => {
                        sleep(FOLLOW_POLL_INTERVAL).await;
                        continue;
                    },
                    Err(err) if err.kind() == io::ErrorKind::NotFound => break,
                    Err(err) => {
                        yield Err(LogError::from(err));
                        break;
                    }
                };

                let mut reader = BufReader::new(file);
                let mut line = Vec::new();
                let mut position = 0u64;

                loop {
                    match reader.read_until(b'\n', &mut line).await {
                        Ok(0) if follow => {
                            // purged or recreated logs are read again from the start
                            if is_replaced(reader.get_ref(), &path, position).await {
                                continue 'open;
                            }
                            sleep(FOLLOW_POLL_INTERVAL).await;
                        },
                        Ok(0) => {
                            if let Some(entry) = parse_line(&line) {
                                yield entry;
                            }
                            break 'open;
                        },
                        // partial line, the rest is still being written
                        Ok(n) if line.last() != Some(&b'\n') => position += n as u64,
                        Ok(n) => {
                            position += n as u64;
                            if let Some(entry) = parse_line(&line) {
                                yield entry;
                            }
                            line.clear();
                        },
                        Err(err) => {
                            yield Err(LogError::from(err));
                            break 'open;
                        }
                    }
                }
            }
        }
    }

    pub async fn purge(&self, function: &str) -> Result<(), LogError> {
        let lock = self.lock_for(function);
        let _guard = lock.lock().await;

        match fs::remove_file(self.log_path(function)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn lock_for(&self, function: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
            .entry(function.to_owned())
            .or_default()
            .clone()
    }
}

/// The open file was unlinked, another file took its path, or it was truncated below what was read.
async fn is_replaced(file: &File, path: &Path, position: u64) -> bool {
    let (opened, current) = match (file.metadata().await, fs::metadata(path).await) {
        (Ok(opened), Ok(current)) => (opened, current),
        _ => return true,
    };

    opened.nlink() == 0
        || opened.ino() != current.ino()
        || opened.dev() != current.dev()
        || current.len() < position
}

fn parse_line(line: &[u8]) -> Option<Result<InvocationLogEntry, LogError>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_slice(line).map_err(LogError::from))
}
