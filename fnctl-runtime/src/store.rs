use {
    std::{io, path::{Path, PathBuf}, time::Duration},
    serde::Deserialize,
    serde_json::Value,
    tokio::fs,
    tracing::warn,
    crate::error::StoreError,
};

pub const CONFIG_FILE_NAME: &str = "fnctl.json";

const MODULE_EXTENSIONS: [&str; 2] = ["wasm", "wat"];

/// Reads function records from `<functions_dir>/<name>/fnctl.json`.
///
/// There is no cache: every call reflects what is on disk right now, so edits made by other
/// processes are picked up by the next request.
#[derive(Debug, Clone)]
pub struct FunctionStore {
    functions_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    pub name: String,
    pub kind: FunctionKind,
    pub logging_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionKind {
    Module {
        entrypoint: Entrypoint,
    },
    Exec {
        command: String,
        timeout: Option<Duration>,
    },
}

/// `file:symbol` reference to a handler exported by a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entrypoint {
    pub file: String,
    pub symbol: String,
}

#[derive(Deserialize)]
struct FunctionConfigFile {
    name: Option<String>,
    kind: Option<String>,
    entrypoint: Option<String>,
    command: Option<String>,
    logging: Option<bool>,
    timeout_ms: Option<u64>,
}

impl FunctionStore {
    pub fn new(functions_dir: impl Into<PathBuf>) -> Self {
        Self {
            functions_dir: functions_dir.into(),
        }
    }

    pub fn functions_dir(&self) -> &Path {
        &self.functions_dir
    }

    pub fn function_dir(&self, name: &str) -> PathBuf {
        self.functions_dir.join(name)
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.function_dir(name).join(CONFIG_FILE_NAME)
    }

    pub async fn load(&self, name: &str) -> Result<FunctionRecord, StoreError> {
        let contents = self.read_config(name).await?;
        let config: FunctionConfigFile = serde_json::from_slice(&contents)
            .map_err(|err| config_error(name, format!("failed to parse {CONFIG_FILE_NAME}: {err}")))?;
        FunctionRecord::from_config(name, config)
    }

    pub async fn exists(&self, name: &str) -> bool {
        is_valid_name(name) && fs::try_exists(self.config_path(name)).await.unwrap_or(false)
    }

    pub async fn set_logging(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let contents = self.read_config(name).await?;
        let mut config: Value = serde_json::from_slice(&contents)
            .map_err(|err| config_error(name, format!("failed to parse {CONFIG_FILE_NAME}: {err}")))?;
        match config.as_object_mut() {
            Some(object) => {
                object.insert("logging".to_owned(), Value::Bool(enabled));
            },
            None => return Err(config_error(name, format!("{CONFIG_FILE_NAME} is not an object"))),
        }

        let mut serialized = serde_json::to_vec_pretty(&config)
            .map_err(|err| config_error(name, err.to_string()))?;
        serialized.push(b'\n');

        let path = self.config_path(name);
        let tmp_path = path.with_extension("json.tmp");
        let write_error = |source: io::Error| StoreError::Write { name: name.to_owned(), source };
        fs::write(&tmp_path, serialized).await.map_err(write_error)?;
        fs::rename(&tmp_path, &path).await.map_err(write_error)?;
        Ok(())
    }

    /// All loadable records, sorted by name. Records that fail to load are skipped.
    pub async fn list(&self) -> io::Result<Vec<FunctionRecord>> {
        let mut entries = match fs::read_dir(&self.functions_dir).await {
            Ok(v) => v,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut records = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(v)) => v,
                Ok(None) => break,
                Err(err) => {
                    warn!("failed to read functions directory entry: {err:?}");
                    continue;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            match self.load(&name).await {
                Ok(record) => records.push(record),
                Err(StoreError::NotFound { .. }) => continue,
                Err(err) => warn!("skipping function {name:?}: {err}"),
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Removes the function directory together with its record.
    pub async fn remove(&self, name: &str) -> Result<(), StoreError> {
        if !self.exists(name).await {
            return Err(StoreError::NotFound { name: name.to_owned() });
        }

        fs::remove_dir_all(self.function_dir(name)).await
            .map_err(|source| StoreError::Write { name: name.to_owned(), source })
    }

    async fn read_config(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        if !is_valid_name(name) {
            return Err(StoreError::NotFound { name: name.to_owned() });
        }

        match fs::read(self.config_path(name)).await {
            Ok(v) => Ok(v),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound { name: name.to_owned() }),
            Err(err) => Err(config_error(name, format!("failed to read {CONFIG_FILE_NAME}: {err}"))),
        }
    }
}

impl FunctionRecord {
    fn from_config(name: &str, config: FunctionConfigFile) -> Result<Self, StoreError> {
        match config.name.as_deref() {
            Some(v) if v == name => {},
            Some(v) => return Err(config_error(name, format!("name {v:?} does not match function directory"))),
            None => return Err(config_error(name, "missing required field: name")),
        }

        let kind = match config.kind.as_deref() {
            Some("module") => {
                let entrypoint = config.entrypoint
                    .ok_or_else(|| config_error(name, "module function is missing entrypoint"))?;
                FunctionKind::Module {
                    entrypoint: Entrypoint::parse(&entrypoint).map_err(|reason| config_error(name, reason))?,
                }
            },
            Some("exec") => {
                let command = config.command
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| config_error(name, "exec function is missing command"))?;
                FunctionKind::Exec {
                    command,
                    timeout: config.timeout_ms.map(Duration::from_millis),
                }
            },
            Some(other) => return Err(config_error(name, format!("unknown kind: {other:?}"))),
            None => return Err(config_error(name, "missing required field: kind")),
        };

        Ok(Self {
            name: name.to_owned(),
            kind,
            logging_enabled: config.logging.unwrap_or(true),
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            FunctionKind::Module { .. } => "module",
            FunctionKind::Exec { .. } => "exec",
        }
    }
}

impl Entrypoint {
    pub fn new(file: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            symbol: symbol.into(),
        }
    }

    pub fn parse(entrypoint: &str) -> Result<Self, String> {
        match entrypoint.rsplit_once(':') {
            Some((file, symbol)) if !file.is_empty() && !symbol.is_empty() => Ok(Self::new(file, symbol)),
            _ => Err(format!("invalid entrypoint {entrypoint:?}, expected \"file:symbol\"")),
        }
    }

    /// Resolves the module file inside `function_dir`, trying known extensions when the file
    /// is referenced without one.
    pub fn source_path(&self, function_dir: &Path) -> PathBuf {
        let candidate = function_dir.join(&self.file);
        if candidate.extension().is_some() || candidate.exists() {
            return candidate;
        }

        MODULE_EXTENSIONS.iter()
            .map(|extension| candidate.with_extension(extension))
            .find(|path| path.exists())
            .unwrap_or(candidate)
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

fn config_error(name: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Config {
        name: name.to_owned(),
        reason: reason.into(),
    }
}
