use {
    std::{ffi::OsString, path::{Path, PathBuf}, time::Duration},
    serde::Deserialize,
    crate::error::ConfigLoadError,
};

const FUNCTIONS_DIR: &str = "functions";
const LOGS_DIR: &str = "logs";
const DEFAULT_HOME_DIR: &str = ".fnctl";
const HOME_ENV: &str = "FNCTL_HOME";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Falls back to `$FNCTL_HOME`, then `~/.fnctl`.
    pub home: PathBuf,
    pub host: String,
    pub port: u16,
    /// Disables the gateway access log. Invocation logs are not affected.
    pub quiet: bool,
    pub exec_timeout_ms: u64,
    pub module_timeout_ms: u64,
    pub module_fuel: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            host: "127.0.0.1".to_owned(),
            port: 8080,
            quiet: false,
            exec_timeout_ms: 120_000,
            module_timeout_ms: 30_000,
            module_fuel: 10_000_000_000,
        }
    }
}

impl ServerConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    pub fn load(file_path: &Path) -> Result<Self, ConfigLoadError> {
        let contents = std::fs::read(file_path)
            .map_err(|err| ConfigLoadError::FailedToRead { path: file_path.to_path_buf(), source: err })?;
        serde_yml::from_slice(&contents)
            .map_err(|err| ConfigLoadError::FailedToParse { path: file_path.to_path_buf(), reason: err.to_string() })
    }

    /// Config file (if any) with `home` from the command line applied on top. The `FNCTL_HOME`
    /// fallback only applies when neither of them sets a home.
    pub fn resolve(file_path: Option<&Path>, home: Option<PathBuf>) -> Result<Self, ConfigLoadError> {
        let config = match file_path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        Ok(match home {
            Some(home) => config.with_home(home),
            None => config,
        })
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_module_timeout(mut self, timeout: Duration) -> Self {
        self.module_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_module_fuel(mut self, fuel: u64) -> Self {
        self.module_fuel = fuel;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn functions_dir(&self) -> PathBuf {
        self.home.join(FUNCTIONS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join(LOGS_DIR)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn module_timeout(&self) -> Duration {
        Duration::from_millis(self.module_timeout_ms)
    }
}

fn default_home() -> PathBuf {
    home_from(std::env::var_os(HOME_ENV), std::env::var_os("HOME"))
}

fn home_from(fnctl_home: Option<OsString>, user_home: Option<OsString>) -> PathBuf {
    match fnctl_home {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => user_home
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_HOME_DIR),
    }
}
