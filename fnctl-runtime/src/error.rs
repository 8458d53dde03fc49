use {
    std::{io, path::PathBuf, time::Duration},
    thiserror::Error,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("function not found: {name}")]
    NotFound { name: String },

    /// Record exists on disk but cannot be used to invoke the function.
    #[error("invalid config for function {name:?}: {reason}")]
    Config { name: String, reason: String },

    #[error("failed to update function {name:?}: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Error that may be returned by an invoker. Every variant is served as 500 by the gateway.
#[derive(Error, Debug)]
pub enum InvokeError {
    /// Module source is missing, does not compile or does not export the handler.
    /// Next invocation retries the load.
    #[error("failed to load module: {reason}")]
    Load { reason: String },

    /// Handler ran and failed: returned an error, trapped or produced an unusable result.
    #[error("handler failed: {reason}")]
    Handler { reason: String },

    #[error("function timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("process exited with {status}: {output}")]
    Exec { status: String, output: String },

    #[error("malformed function output: {reason}")]
    MalformedOutput { reason: String },
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("invocation log io error: {0}")]
    Io(#[from] io::Error),

    #[error("invocation log entry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path:?}: {source}")]
    FailedToRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path:?}: {reason}")]
    FailedToParse { path: PathBuf, reason: String },
}
