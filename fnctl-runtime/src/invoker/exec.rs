use {
    std::{io, process::Stdio, time::Duration},
    futures::future::BoxFuture,
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
        process::{Child, Command},
        time::timeout,
    },
    tracing::warn,
    fnctl_core::InvocationResult,
    crate::{
        error::InvokeError,
        invoker::{Invocation, Invoker},
        store::FunctionKind,
    },
};

/// Runs `exec` functions as a shell command inside the function directory.
///
/// The payload is written to stdin as JSON and stdout is parsed as the invocation result.
pub struct ExecInvoker {
    default_timeout: Duration,
}

impl ExecInvoker {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Invoker for ExecInvoker {
    fn invoke(&self, invocation: Invocation) -> BoxFuture<'_, Result<InvocationResult, InvokeError>> {
        Box::pin(async move {
            let (command, deadline) = match &invocation.record.kind {
                FunctionKind::Exec { command, timeout } => (command.clone(), timeout.unwrap_or(self.default_timeout)),
                FunctionKind::Module { .. } => return Err(InvokeError::Exec {
                    status: "not started".to_owned(),
                    output: format!("function {:?} is not an exec function", invocation.record.name),
                }),
            };
            let function_dir = invocation.function_dir.clone();
            let input = serde_json::to_vec(&invocation.into_payload())
                .map_err(|err| InvokeError::MalformedOutput { reason: format!("failed to serialize payload: {err}") })?;

            let mut child = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .current_dir(&function_dir)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                // the shell leads a fresh process group, so a timeout reaches everything it started
                .process_group(0)
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| InvokeError::Exec { status: "failed to start".to_owned(), output: err.to_string() })?;

            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    // the process is free to exit without reading its input
                    match stdin.write_all(&input).await {
                        Ok(()) => {},
                        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {},
                        Err(err) => warn!("failed to write payload to function stdin: {err:?}"),
                    }
                });
            }

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let finished = timeout(deadline, async {
                tokio::try_join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
            }).await;

            let (status, stdout, stderr) = match finished {
                Ok(Ok(v)) => v,
                Ok(Err(err)) => {
                    kill_process_group(&mut child).await;
                    return Err(InvokeError::Exec { status: "unknown".to_owned(), output: err.to_string() });
                },
                Err(_) => {
                    kill_process_group(&mut child).await;
                    return Err(InvokeError::Timeout(deadline));
                },
            };

            if !status.success() {
                let stderr = String::from_utf8_lossy(&stderr).trim().to_owned();
                return Err(InvokeError::Exec {
                    status: status.to_string(),
                    output: if stderr.is_empty() {
                        String::from_utf8_lossy(&stdout).trim().to_owned()
                    } else {
                        stderr
                    },
                });
            }

            let value = serde_json::from_slice(&stdout)
                .map_err(|err| InvokeError::MalformedOutput { reason: format!("stdout is not valid json: {err}") })?;
            InvocationResult::from_value(value)
                .map_err(|err| InvokeError::MalformedOutput { reason: err.to_string() })
        })
    }
}

async fn read_pipe(pipe: Option<impl AsyncRead + Unpin>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// SIGKILLs the whole process group led by `child` and reaps the shell.
async fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Ok(pgid) = libc::pid_t::try_from(pid) {
            // SAFETY: plain syscall, the group was created by `process_group(0)` at spawn
            if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
                warn!("failed to kill process group {pgid}: {:?}", io::Error::last_os_error());
            }
        }
    }

    if let Err(err) = child.kill().await {
        warn!("failed to kill timed out function process: {err:?}");
    }
}
