//! Channels to a search server.

use async_trait::async_trait;

use super::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::error::KlerResult;

/// Sends JSON-RPC messages to a search server.
#[async_trait]
pub trait SearchTransport: Send + Sync {
    /// Send a request and wait for the response carrying the same id.
    async fn send(&self, request: JsonRpcRequest) -> KlerResult<JsonRpcResponse>;

    async fn notify(&self, notification: JsonRpcNotification) -> KlerResult<()>;

    async fn close(&self) -> KlerResult<()>;
}

#[cfg(feature = "native")]
pub use stdio::StdioTransport;

#[cfg(feature = "native")]
mod stdio {
    use std::process::Stdio;

    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::process::{Child, ChildStdin, ChildStdout, Command};
    use tokio::sync::Mutex;

    use super::SearchTransport;
    use crate::error::{KlerError, KlerResult};
    use crate::search::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

    struct Pipes {
        stdin: ChildStdin,
        stdout: BufReader<ChildStdout>,
    }

    /// Newline-delimited JSON-RPC over a child process's stdin/stdout.
    ///
    /// Requests are serialized: one request is in flight at a time and lines
    /// that are not its response (server notifications, log noise) are skipped.
    pub struct StdioTransport {
        name: String,
        pipes: Mutex<Pipes>,
        child: Mutex<Child>,
    }

    impl StdioTransport {
        /// Spawn `command[0]` with the remaining items as arguments.
        pub fn spawn(command: &[String]) -> KlerResult<Self> {
            let (program, args) = command
                .split_first()
                .ok_or_else(|| KlerError::Config("search server command is empty".into()))?;
            let mut child = Command::new(program)
                .args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;
            let stdin = child.stdin.take().ok_or_else(|| KlerError::Mcp {
                server: program.clone(),
                message: "child stdin unavailable".into(),
            })?;
            let stdout = child.stdout.take().ok_or_else(|| KlerError::Mcp {
                server: program.clone(),
                message: "child stdout unavailable".into(),
            })?;
            tracing::info!(server = %program, "search server spawned");
            Ok(Self {
                name: program.clone(),
                pipes: Mutex::new(Pipes {
                    stdin,
                    stdout: BufReader::new(stdout),
                }),
                child: Mutex::new(child),
            })
        }

        async fn write_line(stdin: &mut ChildStdin, payload: &impl serde::Serialize) -> KlerResult<()> {
            let mut line = serde_json::to_vec(payload)?;
            line.push(b'\n');
            stdin.write_all(&line).await?;
            stdin.flush().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl SearchTransport for StdioTransport {
        async fn send(&self, request: JsonRpcRequest) -> KlerResult<JsonRpcResponse> {
            let mut pipes = self.pipes.lock().await;
            Self::write_line(&mut pipes.stdin, &request).await?;

            let mut line = String::new();
            loop {
                line.clear();
                if pipes.stdout.read_line(&mut line).await? == 0 {
                    return Err(KlerError::Mcp {
                        server: self.name.clone(),
                        message: "server closed its output".into(),
                    });
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(resp) if resp.id == request.id => return Ok(resp),
                    Ok(resp) => {
                        tracing::debug!(server = %self.name, id = ?resp.id, "skipping stale response")
                    }
                    Err(_) => tracing::debug!(server = %self.name, "skipping non-response line"),
                }
            }
        }

        async fn notify(&self, notification: JsonRpcNotification) -> KlerResult<()> {
            let mut pipes = self.pipes.lock().await;
            Self::write_line(&mut pipes.stdin, &notification).await
        }

        async fn close(&self) -> KlerResult<()> {
            let mut child = self.child.lock().await;
            if let Err(e) = child.kill().await {
                tracing::warn!(server = %self.name, error = %e, "failed to stop search server");
            }
            Ok(())
        }
    }
}
