//! Flow exchange with the host proxy.
//!
//! Newline-delimited JSON: the host writes one flow per line and reads back
//! the same flow after mutation, tagged with its `id` and an `applied` record.
//! Each flow runs on its own task, so a delayed flow never holds up the rest
//! and replies may come back out of order.

use crate::error::FlowError;
use crate::flow::Flow;
use crate::modifier::{Applied, ResponseHook};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Replies buffered before flow tasks wait on the writer.
const REPLY_BUFFER: usize = 256;

/// Reply for a successfully parsed flow.
#[derive(Debug, Serialize)]
pub struct FlowReply {
    #[serde(flatten)]
    pub flow: Flow,
    /// Rule applied to the flow, `null` when none matched
    pub applied: Option<Applied>,
}

/// Reply for a line that could not be parsed as a flow.
#[derive(Debug, Serialize)]
struct ErrorReply {
    id: Option<String>,
    error: String,
}

/// Serve flows from `reader`, writing replies to `writer`, until `reader` hits EOF.
///
/// Returns once every in-flight flow has been answered.
pub async fn serve_connection<R, W>(
    hook: Arc<dyn ResponseHook>,
    reader: R,
    writer: W,
) -> Result<(), FlowError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(REPLY_BUFFER);
    let writer_task = tokio::spawn(write_replies(writer, rx));

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let hook = Arc::clone(&hook);
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = handle_line(hook.as_ref(), &line).await;
            if tx.send(reply).await.is_err() {
                debug!("Reply writer closed, dropping reply");
            }
        });
    }

    // Writer finishes once the last flow task drops its sender
    drop(tx);
    writer_task
        .await
        .map_err(|e| FlowError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Serve flows on stdin/stdout.
pub async fn serve_stdio(hook: Arc<dyn ResponseHook>) -> Result<(), FlowError> {
    info!(hook = %hook.name(), "Serving flows on stdio");
    serve_connection(hook, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve flows on a Unix domain socket until `shutdown` resolves.
///
/// A stale socket at `path` is replaced, any other file there is an error.
/// The socket file is removed on shutdown.
#[cfg(unix)]
pub async fn serve_unix<F>(
    hook: Arc<dyn ResponseHook>,
    path: &std::path::Path,
    shutdown: F,
) -> Result<(), FlowError>
where
    F: std::future::Future<Output = ()>,
{
    use std::os::unix::fs::FileTypeExt;
    use tokio::net::UnixListener;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path)?,
        Ok(_) => return Err(FlowError::NotASocket(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(path)?;
    info!(hook = %hook.name(), socket = %path.display(), "Serving flows on Unix socket");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                debug!("Host connected");
                let hook = Arc::clone(&hook);
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    match serve_connection(hook, reader, writer).await {
                        Ok(()) => debug!("Host disconnected"),
                        Err(e) => warn!(error = %e, "Host connection failed"),
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Shutting down flow server");
                break;
            }
        }
    }

    if let Err(e) = std::fs::remove_file(path) {
        warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
    }
    Ok(())
}

async fn handle_line(hook: &dyn ResponseHook, line: &str) -> String {
    match serde_json::from_str::<Flow>(line) {
        Ok(mut flow) => {
            let applied = hook.on_response(&mut flow).await;
            encode(&FlowReply { flow, applied })
        }
        Err(e) => {
            // Echo the id back when the line is at least a JSON object
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_str).map(String::from));
            let error = FlowError::Malformed(e);
            warn!(id = ?id, error = %error, "Rejected flow");
            encode(&ErrorReply {
                id,
                error: error.to_string(),
            })
        }
    }
}

fn encode<T: Serialize>(reply: &T) -> String {
    serde_json::to_string(reply).unwrap_or_else(|e| {
        serde_json::json!({ "id": null, "error": format!("failed to encode reply: {}", e) })
            .to_string()
    })
}

async fn write_replies<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> Result<(), FlowError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = rx.recv().await {
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifier::ResponseModifier;
    use tokio::io::AsyncReadExt;
    use tokio_test::assert_ok;

    fn hook() -> Arc<dyn ResponseHook> {
        Arc::new(
            ResponseModifier::from_json(
                r#"{
                    "/slow": {"delay": 0.3, "response": {"status_code": 504}},
                    "/api/": {"response": {"status_code": 500, "body": {"error": "boom"}}}
                }"#,
            )
            .unwrap(),
        )
    }

    async fn exchange(input: &str) -> Vec<Value> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(serve_connection(hook(), server_read, server_write));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        assert_ok!(task.await.unwrap());

        output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_exchange_replaces_response() {
        let replies = exchange(
            r#"{"id": "1", "request": {"path": "/api/items"}, "response": {"status_code": 200, "body": {"type": "text", "content": "[]"}}}
"#,
        )
        .await;

        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(reply["id"], "1");
        assert_eq!(reply["response"]["status_code"], 500);
        assert_eq!(reply["response"]["body"]["content"], r#"{"error":"boom"}"#);
        assert_eq!(reply["applied"]["pattern"], "/api/");
        assert_eq!(reply["applied"]["mutation"]["kind"], "replaced");
    }

    #[tokio::test]
    async fn test_exchange_passthrough_has_null_applied() {
        let replies = exchange(
            r#"{"id": "p", "request": {"path": "/health"}, "response": {"status_code": 204}}
"#,
        )
        .await;

        assert_eq!(replies[0]["response"]["status_code"], 204);
        assert!(replies[0]["applied"].is_null());
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error_reply() {
        let replies = exchange(
            "{\"id\": \"bad\", \"request\": 5}\nnot json at all\n\n{\"id\": \"ok\", \"request\": {\"path\": \"/x\"}, \"response\": {}}\n",
        )
        .await;

        assert_eq!(replies.len(), 3);
        let bad = replies.iter().find(|r| r["id"] == "bad").unwrap();
        assert!(bad["error"].as_str().unwrap().starts_with("malformed flow"));
        assert!(replies.iter().any(|r| r["id"].is_null() && r["error"].is_string()));
        assert!(replies.iter().any(|r| r["id"] == "ok" && r["applied"].is_null()));
    }

    #[tokio::test]
    async fn test_delayed_flow_does_not_block_others() {
        let replies = exchange(concat!(
            r#"{"id": "slow", "request": {"path": "/slow"}, "response": {}}"#,
            "\n",
            r#"{"id": "fast", "request": {"path": "/api/fast"}, "response": {}}"#,
            "\n",
        ))
        .await;

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], "fast");
        assert_eq!(replies[1]["id"], "slow");
        assert_eq!(replies[1]["response"]["status_code"], 504);
        assert_eq!(replies[1]["applied"]["delay_secs"], 0.3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_roundtrip() {
        use tokio::net::UnixStream;
        use tokio::sync::oneshot;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modifier.sock");
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server_path = path.clone();
        let server = tokio::spawn(async move {
            serve_unix(hook(), &server_path, async move {
                let _ = stop_rx.await;
            })
            .await
        });

        let mut stream = loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };

        stream
            .write_all(b"{\"id\": \"u\", \"request\": {\"path\": \"/api/x\"}, \"response\": {}}\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();

        let mut output = String::new();
        stream.read_to_string(&mut output).await.unwrap();
        let reply: Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(reply["id"], "u");
        assert_eq!(reply["response"]["status_code"], 500);

        stop_tx.send(()).unwrap();
        assert_ok!(server.await.unwrap());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_keeps_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modifications_config.json");
        std::fs::write(&path, "{}").unwrap();

        let result = serve_unix(hook(), &path, async {}).await;

        assert!(matches!(result, Err(FlowError::NotASocket(_))));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        assert_ok!(serve_unix(hook(), &path, async {}).await);
        assert!(!path.exists());
    }
}
