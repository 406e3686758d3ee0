//! Client side of the worker socket.
//!
//! Every request uses a fresh connection: write one line, read until the
//! first line that parses as a response envelope, close.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lodge_protocol::{LineBuffer, Request, Response, encode_line};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::error::CommunicationError;

/// Upper bound on buffered response bytes.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Connection details for one worker socket.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    socket_path: PathBuf,
}

impl WorkerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the socket exists and accepts a connection.
    ///
    /// The file alone is not enough: a worker may create it before it starts
    /// accepting. The probe connection is closed without sending anything.
    pub async fn probe(&self) -> bool {
        if !self.socket_path.exists() {
            return false;
        }
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    /// Send `request` and wait for its response, bounded by `timeout`.
    ///
    /// A timeout abandons the connection only; the worker may still finish
    /// the work it was asked to do.
    pub async fn request(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, CommunicationError> {
        tokio::time::timeout(timeout, self.exchange(request))
            .await
            .map_err(|_| CommunicationError::Timeout(timeout))?
    }

    async fn exchange(&self, request: &Request) -> Result<Response, CommunicationError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(CommunicationError::Connect)?;

        let line = encode_line(request)?;
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(CommunicationError::Write)?;
        stream.flush().await.map_err(CommunicationError::Write)?;

        let mut buffer = LineBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(response) = buffer.next_response() {
                if response.id != request.id {
                    return Err(CommunicationError::IdMismatch {
                        expected: request.id.clone(),
                        actual: response.id,
                    });
                }
                return Ok(response);
            }

            let n = stream
                .read(&mut chunk)
                .await
                .map_err(CommunicationError::Read)?;
            if n == 0 {
                return Err(CommunicationError::Closed);
            }
            buffer.extend(&chunk[..n]);
            if buffer.len() > MAX_RESPONSE_BYTES {
                return Err(CommunicationError::TooLarge(MAX_RESPONSE_BYTES));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodge_protocol::Outcome;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    /// Accept one connection, read the request line, then write `chunks`
    /// with a short pause between them.
    async fn serve_once(listener: UnixListener, chunks: Vec<String>) -> String {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        for chunk in chunks {
            write.write_all(chunk.as_bytes()).await.unwrap();
            write.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        line
    }

    fn socket_in(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("socket")
    }

    #[tokio::test]
    async fn test_response_split_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            vec![
                "{\"id\":\"r1\",\"res".to_string(),
                "ult\":{\"ok\":true}}".to_string(),
                "\n".to_string(),
            ],
        ));

        let client = WorkerClient::new(&path);
        let request = Request::new("r1", "ping", json!({}));
        let response = client.request(&request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.outcome, Outcome::Result(json!({"ok": true})));

        let sent = server.await.unwrap();
        assert!(sent.ends_with('\n'));
        assert!(sent.contains("\"method\":\"ping\""));
    }

    #[tokio::test]
    async fn test_noise_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_once(
            listener,
            vec!["starting up\n{\"id\":\"r2\",\"error\":\"boom\"}\n".to_string()],
        ));

        let client = WorkerClient::new(&path);
        let response = client
            .request(&Request::new("r2", "x", json!({})), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.outcome, Outcome::Error("boom".to_string()));
    }

    #[tokio::test]
    async fn test_close_without_line_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_once(listener, vec!["{\"id\":\"r3\"".to_string()]));

        let client = WorkerClient::new(&path);
        let err = client
            .request(&Request::new("r3", "x", json!({})), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicationError::Closed));
    }

    #[tokio::test]
    async fn test_mismatched_id_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_once(
            listener,
            vec!["{\"id\":\"other\",\"result\":null}\n".to_string()],
        ));

        let client = WorkerClient::new(&path);
        let err = client
            .request(&Request::new("r4", "x", json!({})), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicationError::IdMismatch { .. }));
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_in(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = WorkerClient::new(&path);
        let err = client
            .request(&Request::new("r5", "x", json!({})), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_in(&dir);
        let client = WorkerClient::new(&path);
        assert!(!client.probe().await);

        // A file that is not a listening socket fails the connect.
        std::fs::write(&path, b"").unwrap();
        assert!(!client.probe().await);
        std::fs::remove_file(&path).unwrap();

        let _listener = UnixListener::bind(&path).unwrap();
        assert!(client.probe().await);
    }

    #[tokio::test]
    async fn test_missing_socket_is_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = WorkerClient::new(socket_in(&dir));
        let err = client
            .request(&Request::new("r6", "x", json!({})), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicationError::Connect(_)));
    }
}
