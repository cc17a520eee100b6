use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;

macro_rules! debug_eprintln {
    ($($arg:tt)*) => {
        if std::env::var("CHATPAD_DEBUG").is_ok() {
            eprintln!($($arg)*);
        }
    };
}

/// How long the initial connection attempt may take. Once the body is
/// streaming there is no overall deadline; a slow but live server keeps
/// going.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TAGS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

/// What the background stream task reports back to the foreground.
/// Exactly one terminal event (`Done` or `Failed`) per stream, and
/// nothing after it.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Fragment(String),
    Done,
    Failed(ChatError),
}

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: String) -> Self {
        // Builder failure means TLS could not initialize; fail at startup.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("http client");
        OllamaClient { base_url, client }
    }

    /// GET /api/tags. Any failure falls back to a single-element list with
    /// the configured default model so startup never hangs on a dead server.
    pub async fn list_models(&self, fallback: &str) -> Vec<String> {
        match self.fetch_models().await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => vec![fallback.to_string()],
            Err(e) => {
                debug_eprintln!("model listing failed: {}", e);
                vec![fallback.to_string()]
            }
        }
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ChatError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = tokio::time::timeout(TAGS_TIMEOUT, self.client.get(&url).send())
            .await
            .map_err(|_| ChatError::Connection("model listing timed out".to_string()))?
            .map_err(|e| ChatError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChatError::Connection(format!(
                "model listing returned {}",
                response.status()
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Connection(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// POST /api/generate with `stream: true` and hand the newline-delimited
    /// JSON body back as fragments over a channel. The spawned task only
    /// transports text; it never touches the conversation or the disk.
    ///
    /// Cancellation is cooperative: the token is checked before each record,
    /// and dropping out of the loop closes the connection.
    pub fn start_stream(
        &self,
        model: &str,
        prompt: &str,
        token: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let url = format!("{}/api/generate", self.base_url);
        let body = serde_json::to_value(GenerateRequest {
            model,
            prompt,
            stream: true,
        })
        .unwrap_or_default();

        tokio::spawn(async move {
            let event = match run_stream(client, url, body, &token, &tx).await {
                Ok(()) => StreamEvent::Done,
                Err(e) => StreamEvent::Failed(e),
            };
            let _ = tx.send(event).await;
        });

        rx
    }
}

async fn run_stream(
    client: reqwest::Client,
    url: String,
    body: serde_json::Value,
    token: &CancellationToken,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), ChatError> {
    let response = tokio::time::timeout(CONNECT_TIMEOUT, client.post(&url).json(&body).send())
        .await
        .map_err(|_| ChatError::Connection("connection timed out".to_string()))?
        .map_err(|e| ChatError::Connection(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let detail = response
            .text()
            .await
            .unwrap_or_else(|_| format!("server returned {}", status));
        return Err(ChatError::Connection(detail));
    }

    let mut stream = response.bytes_stream();
    let mut buffer = LineBuffer::new();

    while let Some(item) = stream.next().await {
        let chunk = item.map_err(|e| ChatError::StreamRead(e.to_string()))?;

        for line in buffer.push(&chunk) {
            if token.is_cancelled() {
                debug_eprintln!("stream cancelled, dropping connection");
                return Ok(());
            }
            if let Some(fragment) = fragment_from_line(&line) {
                if tx.send(StreamEvent::Fragment(fragment)).await.is_err() {
                    // Receiver gone, nobody left to stream to.
                    return Ok(());
                }
            }
        }
    }

    // Whatever is left after the server closed the connection.
    if !token.is_cancelled() {
        if let Some(fragment) = fragment_from_line(&buffer.take_rest()) {
            let _ = tx.send(StreamEvent::Fragment(fragment)).await;
        }
    }

    Ok(())
}

/// Reassembles newline-delimited records from raw transport chunks.
/// Bytes are buffered and decoded only per complete line: transport chunk
/// boundaries do not align with codepoints, so decoding a chunk on its own
/// would mangle a multi-byte character split across two chunks.
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        LineBuffer { bytes: Vec::new() }
    }

    /// Appends a transport chunk and drains every complete line.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.bytes.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=newline).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// The unterminated tail left when the server closes the connection.
    fn take_rest(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.bytes).into_owned();
        self.bytes.clear();
        rest
    }
}

/// One NDJSON record → at most one fragment. Malformed and empty lines are
/// skipped, not errors; records with an empty `response` yield nothing.
fn fragment_from_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<GenerateChunk>(line) {
        Ok(chunk) if !chunk.response.is_empty() => Some(chunk.response),
        Ok(_) => None,
        Err(e) => {
            debug_eprintln!("skipping malformed record: {} ({})", line, e);
            None
        }
    }
}
