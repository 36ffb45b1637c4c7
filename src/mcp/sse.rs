//! Legacy MCP "HTTP+SSE" transport.
//!
//! The server streams JSON-RPC messages over a long-lived `GET` event stream
//! and announces, in its first `endpoint` event, the URL that client messages
//! must be `POST`ed to. rmcp speaks newline-delimited JSON over any async
//! reader/writer pair, so this module bridges the two through an in-memory
//! duplex pipe.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, anyhow};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::sse::{SseDecoder, SseFrame};

const DUPLEX_CAPACITY: usize = 256 * 1024;

/// Reader/writer pair handed to rmcp.
pub type SseTransport = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

/// Open the event stream, wait for the `endpoint` event, and start the
/// background pumps.
///
/// Endpoint discovery is bounded by `connect_timeout`.
pub async fn connect(
    server: &str,
    url: &Url,
    headers: &HashMap<String, String>,
    connect_timeout: Duration,
) -> anyhow::Result<SseTransport> {
    let http = reqwest::Client::builder()
        .default_headers(super::header_map(headers)?)
        .build()
        .context("failed to build HTTP client")?;

    let deadline = tokio::time::Instant::now() + connect_timeout;

    let resp = tokio::time::timeout_at(
        deadline,
        http.get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .send(),
    )
    .await
    .map_err(|_| anyhow!("timed out opening SSE stream for '{server}'"))?
    .with_context(|| format!("failed to open SSE stream for '{server}'"))?
    .error_for_status()
    .with_context(|| format!("SSE stream for '{server}' rejected"))?;

    let mut bytes = Box::pin(resp.bytes_stream());
    let mut decoder = SseDecoder::new();
    let mut pending: Vec<SseFrame> = Vec::new();

    let endpoint = loop {
        let chunk = tokio::time::timeout_at(deadline, bytes.next())
            .await
            .map_err(|_| anyhow!("SSE endpoint event not received from '{server}'"))?
            .ok_or_else(|| anyhow!("SSE stream for '{server}' closed before endpoint event"))?
            .with_context(|| format!("SSE stream for '{server}' failed"))?;

        let mut found = None;
        for frame in decoder.push(&chunk) {
            if found.is_none() && frame.event_type() == "endpoint" {
                found = Some(resolve_endpoint(url, &frame.data)?);
            } else {
                pending.push(frame);
            }
        }
        if let Some(endpoint) = found {
            break endpoint;
        }
    };

    tracing::debug!(
        name: "mcp.sse.endpoint",
        server = %server,
        endpoint = %endpoint,
        "SSE endpoint discovered"
    );

    let (client_io, bridge_io) = tokio::io::duplex(DUPLEX_CAPACITY);
    let (bridge_rx, mut bridge_tx) = tokio::io::split(bridge_io);
    let shutdown = CancellationToken::new();

    // Server -> rmcp
    {
        let shutdown = shutdown.clone();
        let server = server.to_string();
        tokio::spawn(async move {
            for frame in pending {
                if forward_frame(&mut bridge_tx, &frame).await.is_err() {
                    return;
                }
            }
            loop {
                let chunk = tokio::select! {
                    () = shutdown.cancelled() => break,
                    chunk = bytes.next() => chunk,
                };
                match chunk {
                    Some(Ok(chunk)) => {
                        for frame in decoder.push(&chunk) {
                            if forward_frame(&mut bridge_tx, &frame).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(server = %server, error = %e, "SSE stream error");
                        break;
                    }
                    None => {
                        tracing::info!(server = %server, "SSE stream closed by server");
                        break;
                    }
                }
            }
            let _ = bridge_tx.shutdown().await;
        });
    }

    // rmcp -> server
    {
        let server = server.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(bridge_rx).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => post_message(&http, &endpoint, &server, line).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "SSE bridge read failed");
                        break;
                    }
                }
            }
            shutdown.cancel();
        });
    }

    Ok(tokio::io::split(client_io))
}

/// Resolve the announced endpoint against the stream URL.
pub fn resolve_endpoint(base: &Url, data: &str) -> anyhow::Result<Url> {
    base.join(data.trim())
        .with_context(|| format!("invalid SSE endpoint '{}'", data.trim()))
}

async fn forward_frame(
    tx: &mut WriteHalf<DuplexStream>,
    frame: &SseFrame,
) -> std::io::Result<()> {
    if frame.event_type() != "message" || frame.data.trim().is_empty() {
        return Ok(());
    }
    // JSON allows raw newlines only as whitespace, so folding keeps one message per line.
    let mut line = frame.data.replace(['\r', '\n'], " ");
    line.push('\n');
    tx.write_all(line.as_bytes()).await?;
    tx.flush().await
}

async fn post_message(http: &reqwest::Client, endpoint: &Url, server: &str, body: String) {
    match http
        .post(endpoint.clone())
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => {
            tracing::warn!(
                server = %server,
                status = %resp.status(),
                "SSE message POST rejected"
            );
        }
        Err(e) => {
            tracing::warn!(server = %server, error = %e, "SSE message POST failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_endpoint() {
        let base = Url::parse("http://localhost:9000/sse").unwrap();
        let ep = resolve_endpoint(&base, "/messages?session_id=abc").unwrap();
        assert_eq!(ep.as_str(), "http://localhost:9000/messages?session_id=abc");
    }

    #[test]
    fn test_resolve_absolute_endpoint() {
        let base = Url::parse("https://a.example.com/mcp/sse").unwrap();
        let ep = resolve_endpoint(&base, " https://b.example.com/post ").unwrap();
        assert_eq!(ep.as_str(), "https://b.example.com/post");
    }

    #[tokio::test]
    async fn test_forward_frame_writes_one_line_per_message() {
        let (a, b) = tokio::io::duplex(1024);
        let (_, mut tx) = tokio::io::split(a);
        let (rx, _) = tokio::io::split(b);

        let frame = SseFrame {
            event: None,
            data: "{\"jsonrpc\":\"2.0\",\n\"id\":1}".to_string(),
        };
        forward_frame(&mut tx, &frame).await.unwrap();
        let ignored = SseFrame {
            event: Some("ping".to_string()),
            data: "{}".to_string(),
        };
        forward_frame(&mut tx, &ignored).await.unwrap();
        drop(tx);

        let mut lines = BufReader::new(rx).lines();
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("{\"jsonrpc\":\"2.0\", \"id\":1}")
        );
    }
}
