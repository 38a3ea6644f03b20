//! TCP listener for identified packages
//!
//! The identification subsystem connects and writes one request per line,
//! either `PKG <index> <chute> [barcode]` or a JSON object
//! `{"index": 1, "chute": 3, "barcode": "..."}`. Every request gets one reply
//! line: `OK <index> <delay_ms>[ estimated]` or `ERR <index> <reason>`.

use crate::domain::types::{Chute, Package};
use crate::services::correlator::TriggerAssignment;
use crate::services::sorter::{SortError, Sorter};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Ingest listener configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub port: u16,
    pub enabled: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { port: 25900, enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IngestRequest {
    pub index: u64,
    pub chute: u16,
    #[serde(default)]
    pub barcode: String,
}

/// Parse one request line
pub fn parse_request(line: &str) -> Result<IngestRequest, String> {
    if line.starts_with('{') {
        return serde_json::from_str(line).map_err(|e| format!("bad_json: {e}"));
    }

    let Some(rest) = line.strip_prefix("PKG ") else {
        return Err("unknown_command".to_string());
    };
    let mut parts = rest.split_ascii_whitespace();
    let index = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| "bad_index".to_string())?;
    let chute = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| "bad_chute".to_string())?;
    let barcode = parts.next().unwrap_or_default().to_string();

    Ok(IngestRequest { index, chute, barcode })
}

pub fn format_reply(index: u64, result: &Result<TriggerAssignment, SortError>) -> String {
    match result {
        Ok(assignment) => {
            let delay_ms = assignment.delay.as_millis();
            if assignment.estimated {
                format!("OK {index} {delay_ms} estimated\n")
            } else {
                format!("OK {index} {delay_ms}\n")
            }
        }
        Err(e) => format!("ERR {index} {}\n", e.reason().as_str()),
    }
}

/// Start the ingest TCP listener
pub async fn start_ingest_listener(
    config: IngestConfig,
    sorter: Arc<Sorter>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if !config.enabled {
        info!("ingest_listener_disabled");
        return Ok(());
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(port = %config.port, "ingest_listener_started");

    serve(listener, sorter, shutdown).await;
    Ok(())
}

/// Accept loop on an already bound listener
pub async fn serve(listener: TcpListener, sorter: Arc<Sorter>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("ingest_listener_shutdown");
                    return;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let sorter = Arc::clone(&sorter);
                        tokio::spawn(async move {
                            handle_ingest_connection(socket, addr, sorter).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "ingest_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_ingest_connection(socket: TcpStream, addr: SocketAddr, sorter: Arc<Sorter>) {
    debug!(peer = %addr, "ingest_connection_accepted");

    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match parse_request(line) {
            Ok(request) => {
                let index = request.index;
                let result = sorter
                    .process_package(Package::new(index, request.barcode), Chute(request.chute))
                    .await;
                format_reply(index, &result)
            }
            Err(reason) => {
                warn!(peer = %addr, line = %line, reason = %reason, "ingest_bad_request");
                format!("ERR - {}\n", reason.split(':').next().unwrap_or("bad_request"))
            }
        };

        if let Err(e) = write_half.write_all(reply.as_bytes()).await {
            warn!(peer = %addr, error = %e, "ingest_reply_failed");
            break;
        }
    }

    debug!(peer = %addr, "ingest_connection_closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::Config;
    use crate::infra::metrics::Metrics;
    use crate::io::mock_link::MockLinkFactory;
    use std::time::Duration;

    #[test]
    fn test_parse_text_request() {
        assert_eq!(
            parse_request("PKG 42 3 ABC123").unwrap(),
            IngestRequest { index: 42, chute: 3, barcode: "ABC123".to_string() }
        );
        assert_eq!(parse_request("PKG 7 1").unwrap().barcode, "");
    }

    #[test]
    fn test_parse_json_request() {
        let request = parse_request(r#"{"index": 9, "chute": 2, "barcode": "X9"}"#).unwrap();
        assert_eq!(request, IngestRequest { index: 9, chute: 2, barcode: "X9".to_string() });
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_request("HELLO").unwrap_err(), "unknown_command");
        assert_eq!(parse_request("PKG x 1").unwrap_err(), "bad_index");
        assert_eq!(parse_request("PKG 1").unwrap_err(), "bad_chute");
        assert!(parse_request("{not json").unwrap_err().starts_with("bad_json"));
    }

    #[test]
    fn test_format_reply() {
        let now = tokio::time::Instant::now();
        let ok = Ok(TriggerAssignment {
            trigger_at: now,
            delay: Duration::from_millis(320),
            estimated: false,
            plc_seq: None,
        });
        assert_eq!(format_reply(5, &ok), "OK 5 320\n");
        assert_eq!(format_reply(5, &Err(SortError::NotRunning)), "ERR 5 not_running\n");
    }

    async fn round_trip(sorter: Arc<Sorter>, requests: &str) -> Vec<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, sorter, shutdown_rx));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(requests.as_bytes()).await.unwrap();

        let expected = requests.lines().filter(|l| !l.trim().is_empty()).count();
        let mut lines = BufReader::new(read_half).lines();
        let mut replies = Vec::new();
        while replies.len() < expected {
            let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            replies.push(line);
        }

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
        replies
    }

    #[tokio::test]
    async fn test_rejects_when_not_running() {
        let factory = Arc::new(MockLinkFactory::default());
        let sorter = Arc::new(Sorter::new(Config::default(), factory, Arc::new(Metrics::new())));

        let replies = round_trip(sorter, "PKG 1 1 A\nBOGUS\n").await;
        assert_eq!(replies, vec!["ERR 1 not_running", "ERR - unknown_command"]);
    }

    #[tokio::test]
    async fn test_queues_package_with_estimated_trigger() {
        let factory = Arc::new(MockLinkFactory::default());
        let sorter = Arc::new(Sorter::new(Config::default(), factory, Arc::new(Metrics::new())));
        sorter.start().await.unwrap();

        // No entry pulse seen yet: midpoint of the 200-1500 ms window
        let replies = round_trip(Arc::clone(&sorter), "{\"index\": 7, \"chute\": 1}\n").await;
        assert_eq!(replies, vec!["OK 7 850 estimated"]);
        assert_eq!(sorter.pending_count(), 1);

        sorter.stop().await;
    }
}
