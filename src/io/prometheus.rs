//! Prometheus metrics HTTP endpoint
//!
//! Exposes sorter metrics in Prometheus text format at /metrics, device
//! connectivity at /devices and engine diagnostics at /status.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{
    MetricsSummary, RejectReason, METRICS_BUCKET_BOUNDS, METRICS_DELAY_MS_BOUNDS,
    METRICS_NUM_BUCKETS,
};
use crate::services::sorter::Sorter;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(
    summary: &MetricsSummary,
    devices: &[(String, bool)],
    site_id: &str,
) -> String {
    let mut output = String::with_capacity(8192);

    write_package_metrics(&mut output, site_id, summary);
    write_rejection_metrics(&mut output, site_id, summary);
    write_pulse_metrics(&mut output, site_id, summary);
    write_actuator_metrics(&mut output, site_id, summary);
    write_latency_metrics(&mut output, site_id, summary);
    write_device_metrics(&mut output, site_id, devices);

    output
}

fn write_package_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "sorter_packages_total",
        "Packages submitted for sorting",
        MetricType::Counter,
        site,
        summary.packages_total,
    );
    write_metric(
        output,
        "sorter_packages_queued_total",
        "Packages accepted and queued for a lane",
        MetricType::Counter,
        site,
        summary.packages_queued,
    );
    write_metric(
        output,
        "sorter_packages_sorted_total",
        "Packages diverted by a pendulum or confirmed by the PLC",
        MetricType::Counter,
        site,
        summary.packages_sorted,
    );
    write_metric(
        output,
        "sorter_estimated_triggers_total",
        "Packages queued with an estimated trigger instant",
        MetricType::Counter,
        site,
        summary.estimated_triggers,
    );
    write_metric(
        output,
        "sorter_timeouts_total",
        "Packages dropped without reaching their lane",
        MetricType::Counter,
        site,
        summary.timeouts,
    );
    write_metric(
        output,
        "sorter_pending_packages",
        "Packages waiting for a lane pulse",
        MetricType::Gauge,
        site,
        summary.pending as u64,
    );
}

fn write_rejection_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let name = "sorter_rejected_total";
    let _ = writeln!(output, "# HELP {name} Packages refused, by reason");
    let _ = writeln!(output, "# TYPE {name} counter");
    for reason in RejectReason::ALL {
        let _ = writeln!(
            output,
            "{name}{{site=\"{site}\",reason=\"{}\"}} {}",
            reason.as_str(),
            summary.rejected[reason as usize]
        );
    }
}

fn write_pulse_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "sorter_entry_pulses_total",
        "Entry sensor pulses (or PLC sequence notices)",
        MetricType::Counter,
        site,
        summary.entry_pulses,
    );
    write_metric(
        output,
        "sorter_expired_pulses_total",
        "Entry pulses dropped without a package",
        MetricType::Counter,
        site,
        summary.expired_pulses,
    );
    write_metric(
        output,
        "sorter_queued_pulses",
        "Entry pulses waiting for a package",
        MetricType::Gauge,
        site,
        summary.queued_pulses as u64,
    );
    write_metric(
        output,
        "sorter_lane_pulses_total",
        "Lane sensor pulses",
        MetricType::Counter,
        site,
        summary.lane_pulses,
    );
    write_metric(
        output,
        "sorter_unmatched_lane_pulses_total",
        "Lane sensor pulses with no package in window",
        MetricType::Counter,
        site,
        summary.unmatched_lane_pulses,
    );
}

fn write_actuator_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "sorter_swings_total",
        "Swing commands sent",
        MetricType::Counter,
        site,
        summary.swings_sent,
    );
    write_metric(
        output,
        "sorter_resets_total",
        "Reset commands sent",
        MetricType::Counter,
        site,
        summary.resets_sent,
    );
    write_metric(
        output,
        "sorter_resets_skipped_total",
        "Resets skipped because the next package goes the same way",
        MetricType::Counter,
        site,
        summary.resets_skipped,
    );
    write_metric(
        output,
        "sorter_send_failures_total",
        "Commands that could not be written to a device",
        MetricType::Counter,
        site,
        summary.send_failures,
    );
    write_metric(
        output,
        "sorter_reconnects_total",
        "Reconnect-all attempts after a link fault",
        MetricType::Counter,
        site,
        summary.reconnects,
    );
    write_metric(
        output,
        "sorter_plc_feedback_ok_total",
        "PLC feedback frames reporting success",
        MetricType::Counter,
        site,
        summary.plc_feedback_ok,
    );
    write_metric(
        output,
        "sorter_plc_feedback_errors_total",
        "PLC feedback frames reporting an error",
        MetricType::Counter,
        site,
        summary.plc_feedback_errors,
    );
}

fn write_latency_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "sorter_process_latency_us",
        "process_package latency in microseconds",
        site,
        &summary.process_latency_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.process_latency_avg_us,
    );
    write_metric(
        output,
        "sorter_process_latency_p99_us",
        "99th percentile process_package latency",
        MetricType::Gauge,
        site,
        summary.process_latency_p99_us,
    );
    write_histogram(
        output,
        "sorter_actuation_ms",
        "Lane pulse to completed actuation in milliseconds",
        site,
        &summary.actuation_buckets,
        &METRICS_DELAY_MS_BOUNDS,
        summary.actuation_avg_ms,
    );
    write_histogram(
        output,
        "sorter_trigger_delay_ms",
        "Entry pulse to identification delay in milliseconds",
        site,
        &summary.trigger_delay_buckets,
        &METRICS_DELAY_MS_BOUNDS,
        summary.trigger_delay_avg_ms,
    );
}

fn write_device_metrics(output: &mut String, site: &str, devices: &[(String, bool)]) {
    let name = "sorter_device_connected";
    let _ = writeln!(output, "# HELP {name} Device link state (1 = connected)");
    let _ = writeln!(output, "# TYPE {name} gauge");
    for (device, connected) in devices {
        let _ = writeln!(
            output,
            "{name}{{site=\"{site}\",device=\"{device}\"}} {}",
            u8::from(*connected)
        );
    }
}

#[derive(Serialize)]
struct DeviceEntry<'a> {
    device: &'a str,
    connected: bool,
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    sorter: Arc<Sorter>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let summary = sorter.metrics().snapshot(sorter.pending_count(), sorter.queued_pulses());
            let devices = sorter.all_device_connection_states();
            text_response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                format_prometheus_metrics(&summary, &devices, &site_id),
            )
        }
        (&Method::GET, "/devices") => {
            let states = sorter.all_device_connection_states();
            let entries: Vec<DeviceEntry<'_>> = states
                .iter()
                .map(|(device, connected)| DeviceEntry { device, connected: *connected })
                .collect();
            match serde_json::to_string(&entries) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, format!(r#"{{"error":"{e}"}}"#)),
            }
        }
        (&Method::GET, "/status") => match serde_json::to_string(&sorter.diagnostics()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, format!(r#"{{"error":"{e}"}}"#)),
        },
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    sorter: Arc<Sorter>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let sorter = sorter.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let sorter = sorter.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, sorter, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
