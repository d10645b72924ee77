//! Prometheus text exposition format.
//!
//! Renders the current aggregate and per-node stats for scraping by a
//! Prometheus server or compatible agent.

use std::fmt::Write;

use tidegate_state::NodeStats;

use crate::store::AggregatedMetrics;

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Render the aggregate and node stats into Prometheus text format.
pub fn render_prometheus(metrics: &AggregatedMetrics, nodes: &[NodeStats]) -> String {
    let mut out = String::new();

    header(&mut out, "tidegate_requests_total", "counter", "Requests recorded since startup.");
    let _ = writeln!(out, "tidegate_requests_total {}", metrics.total_requests);

    header(&mut out, "tidegate_errors_total", "counter", "Requests with status >= 400 since startup.");
    let _ = writeln!(out, "tidegate_errors_total {}", metrics.total_errors);

    header(&mut out, "tidegate_requests_per_minute", "gauge", "Requests completed in the last minute.");
    let _ = writeln!(out, "tidegate_requests_per_minute {}", metrics.requests_per_minute);

    header(&mut out, "tidegate_latency_ms", "gauge", "Request latency over the aggregation window in milliseconds.");
    let _ = writeln!(out, "tidegate_latency_ms{{stat=\"avg\"}} {:.2}", metrics.avg_latency_ms);
    let _ = writeln!(out, "tidegate_latency_ms{{stat=\"p95\"}} {:.2}", metrics.p95_latency_ms);
    let _ = writeln!(out, "tidegate_latency_ms{{stat=\"p99\"}} {:.2}", metrics.p99_latency_ms);

    header(&mut out, "tidegate_error_rate_percent", "gauge", "Error rate over the aggregation window (0-100).");
    let _ = writeln!(out, "tidegate_error_rate_percent {:.4}", metrics.error_rate_percent);

    header(&mut out, "tidegate_node_healthy", "gauge", "1 if the node is healthy.");
    for n in nodes {
        let _ = writeln!(out, "tidegate_node_healthy{{node=\"{}\"}} {}", n.id, u8::from(n.healthy));
    }

    header(&mut out, "tidegate_node_connections", "gauge", "In-flight connections per node.");
    for n in nodes {
        let _ = writeln!(out, "tidegate_node_connections{{node=\"{}\"}} {}", n.id, n.current_connections);
    }

    header(&mut out, "tidegate_node_max_connections", "gauge", "Connection capacity per node.");
    for n in nodes {
        let _ = writeln!(out, "tidegate_node_max_connections{{node=\"{}\"}} {}", n.id, n.max_connections);
    }

    header(&mut out, "tidegate_node_probe_latency_ms", "gauge", "Latency of the last health probe per node.");
    for n in nodes {
        if let Some(latency) = n.latency_ms {
            let _ = writeln!(out, "tidegate_node_probe_latency_ms{{node=\"{}\"}} {latency:.2}", n.id);
        }
    }

    out
}
