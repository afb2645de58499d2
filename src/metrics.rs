//! Prometheus text exposition of the publisher [`StatsSnapshot`].
use crate::stats::{Counter, StatsSnapshot};
use std::fmt;

/// Renders counters in the Prometheus text format.
///
/// Global counters are named `rabbitmq_<key>_total`. Per-connection counters are named
/// `rabbitmq_connection_<key>_total` and carry a `connection` label.
///
/// ```rust
/// use carrot_relay::metrics::PrometheusExporter;
/// use carrot_relay::stats::{Counter, Stats};
///
/// let stats = Stats::new();
/// stats.record("primary", Counter::PublishAttempts);
///
/// let text = PrometheusExporter.render_raw(&stats.snapshot());
/// assert!(text.contains("rabbitmq_publish_attempts_total 1\n"));
/// assert!(text.contains("rabbitmq_connection_publish_attempts_total{connection=\"primary\"} 1\n"));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusExporter;

impl PrometheusExporter {
    /// `HELP`, `TYPE` and sample lines for every counter.
    pub fn render(&self, snapshot: &StatsSnapshot) -> String {
        Exposition {
            snapshot,
            with_metadata: true,
        }
        .to_string()
    }

    /// Sample lines only.
    pub fn render_raw(&self, snapshot: &StatsSnapshot) -> String {
        Exposition {
            snapshot,
            with_metadata: false,
        }
        .to_string()
    }
}

struct Exposition<'a> {
    snapshot: &'a StatsSnapshot,
    with_metadata: bool,
}

impl Exposition<'_> {
    fn metadata(&self, f: &mut fmt::Formatter<'_>, name: &str, help: &str) -> fmt::Result {
        if self.with_metadata {
            writeln!(f, "# HELP {name} {help}")?;
            writeln!(f, "# TYPE {name} counter")?;
        }
        Ok(())
    }
}

impl fmt::Display for Exposition<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for counter in Counter::ALL {
            let name = metric_name(counter.key());
            self.metadata(f, &name, help(counter))?;
            writeln!(f, "{name} {}", self.snapshot.get(counter))?;
        }

        // One family per counter: metadata once, then every connection's sample.
        for counter in Counter::ALL {
            let mut samples = self
                .snapshot
                .per_connection
                .iter()
                .filter_map(|(connection, counters)| Some((connection, counters.get(&counter)?)))
                .peekable();
            if samples.peek().is_none() {
                continue;
            }
            let name = metric_name(&format!("connection_{}", counter.key()));
            self.metadata(f, &name, &format!("Per-connection metric ({counter})."))?;
            for (connection, value) in samples {
                writeln!(
                    f,
                    "{name}{{connection=\"{}\"}} {value}",
                    escape_label(connection)
                )?;
            }
        }
        Ok(())
    }
}

fn help(counter: Counter) -> &'static str {
    match counter {
        Counter::PublishAttempts => "Total publish attempts (before confirm).",
        Counter::PublishRetries => "Number of retried publish attempts.",
        Counter::PublishFailures => "Number of failed publish operations after retries.",
        Counter::ConnectionResets => {
            "Number of connection resets triggered by the producer layer."
        }
    }
}

/// `rabbitmq_<raw>_total`, with every run of characters outside `[a-zA-Z0-9_]` collapsed
/// into a single underscore.
fn metric_name(raw: &str) -> String {
    let mut name = String::from("rabbitmq_");
    let mut in_invalid_run = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c.to_ascii_lowercase());
            in_invalid_run = false;
        } else if !in_invalid_run {
            name.push('_');
            in_invalid_run = true;
        }
    }
    name.push_str("_total");
    name
}

fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '"' => escaped.push_str("\\\""),
            c => escaped.push(c),
        }
    }
    escaped
}
