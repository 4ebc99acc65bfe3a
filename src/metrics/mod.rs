//! Metrics collection and export module.
//!
//! [`MetricsMapper`] turns a [`Snapshot`] into Prometheus gauge families.
//! [`SnapshotCollector`] plugs the mapper into a `prometheus::Registry` so that
//! every gather fetches a fresh snapshot, while registration only needs the
//! metric descriptions.
//!
//! # Submodules
//!
//! - `prom` - text exposition of a registry

pub mod prom;

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, GaugeVec, Opts};
use tracing::error;

use crate::error::ExporterError;
use crate::worker::ScrapeClient;
use crate::Snapshot;

pub const IDENTITY_LABELS: [&str; 6] = [
    "nickname",
    "ca",
    "storage_type",
    "storage_location",
    "storage_nickname",
    "storage_token",
];

const STATUS_LABELS: [&str; 7] = [
    "nickname",
    "ca",
    "storage_type",
    "storage_location",
    "storage_nickname",
    "storage_token",
    "status",
];

/// One set of gauges. A fresh set is built for every render so that records
/// from an earlier scrape never leak into a later one.
struct SnapshotGauges {
    up: Gauge,
    enabled: Gauge,
    requests_total: Gauge,
    ca_error: GaugeVec,
    key_generated_date: GaugeVec,
    key_issued_count: GaugeVec,
    last_checked: GaugeVec,
    not_valid_after: GaugeVec,
    not_valid_before: GaugeVec,
    stuck: GaugeVec,
    status: GaugeVec,
}

impl SnapshotGauges {
    fn new() -> Result<Self, prometheus::Error> {
        let per_request = |name: &str, help: &str| GaugeVec::new(Opts::new(name, help), &IDENTITY_LABELS);
        Ok(SnapshotGauges {
            up: Gauge::with_opts(Opts::new(
                "certmonger_up",
                "1 if certmonger could be queried over the system bus",
            ))?,
            enabled: Gauge::with_opts(Opts::new(
                "certmonger_enabled",
                "1 if the certmonger service is enabled; 0 if disabled or unknown",
            ))?,
            requests_total: Gauge::with_opts(Opts::new(
                "certmonger_requests_total",
                "Number of certificates managed by certmonger",
            ))?,
            ca_error: per_request(
                "certmonger_request_ca_error",
                "1 if the CA returned an error when certificate signing was requested",
            )?,
            key_generated_date: per_request(
                "certmonger_request_key_generated_date_seconds",
                "Timestamp the private key was generated",
            )?,
            key_issued_count: per_request(
                "certmonger_request_key_issued_count",
                "Number of times a certificate was issued for the private key",
            )?,
            last_checked: per_request(
                "certmonger_request_last_checked_date_seconds",
                "Timestamp of last check for expiration",
            )?,
            not_valid_after: per_request(
                "certmonger_request_not_valid_after_date_seconds",
                "Timestamp of certificate expiry",
            )?,
            not_valid_before: per_request(
                "certmonger_request_not_valid_before_date_seconds",
                "Timestamp after which certificate is valid",
            )?,
            stuck: per_request("certmonger_request_stuck", "1 if request is stuck")?,
            status: GaugeVec::new(
                Opts::new(
                    "certmonger_request_status",
                    "Current state of the request; always 1, the state is in the status label",
                ),
                &STATUS_LABELS,
            )?,
        })
    }

    fn scalars(&self) -> [&dyn Collector; 3] {
        [&self.up, &self.enabled, &self.requests_total]
    }

    fn per_request(&self) -> [&GaugeVec; 7] {
        [
            &self.ca_error,
            &self.key_issued_count,
            &self.last_checked,
            &self.not_valid_after,
            &self.not_valid_before,
            &self.stuck,
            &self.status,
        ]
    }
}

pub struct MetricsMapper {
    shapes: SnapshotGauges,
}

impl MetricsMapper {
    pub fn new() -> Result<Self, ExporterError> {
        Ok(MetricsMapper {
            shapes: SnapshotGauges::new()?,
        })
    }

    /// Names, help and labels of every series, without touching any data.
    pub fn describe(&self) -> Vec<&Desc> {
        let shapes = &self.shapes;
        let mut descs: Vec<&Desc> = shapes.scalars().into_iter().flat_map(|c| c.desc()).collect();
        descs.extend(shapes.key_generated_date.desc());
        for vec in shapes.per_request() {
            descs.extend(vec.desc());
        }
        descs
    }

    /// Renders a snapshot. Families without any sample are left out.
    pub fn render(&self, snapshot: &Snapshot) -> Result<Vec<MetricFamily>, ExporterError> {
        let gauges = SnapshotGauges::new()?;

        gauges.up.set(bool_value(snapshot.bus_reachable));
        gauges
            .enabled
            .set(bool_value(snapshot.service_enabled.unwrap_or(false)));
        gauges.requests_total.set(snapshot.requests.len() as f64);

        let mut key_dates = 0;
        for record in &snapshot.requests {
            let identity = record.identity();
            let labels: Vec<&str> = identity.iter().map(String::as_str).collect();

            gauges
                .ca_error
                .with_label_values(&labels)
                .set(bool_value(record.ca_error));
            if let Some(date) = record.key_generated_date.filter(|&d| d > 0) {
                gauges
                    .key_generated_date
                    .with_label_values(&labels)
                    .set(date as f64);
                key_dates += 1;
            }
            gauges
                .key_issued_count
                .with_label_values(&labels)
                .set(record.key_issued_count as f64);
            gauges
                .last_checked
                .with_label_values(&labels)
                .set(record.last_checked as f64);
            gauges
                .not_valid_after
                .with_label_values(&labels)
                .set(record.not_valid_after as f64);
            gauges
                .not_valid_before
                .with_label_values(&labels)
                .set(record.not_valid_before as f64);
            gauges
                .stuck
                .with_label_values(&labels)
                .set(bool_value(record.stuck));

            let mut status_labels = labels.clone();
            status_labels.push(&record.status);
            gauges.status.with_label_values(&status_labels).set(1.0);
        }

        let mut families: Vec<MetricFamily> =
            gauges.scalars().into_iter().flat_map(|c| c.collect()).collect();
        if key_dates > 0 {
            families.extend(gauges.key_generated_date.collect());
        }
        if !snapshot.requests.is_empty() {
            for vec in gauges.per_request() {
                families.extend(vec.collect());
            }
        }
        Ok(families)
    }
}

fn bool_value(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

/// Registry collector that asks the supervisor for a snapshot on every gather.
pub struct SnapshotCollector {
    client: ScrapeClient,
    mapper: MetricsMapper,
}

impl SnapshotCollector {
    pub fn new(client: ScrapeClient) -> Result<Self, ExporterError> {
        Ok(SnapshotCollector {
            client,
            mapper: MetricsMapper::new()?,
        })
    }
}

impl Collector for SnapshotCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.mapper.describe()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = self.client.scrape().unwrap_or_else(|e| {
            error!(error = %e, "Scrape failed");
            Snapshot::unreachable()
        });
        self.mapper.render(&snapshot).unwrap_or_else(|e| {
            error!(error = %e, "Failed to render snapshot");
            Vec::new()
        })
    }
}
