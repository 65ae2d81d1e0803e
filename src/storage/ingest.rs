//! Metric ingestion with counter rate derivation
//!
//! Counter samples (octets, errors) are stored as collected. For each one,
//! the previous reading of the same series is looked up and a derived rate
//! sample is written alongside it in the same batch.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, instrument, trace};

use crate::config::RatesConfig;
use crate::rate::{counter_rate, CounterReading, CounterWidth, RateUnit};

use super::backend::StorageBackend;
use super::error::StorageResult;
use super::schema::{
    Derivation, MetricSample, META_COUNTER_BITS, META_DISCONTINUITY, META_IF_SPEED,
};

/// Summary of one ingestion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub raw: usize,
    pub derived: Vec<MetricSample>,
    pub discontinuities: usize,
}

pub struct MetricIngestor {
    store: Arc<dyn StorageBackend>,
    limits: RatesConfig,
}

impl MetricIngestor {
    pub fn new(store: Arc<dyn StorageBackend>, limits: RatesConfig) -> Self {
        Self { store, limits }
    }

    /// Persist collected samples plus the rates derived from them.
    ///
    /// Samples of derived types coming from a collector are dropped; those
    /// series are only ever produced here.
    #[instrument(skip_all, fields(count = samples.len()))]
    pub async fn ingest(&self, samples: Vec<MetricSample>) -> StorageResult<IngestReport> {
        let mut report = IngestReport::default();
        let mut batch = Vec::with_capacity(samples.len());

        for sample in samples {
            if sample.metric_type.is_derived() {
                trace!(
                    "dropping collected sample of derived type {}",
                    sample.metric_type
                );
                continue;
            }

            if let Some(derivation) = sample.metric_type.derivation() {
                if let Some(derived) = self.derive(&sample, derivation).await? {
                    if derived.meta_bool(META_DISCONTINUITY) {
                        report.discontinuities += 1;
                    }
                    report.derived.push(derived);
                }
            }

            batch.push(sample);
        }

        report.raw = batch.len();
        batch.extend(report.derived.iter().cloned());
        self.store.insert_samples(batch).await?;

        debug!(
            "ingested {} samples, {} derived ({} discontinuities)",
            report.raw,
            report.derived.len(),
            report.discontinuities
        );
        Ok(report)
    }

    async fn derive(
        &self,
        current: &MetricSample,
        derivation: Derivation,
    ) -> StorageResult<Option<MetricSample>> {
        let Some(current_value) = counter_value(current.value) else {
            trace!("counter {} is not a valid reading: {}", current.metric_type, current.value);
            return Ok(None);
        };

        let previous = self
            .store
            .query_latest(
                &current.device_id,
                current.metric_type,
                &current.context,
                1,
            )
            .await?
            .pop();

        let Some(previous) = previous else {
            trace!("no previous reading for {}/{}", current.metric_type, current.context);
            return Ok(None);
        };
        let Some(previous_value) = counter_value(previous.value) else {
            return Ok(None);
        };

        let width = counter_width(current, &previous, current_value.max(previous_value));
        let ceiling = match derivation.unit {
            RateUnit::BitsPerSecond => current
                .meta_f64(META_IF_SPEED)
                .filter(|speed| *speed > 0.0)
                .map(|speed| speed.min(self.limits.absolute_ceiling_bps))
                .unwrap_or(self.limits.absolute_ceiling_bps),
            RateUnit::PerSecond => self.limits.error_rate_ceiling,
        };

        let rate = match counter_rate(
            CounterReading::new(previous_value, previous.timestamp),
            CounterReading::new(current_value, current.timestamp),
            width,
            derivation.unit,
            Some(ceiling),
        ) {
            Ok(rate) => rate,
            Err(e) => {
                trace!("no rate for {}/{}: {}", current.metric_type, current.context, e);
                return Ok(None);
            }
        };

        let mut metadata = Map::new();
        if let Value::Object(source) = &current.metadata {
            for (key, value) in source {
                if key != META_COUNTER_BITS {
                    metadata.insert(key.clone(), value.clone());
                }
            }
        }
        if rate.discontinuous {
            metadata.insert(META_DISCONTINUITY.to_string(), json!(true));
        }

        Ok(Some(
            MetricSample::new(
                current.device_id.clone(),
                derivation.target,
                rate.value,
                current.timestamp,
            )
            .with_context(current.context.clone())
            .with_unit(derivation.unit.label())
            .with_metadata(Value::Object(metadata)),
        ))
    }
}

fn counter_value(value: f64) -> Option<u64> {
    (value.is_finite() && value >= 0.0).then_some(value as u64)
}

/// Declared width if either reading carries one, otherwise inferred from
/// the magnitude of the values seen.
fn counter_width(current: &MetricSample, previous: &MetricSample, largest: u64) -> CounterWidth {
    current
        .meta_u64(META_COUNTER_BITS)
        .or_else(|| previous.meta_u64(META_COUNTER_BITS))
        .and_then(CounterWidth::from_bits)
        .unwrap_or(if largest > u32::MAX as u64 {
            CounterWidth::Bits64
        } else {
            CounterWidth::Bits32
        })
}
