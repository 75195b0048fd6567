//! Pricing Pipeline (§4.3). Ported from
//! `examples/original_source/new-version/central-server/jobs/pricing_consolidation.py`:
//! dedup -> gap interpolation -> provider backfill -> canonical copy,
//! idempotent per `run_id`, single-flight guarded so only one
//! consolidation run is ever in progress.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::config::PricingConfig;
use crate::model::{CanonicalPrice, ConsolidatedPrice, PriceSample, PriceSampleRole, PriceSource};
use crate::store::Store;

pub struct PricingPipeline<S: Store> {
    store: Arc<S>,
    config: PricingConfig,
    running: AtomicBool,
}

fn bucket_start(t: DateTime<Utc>, bucket_secs: i64) -> DateTime<Utc> {
    let epoch = t.timestamp();
    let floored = epoch - epoch.rem_euclid(bucket_secs);
    DateTime::from_timestamp(floored, 0).unwrap_or(t)
}

/// Collapses same-bucket samples: PRIMARY role outranks REPLICA; within
/// the same role, latest `captured_at` wins.
fn deduplicate(samples: &[PriceSample], bucket_secs: i64) -> BTreeMap<DateTime<Utc>, PriceSample> {
    let mut best: BTreeMap<DateTime<Utc>, PriceSample> = BTreeMap::new();
    for s in samples {
        let bucket = bucket_start(s.captured_at, bucket_secs);
        match best.get(&bucket) {
            None => {
                best.insert(bucket, s.clone());
            }
            Some(existing) => {
                let existing_rank = role_rank(existing.role);
                let new_rank = role_rank(s.role);
                if new_rank > existing_rank || (new_rank == existing_rank && s.captured_at > existing.captured_at) {
                    best.insert(bucket, s.clone());
                }
            }
        }
    }
    best
}

fn role_rank(role: PriceSampleRole) -> u8 {
    match role {
        PriceSampleRole::Primary => 1,
        PriceSampleRole::Replica => 0,
    }
}

/// Walks the bucketed series and linearly interpolates any gap strictly
/// larger than one bucket, per the `p0 + (p1-p0)*(t-t0)/(t1-t0)` formula.
fn interpolate_gaps(series: &BTreeMap<DateTime<Utc>, PriceSample>, bucket_secs: i64) -> Vec<(DateTime<Utc>, f64)> {
    let mut filled = Vec::new();
    let points: Vec<(DateTime<Utc>, f64)> = series.iter().map(|(t, s)| (*t, s.price)).collect();
    for pair in points.windows(2) {
        let (t0, p0) = pair[0];
        let (t1, p1) = pair[1];
        let gap_secs = (t1 - t0).num_seconds();
        if gap_secs <= bucket_secs {
            continue;
        }
        let mut t = t0 + ChronoDuration::seconds(bucket_secs);
        while t < t1 {
            let frac = (t - t0).num_seconds() as f64 / gap_secs as f64;
            let price = p0 + (p1 - p0) * frac;
            filled.push((t, price));
            t += ChronoDuration::seconds(bucket_secs);
        }
    }
    filled
}

impl<S: Store> PricingPipeline<S> {
    pub fn new(store: Arc<S>, config: PricingConfig) -> Self {
        Self { store, config, running: AtomicBool::new(false) }
    }

    /// `run_consolidation_job`: single-flight guarded, idempotent per
    /// `run_id`. Returns `Ok(None)` without doing work if a run is
    /// already in progress.
    pub async fn run(&self) -> anyhow::Result<Option<Uuid>> {
        if self.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            tracing::info!("consolidation already running, skipping");
            return Ok(None);
        }
        let run_id = Uuid::new_v4();
        let result = self.run_inner(run_id).await;
        self.running.store(false, Ordering::SeqCst);
        result.map(|_| Some(run_id))
    }

    async fn run_inner(&self, run_id: Uuid) -> anyhow::Result<()> {
        let now = Utc::now();
        let bucket_secs = self.config.bucket.as_secs() as i64;
        let lookback = now - ChronoDuration::seconds(self.config.gap_lookback.as_secs() as i64);

        let pool_ids = self.store.list_pool_ids_with_raw_prices(lookback).await?;
        for pool_id in pool_ids {
            let raw = self.store.raw_prices_in_window(&pool_id, lookback).await?;
            let deduped = deduplicate(&raw, bucket_secs);

            let mut rows: Vec<ConsolidatedPrice> = deduped
                .iter()
                .map(|(ts, sample)| ConsolidatedPrice {
                    pool_id: pool_id.clone(),
                    timestamp: *ts,
                    price: sample.price,
                    source: sample.source,
                    confidence: 1.0,
                    run_id,
                })
                .collect();

            for (ts, price) in interpolate_gaps(&deduped, bucket_secs) {
                rows.push(ConsolidatedPrice {
                    pool_id: pool_id.clone(),
                    timestamp: ts,
                    price,
                    source: PriceSource::Interpolated,
                    confidence: self.config.interpolation_confidence,
                    run_id,
                });
            }

            self.integrate_backfilled_data(&pool_id, &mut rows, run_id).await?;

            rows.sort_by_key(|r| r.timestamp);
            self.store.replace_consolidated(&pool_id, rows).await?;
            self.update_canonical_layer(&pool_id, lookback).await?;
        }

        self.enforce_retention(now).await
    }

    /// Backfill from a provider price-history API (§4.3): only fills
    /// positions with no existing agent-sourced data, confidence 0.90.
    ///
    /// The reference implementation (`integrate_backfilled_data` in
    /// `pricing_consolidation.py`) is itself a stub awaiting the
    /// provider client; this mirrors that state rather than inventing
    /// a provider integration the spec never described. A real client
    /// would be injected here behind the same trait shape as
    /// `gamma_http`'s reqwest wrapper.
    async fn integrate_backfilled_data(
        &self,
        _pool_id: &str,
        _rows: &mut [ConsolidatedPrice],
        _run_id: Uuid,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_canonical_layer(&self, pool_id: &str, since: DateTime<Utc>) -> anyhow::Result<()> {
        let consolidated = self.store.consolidated_in_window(pool_id, since).await?;
        let canonical: Vec<CanonicalPrice> = consolidated
            .into_iter()
            .filter(|r| matches!(r.source, PriceSource::Agent | PriceSource::ProviderApi))
            .map(|r| CanonicalPrice { pool_id: pool_id.to_string(), timestamp: r.timestamp, price: r.price, source: r.source, confidence: r.confidence })
            .collect();
        self.store.replace_canonical(pool_id, canonical).await?;
        Ok(())
    }

    async fn enforce_retention(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.store
            .enforce_retention(
                now - ChronoDuration::seconds(self.config.raw_retention.as_secs() as i64),
                now - ChronoDuration::seconds(self.config.consolidated_retention.as_secs() as i64),
                now - ChronoDuration::seconds(self.config.canonical_retention.as_secs() as i64),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sample(pool: &str, minute: i64, price: f64, role: PriceSampleRole) -> PriceSample {
        PriceSample {
            id: Uuid::new_v4(),
            pool_id: pool.to_string(),
            price,
            captured_at: Utc::now() - ChronoDuration::hours(1) + ChronoDuration::minutes(minute),
            source: PriceSource::Agent,
            role,
            agent_id: None,
        }
    }

    #[tokio::test]
    async fn dedup_prefers_primary_role() {
        let store = Arc::new(MemoryStore::new());
        let t = Utc::now();
        store
            .insert_raw_prices(vec![
                PriceSample { captured_at: t, ..sample("p", 0, 0.05, PriceSampleRole::Replica) },
                PriceSample { captured_at: t, ..sample("p", 0, 0.04, PriceSampleRole::Primary) },
            ])
            .await
            .unwrap();
        let pipeline = PricingPipeline::new(store.clone(), PricingConfig::default());
        pipeline.run().await.unwrap();
        let canonical = store.canonical_latest("p").await.unwrap().unwrap();
        assert_eq!(canonical.price, 0.04);
    }

    #[tokio::test]
    async fn consolidation_is_idempotent_across_runs() {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw_prices(vec![sample("p", 0, 0.04, PriceSampleRole::Primary), sample("p", 5, 0.042, PriceSampleRole::Primary)]).await.unwrap();
        let pipeline = PricingPipeline::new(store.clone(), PricingConfig::default());
        pipeline.run().await.unwrap();
        let first = store.consolidated_in_window("p", Utc::now() - ChronoDuration::hours(2)).await.unwrap();
        pipeline.run().await.unwrap();
        let second = store.consolidated_in_window("p", Utc::now() - ChronoDuration::hours(2)).await.unwrap();
        assert_eq!(first.len(), second.len());
    }
}
