use prometheus::{IntCounter, IntGauge, Registry};

/// Counters and gauges the manager updates eagerly alongside its own
/// bookkeeping. Counters are process-lifetime, mirroring the stats surface.
#[derive(Clone, Debug)]
pub struct BlockManagerMetrics {
    pub alloc_total: IntCounter,
    pub alloc_new: IntCounter,
    pub reused: IntCounter,
    pub offloaded: IntCounter,
    pub onboarded: IntCounter,
    pub free_primary: IntGauge,
    pub free_secondary: IntGauge,
    pub used: IntGauge,
}

impl BlockManagerMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.alloc_total.clone()))?;
        registry.register(Box::new(metrics.alloc_new.clone()))?;
        registry.register(Box::new(metrics.reused.clone()))?;
        registry.register(Box::new(metrics.offloaded.clone()))?;
        registry.register(Box::new(metrics.onboarded.clone()))?;
        registry.register(Box::new(metrics.free_primary.clone()))?;
        registry.register(Box::new(metrics.free_secondary.clone()))?;
        registry.register(Box::new(metrics.used.clone()))?;
        Ok(metrics)
    }

    /// Metrics not attached to any registry; used when the embedder does
    /// not scrape this manager.
    pub fn unregistered() -> prometheus::Result<Self> {
        Ok(Self {
            alloc_total: IntCounter::new(
                "kv_cache_alloc_total_blocks",
                "Lifetime block allocations, fresh and reused",
            )?,
            alloc_new: IntCounter::new(
                "kv_cache_alloc_new_blocks",
                "Lifetime block allocations that were fresh, not reused",
            )?,
            reused: IntCounter::new("kv_cache_reused_blocks", "Lifetime reuse hits")?,
            offloaded: IntCounter::new(
                "kv_cache_offloaded_blocks",
                "Blocks copied from primary to secondary memory",
            )?,
            onboarded: IntCounter::new(
                "kv_cache_onboarded_blocks",
                "Blocks copied from secondary back to primary memory",
            )?,
            free_primary: IntGauge::new(
                "kv_cache_free_primary_blocks",
                "Unreferenced blocks in the primary pool",
            )?,
            free_secondary: IntGauge::new(
                "kv_cache_free_secondary_blocks",
                "Unreferenced blocks in the secondary pool",
            )?,
            used: IntGauge::new("kv_cache_used_blocks", "Blocks held by live sequences")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_count() {
        let registry = Registry::new();
        let metrics = BlockManagerMetrics::new(&registry).unwrap();

        metrics.alloc_total.inc();
        metrics.alloc_total.inc();
        metrics.free_primary.set(7);

        assert_eq!(metrics.alloc_total.get(), 2);
        assert_eq!(metrics.free_primary.get(), 7);
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = Registry::new();
        let _metrics = BlockManagerMetrics::new(&registry).unwrap();
        assert!(BlockManagerMetrics::new(&registry).is_err());
    }
}
