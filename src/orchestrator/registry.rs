//! Static `task_type → job function` registry (spec.md §9 REDESIGN
//! FLAGS: replaces dynamic string dispatch through a task-class lookup
//! table with a compile-time-checked map of function pointers).

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::orchestrator::jobs::{self, JobFn};

static REGISTRY: Lazy<HashMap<&'static str, JobFn>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, JobFn> = HashMap::new();
    m.insert("ohlcv_historical_backfill", jobs::historical_backfill as JobFn);
    m.insert("ohlcv_daily_eod", jobs::daily_eod as JobFn);
    m.insert("weekly_aggregation", jobs::weekly_aggregation as JobFn);
    m.insert("catalog_import", jobs::catalog_import as JobFn);
    m.insert("sector_enrichment", jobs::sector_enrichment as JobFn);
    m
});

/// Looks up the job function registered for `task_type`, if any.
pub fn lookup(task_type: &str) -> Option<JobFn> {
    REGISTRY.get(task_type).copied()
}

/// Every registered `task_type`, for submission-time validation and
/// `ingestctl`'s `--help` output.
pub fn registered_task_types() -> Vec<&'static str> {
    REGISTRY.keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_job_is_registered() {
        let types = registered_task_types();
        assert_eq!(types.len(), 5);
        assert!(lookup("ohlcv_historical_backfill").is_some());
        assert!(lookup("ohlcv_daily_eod").is_some());
        assert!(lookup("weekly_aggregation").is_some());
        assert!(lookup("catalog_import").is_some());
        assert!(lookup("sector_enrichment").is_some());
        assert!(lookup("not_a_real_task_type").is_none());
    }
}
