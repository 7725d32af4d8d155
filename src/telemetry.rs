//! Telemetry metric name constants.
//!
//! Centralised metric names for huginn operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `huginn_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `bucket`: cache bucket name (e.g. "api", "static")
//! - `strategy`: caching strategy applied to the request
//! - `tag`: sync queue tag (e.g. "evaluation-sync")
//! - `store`: local store name
//! - `status`: outcome: "ok" or "error"

/// Total cache hits served from a bucket.
///
/// Labels: `bucket`.
pub const CACHE_HITS_TOTAL: &str = "huginn_cache_hits_total";

/// Total cache misses for a bucket.
///
/// Labels: `bucket`.
pub const CACHE_MISSES_TOTAL: &str = "huginn_cache_misses_total";

/// Total entries evicted to respect a bucket's entry limit.
///
/// Labels: `bucket`.
pub const CACHE_EVICTIONS_TOTAL: &str = "huginn_cache_evictions_total";

/// Total requests served with a stale fallback or offline document.
///
/// Labels: `bucket`.
pub const CACHE_FALLBACKS_TOTAL: &str = "huginn_cache_fallbacks_total";

/// Request handling duration in seconds.
///
/// Labels: `bucket`, `strategy`.
pub const REQUEST_DURATION_SECONDS: &str = "huginn_request_duration_seconds";

/// Total items appended to the durable sync queue.
///
/// Labels: `tag`.
pub const SYNC_QUEUE_ENQUEUED_TOTAL: &str = "huginn_sync_queue_enqueued_total";

/// Total queued items replayed.
///
/// Labels: `tag`, `status` ("ok" | "error").
pub const SYNC_QUEUE_REPLAYED_TOTAL: &str = "huginn_sync_queue_replayed_total";

/// Total local-store sync passes.
///
/// Labels: `store`, `status` ("ok" | "error").
pub const STORE_SYNCS_TOTAL: &str = "huginn_store_syncs_total";

/// Total pushed store items.
///
/// Labels: `store`, `operation`, `status` ("ok" | "error").
pub const STORE_PUSHED_TOTAL: &str = "huginn_store_pushed_total";

/// Total conflicts detected while merging server changes.
///
/// Labels: `store`.
pub const STORE_CONFLICTS_TOTAL: &str = "huginn_store_conflicts_total";

/// Total retry attempts made by the retrying HTTP client.
///
/// Labels: `method`.
pub const RETRIES_TOTAL: &str = "huginn_retries_total";
