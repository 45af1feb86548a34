// Copyright 2025 Saturn Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::snapshot::{InvocationSnapshot, MethodMetrics, Outcome, ProviderMetrics};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

const NUM_HISTOGRAM_BINS: usize = 100;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Logarithmic latency histogram.
///
/// Each decade of microseconds is split into ten bins by leading digit, so
/// bin `d * 10 + k` covers `[k * 10^d, (k + 1) * 10^d)`. Ten decades reach
/// past 10^9us; anything larger lands in the last bin.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::latency_to_bin(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_to_bin(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10();
        let leading = latency_us / 10u64.pow(decade);
        (decade as usize * 10 + leading as usize).min(NUM_HISTOGRAM_BINS - 1)
    }

    /// Lower bound of a bin.
    fn bin_to_latency(bin: usize) -> u64 {
        let decade = (bin / 10) as u32;
        let leading = (bin % 10).max(1) as u64;
        10u64.saturating_pow(decade).saturating_mul(leading)
    }

    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile).div_ceil(100)).max(1);
        let mut cumulative = 0;

        for (idx, bin) in self.bins.iter().enumerate() {
            let count = bin.load(Ordering::Relaxed);
            if count > 0 && cumulative + count >= target {
                let start = Self::bin_to_latency(idx);
                let end = Self::bin_to_latency(idx + 1).max(start + 1);
                let fraction = (target - cumulative) as f64 / count as f64;
                return start + (fraction * (end - start) as f64) as u64;
            }
            cumulative += count;
        }

        Self::bin_to_latency(NUM_HISTOGRAM_BINS)
    }

    /// `(avg, p50, p95, p99)` in microseconds.
    fn calculate_percentiles(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }
        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (
            avg,
            self.estimate_percentile(50),
            self.estimate_percentile(95),
            self.estimate_percentile(99),
        )
    }
}

#[derive(Debug)]
struct MethodStats {
    call_count: AtomicU64,
    success_count: AtomicU64,
    biz_error_count: AtomicU64,
    timeout_count: AtomicU64,
    failure_count: AtomicU64,
    latencies: LatencyHistogram,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            biz_error_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
        }
    }

    fn record(&self, latency_us: u64, outcome: Outcome) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Success => &self.success_count,
            Outcome::BizError => &self.biz_error_count,
            Outcome::Timeout => &self.timeout_count,
            Outcome::Failure => &self.failure_count,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.latencies.record(latency_us);
    }

    fn snapshot(&self) -> MethodMetrics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.calculate_percentiles();

        MethodMetrics {
            call_count: self.call_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            biz_error_count: self.biz_error_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

#[derive(Debug)]
struct ProviderStats {
    request_count: AtomicU64,
    last_request_ms: AtomicU64,
}

impl ProviderStats {
    fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            last_request_ms: AtomicU64::new(0),
        }
    }

    fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.last_request_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn snapshot(&self, address: &str) -> ProviderMetrics {
        ProviderMetrics {
            address: address.to_string(),
            request_count: self.request_count.load(Ordering::Relaxed),
            last_request_ms: self.last_request_ms.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe invocation metrics for one consumer runtime.
///
/// Counters are lock-free atomics with relaxed ordering; snapshots are
/// eventually consistent. The per-method and per-provider maps take a
/// `RwLock` only to insert new entries.
///
/// # Example
///
/// ```rust
/// use saturn_metrics::{InvocationMetrics, Outcome};
///
/// let metrics = InvocationMetrics::new();
/// metrics.record_invocation("EchoService.echo", 150, Outcome::Success);
///
/// let snapshot = metrics.snapshot();
/// assert_eq!(snapshot.total_invocations, 1);
/// ```
#[derive(Debug)]
pub struct InvocationMetrics {
    total_invocations: AtomicU64,
    successful_invocations: AtomicU64,
    failed_invocations: AtomicU64,
    timeouts: AtomicU64,
    biz_errors: AtomicU64,
    retries: AtomicU64,
    methods: RwLock<HashMap<String, Arc<MethodStats>>>,
    providers: RwLock<HashMap<String, Arc<ProviderStats>>>,
    start_time: Instant,
}

impl InvocationMetrics {
    pub fn new() -> Self {
        Self {
            total_invocations: AtomicU64::new(0),
            successful_invocations: AtomicU64::new(0),
            failed_invocations: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            biz_errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            methods: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Records a finished invocation.
    ///
    /// # Arguments
    /// * `method` - Qualified method name, e.g. `EchoService.echo`
    /// * `latency_us` - Time from dispatch to completion in microseconds
    /// * `outcome` - How the invocation ended
    pub fn record_invocation(&self, method: &str, latency_us: u64, outcome: Outcome) {
        self.total_invocations.fetch_add(1, Ordering::Relaxed);
        if outcome.is_success() {
            self.successful_invocations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_invocations.fetch_add(1, Ordering::Relaxed);
        }
        match outcome {
            Outcome::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::BizError => {
                self.biz_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let stats = self.method_stats(method);
        stats.record(latency_us, outcome);
    }

    /// Records one request written to a provider.
    pub fn record_provider_request(&self, address: &str) {
        let existing = self.providers.read().get(address).cloned();
        let stats = match existing {
            Some(stats) => stats,
            None => self
                .providers
                .write()
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(ProviderStats::new()))
                .clone(),
        };
        stats.record_request();
    }

    /// Records a fail-over retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_invocations(&self) -> u64 {
        self.total_invocations.load(Ordering::Relaxed)
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> InvocationSnapshot {
        let methods = self
            .methods
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        let providers = self
            .providers
            .read()
            .iter()
            .map(|(addr, stats)| (addr.clone(), stats.snapshot(addr)))
            .collect();

        InvocationSnapshot {
            total_invocations: self.total_invocations.load(Ordering::Relaxed),
            successful_invocations: self.successful_invocations.load(Ordering::Relaxed),
            failed_invocations: self.failed_invocations.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            biz_errors: self.biz_errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            methods,
            providers,
        }
    }

    fn method_stats(&self, method: &str) -> Arc<MethodStats> {
        if let Some(stats) = self.methods.read().get(method) {
            return stats.clone();
        }
        self.methods
            .write()
            .entry(method.to_string())
            .or_insert_with(|| Arc::new(MethodStats::new()))
            .clone()
    }
}

impl Default for InvocationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
