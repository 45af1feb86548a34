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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a single invocation ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// The provider ran the method and reported an application error.
    BizError,
    Timeout,
    Failure,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Metrics for a specific service method
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodMetrics {
    pub call_count: u64,
    pub success_count: u64,
    pub biz_error_count: u64,
    pub timeout_count: u64,
    pub failure_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Request distribution for one provider address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetrics {
    pub address: String,
    pub request_count: u64,
    pub last_request_ms: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationSnapshot {
    pub total_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    pub timeouts: u64,
    pub biz_errors: u64,
    pub retries: u64,
    pub uptime_ms: u64,
    pub methods: HashMap<String, MethodMetrics>,
    pub providers: HashMap<String, ProviderMetrics>,
}
