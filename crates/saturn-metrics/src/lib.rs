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

//! Saturn Invocation Metrics
//!
//! Thread-safe counters and latency percentiles for consumer-side invocations.
//!
//! - [`InvocationMetrics`]: lock-free counters, per-method stats and
//!   per-provider request distribution
//! - [`InvocationSnapshot`]: serializable point-in-time view
//!
//! One `InvocationMetrics` is owned by each client runtime and shared via `Arc`.

mod registry;
mod snapshot;

pub use registry::InvocationMetrics;
pub use snapshot::{InvocationSnapshot, MethodMetrics, Outcome, ProviderMetrics};
