//! Saturn consumer runtime.
//!
//! Calls a remote service across many provider instances:
//!
//! - [`ChannelGroup`]: live connections to one provider address
//! - [`DirectoryGroupTable`]: which groups serve which service directory
//! - [`LoadBalancer`]: weighted round robin and weighted random selection
//! - [`FutureRegistry`]: request/response correlation and timeout scanning
//! - [`ClusterInvoker`]: fail-fast, fail-over and fail-safe strategies
//! - [`ConnectionWatchdog`]: reconnection with exponential backoff
//! - [`ServiceClient`]: the consumer-facing call surface
//!
//! Everything hangs off one [`ClientRuntime`].

pub mod channel;
pub mod client;
pub mod cluster;
pub mod config;
pub mod connector;
pub mod directory;
pub mod dispatcher;
pub mod executor;
pub mod future;
pub mod group;
pub mod load_balancer;
pub mod runtime;
pub mod tcp;
pub mod watchdog;

pub use channel::{Channel, ChannelFactory, WriteListener};
pub use client::{ServiceClient, ServiceClientBuilder};
pub use cluster::{cluster_invoker, ClusterInvoker, FailFastInvoker, FailOverInvoker, FailSafeInvoker};
pub use config::{ClusterStrategy, ConsumerConfig, DispatchMode, LoadBalancerKind, RuntimeConfig};
pub use connector::Connector;
pub use directory::{CopyOnWriteGroupList, DirectoryGroupTable};
pub use dispatcher::{BroadcastDispatcher, DispatchContext, Dispatcher, Invocation, RoundDispatcher};
pub use executor::{CallbackExecutor, TokioExecutor, WorkerPoolExecutor};
pub use future::{FutureRegistry, InvokeFuture};
pub use group::ChannelGroup;
pub use load_balancer::{load_balancer, LoadBalancer, RandomLoadBalancer, RoundRobinLoadBalancer};
pub use runtime::ClientRuntime;
pub use tcp::{TcpChannel, TcpChannelFactory, TcpOptions};
pub use watchdog::ConnectionWatchdog;
