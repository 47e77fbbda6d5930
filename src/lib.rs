//! corral keeps load-balancer upstream pools in step with deployments.
//!
//! corral manages the lifecycle of "upstream" objects on a gateway
//! control plane: it resolves a logical pool key to exactly one remote
//! upstream (created at most once, even under concurrent callers),
//! registers each deployment's backend targets against it, and retires
//! superseded targets in the background once the new deployment is
//! confirmed healthy.
//!
//! It uses the following terminology:
//! * Upstreams are named pools of backend instances fronted by a gateway.
//! * Targets are the instances themselves, registered against an
//!   upstream.
//! * Generations partition targets by the deployment that created them.
//!   A rollout onboards a new generation; eviction retires the previous
//!   one without breaking in-flight traffic.
//!
//! # Usage
//!
//! * The main interface for this crate is [manager::Manager].
//! * To construct a manager, you must supply a [gateway::GatewayClient]
//!   and a [store::Store]. These are interfaces which specify "how to
//!   talk to the load-balancer control plane" and "where pool membership
//!   is durably recorded", respectively.
//!
//! # DTrace probes
//!
//! corral contains a number of DTrace USDT probes, which fire as the
//! manager rolls pools forward. The full list of probes is:
//!
//! - `onboard-start`: Fires when an onboarding call begins.
//! - `onboard-done`: Fires when an onboarding call succeeds.
//! - `onboard-failed`: Fires when an onboarding call fails, with a string
//!   identifying the reason.
//! - `evict-tick-start`: Fires at the start of one eviction tick.
//! - `evict-tick-done`: Fires when an eviction tick completes, with its
//!   outcome ("done" or "deferred").
//! - `target-deleted`: Fires after a target is deleted from the gateway
//!   and the store.
//! - `target-delete-skipped`: Fires when a delete is skipped because the
//!   target is still used by the current deployment.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly
//! enabled, by tracing the program with the `dtrace(1)` command-line
//! tool.
//!
//! On most systems, the USDT probes must be registered with the DTrace
//! kernel module, a technically fallible process. To account for this,
//! the [manager::Manager::new] constructor is fallible, returning an
//! `Err` that still grants access to the manager itself. (This is
//! similar to `std::sync::PoisonError`.)

// Public API
pub mod gateway;
pub mod manager;
pub mod policy;
pub mod store;
pub mod upstream;

// Necessary for implementation
mod eviction;
mod onboarder;
mod registry;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod stores;

/// USDT probes for tracing how corral rolls pools forward.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "corral")]
mod probes {
    /// Fires when an onboarding call begins.
    fn onboard__start(upstream: &str, deployment: u64) {}

    /// Fires when an onboarding call succeeds.
    fn onboard__done(upstream: &str, deployment: u64) {}

    /// Fires when an onboarding call fails, with a string identifying
    /// the reason.
    fn onboard__failed(upstream: &str, deployment: u64, reason: &str) {}

    /// Fires at the start of one eviction tick.
    fn evict__tick__start(upstream: u64, deployment: u64) {}

    /// Fires when an eviction tick completes, with its outcome.
    fn evict__tick__done(outcome: &str) {}

    /// Fires after a target is deleted from the gateway and the store.
    fn target__deleted(upstream: &str, target: &str) {}

    /// Fires when a delete is skipped because the target is still used
    /// by the current deployment.
    fn target__delete__skipped(upstream: &str, target: &str) {}
}
