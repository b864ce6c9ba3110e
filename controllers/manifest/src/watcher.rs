//! Manifest watcher.
//!
//! Runs the reconciliation engine under `kube_runtime::Controller`, which
//! handles reconnection and guarantees one reconciliation per object at a
//! time. Engine outcomes are translated into requeue actions here.

use crate::backoff::{jitter, RateLimiter};
use crate::error::ControllerError;
use crds::Manifest;
use declarative::{LegacyReconciler, Outcome, Reconciler};
use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::{controller::{Action, Config as ControllerConfig}, watcher, Controller};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Spread applied to the requeue intervals of settled instances.
const REQUEUE_JITTER: f64 = 0.1;

/// Reconciliation path selected at startup.
pub enum Engine {
    /// Render, diff, prune and apply in one pass
    Declarative(Reconciler),
    /// Jobs per installation on the worker pool
    WorkerPool(LegacyReconciler),
}

impl Engine {
    async fn reconcile(&self, namespace: &str, name: &str) -> declarative::Result<Outcome> {
        match self {
            Engine::Declarative(reconciler) => reconciler.reconcile(namespace, name).await,
            Engine::WorkerPool(reconciler) => reconciler.reconcile(namespace, name).await,
        }
    }
}

/// Shared state of every reconciliation.
pub struct Context {
    engine: Engine,
    limiter: RateLimiter,
}

impl Context {
    /// Wraps `engine` with the default rate limiter.
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            limiter: RateLimiter::default(),
        }
    }
}

fn key_of(obj: &Manifest) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Maps an engine outcome to the controller action for `key`.
pub fn action_for(outcome: Outcome, key: &str, limiter: &RateLimiter) -> Action {
    match outcome {
        Outcome::Requeue => Action::requeue(limiter.when(key)),
        Outcome::RequeueAfter(interval) => {
            limiter.forget(key);
            Action::requeue(jitter(interval, REQUEUE_JITTER))
        }
        Outcome::Done => {
            limiter.forget(key);
            Action::await_change()
        }
    }
}

/// Watches Manifests through `api` until the stream ends.
pub async fn watch_manifests(
    api: Api<Manifest>,
    ctx: Arc<Context>,
    concurrency: u16,
) -> Result<(), ControllerError> {
    info!("Starting Manifest watcher (concurrency {})", concurrency);

    let error_policy = |obj: Arc<Manifest>, error: &ControllerError, ctx: Arc<Context>| {
        let key = key_of(&obj);
        let delay = ctx.limiter.when(&key);
        warn!("Reconciliation of {} failed, retrying in {:?}: {}", key, delay, error);
        Action::requeue(delay)
    };

    let reconcile = |obj: Arc<Manifest>, ctx: Arc<Context>| async move {
        let key = key_of(&obj);
        debug!("Reconciling Manifest {}", key);
        let outcome = ctx
            .engine
            .reconcile(&obj.namespace().unwrap_or_default(), &obj.name_any())
            .await?;
        debug!("Manifest {} reconciled: {:?}", key, outcome);
        Ok::<_, ControllerError>(action_for(outcome, &key, &ctx.limiter))
    };

    // Debounce batches the bursts of status writes each pass produces
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(concurrency);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {}/{}", obj.namespace.as_deref().unwrap_or_default(), obj.name),
                Err(e) => error!("Controller error for Manifest: {}", e),
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_backs_off_per_key() {
        let limiter = RateLimiter::default();

        assert_eq!(action_for(Outcome::Requeue, "a", &limiter), Action::requeue(Duration::from_secs(1)));
        assert_eq!(action_for(Outcome::Requeue, "a", &limiter), Action::requeue(Duration::from_secs(2)));
        assert_eq!(action_for(Outcome::Requeue, "b", &limiter), Action::requeue(Duration::from_secs(1)));
    }

    #[test]
    fn test_settled_outcomes_reset_backoff() {
        let limiter = RateLimiter::default();
        action_for(Outcome::Requeue, "a", &limiter);
        action_for(Outcome::Requeue, "a", &limiter);

        action_for(Outcome::RequeueAfter(Duration::from_secs(30)), "a", &limiter);
        assert_eq!(limiter.retries("a"), 0);

        action_for(Outcome::Requeue, "a", &limiter);
        assert_eq!(action_for(Outcome::Done, "a", &limiter), Action::await_change());
        assert_eq!(limiter.retries("a"), 0);
    }
}
