//! Tower middleware that enforces a resource's flow rules.
//!
//! The layer does not know how any controller meters traffic; it only asks the
//! [`FlowRuleManager`] for a [`Decision`] and acts on it:
//! - `Pass`: call the inner service.
//! - `Wait(d)`: sleep for `d`, then call the inner service.
//! - `Blocked`: fail with [`ShapingError::Blocked`] without calling it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;
use tracing::trace;

use crate::error::ShapingError;
use crate::manager::FlowRuleManager;
use crate::shaping::{CheckContext, Decision};

/// Applies the rules of one resource to every request of the wrapped service.
#[derive(Clone, Debug)]
pub struct FlowControlLayer {
    manager: Arc<FlowRuleManager>,
    resource: Arc<str>,
    in_flight: Arc<AtomicU32>,
}

impl FlowControlLayer {
    /// Create a layer guarding `resource`.
    ///
    /// Services produced by one layer share an in-flight counter, which feeds
    /// concurrency rules.
    pub fn new(manager: Arc<FlowRuleManager>, resource: impl Into<String>) -> Self {
        Self {
            manager,
            resource: Arc::from(resource.into()),
            in_flight: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl<S> Layer<S> for FlowControlLayer {
    type Service = FlowControlService<S>;

    fn layer(&self, service: S) -> Self::Service {
        FlowControlService {
            inner: service,
            manager: self.manager.clone(),
            resource: self.resource.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

/// Middleware service produced by [`FlowControlLayer`].
#[derive(Clone, Debug)]
pub struct FlowControlService<S> {
    inner: S,
    manager: Arc<FlowRuleManager>,
    resource: Arc<str>,
    in_flight: Arc<AtomicU32>,
}

impl<S> FlowControlService<S> {
    /// Requests currently admitted and not yet finished.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }
}

struct InFlight(Arc<AtomicU32>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<S, Req> Service<Req> for FlowControlService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ShapingError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ShapingError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let ctx = CheckContext::new(1).with_concurrency(self.in_flight.load(Ordering::Acquire));
        let decision = self.manager.check(&self.resource, &ctx);

        if let Decision::Blocked(reason) = decision {
            trace!(target: "flowshape::layer", resource = %self.resource, %reason, "request blocked");
            let resource = self.resource.to_string();
            return Box::pin(async move {
                Err::<S::Response, _>(ShapingError::Blocked { resource, reason })
            });
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlight(self.in_flight.clone());
        // The clone may not be ready; keep the readied one for this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let _guard = guard;
            if let Decision::Wait(wait) = decision {
                tokio::time::sleep(wait).await;
            }
            inner.call(req).await.map_err(ShapingError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{MetricType, Rule};
    use std::convert::Infallible;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct Echo;

    impl Service<u32> for Echo {
        type Response = u32;
        type Error = Infallible;
        type Future = futures::future::Ready<Result<u32, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: u32) -> Self::Future {
            futures::future::ready(Ok(req))
        }
    }

    #[tokio::test]
    async fn passes_without_rules() {
        let manager = Arc::new(FlowRuleManager::new());
        let svc = FlowControlLayer::new(manager, "echo").layer(Echo);
        assert_eq!(svc.oneshot(7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn blocks_when_concurrency_rule_is_zero() {
        let manager = Arc::new(FlowRuleManager::new());
        let _ = manager.load_rules(vec![Rule {
            metric_type: MetricType::Concurrency,
            ..Rule::new("echo", 0.0)
        }]);
        let svc = FlowControlLayer::new(manager, "echo").layer(Echo);
        let probe = svc.clone();
        let err = svc.oneshot(1).await.unwrap_err();
        assert!(err.is_blocked());
        // Blocked requests never bump the counter.
        assert_eq!(probe.in_flight(), 0);
    }
}
