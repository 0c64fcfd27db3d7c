use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowshape::{CheckContext, ControlBehavior, FlowControlLayer, FlowRuleManager, Rule};

use futures::future::Ready;
use std::sync::Arc;
use tower::{Service, ServiceBuilder};

// Returns its input; isolates the middleware's own cost.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

fn rules(resources: usize) -> Vec<Rule> {
    (0..resources)
        .flat_map(|i| {
            let resource = format!("resource-{i}");
            [
                Rule { id: (i * 2 + 1) as u64, ..Rule::new(resource.clone(), f64::MAX) },
                Rule {
                    id: (i * 2 + 2) as u64,
                    control_behavior: ControlBehavior::Throttling,
                    ..Rule::new(resource, 1e9)
                },
            ]
        })
        .collect()
}

fn check_hot_resource(c: &mut Criterion) {
    let manager = FlowRuleManager::new();
    let _ = manager.load_rules(rules(1_000));
    let ctx = CheckContext::new(1);

    c.bench_function("check_two_rules_1k_resources", |b| {
        b.iter(|| black_box(manager.check(black_box("resource-500"), &ctx)));
    });
    c.bench_function("check_unknown_resource", |b| {
        b.iter(|| black_box(manager.check(black_box("missing"), &ctx)));
    });
}

fn reload_rules(c: &mut Criterion) {
    let manager = FlowRuleManager::new();
    let first = rules(100);
    let second: Vec<Rule> = first.iter().cloned().map(|r| Rule { count: r.count / 2.0, ..r }).collect();

    let mut flip = false;
    c.bench_function("load_rules_100_resources", |b| {
        b.iter(|| {
            flip = !flip;
            let next = if flip { first.clone() } else { second.clone() };
            black_box(manager.load_rules(next))
        });
    });
}

fn layer_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let manager = Arc::new(FlowRuleManager::new());
    let _ = manager.load_rules(vec![Rule { id: 1, ..Rule::new("echo", f64::MAX) }]);
    let svc = ServiceBuilder::new().layer(FlowControlLayer::new(manager, "echo")).service(EchoService);

    c.bench_function("flow_control_layer_pass", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

criterion_group!(benches, check_hot_resource, reload_rules, layer_throughput);
criterion_main!(benches);
