//! Warnings emitted when rules or generators are refused.
use flowshape::{ControlBehavior, FlowRuleManager, Rule, TokenCalculateStrategy};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);
impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture<F: FnOnce()>(f: F) -> String {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
        .with_target(true)
        .with_ansi(false)
        .without_time()
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

#[test]
fn load_rules_warns_for_each_skipped_rule() {
    let manager = FlowRuleManager::new();
    let logs = capture(|| {
        let outcome = manager.load_rules(vec![
            Rule { id: 1, ..Rule::new("", 1.0) },
            Rule { id: 2, ..Rule::new("ok", 1.0) },
            Rule {
                id: 3,
                token_calculate_strategy: TokenCalculateStrategy::Custom(40),
                ..Rule::new("orphan", 1.0)
            },
        ]);
        assert_eq!(outcome.skipped.len(), 2);
    });

    assert_eq!(logs.matches("skipping flow rule").count(), 2, "logs: {logs}");
    assert!(logs.contains("flowshape::rules"));
    assert!(logs.contains("flow rules loaded"));
    assert_eq!(manager.get_rules().len(), 1);
}

#[test]
fn protected_generator_replacement_is_logged() {
    let manager = FlowRuleManager::new();
    let logs = capture(|| {
        let result = manager.set_traffic_shaping_generator(
            TokenCalculateStrategy::WarmUp,
            ControlBehavior::Throttling,
            |_| Err("never used".to_string()),
        );
        assert!(result.is_err());
    });

    assert!(logs.contains("refusing to replace built-in generator"), "logs: {logs}");
    assert!(logs.contains("flowshape::generators"));
}
