//! Common test utilities and setup

#![allow(dead_code)]

use serde_json::{Map, Value};
use std::sync::Arc;
use stepflow::testing::{CountingWorker, FailingWorker};
use stepflow::{EchoWorker, ExecutionLayer, Services, WorkflowEngine};

/// Workers registered by [`setup_engine`]
pub struct Workers {
    pub counter: Arc<CountingWorker>,
}

/// Engine whose layer has `echo`, `count` and `bad` targets
pub fn setup_engine() -> (WorkflowEngine, Workers) {
    let layer = ExecutionLayer::default();
    let counter = Arc::new(CountingWorker::new());
    layer.register_worker("echo", Arc::new(EchoWorker));
    layer.register_worker("count", counter.clone());
    layer.register_worker("bad", Arc::new(FailingWorker::new("target always fails")));

    let engine = WorkflowEngine::new(Arc::new(Services::new(Arc::new(layer))));
    (engine, Workers { counter })
}

pub fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
