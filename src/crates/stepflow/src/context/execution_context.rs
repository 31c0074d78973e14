//! Shared execution state for one workflow run

use super::expression::evaluate_bool;
use super::template::{lookup, resolve_str, resolve_value};
use crate::execution::ExecutionLayer;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Context data key for a step field: `step.<id>.<field>`
pub fn step_key(step_id: &str, field: &str) -> String {
    format!("step.{}.{}", step_id, field)
}

/// Collaborators reachable from a running step
///
/// The execution layer is always present. Anything else is registered by
/// name and fetched with [`Services::get_service`].
pub struct Services {
    execution: Arc<ExecutionLayer>,
    named: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    pub fn new(execution: Arc<ExecutionLayer>) -> Self {
        Self {
            execution,
            named: HashMap::new(),
        }
    }

    /// Register a named collaborator
    pub fn with_service<T: Any + Send + Sync>(
        mut self,
        name: impl Into<String>,
        service: Arc<T>,
    ) -> Self {
        self.named.insert(name.into(), service);
        self
    }

    pub fn execution(&self) -> &Arc<ExecutionLayer> {
        &self.execution
    }

    /// Look up a named collaborator of type `T`
    pub fn get_service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.named.get(name)?.clone().downcast::<T>().ok()
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new(Arc::new(ExecutionLayer::default()))
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.named.keys().collect();
        names.sort();
        f.debug_struct("Services")
            .field("execution", &self.execution)
            .field("named", &names)
            .finish()
    }
}

/// Key/value state shared by the steps of one execution
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    workflow_id: String,
    data: Map<String, Value>,
    services: Arc<Services>,
    // data as it was when this sub-context was split off
    base: Option<Arc<Map<String, Value>>>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, services: Arc<Services>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            data: Map::new(),
            services,
            base: None,
        }
    }

    /// Seed initial data
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn execution(&self) -> &Arc<ExecutionLayer> {
        self.services.execution()
    }

    pub fn get_service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services.get_service(name)
    }

    /// Value for `key` (exact flat key, then nested walk)
    pub fn get(&self, key: &str) -> Option<&Value> {
        lookup(&self.data, key)
    }

    /// Value for `key` or `default`
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).cloned().unwrap_or(default)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Write `step.<id>.<field>`
    pub fn set_step_value(&mut self, step_id: &str, field: &str, value: Value) {
        self.data.insert(step_key(step_id, field), value);
    }

    /// Insert every entry of `values`
    pub fn merge(&mut self, values: Map<String, Value>) {
        self.data.extend(values);
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Resolve `{{key}}` placeholders in a string
    pub fn resolve_template(&self, template: &str) -> String {
        resolve_str(template, &self.data)
    }

    /// Resolve placeholders in every string inside `value`
    pub fn resolve_value(&self, value: &Value) -> Value {
        resolve_value(value, &self.data)
    }

    /// Evaluate a condition against the current data
    ///
    /// Placeholders are resolved first. Any lex, parse or evaluation error
    /// yields `false` and is logged.
    pub fn evaluate_condition(&self, condition: &str) -> bool {
        let resolved = self.resolve_template(condition);
        match evaluate_bool(&resolved, &self.data) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    workflow_id = %self.workflow_id,
                    condition = %condition,
                    resolved = %resolved,
                    error = %e,
                    "Condition evaluation failed, treating as false"
                );
                false
            }
        }
    }

    /// Independent copy of this context for nested or concurrent execution
    ///
    /// Writes to the copy are invisible to this context until merged back
    /// with [`absorb`](Self::absorb).
    pub fn sub_context(&self) -> Self {
        Self {
            workflow_id: self.workflow_id.clone(),
            data: self.data.clone(),
            services: self.services.clone(),
            base: Some(Arc::new(self.data.clone())),
        }
    }

    /// Merge the keys a sub-context added or changed
    ///
    /// Keys are compared against the data the sub-context started from, so
    /// absorbing several siblings in a fixed order is deterministic: a later
    /// sibling only overrides keys it wrote itself. Removals are not merged.
    pub fn absorb(&mut self, child: ExecutionContext) {
        let base = child.base;
        for (key, value) in child.data {
            let changed = match base.as_deref() {
                Some(base) => base.get(&key) != Some(&value),
                None => self.data.get(&key) != Some(&value),
            };
            if changed {
                self.data.insert(key, value);
            }
        }
    }

    /// Data as a JSON object
    pub fn snapshot(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        ExecutionContext::new("wf-1", Arc::new(Services::default()))
    }

    #[test]
    fn test_get_set_and_defaults() {
        let mut ctx = context();
        ctx.set("name", json!("demo"));
        ctx.set_step_value("abc", "result", json!({"n": 1}));

        assert_eq!(ctx.get("name"), Some(&json!("demo")));
        assert_eq!(ctx.get("step.abc.result.n"), Some(&json!(1)));
        assert_eq!(ctx.get_or("missing", json!(0)), json!(0));
        assert!(ctx.contains("step.abc.result"));
        assert_eq!(ctx.remove("name"), Some(json!("demo")));
        assert!(ctx.get("name").is_none());
    }

    #[test]
    fn test_named_services() {
        #[derive(Debug, PartialEq)]
        struct Clock(u64);

        let services = Services::default().with_service("clock", Arc::new(Clock(42)));
        let ctx = ExecutionContext::new("wf", Arc::new(services));

        assert_eq!(ctx.get_service::<Clock>("clock").as_deref(), Some(&Clock(42)));
        assert!(ctx.get_service::<String>("clock").is_none());
        assert!(ctx.get_service::<Clock>("calendar").is_none());
    }

    #[test]
    fn test_evaluate_condition_resolves_templates_first() {
        let mut ctx = context();
        ctx.set("threshold", json!(3));
        ctx.set("count", json!(5));
        ctx.set("step.s1.result", json!("approved"));

        assert!(ctx.evaluate_condition("count > {{threshold}}"));
        assert!(ctx.evaluate_condition("'{{step.s1.result}}' == 'approved'"));
        assert!(!ctx.evaluate_condition("count > 10"));
    }

    #[test]
    fn test_evaluate_condition_errors_are_false() {
        let ctx = context();
        assert!(!ctx.evaluate_condition("undefined_name == 1"));
        assert!(!ctx.evaluate_condition("1 +"));
        assert!(!ctx.evaluate_condition("1 / 0"));
    }

    #[test]
    fn test_sub_context_is_independent() {
        let mut parent = context();
        parent.set("shared", json!({"list": [1]}));

        let mut child = parent.sub_context();
        child.set("shared", json!({"list": [1, 2]}));
        child.set("new", json!(true));

        assert_eq!(parent.get("shared"), Some(&json!({"list": [1]})));
        assert!(parent.get("new").is_none());

        parent.absorb(child);
        assert_eq!(parent.get("shared"), Some(&json!({"list": [1, 2]})));
        assert_eq!(parent.get("new"), Some(&json!(true)));
    }

    #[test]
    fn test_absorb_only_merges_keys_a_child_wrote() {
        let mut parent = context();
        parent.set("x", json!(1));

        let mut first = parent.sub_context();
        let second = parent.sub_context();
        first.set("x", json!(2));

        parent.absorb(first);
        // second never touched x, so it must not revert it
        parent.absorb(second);
        assert_eq!(parent.get("x"), Some(&json!(2)));
    }

    #[test]
    fn test_snapshot() {
        let mut ctx = context();
        ctx.set("a", json!(1));
        assert_eq!(ctx.snapshot(), json!({"a": 1}));
        assert_eq!(ctx.workflow_id(), "wf-1");
    }
}
