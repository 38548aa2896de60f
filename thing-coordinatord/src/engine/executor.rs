use std::collections::{BTreeMap, HashMap};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use shared::call::{CallOutcome, InputList, Literal, ServiceCall};
use shared::composition::{IoTApp, RelationshipInstance, RelationshipKind, ServiceInstance};
use shared::condition;
use shared::types::Param;
use super::console::RunConsole;
use super::transport::ServiceCaller;

/// One executed instance as reported at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutedCall {
    pub instance_id: String,
    pub display_name: String,
    pub success: bool,
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub app_id: String,
    pub app_name: String,
    /// In first-execution order
    pub executed: Vec<ExecutedCall>,
    pub cancelled: bool,
}

impl RunSummary {
    #[cfg(test)]
    pub fn get(&self, display_name: &str) -> Option<&ExecutedCall> {
        self.executed.iter().find(|c| c.display_name == display_name)
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .executed
            .iter()
            .map(|c| {
                let result = c
                    .result
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "none".to_string());
                format!("{}: success={} result={}", c.display_name, c.success, result)
            })
            .collect();
        if self.cancelled {
            lines.push("Run was cancelled".to_string());
        }
        lines
    }
}

/// The run was cancelled, either explicitly or because input closed
struct Halted;

/// Per-run state: the result map and the execution record
struct Run<'a> {
    caller: &'a dyn ServiceCaller,
    console: &'a mut dyn RunConsole,
    cancel: &'a CancellationToken,
    results: HashMap<String, CallOutcome>,
    executed: Vec<ExecutedCall>,
}

/// Execute an app once.
///
/// Edges are walked in stored order. A source instance is called at most
/// once per run; its result is reused by every later edge leaving it.
/// Transport failures become failed results and never stop the loop; only
/// cancellation does, and then the summary holds what already completed.
pub async fn run_app(
    app: &IoTApp,
    caller: &dyn ServiceCaller,
    console: &mut dyn RunConsole,
    cancel: &CancellationToken,
) -> RunSummary {
    tracing::info!("Running app {} ({})", app.name(), app.id());
    console.write_line(&format!("Running {}", app.name()));

    let mut run = Run {
        caller,
        console,
        cancel,
        results: HashMap::new(),
        executed: Vec::new(),
    };

    if app.relationship_instances().is_empty() {
        run.console.write_line("No relationships to execute");
    }

    let mut cancelled = false;
    for rel in app.relationship_instances() {
        if run.step(app, rel).await.is_err() {
            cancelled = true;
            break;
        }
    }

    if cancelled {
        tracing::info!("Run of {} cancelled after {} call(s)", app.id(), run.executed.len());
        run.console.write_line("Run cancelled");
    } else {
        run.console.write_line("Run finished");
    }

    RunSummary {
        app_id: app.id().to_string(),
        app_name: app.name().to_string(),
        executed: run.executed,
        cancelled,
    }
}

impl Run<'_> {
    async fn step(&mut self, app: &IoTApp, rel: &RelationshipInstance) -> Result<(), Halted> {
        let (Some(src), Some(dst)) = (app.service_instance(&rel.src), app.service_instance(&rel.dst)) else {
            tracing::warn!("Skipping relationship {}: endpoint not in app", rel.id);
            return Ok(());
        };

        let outcome = match self.results.get(&src.id) {
            Some(cached) => cached.clone(),
            None => self.execute(src, src.input_values.clone()).await?,
        };

        let proceed = match &rel.kind {
            RelationshipKind::Ordered => true,
            RelationshipKind::OnSuccess => outcome.success,
            RelationshipKind::Condition => {
                outcome.success
                    && match &rel.condition {
                        Some(expr) => condition::evaluate(outcome.value.as_ref().unwrap_or(&Value::Null), expr),
                        None => false,
                    }
            }
            RelationshipKind::Other(tag) => {
                tracing::warn!("Unknown relationship type {:?} on {}", tag, app.edge_label(rel));
                false
            }
        };

        if !proceed {
            self.console.write_line(&format!("Skipping {}", app.edge_label(rel)));
            return Ok(());
        }

        let values = self.propagate(src, &outcome, dst);
        self.execute(dst, values).await?;
        Ok(())
    }

    /// Substitute the source's result into inputs left empty or bound to
    /// the source's output name.
    fn propagate(
        &mut self,
        src: &ServiceInstance,
        outcome: &CallOutcome,
        dst: &ServiceInstance,
    ) -> BTreeMap<String, String> {
        let mut values = dst.input_values.clone();
        let Some(text) = outcome.value_text() else {
            return values;
        };
        let output_name = src.service.output().map(|p| p.name.as_str());

        for param in dst.service.input_params() {
            let bound = values.get(&param.name).map(|v| v.trim()).unwrap_or("");
            if bound.is_empty() || Some(bound) == output_name {
                self.console.write_line(&format!(
                    "Using {} from {} for {}.{}",
                    text,
                    src.display_name(),
                    dst.display_name(),
                    param.name
                ));
                values.insert(param.name.clone(), text.clone());
            }
        }
        values
    }

    async fn execute(
        &mut self,
        instance: &ServiceInstance,
        values: BTreeMap<String, String>,
    ) -> Result<CallOutcome, Halted> {
        let mut literals = Vec::with_capacity(instance.service.input_params().len());
        for param in instance.service.input_params() {
            let bound = values.get(&param.name).map(String::as_str).unwrap_or("");
            let literal = match Literal::encode(param.ty, bound) {
                Ok(literal) => literal,
                Err(e) => {
                    if !bound.trim().is_empty() {
                        self.console.write_line(&format!(
                            "Bound value for {}.{} rejected: {}",
                            instance.display_name(),
                            param.name,
                            e
                        ));
                    }
                    self.prompt(instance, param).await?
                }
            };
            literals.push(literal);
        }

        if self.cancel.is_cancelled() {
            return Err(Halted);
        }

        let call = ServiceCall::new(&instance.service, &InputList::new(literals));
        self.console.write_line(&format!(
            "Calling {} on {} with {}",
            instance.display_name(),
            instance.service.thing_id,
            call.service_inputs
        ));
        let outcome = self.caller.call(&instance.service, &call).await;

        let shown = outcome.value_text().unwrap_or_else(|| "none".to_string());
        if outcome.success {
            self.console.write_line(&format!("{} succeeded: {}", instance.display_name(), shown));
        } else {
            self.console.write_line(&format!("{} failed", instance.display_name()));
        }
        tracing::debug!("{} -> success={} result={}", instance.display_name(), outcome.success, shown);

        self.record(instance, &outcome);
        Ok(outcome)
    }

    fn record(&mut self, instance: &ServiceInstance, outcome: &CallOutcome) {
        self.results.insert(instance.id.clone(), outcome.clone());

        let entry = ExecutedCall {
            instance_id: instance.id.clone(),
            display_name: instance.display_name().to_string(),
            success: outcome.success,
            result: outcome.value.clone(),
        };
        match self.executed.iter_mut().find(|c| c.instance_id == instance.id) {
            Some(existing) => *existing = entry,
            None => self.executed.push(entry),
        }
    }

    /// Ask until a value of the declared type arrives
    async fn prompt(&mut self, instance: &ServiceInstance, param: &Param) -> Result<Literal, Halted> {
        let prompt = format!(
            "Value for {} of {} ({})",
            param.name,
            instance.display_name(),
            param.ty
        );
        loop {
            if self.cancel.is_cancelled() {
                return Err(Halted);
            }
            let answer = tokio::select! {
                answer = self.console.read_value(&prompt) => answer,
                _ = self.cancel.cancelled() => return Err(Halted),
            };
            let Some(answer) = answer else {
                tracing::info!("Input closed while waiting for {}", prompt);
                return Err(Halted);
            };
            match Literal::encode(param.ty, &answer) {
                Ok(literal) => return Ok(literal),
                Err(e) => self.console.write_line(&format!("Rejected {:?}: {}", answer, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use async_trait::async_trait;
    use shared::types::{Service, Signature};

    /// Replies per service name, recording every call it receives
    struct ScriptedCaller {
        replies: HashMap<String, CallOutcome>,
        calls: Mutex<Vec<(String, String)>>,
        cancel_after_first: Option<CancellationToken>,
    }

    impl ScriptedCaller {
        fn new(replies: &[(&str, CallOutcome)]) -> Self {
            Self {
                replies: replies.iter().map(|(n, o)| (n.to_string(), o.clone())).collect(),
                calls: Mutex::new(Vec::new()),
                cancel_after_first: None,
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServiceCaller for ScriptedCaller {
        async fn call(&self, service: &Service, call: &ServiceCall) -> CallOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((service.name.clone(), call.service_inputs.clone()));
            if let Some(cancel) = &self.cancel_after_first {
                cancel.cancel();
            }
            self.replies.get(&service.name).cloned().unwrap_or_else(CallOutcome::failed)
        }
    }

    #[derive(Default)]
    struct ScriptedConsole {
        answers: VecDeque<String>,
        prompts: Vec<String>,
        lines: Vec<String>,
    }

    #[async_trait]
    impl RunConsole for ScriptedConsole {
        fn write_line(&mut self, line: &str) {
            self.lines.push(line.to_string());
        }

        async fn read_value(&mut self, prompt: &str) -> Option<String> {
            self.prompts.push(prompt.to_string());
            self.answers.pop_front()
        }
    }

    fn service(name: &str, api: &str) -> Arc<Service> {
        Arc::new(Service {
            name: name.to_string(),
            thing_id: "MySmartThing01".into(),
            thing_name: "RaspberryPi".into(),
            entity_id: "E1".into(),
            space_id: "MySmartSpace".into(),
            signature: api.parse::<Signature>().unwrap(),
            kind: String::new(),
            app_category: String::new(),
            description: String::new(),
            keywords: String::new(),
            address: Some("192.168.8.201".parse().unwrap()),
        })
    }

    fn ok(value: Value) -> CallOutcome {
        CallOutcome { success: true, value: Some(value) }
    }

    /// A(temp:int) -> B(threshold:int)
    fn threshold_app(kind: RelationshipKind, cond: Option<&str>) -> IoTApp {
        let mut app = IoTApp::new("threshold");
        let a = ServiceInstance::new(service("A", r#"A:[NULL]:("temp",int,"NULL")"#));
        let b = ServiceInstance::new(service("B", r#"B:["threshold",int,"NULL"]:(NULL)"#));
        let rel = RelationshipInstance::new(&a, &b, kind, cond.map(String::from)).unwrap();
        app.add_service_instance(a).unwrap();
        app.add_service_instance(b).unwrap();
        app.add_relationship_instance(rel).unwrap();
        app
    }

    #[tokio::test]
    async fn test_condition_met_propagates_result() {
        let app = threshold_app(RelationshipKind::Condition, Some("> 25"));
        let caller = ScriptedCaller::new(&[("A", ok(Value::from(30))), ("B", ok(Value::from("done")))]);
        let mut console = ScriptedConsole::default();

        let summary = run_app(&app, &caller, &mut console, &CancellationToken::new()).await;

        assert_eq!(
            caller.calls(),
            vec![("A".to_string(), "()".to_string()), ("B".to_string(), "(30)".to_string())]
        );
        assert!(summary.get("A").unwrap().success);
        assert!(summary.get("B").unwrap().success);
        assert!(!summary.cancelled);
        assert!(console.prompts.is_empty());
    }

    #[tokio::test]
    async fn test_failed_source_blocks_condition() {
        let app = threshold_app(RelationshipKind::Condition, Some("> 25"));
        let caller = ScriptedCaller::new(&[("A", CallOutcome::failed()), ("B", ok(Value::from(1)))]);
        let mut console = ScriptedConsole::default();

        let summary = run_app(&app, &caller, &mut console, &CancellationToken::new()).await;

        assert_eq!(caller.calls().len(), 1);
        assert_eq!(summary.executed.len(), 1);
        assert!(!summary.get("A").unwrap().success);
        assert!(summary.get("B").is_none());
    }

    #[tokio::test]
    async fn test_condition_false_skips_destination() {
        let app = threshold_app(RelationshipKind::Condition, Some("> 25"));
        let caller = ScriptedCaller::new(&[("A", ok(Value::from(20)))]);
        let mut console = ScriptedConsole::default();

        let summary = run_app(&app, &caller, &mut console, &CancellationToken::new()).await;
        assert_eq!(caller.calls().len(), 1);
        assert_eq!(summary.executed.len(), 1);
    }

    #[tokio::test]
    async fn test_on_success_follows_source_status() {
        let app = threshold_app(RelationshipKind::OnSuccess, None);
        let caller = ScriptedCaller::new(&[("A", ok(Value::from(3))), ("B", ok(Value::Null))]);
        let mut console = ScriptedConsole::default();
        run_app(&app, &caller, &mut console, &CancellationToken::new()).await;
        assert_eq!(caller.calls().len(), 2);

        let caller = ScriptedCaller::new(&[("A", CallOutcome::failed())]);
        let mut console = ScriptedConsole::default();
        run_app(&app, &caller, &mut console, &CancellationToken::new()).await;
        assert_eq!(caller.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_shared_source_called_once() {
        let mut app = IoTApp::new("fan-out");
        let a = ServiceInstance::new(service("A", r#"A:[NULL]:("temp",int,"NULL")"#));
        let b = ServiceInstance::new(service("B", "B:[NULL]:(NULL)"));
        let c = ServiceInstance::new(service("C", "C:[NULL]:(NULL)"));
        let ab = RelationshipInstance::new(&a, &b, RelationshipKind::Ordered, None).unwrap();
        let ac = RelationshipInstance::new(&a, &c, RelationshipKind::Ordered, None).unwrap();
        for si in [a, b, c] {
            app.add_service_instance(si).unwrap();
        }
        app.add_relationship_instance(ab).unwrap();
        app.add_relationship_instance(ac).unwrap();

        let caller = ScriptedCaller::new(&[("A", ok(Value::from(1))), ("B", ok(Value::Null)), ("C", ok(Value::Null))]);
        let mut console = ScriptedConsole::default();
        let summary = run_app(&app, &caller, &mut console, &CancellationToken::new()).await;

        let names: Vec<String> = caller.calls().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        let order: Vec<&str> = summary.executed.iter().map(|c| c.display_name.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_cancel_after_first_call_stops_run() {
        let app = threshold_app(RelationshipKind::Ordered, None);
        let cancel = CancellationToken::new();
        let mut caller = ScriptedCaller::new(&[("A", ok(Value::from(30))), ("B", ok(Value::Null))]);
        caller.cancel_after_first = Some(cancel.clone());
        let mut console = ScriptedConsole::default();

        let summary = run_app(&app, &caller, &mut console, &cancel).await;

        assert_eq!(caller.calls().len(), 1);
        assert!(summary.cancelled);
        assert_eq!(summary.executed.len(), 1);
        assert_eq!(summary.executed[0].display_name, "A");
    }

    #[tokio::test]
    async fn test_unknown_relationship_type_skips_destination() {
        let app = threshold_app(RelationshipKind::Other("sometimes".into()), None);
        let caller = ScriptedCaller::new(&[("A", ok(Value::from(30))), ("B", ok(Value::Null))]);
        let mut console = ScriptedConsole::default();

        let summary = run_app(&app, &caller, &mut console, &CancellationToken::new()).await;
        assert_eq!(caller.calls().len(), 1);
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn test_missing_input_prompted_until_valid() {
        // A fails, so nothing propagates and B has to ask
        let app = threshold_app(RelationshipKind::Ordered, None);
        let caller = ScriptedCaller::new(&[("A", CallOutcome::failed()), ("B", ok(Value::Null))]);
        let mut console = ScriptedConsole {
            answers: VecDeque::from(vec!["".to_string(), "abc".to_string(), "12".to_string()]),
            ..Default::default()
        };

        let summary = run_app(&app, &caller, &mut console, &CancellationToken::new()).await;

        assert_eq!(console.prompts.len(), 3);
        assert_eq!(caller.calls()[1], ("B".to_string(), "(12)".to_string()));
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn test_closed_input_halts_run() {
        let app = threshold_app(RelationshipKind::Ordered, None);
        let caller = ScriptedCaller::new(&[("A", CallOutcome::failed())]);
        let mut console = ScriptedConsole::default();

        let summary = run_app(&app, &caller, &mut console, &CancellationToken::new()).await;

        assert!(summary.cancelled);
        assert_eq!(caller.calls().len(), 1);
        assert_eq!(summary.executed.len(), 1);
    }

    #[tokio::test]
    async fn test_placeholder_bound_to_output_name_is_replaced() {
        let mut app = IoTApp::new("placeholder");
        let a = ServiceInstance::new(service("A", r#"A:[NULL]:("temp",int,"NULL")"#));
        let mut b = ServiceInstance::new(service("B", r#"B:["threshold",int,"NULL"]:(NULL)"#));
        b.bind("threshold", "temp").unwrap();
        let rel = RelationshipInstance::new(&a, &b, RelationshipKind::Ordered, None).unwrap();
        app.add_service_instance(a).unwrap();
        app.add_service_instance(b).unwrap();
        app.add_relationship_instance(rel).unwrap();

        let caller = ScriptedCaller::new(&[("A", ok(Value::from(41))), ("B", ok(Value::Null))]);
        let mut console = ScriptedConsole::default();
        run_app(&app, &caller, &mut console, &CancellationToken::new()).await;

        assert_eq!(caller.calls()[1].1, "(41)");
    }

    #[tokio::test]
    async fn test_explicit_binding_is_kept() {
        let mut app = IoTApp::new("bound");
        let a = ServiceInstance::new(service("A", r#"A:[NULL]:("temp",int,"NULL")"#));
        let mut b = ServiceInstance::new(service("B", r#"B:["threshold",int,"NULL"]:(NULL)"#));
        b.bind("threshold", "7").unwrap();
        let rel = RelationshipInstance::new(&a, &b, RelationshipKind::Ordered, None).unwrap();
        app.add_service_instance(a).unwrap();
        app.add_service_instance(b).unwrap();
        app.add_relationship_instance(rel).unwrap();

        let caller = ScriptedCaller::new(&[("A", ok(Value::from(41))), ("B", ok(Value::Null))]);
        let mut console = ScriptedConsole::default();
        run_app(&app, &caller, &mut console, &CancellationToken::new()).await;

        assert_eq!(caller.calls()[1].1, "(7)");
    }
}
