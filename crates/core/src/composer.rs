use crate::dispatch::{Dispatcher, HttpDispatcher};
use crate::error::{ComposeError, ComposeResult};
use crate::graph::ServiceGraph;
use crate::types::{NodeId, Payload, RunId, ServiceDescriptor};
use std::collections::HashMap;

/// Composes registered services into a pipeline and runs it.
///
/// A run walks the graph in topological order. Source nodes receive the
/// initial input; every other node receives the shallow union of its direct
/// predecessors' outputs. Predecessors are merged in registration order, so
/// when two of them produce the same key the later-registered one wins.
///
/// Each node is dispatched only after the previous one has answered. The
/// first dispatch failure aborts the run and the result cache keeps only the
/// outputs of the nodes that completed before it.
#[derive(Debug)]
pub struct ServiceComposer<D = HttpDispatcher> {
    graph: ServiceGraph,
    registry: HashMap<NodeId, ServiceDescriptor>,
    results: HashMap<NodeId, Payload>,
    dispatcher: D,
}

impl ServiceComposer<HttpDispatcher> {
    pub fn new() -> Self {
        Self::with_dispatcher(HttpDispatcher::default())
    }
}

impl Default for ServiceComposer<HttpDispatcher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dispatcher> ServiceComposer<D> {
    pub fn with_dispatcher(dispatcher: D) -> Self {
        Self {
            graph: ServiceGraph::new(),
            registry: HashMap::new(),
            results: HashMap::new(),
            dispatcher,
        }
    }

    /// Register a service as a new graph node
    pub fn register(&mut self, service: ServiceDescriptor) -> ComposeResult<()> {
        if self.registry.contains_key(&service.id) {
            return Err(ComposeError::DuplicateService(service.id));
        }

        tracing::debug!("Registering service {} at {}", service.id, service.endpoint);
        self.graph.add_node(service.id.clone());
        self.registry.insert(service.id.clone(), service);

        Ok(())
    }

    /// Connect the output of `from` to the input of `to`.
    ///
    /// Returns `false` and leaves the graph untouched when either id is not
    /// registered, so callers can decide whether that is fatal.
    pub fn connect(&mut self, from: &NodeId, to: &NodeId) -> bool {
        match self.graph.add_edge(from, to) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to connect {} -> {}: {}", from, to, e);
                false
            }
        }
    }

    /// Run the pipeline once with `initial_input` fed to every source node.
    pub async fn schedule(&mut self, initial_input: Payload) -> ComposeResult<()> {
        let run_id = RunId::new();
        let started_at = chrono::Utc::now();

        self.results.clear();
        let order = self.graph.topological_sort()?;

        tracing::info!("Starting pipeline run: run_id={}, nodes={}", run_id, order.len());

        for node in order {
            let input = if self.graph.is_source(&node)? {
                initial_input.clone()
            } else {
                self.merge_predecessor_outputs(&node)?
            };

            let service = self
                .registry
                .get(&node)
                .ok_or_else(|| ComposeError::UnregisteredService(node.clone()))?;

            tracing::info!("Dispatching node {} to {}", node, service.endpoint);

            let output = match self.dispatcher.dispatch(service, &input).await {
                Ok(output) => output,
                Err(source) => {
                    tracing::error!(
                        "Pipeline run failed: run_id={}, node={}, error={}",
                        run_id,
                        node,
                        source
                    );
                    return Err(ComposeError::Dispatch { node, source });
                }
            };

            self.results.insert(node, output);
        }

        let elapsed = chrono::Utc::now() - started_at;
        tracing::info!(
            "Pipeline run completed: run_id={}, duration_ms={}",
            run_id,
            elapsed.num_milliseconds()
        );

        Ok(())
    }

    /// Outputs of all sink nodes from the last run
    pub fn collect_final_outputs(&self) -> HashMap<NodeId, Payload> {
        self.graph
            .sinks()
            .into_iter()
            .filter_map(|sink| {
                let output = self.results.get(&sink)?.clone();
                Some((sink, output))
            })
            .collect()
    }

    /// Every output cached by the last run
    pub fn results(&self) -> &HashMap<NodeId, Payload> {
        &self.results
    }

    pub fn output(&self, id: &NodeId) -> Option<&Payload> {
        self.results.get(id)
    }

    pub fn descriptor(&self, id: &NodeId) -> Option<&ServiceDescriptor> {
        self.registry.get(id)
    }

    pub fn graph(&self) -> &ServiceGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    fn merge_predecessor_outputs(&self, node: &NodeId) -> ComposeResult<Payload> {
        let mut merged = Payload::new();

        for pred in self.graph.predecessors(node)? {
            if let Some(output) = self.results.get(&pred) {
                for (key, value) in output {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DispatchError, GraphError};
    use crate::types::Endpoint;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Answers with a canned output per node and records every call.
    #[derive(Debug, Default, Clone)]
    struct ScriptedDispatcher {
        outputs: HashMap<NodeId, Payload>,
        failing: HashSet<NodeId>,
        calls: Arc<Mutex<Vec<(NodeId, Payload)>>>,
    }

    impl ScriptedDispatcher {
        fn respond(mut self, node: &str, output: serde_json::Value) -> Self {
            self.outputs.insert(NodeId::new(node), payload(output));
            self
        }

        fn fail_on(mut self, node: &str) -> Self {
            self.failing.insert(NodeId::new(node));
            self
        }

        fn visited(&self) -> Vec<NodeId> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(node, _)| node.clone())
                .collect()
        }

        fn input_of(&self, node: &str) -> Payload {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n.as_str() == node)
                .map(|(_, input)| input.clone())
                .unwrap()
        }
    }

    #[async_trait]
    impl Dispatcher for ScriptedDispatcher {
        async fn dispatch(
            &self,
            service: &ServiceDescriptor,
            input: &Payload,
        ) -> Result<Payload, DispatchError> {
            self.calls
                .lock()
                .unwrap()
                .push((service.id.clone(), input.clone()));

            if self.failing.contains(&service.id) {
                return Err(DispatchError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }

            Ok(self.outputs.get(&service.id).cloned().unwrap_or_default())
        }
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn service(name: &str, port: u16) -> ServiceDescriptor {
        ServiceDescriptor::new(name, Endpoint::http("localhost", port))
    }

    fn composer_with(
        dispatcher: ScriptedDispatcher,
        nodes: &[&str],
        edges: &[(&str, &str)],
    ) -> ServiceComposer<ScriptedDispatcher> {
        let mut composer = ServiceComposer::with_dispatcher(dispatcher);
        for (i, node) in nodes.iter().enumerate() {
            composer.register(service(node, 8000 + i as u16)).unwrap();
        }
        for (from, to) in edges {
            assert!(composer.connect(&id(from), &id(to)));
        }
        composer
    }

    fn diamond(dispatcher: ScriptedDispatcher) -> ServiceComposer<ScriptedDispatcher> {
        composer_with(
            dispatcher,
            &["s1", "s2", "s3", "s4"],
            &[("s1", "s2"), ("s2", "s3"), ("s2", "s4"), ("s3", "s4")],
        )
    }

    fn diamond_dispatcher() -> ScriptedDispatcher {
        ScriptedDispatcher::default()
            .respond("s1", json!({"text": "hello", "stage": "s1"}))
            .respond("s2", json!({"from_s2": 2, "stage": "s2"}))
            .respond("s3", json!({"from_s3": 3, "stage": "s3"}))
            .respond("s4", json!({"result": "final"}))
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut composer = ServiceComposer::with_dispatcher(ScriptedDispatcher::default());
        composer.register(service("s1", 8001)).unwrap();

        let err = composer.register(service("s1", 8002)).unwrap_err();
        assert!(matches!(err, ComposeError::DuplicateService(ref node) if node == &id("s1")));
        assert_eq!(composer.len(), 1);
        assert_eq!(composer.descriptor(&id("s1")).unwrap().endpoint.port, 8001);
    }

    #[test]
    fn test_connect_unknown_service_returns_false() {
        let mut composer = composer_with(ScriptedDispatcher::default(), &["s1", "s2"], &[]);

        assert!(!composer.connect(&id("s1"), &id("missing")));
        assert!(!composer.connect(&id("missing"), &id("s2")));

        assert_eq!(composer.graph().edge_count(), 0);
        assert_eq!(composer.graph().len(), 2);
        assert!(!composer.graph().contains(&id("missing")));
    }

    #[tokio::test]
    async fn test_diamond_visit_order() {
        let dispatcher = diamond_dispatcher();
        let mut composer = diamond(dispatcher.clone());

        composer.schedule(payload(json!({"text": "hello"}))).await.unwrap();

        assert_eq!(dispatcher.visited(), vec![id("s1"), id("s2"), id("s3"), id("s4")]);
    }

    #[tokio::test]
    async fn test_diamond_merge_later_predecessor_wins() {
        let dispatcher = diamond_dispatcher();
        let mut composer = diamond(dispatcher.clone());

        composer.schedule(payload(json!({"text": "hello"}))).await.unwrap();

        // s2 then s3 in registration order; s3 overwrites the shared key
        assert_eq!(
            dispatcher.input_of("s4"),
            payload(json!({"from_s2": 2, "from_s3": 3, "stage": "s3"}))
        );
        assert_eq!(
            dispatcher.input_of("s3"),
            payload(json!({"from_s2": 2, "stage": "s2"}))
        );
    }

    #[tokio::test]
    async fn test_sources_receive_initial_input() {
        let dispatcher = ScriptedDispatcher::default()
            .respond("left", json!({"left": true}))
            .respond("right", json!({"right": true}));
        let mut composer = composer_with(
            dispatcher.clone(),
            &["left", "right", "join"],
            &[("left", "join"), ("right", "join")],
        );

        let initial = payload(json!({"question": "why?"}));
        composer.schedule(initial.clone()).await.unwrap();

        assert_eq!(dispatcher.input_of("left"), initial);
        assert_eq!(dispatcher.input_of("right"), initial);
        assert_eq!(
            dispatcher.input_of("join"),
            payload(json!({"left": true, "right": true}))
        );
    }

    #[tokio::test]
    async fn test_dispatch_failure_aborts_run() {
        let dispatcher = ScriptedDispatcher::default()
            .respond("s1", json!({"stage": "s1"}))
            .respond("s3", json!({"stage": "s3"}))
            .fail_on("s2");
        let mut composer = composer_with(
            dispatcher.clone(),
            &["s1", "s2", "s3"],
            &[("s1", "s2"), ("s2", "s3")],
        );

        let err = composer.schedule(Payload::new()).await.unwrap_err();

        assert_eq!(err.failed_node(), Some(&id("s2")));
        assert!(err.to_string().contains("status 500"));
        assert_eq!(dispatcher.visited(), vec![id("s1"), id("s2")]);
        assert_eq!(composer.results().len(), 1);
        assert_eq!(composer.output(&id("s1")), Some(&payload(json!({"stage": "s1"}))));
        assert!(composer.output(&id("s3")).is_none());
        assert!(composer.collect_final_outputs().is_empty());
    }

    #[tokio::test]
    async fn test_collect_final_outputs() {
        let mut composer = diamond(diamond_dispatcher());
        composer.schedule(Payload::new()).await.unwrap();

        let finals = composer.collect_final_outputs();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[&id("s4")], payload(json!({"result": "final"})));
        assert_eq!(composer.results().len(), 4);
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_dispatch() {
        let dispatcher = ScriptedDispatcher::default();
        let mut composer = composer_with(
            dispatcher.clone(),
            &["a", "b"],
            &[("a", "b"), ("b", "a")],
        );

        let err = composer.schedule(Payload::new()).await.unwrap_err();

        assert!(matches!(
            err,
            ComposeError::Graph(GraphError::CycleDetected { .. })
        ));
        assert!(dispatcher.visited().is_empty());
    }

    #[tokio::test]
    async fn test_cache_rebuilt_each_run() {
        let dispatcher = ScriptedDispatcher::default()
            .respond("a", json!({"stage": "a"}))
            .respond("b", json!({"stage": "b"}))
            .fail_on("c");
        let mut composer = composer_with(dispatcher, &["a", "b"], &[("a", "b")]);
        composer.schedule(Payload::new()).await.unwrap();
        assert_eq!(composer.results().len(), 2);

        // "c" becomes the only source and fails first, so nothing is cached
        composer.register(service("c", 9000)).unwrap();
        assert!(composer.connect(&id("c"), &id("a")));
        let err = composer.schedule(Payload::new()).await.unwrap_err();

        assert_eq!(err.failed_node(), Some(&id("c")));
        assert!(composer.results().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_over_http() {
        use wiremock::matchers::{body_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upper"))
            .and(body_json(json!({"text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "HELLO"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/exclaim"))
            .and(body_json(json!({"text": "HELLO"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "HELLO!"})))
            .mount(&server)
            .await;

        let address = server.address();
        let host = address.ip().to_string();
        let mut composer = ServiceComposer::new();
        composer
            .register(ServiceDescriptor::new(
                "upper",
                Endpoint::http(host.clone(), address.port()).with_path("/upper"),
            ))
            .unwrap();
        composer
            .register(ServiceDescriptor::new(
                "exclaim",
                Endpoint::http(host, address.port()).with_path("/exclaim"),
            ))
            .unwrap();
        assert!(composer.connect(&id("upper"), &id("exclaim")));

        composer.schedule(payload(json!({"text": "hello"}))).await.unwrap();

        let finals = composer.collect_final_outputs();
        assert_eq!(finals[&id("exclaim")], payload(json!({"text": "HELLO!"})));
    }
}
