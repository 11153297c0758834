use crate::engine::{EngineContext, EngineOutcome, ExecutionEngine};
use crate::registry::NodeRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{
    ErrorHandling, NodeContext, NodeError, NodeId, NodeOutput, NodeSpec, PortData, ResumeState,
    RetryPolicy, RunError, RunExecutionData, TaskData, Workflow, WorkflowError,
};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::AbortHandle;
use tokio::time::{timeout, Duration};

/// Executes workflows as DAGs with parallel execution
pub struct WorkflowExecutor {
    registry: Arc<NodeRegistry>,
    max_parallel: usize,
}

/// Result of one spawned step.
struct StepResult {
    node_id: NodeId,
    label: String,
    start_time: DateTime<Utc>,
    duration_ms: u64,
    result: Result<NodeOutput, NodeError>,
}

/// The dependency graph plus lookups in both directions.
struct StepGraph {
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

impl StepGraph {
    fn build(workflow: &Workflow) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node_spec in &workflow.nodes {
            index.insert(node_spec.id, graph.add_node(node_spec.id));
        }

        for conn in &workflow.connections {
            let from_idx = index
                .get(&conn.from_node)
                .ok_or_else(|| WorkflowError::NodeNotFound(conn.from_node.to_string()))?;
            let to_idx = index
                .get(&conn.to_node)
                .ok_or_else(|| WorkflowError::NodeNotFound(conn.to_node.to_string()))?;
            graph.add_edge(*from_idx, *to_idx, ());
        }

        if toposort(&graph, None).is_err() {
            return Err(WorkflowError::CyclicDependency);
        }

        Ok(Self { graph, index })
    }

    fn predecessors(&self, node_id: NodeId) -> Vec<NodeId> {
        self.index
            .get(&node_id)
            .map(|idx| {
                self.graph
                    .neighbors_directed(*idx, petgraph::Direction::Incoming)
                    .filter_map(|dep| self.graph.node_weight(dep).copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Steps that must run for `destination` to run, itself included.
    fn ancestors_of(&self, destination: NodeId) -> HashSet<NodeId> {
        let Some(target) = self.index.get(&destination) else {
            return HashSet::new();
        };
        self.index
            .iter()
            .filter(|(_, idx)| has_path_connecting(&self.graph, **idx, *target, None))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Bookkeeping for one run of the DAG.
struct RunState {
    data: RunExecutionData,
    scope: HashSet<NodeId>,
    completed: HashSet<NodeId>,
    started: HashSet<NodeId>,
    outputs: HashMap<NodeId, PortData>,
    waiting: Option<ResumeState>,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<NodeRegistry>, max_parallel: usize) -> Self {
        Self {
            registry,
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Execute a workflow, continuing from whatever `ctx.data` already holds
    pub async fn execute(&self, ctx: EngineContext) -> EngineOutcome {
        let workflow = ctx.workflow.clone();
        let mut data = ctx.data.clone();
        data.execution_data = None;

        tracing::info!(
            "Starting workflow execution {} of {}",
            ctx.execution_id,
            workflow.id
        );

        let graph = match StepGraph::build(&workflow) {
            Ok(graph) => graph,
            Err(e) => {
                tracing::error!("Workflow {} cannot run: {}", workflow.id, e);
                data.result_data.error = Some(RunError::new(e.to_string()));
                return EngineOutcome::Finished(data);
            }
        };

        let mut state = match self.plan(&workflow, &graph, data) {
            Ok(state) => state,
            Err((e, mut data)) => {
                data.result_data.error = Some(RunError::new(e.to_string()));
                return EngineOutcome::Finished(data);
            }
        };

        self.execute_dag(&ctx, &workflow, &graph, &mut state).await
    }

    /// Decides which steps run and which are satisfied by earlier or pinned
    /// results.
    fn plan(
        &self,
        workflow: &Workflow,
        graph: &StepGraph,
        mut data: RunExecutionData,
    ) -> Result<RunState, (WorkflowError, RunExecutionData)> {
        let scope = match data.start_data.destination_node.clone() {
            Some(destination) => match workflow.find_node_by_label(&destination) {
                Some(spec) => graph.ancestors_of(spec.id),
                None => return Err((WorkflowError::NodeNotFound(destination), data)),
            },
            None => workflow.nodes.iter().map(|n| n.id).collect(),
        };
        let filter: Option<HashSet<String>> = data
            .start_data
            .run_node_filter
            .as_ref()
            .map(|names| names.iter().cloned().collect());

        let mut completed = HashSet::new();
        let mut outputs = HashMap::new();
        for spec in workflow.nodes.iter().filter(|n| scope.contains(&n.id)) {
            let label = spec.label();
            if let Some(previous) = data.completed_outputs(&label) {
                outputs.insert(spec.id, previous.clone());
                completed.insert(spec.id);
            } else if let Some(pinned) = data.pinned_outputs(&label).cloned() {
                data.record_task(
                    &label,
                    TaskData {
                        start_time: Utc::now(),
                        execution_time_ms: 0,
                        data: pinned.clone(),
                        error: None,
                    },
                );
                outputs.insert(spec.id, pinned);
                completed.insert(spec.id);
            } else if filter.as_ref().map(|f| !f.contains(&label)).unwrap_or(false) {
                tracing::debug!("Skipping step '{}' outside the run filter", label);
                completed.insert(spec.id);
            }
        }

        Ok(RunState {
            data,
            scope,
            completed,
            started: HashSet::new(),
            outputs,
            waiting: None,
        })
    }

    /// Execute the DAG with parallelism
    async fn execute_dag(
        &self,
        ctx: &EngineContext,
        workflow: &Workflow,
        graph: &StepGraph,
        state: &mut RunState,
    ) -> EngineOutcome {
        let max_parallel = self
            .max_parallel
            .min(workflow.settings.max_parallel_nodes.max(1));
        let mut running = FuturesUnordered::new();
        let mut abort_handles: HashMap<NodeId, AbortHandle> = HashMap::new();

        loop {
            if ctx.cancellation.is_cancelled() {
                return Self::cancelled(abort_handles, std::mem::take(&mut state.data));
            }

            // A parked step stops new work; steps already running finish.
            if state.waiting.is_none() {
                for node_id in self.find_ready_nodes(workflow, graph, state) {
                    if running.len() >= max_parallel {
                        break;
                    }
                    let Some(spec) = workflow.find_node(node_id) else {
                        continue;
                    };
                    state.started.insert(node_id);
                    ctx.events.node_before(&spec.label());

                    let inputs = self.collect_node_inputs(node_id, workflow, state);
                    let handle = tokio::spawn(self.step_task(ctx, workflow, spec.clone(), inputs));
                    abort_handles.insert(node_id, handle.abort_handle());
                    running.push(handle);
                }
            }

            // If nothing is running and nothing is ready, we're done
            if running.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = ctx.cancellation.cancelled() => {
                    return Self::cancelled(abort_handles, std::mem::take(&mut state.data));
                }
                Some(joined) = running.next() => joined,
            };

            let step = match joined {
                Ok(step) => step,
                Err(e) => {
                    tracing::error!("Step task failed: {}", e);
                    for handle in abort_handles.values() {
                        handle.abort();
                    }
                    let mut data = std::mem::take(&mut state.data);
                    data.result_data.error = Some(RunError::new(format!("Step task failed: {}", e)));
                    return EngineOutcome::Finished(data);
                }
            };
            abort_handles.remove(&step.node_id);

            match step.result {
                Ok(output) => {
                    tracing::info!("Node {} completed in {}ms", step.label, step.duration_ms);
                    let task = TaskData {
                        start_time: step.start_time,
                        execution_time_ms: step.duration_ms,
                        data: output.outputs.clone(),
                        error: None,
                    };
                    state.data.record_task(&step.label, task.clone());
                    ctx.events.node_after(&step.label, task);

                    if let Some(wait_till) = output.wait_till {
                        tracing::info!("Node {} parks the execution until {}", step.label, wait_till);
                        state.waiting = Some(ResumeState {
                            waiting_node: step.label.clone(),
                            wait_till,
                        });
                    }
                    state.outputs.insert(step.node_id, output.outputs);
                    state.completed.insert(step.node_id);
                }
                Err(NodeError::Cancelled) if ctx.cancellation.is_cancelled() => {
                    return Self::cancelled(abort_handles, std::mem::take(&mut state.data));
                }
                Err(e) => {
                    tracing::error!("Node {} failed: {}", step.label, e);
                    let error = RunError::at_node(e.to_string(), step.label.clone());
                    let task = TaskData {
                        start_time: step.start_time,
                        execution_time_ms: step.duration_ms,
                        data: PortData::new(),
                        error: Some(error.clone()),
                    };
                    state.data.record_task(&step.label, task.clone());
                    ctx.events.node_after(&step.label, task);

                    // Handle error based on workflow settings
                    match workflow.settings.on_error {
                        ErrorHandling::ContinueOnError => {
                            state.completed.insert(step.node_id);
                        }
                        ErrorHandling::StopWorkflow | ErrorHandling::RetryWorkflow { .. } => {
                            for handle in abort_handles.values() {
                                handle.abort();
                            }
                            let mut data = std::mem::take(&mut state.data);
                            data.result_data.error = Some(error);
                            return EngineOutcome::Finished(data);
                        }
                    }
                }
            }
        }

        let mut data = std::mem::take(&mut state.data);
        match state.waiting.take() {
            Some(resume) => {
                let wait_till = resume.wait_till;
                data.execution_data = Some(resume);
                EngineOutcome::Waiting { wait_till, data }
            }
            None => EngineOutcome::Finished(data),
        }
    }

    fn cancelled(
        abort_handles: HashMap<NodeId, AbortHandle>,
        mut data: RunExecutionData,
    ) -> EngineOutcome {
        for handle in abort_handles.values() {
            handle.abort();
        }
        data.result_data.error = Some(RunError::canceled());
        EngineOutcome::Canceled(data)
    }

    /// Builds the future for one step: instantiate, then run with the
    /// step's retry policy and the workflow's step timeout.
    fn step_task(
        &self,
        ctx: &EngineContext,
        workflow: &Workflow,
        spec: NodeSpec,
        inputs: PortData,
    ) -> impl std::future::Future<Output = StepResult> + Send + 'static {
        let registry = self.registry.clone();
        let step_timeout = workflow.settings.max_execution_time_ms;
        let label = spec.label();
        let node_ctx = NodeContext {
            node_id: spec.id,
            node_name: label.clone(),
            execution_id: ctx.execution_id,
            inputs,
            config: spec.config.clone(),
            events: ctx.events.clone(),
            response: ctx.response.clone(),
            cancellation: ctx.cancellation.child_token(),
        };

        async move {
            let start_time = Utc::now();
            let started = Instant::now();
            let result = AssertUnwindSafe(run_step(&registry, &spec, node_ctx, step_timeout))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(NodeError::ExecutionFailed(format!("step '{}' panicked", spec.label())))
                });
            StepResult {
                node_id: spec.id,
                label,
                start_time,
                duration_ms: started.elapsed().as_millis() as u64,
                result,
            }
        }
    }

    /// Find nodes that are ready to execute
    fn find_ready_nodes(
        &self,
        workflow: &Workflow,
        graph: &StepGraph,
        state: &RunState,
    ) -> Vec<NodeId> {
        // Workflow order keeps scheduling deterministic
        workflow
            .nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| state.scope.contains(id))
            .filter(|id| !state.completed.contains(id) && !state.started.contains(id))
            .filter(|id| {
                graph
                    .predecessors(*id)
                    .iter()
                    .filter(|dep| state.scope.contains(dep))
                    .all(|dep| state.completed.contains(dep))
            })
            .collect()
    }

    /// Collect inputs for a node from its predecessors
    fn collect_node_inputs(
        &self,
        node_id: NodeId,
        workflow: &Workflow,
        state: &RunState,
    ) -> PortData {
        let mut inputs = PortData::new();

        if workflow.is_root(node_id) {
            inputs.extend(state.data.start_data.inputs.clone());
        }

        for conn in workflow.incoming(node_id) {
            if let Some(value) = state
                .outputs
                .get(&conn.from_node)
                .and_then(|outputs| outputs.get(&conn.from_port))
            {
                inputs.insert(conn.to_port.clone(), value.clone());
            }
        }

        inputs
    }
}

async fn run_step(
    registry: &NodeRegistry,
    spec: &NodeSpec,
    ctx: NodeContext,
    step_timeout: Option<u64>,
) -> Result<NodeOutput, NodeError> {
    let mut node = registry
        .create_node(spec)
        .map_err(|e| NodeError::Configuration(e.to_string()))?;
    node.initialize().await?;

    let policy = spec.retry_policy.clone().unwrap_or(RetryPolicy {
        max_attempts: 1,
        delay_ms: 0,
        backoff_multiplier: 1.0,
    });
    let max_attempts = policy.attempts();

    let mut attempt = 1;
    loop {
        let result = match step_timeout {
            Some(timeout_ms) => {
                match timeout(Duration::from_millis(timeout_ms), node.execute(ctx.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Timeout {
                        seconds: timeout_ms / 1000,
                    }),
                }
            }
            None => node.execute(ctx.clone()).await,
        };

        match result {
            Err(e)
                if attempt < max_attempts
                    && !matches!(e, NodeError::Cancelled)
                    && !ctx.cancellation.is_cancelled() =>
            {
                tracing::warn!(
                    "Node {} attempt {}/{} failed: {}",
                    ctx.node_name,
                    attempt,
                    max_attempts,
                    e
                );
                tokio::select! {
                    _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
                    _ = tokio::time::sleep(policy.delay_after(attempt)) => {}
                }
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[async_trait]
impl ExecutionEngine for WorkflowExecutor {
    async fn run(&self, ctx: EngineContext) -> EngineOutcome {
        self.execute(ctx).await
    }
}
