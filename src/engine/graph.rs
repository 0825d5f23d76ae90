use crate::core::{SampleBlock, Stage};
use crate::observability::{MetricsCollector, StageMetrics};
use crate::registry;
use crate::resilience::{ErrorPolicy, GuardedStage};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

/// Outputs of one push, keyed by stage id (sinks plus tapped stages)
pub type GraphOutput = BTreeMap<String, Vec<SampleBlock>>;

/// Directed acyclic graph of stages, processed synchronously.
///
/// Each pushed block enters every root stage; stages then run once in
/// topological order over whatever their upstream stages produced. Fan-out
/// hands every consumer a clone sharing the same payload.
#[derive(Default)]
pub struct StageGraph {
    ids: Vec<String>,
    stages: Vec<GuardedStage>,
    edges: Vec<(usize, usize)>,
    taps: HashSet<usize>,
    order: Option<Vec<usize>>,
    collector: MetricsCollector,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `{nodes: [{id, type, config, policy?}], connections: [{from, to}]}`
    pub fn from_json(config: &Value) -> Result<Self> {
        let mut graph = Self::new();

        if let Some(nodes) = config["nodes"].as_array() {
            for node in nodes {
                let id = node["id"]
                    .as_str()
                    .ok_or_else(|| anyhow!("Stage missing id"))?;
                let stage_type = node["type"]
                    .as_str()
                    .ok_or_else(|| anyhow!("Stage {} missing type", id))?;
                let policy: ErrorPolicy = if node["policy"].is_null() {
                    ErrorPolicy::default()
                } else {
                    serde_json::from_value(node["policy"].clone())
                        .with_context(|| format!("Invalid error policy for stage {}", id))?
                };
                let stage = registry::create_stage(stage_type, node["config"].clone())?;
                graph.add_stage_with_policy(id, stage, policy)?;
                if node["tap"].as_bool().unwrap_or(false) {
                    graph.tap(id)?;
                }
            }
        }

        if let Some(connections) = config["connections"].as_array() {
            for conn in connections {
                let from = conn["from"]
                    .as_str()
                    .ok_or_else(|| anyhow!("Connection missing from"))?;
                let to = conn["to"]
                    .as_str()
                    .ok_or_else(|| anyhow!("Connection missing to"))?;
                graph.connect(from, to)?;
            }
        }

        graph.build()?;
        Ok(graph)
    }

    pub fn add_stage(&mut self, id: &str, stage: Box<dyn Stage>) -> Result<()> {
        self.add_stage_with_policy(id, stage, ErrorPolicy::default())
    }

    pub fn add_stage_with_policy(
        &mut self,
        id: &str,
        stage: Box<dyn Stage>,
        policy: ErrorPolicy,
    ) -> Result<()> {
        if self.ids.iter().any(|existing| existing == id) {
            bail!("Duplicate stage id: {}", id);
        }
        let metrics = Arc::new(StageMetrics::new(id));
        self.collector.register(id, metrics.clone());
        self.stages
            .push(GuardedStage::new(id, stage, metrics, policy));
        self.ids.push(id.to_string());
        self.order = None;
        Ok(())
    }

    fn index(&self, id: &str) -> Result<usize> {
        self.ids
            .iter()
            .position(|existing| existing == id)
            .ok_or_else(|| anyhow!("Unknown stage: {}", id))
    }

    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        let edge = (self.index(from)?, self.index(to)?);
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
        self.order = None;
        Ok(())
    }

    /// Also report this stage's output even though it feeds other stages
    pub fn tap(&mut self, id: &str) -> Result<()> {
        let index = self.index(id)?;
        self.taps.insert(index);
        Ok(())
    }

    /// Resolve the processing order; fails on cycles
    pub fn build(&mut self) -> Result<()> {
        let n = self.stages.len();
        let mut in_degree = vec![0usize; n];
        for &(_, to) in &self.edges {
            in_degree[to] += 1;
        }
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &(from, to) in &self.edges {
                if from == i {
                    in_degree[to] -= 1;
                    if in_degree[to] == 0 {
                        ready.push_back(to);
                    }
                }
            }
        }
        if order.len() != n {
            let cyclic: Vec<&str> = (0..n)
                .filter(|i| !order.contains(i))
                .map(|i| self.ids[i].as_str())
                .collect();
            bail!("Stage graph has a cycle through {:?}", cyclic);
        }
        tracing::debug!(stages = n, edges = self.edges.len(), "stage graph built");
        self.order = Some(order);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_ids(&self) -> &[String] {
        &self.ids
    }

    /// Stages without downstream consumers
    pub fn sinks(&self) -> Vec<&str> {
        (0..self.stages.len())
            .filter(|&i| !self.edges.iter().any(|&(from, _)| from == i))
            .map(|i| self.ids[i].as_str())
            .collect()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.collector
    }

    /// Run one block through the whole graph
    pub fn push(&mut self, block: SampleBlock) -> Result<GraphOutput> {
        if self.order.is_none() {
            self.build()?;
        }
        let order = self.order.clone().unwrap_or_default();

        let n = self.stages.len();
        let mut inbox: Vec<Vec<SampleBlock>> = vec![Vec::new(); n];
        let mut has_upstream = vec![false; n];
        for &(_, to) in &self.edges {
            has_upstream[to] = true;
        }
        for (i, inputs) in inbox.iter_mut().enumerate() {
            if !has_upstream[i] {
                inputs.push(block.clone());
            }
        }

        let mut output = GraphOutput::new();
        for i in order {
            let inputs = std::mem::take(&mut inbox[i]);
            let mut produced = Vec::new();
            for input in inputs {
                produced.extend(self.stages[i].process(input)?);
            }

            let mut is_sink = true;
            for &(from, to) in &self.edges {
                if from == i {
                    is_sink = false;
                    inbox[to].extend(produced.iter().cloned());
                }
            }
            if is_sink || self.taps.contains(&i) {
                output
                    .entry(self.ids[i].clone())
                    .or_default()
                    .extend(produced);
            }
        }
        Ok(output)
    }

    pub fn reset(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.reset();
        }
    }
}
