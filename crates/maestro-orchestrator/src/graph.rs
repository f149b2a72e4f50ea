//! Arena-backed step graph with validation.

use crate::plan::{StepPlan, WorkflowPlan};
use maestro_core::{MaestroError, MaestroResult};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;

/// Most steps a single plan may carry.
pub const MAX_STEPS: usize = 256;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+)\.output\s*\}\}").unwrap_or_else(|_| unreachable!())
    })
}

/// Step ids referenced by `{{id.output}}` placeholders in `template`.
pub fn placeholders(template: &str) -> Vec<String> {
    placeholder_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute every `{{id.output}}` with the matching entry of `outputs`.
/// Unknown references are left untouched.
pub fn interpolate(template: &str, outputs: &HashMap<String, String>) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            outputs
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// One node of the graph.
#[derive(Debug, Clone)]
pub struct StepNode {
    /// The step as planned.
    pub plan: StepPlan,
    /// Indices of the steps this one waits for.
    pub deps: Vec<usize>,
    /// Indices of the steps waiting for this one.
    pub dependents: Vec<usize>,
}

/// Validated, acyclic step graph. Nodes are addressed by index.
#[derive(Debug, Clone)]
pub struct StepGraph {
    nodes: Vec<StepNode>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl StepGraph {
    /// Validate `plan` and build its graph.
    ///
    /// Rejects missing ids or agent specs, duplicate ids, unknown or self
    /// dependencies, placeholders that point outside a step's dependencies,
    /// and cycles.
    pub fn build(plan: &WorkflowPlan) -> MaestroResult<Self> {
        if plan.steps.is_empty() {
            return Err(MaestroError::Validation("workflow has no steps".into()));
        }
        if plan.steps.len() > MAX_STEPS {
            return Err(MaestroError::Validation(format!(
                "workflow has {} steps, limit is {MAX_STEPS}",
                plan.steps.len()
            )));
        }
        if plan.max_concurrent_steps == Some(0) {
            return Err(MaestroError::Validation(
                "max_concurrent_steps must be at least 1".into(),
            ));
        }

        let mut index = HashMap::with_capacity(plan.steps.len());
        for (i, step) in plan.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(MaestroError::Validation(format!("step #{} has no id", i + 1)));
            }
            if step.agent.is_none() {
                return Err(MaestroError::Validation(format!(
                    "step '{}' has no agent spec",
                    step.id
                )));
            }
            if let Some(tier) = step.tier {
                if !(1..=3).contains(&tier) {
                    return Err(MaestroError::Validation(format!(
                        "step '{}' has invalid tier {tier}",
                        step.id
                    )));
                }
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(MaestroError::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut nodes: Vec<StepNode> = plan
            .steps
            .iter()
            .map(|plan| StepNode {
                plan: plan.clone(),
                deps: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        for (i, step) in plan.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(MaestroError::Validation(format!(
                        "step '{}' depends on unknown step '{dep}'",
                        step.id
                    )));
                };
                if d == i {
                    return Err(MaestroError::Validation(format!(
                        "step '{}' depends on itself",
                        step.id
                    )));
                }
                if !nodes[i].deps.contains(&d) {
                    nodes[i].deps.push(d);
                    nodes[d].dependents.push(i);
                }
            }
            for reference in placeholders(&step.prompt_template) {
                if !step.depends_on.contains(&reference) {
                    return Err(MaestroError::Validation(format!(
                        "step '{}' uses {{{{{reference}.output}}}} without depending on it",
                        step.id
                    )));
                }
            }
        }

        let graph = Self { nodes };
        if let Some(cycle) = graph.find_cycle() {
            return Err(MaestroError::Validation(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }
        Ok(graph)
    }

    /// Iterative three-color DFS. Returns the ids along the first cycle found.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let n = self.nodes.len();
        let mut color = vec![Color::White; n];

        for start in 0..n {
            if color[start] != Color::White {
                continue;
            }
            color[start] = Color::Gray;
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

            while let Some(&(node, next)) = stack.last() {
                let deps = &self.nodes[node].deps;
                if next >= deps.len() {
                    color[node] = Color::Black;
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let dep = deps[next];
                match color[dep] {
                    Color::Gray => {
                        let from = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                        let mut path: Vec<String> = stack[from..]
                            .iter()
                            .map(|&(n, _)| self.nodes[n].plan.id.clone())
                            .collect();
                        path.push(self.nodes[dep].plan.id.clone());
                        return Some(path);
                    }
                    Color::White => {
                        // Stack depth can never exceed the node count.
                        if stack.len() > n {
                            return Some(vec!["<depth limit>".into()]);
                        }
                        color[dep] = Color::Gray;
                        stack.push((dep, 0));
                    }
                    Color::Black => {}
                }
            }
        }
        None
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty (never true for a built graph).
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node by index.
    pub fn node(&self, i: usize) -> &StepNode {
        &self.nodes[i]
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> &[StepNode] {
        &self.nodes
    }

    /// Indices of steps with no dependents.
    pub fn terminal_steps(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].dependents.is_empty())
            .collect()
    }

    /// A topological order (Kahn), ties broken by declaration order.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut pending: Vec<usize> = self.nodes.iter().map(|n| n.deps.len()).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &d in &self.nodes[i].dependents {
                pending[d] -= 1;
                if pending[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        order
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::AgentSpec;

    fn step(id: &str, deps: &[&str]) -> StepPlan {
        StepPlan {
            id: id.into(),
            agent: Some(AgentSpec::default()),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            prompt_template: format!("do {id}"),
            ..Default::default()
        }
    }

    fn plan(steps: Vec<StepPlan>) -> WorkflowPlan {
        WorkflowPlan {
            steps,
            ..Default::default()
        }
    }

    fn validation_msg(plan: &WorkflowPlan) -> String {
        match StepGraph::build(plan) {
            Err(MaestroError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_diamond_is_valid() {
        let g = StepGraph::build(&plan(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ]))
        .unwrap();
        assert_eq!(g.len(), 4);
        assert_eq!(g.terminal_steps(), vec![3]);
        assert_eq!(g.topological_order(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_cycle_detected() {
        let msg = validation_msg(&plan(vec![
            step("a", &["c"]),
            step("b", &["a"]),
            step("c", &["b"]),
        ]));
        assert!(msg.contains("cycle"), "{msg}");
    }

    #[test]
    fn test_long_chain_no_stack_overflow() {
        let mut steps = vec![step("s0", &[])];
        for i in 1..MAX_STEPS {
            let prev = format!("s{}", i - 1);
            steps.push(step(&format!("s{i}"), &[prev.as_str()]));
        }
        let g = StepGraph::build(&plan(steps)).unwrap();
        assert_eq!(g.topological_order().len(), MAX_STEPS);
    }

    #[test]
    fn test_missing_fields() {
        let mut no_agent = step("a", &[]);
        no_agent.agent = None;
        assert!(validation_msg(&plan(vec![no_agent])).contains("agent spec"));
        assert!(validation_msg(&plan(vec![step("", &[])])).contains("no id"));
        assert!(validation_msg(&plan(vec![])).contains("no steps"));
    }

    #[test]
    fn test_duplicate_and_unknown_ids() {
        assert!(validation_msg(&plan(vec![step("a", &[]), step("a", &[])])).contains("duplicate"));
        assert!(validation_msg(&plan(vec![step("a", &["ghost"])])).contains("unknown"));
        assert!(validation_msg(&plan(vec![step("a", &["a"])])).contains("itself"));
    }

    #[test]
    fn test_placeholder_must_be_dependency() {
        let mut b = step("b", &[]);
        b.prompt_template = "use {{a.output}}".into();
        let msg = validation_msg(&plan(vec![step("a", &[]), b]));
        assert!(msg.contains("without depending"), "{msg}");
    }

    #[test]
    fn test_interpolate() {
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), "ALPHA".to_string());
        assert_eq!(
            interpolate("x={{a.output}}, y={{ a.output }}, z={{b.output}}", &outputs),
            "x=ALPHA, y=ALPHA, z={{b.output}}"
        );
        assert_eq!(placeholders("{{a.output}} {{b-2.output}}"), vec!["a", "b-2"]);
    }
}
