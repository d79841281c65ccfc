//! Dependency resolution and task scheduling.
//!
//! Task generators reference other tasks of the same batch by title. The
//! resolver persists the batch and rewrites those titles into durable ids,
//! then the scheduler decides which tasks may run.
//!
//! Two resolution modes exist:
//!
//! - [`ResolveMode::Validated`] builds the complete title map before resolving,
//!   so declaration order does not matter, and rejects cyclic batches before
//!   anything is persisted.
//! - [`ResolveMode::DeclarationOrder`] only resolves titles declared earlier in
//!   the batch. Forward references are dropped.
//!
//! In both modes self references and unknown titles are dropped. Dropped titles
//! are logged and returned in [`ResolvedTasks::unresolved`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use uuid::Uuid;

use crate::db::Database;
use crate::error::{OrchestratorError, Result};
use crate::models::{CreateTaskInput, Phase, Task, TaskDraft, TaskStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolveMode {
    #[default]
    Validated,
    DeclarationOrder,
}

impl ResolveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validated => "validated",
            Self::DeclarationOrder => "declaration_order",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "validated" => Some(Self::Validated),
            "declaration_order" => Some(Self::DeclarationOrder),
            _ => None,
        }
    }
}

/// A dependency title that did not resolve to a task of the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedDependency {
    pub task: String,
    pub dependency: String,
}

/// Dependency edges of a batch, by position in the input.
#[derive(Debug, Clone, Default)]
pub struct DependencyPlan {
    pub edges: Vec<Vec<usize>>,
    pub unresolved: Vec<UnresolvedDependency>,
}

#[derive(Debug, Clone)]
pub struct ResolvedTasks {
    /// Persisted tasks in input order, with resolved dependencies.
    pub tasks: Vec<Task>,
    pub unresolved: Vec<UnresolvedDependency>,
}

/// Resolve dependency titles of `drafts` to positions within the batch.
pub fn plan_dependencies(drafts: &[TaskDraft], mode: ResolveMode) -> Result<DependencyPlan> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (index, draft) in drafts.iter().enumerate() {
        if positions.contains_key(draft.title.as_str()) {
            tracing::warn!(
                "Duplicate task title {:?}; dependencies resolve to its first declaration",
                draft.title
            );
            continue;
        }
        positions.insert(draft.title.as_str(), index);
    }

    let mut plan = DependencyPlan {
        edges: Vec::with_capacity(drafts.len()),
        unresolved: Vec::new(),
    };

    for (index, draft) in drafts.iter().enumerate() {
        let mut edges = Vec::new();
        for title in &draft.dependencies {
            let target = positions
                .get(title.as_str())
                .copied()
                .filter(|&target| match mode {
                    ResolveMode::Validated => true,
                    ResolveMode::DeclarationOrder => target < index,
                });

            match target {
                Some(target) if target == index => {
                    tracing::warn!("Task {:?} lists itself as a dependency", draft.title);
                }
                Some(target) => {
                    if !edges.contains(&target) {
                        edges.push(target);
                    }
                }
                None => {
                    tracing::warn!(
                        "Dropping unresolved dependency {:?} of task {:?}",
                        title,
                        draft.title
                    );
                    plan.unresolved.push(UnresolvedDependency {
                        task: draft.title.clone(),
                        dependency: title.clone(),
                    });
                }
            }
        }
        plan.edges.push(edges);
    }

    if let Some(cycle) = find_cycle(&plan.edges) {
        let titles = cycle.into_iter().map(|i| drafts[i].title.clone()).collect();
        return Err(OrchestratorError::DependencyCycle(titles));
    }

    Ok(plan)
}

/// Persist a batch of drafts for a story and resolve their dependencies.
///
/// When `parent` is given the drafts are sub-tasks of it: each carries the
/// parent's id and inherits the parent's dependencies.
pub fn create_tasks(
    db: &Database,
    story_id: Uuid,
    drafts: &[TaskDraft],
    parent: Option<&Task>,
    mode: ResolveMode,
) -> Result<ResolvedTasks> {
    let plan = plan_dependencies(drafts, mode)?;

    let mut tasks = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let input = CreateTaskInput::from_draft(draft, parent.map(|p| p.id));
        tasks.push(db.create_task(story_id, input)?);
    }

    let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
    for (task, edges) in tasks.iter_mut().zip(&plan.edges) {
        let mut dependencies: Vec<Uuid> = parent
            .map(|p| p.dependencies.clone())
            .unwrap_or_default();
        for &target in edges {
            if !dependencies.contains(&ids[target]) {
                dependencies.push(ids[target]);
            }
        }

        if !dependencies.is_empty() {
            db.set_task_dependencies(task.id, &dependencies)?;
        }
        task.dependencies = dependencies;
    }

    tracing::info!(
        story_id = %story_id,
        "Created {} tasks ({} unresolved dependencies dropped)",
        tasks.len(),
        plan.unresolved.len()
    );

    Ok(ResolvedTasks {
        tasks,
        unresolved: plan.unresolved,
    })
}

/// Depth-first search with a visiting set. Returns the nodes of the first
/// cycle found, starting and ending on the same node.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Visiting,
        Done,
    }

    fn visit(
        node: usize,
        edges: &[Vec<usize>],
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::Visiting;
        path.push(node);

        for &next in &edges[node] {
            match marks[next] {
                Mark::Visiting => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::New => {
                    if let Some(cycle) = visit(next, edges, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; edges.len()];
    let mut path = Vec::new();
    for node in 0..edges.len() {
        if marks[node] == Mark::New {
            if let Some(cycle) = visit(node, edges, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Dependencies of each task with subdivided tasks replaced by their
/// sub-tasks, recursively.
pub fn effective_dependencies(tasks: &[Task]) -> HashMap<Uuid, Vec<Uuid>> {
    let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for task in tasks {
        if let Some(parent) = task.parent_task_id {
            children.entry(parent).or_default().push(task.id);
        }
    }
    let subdivided: HashSet<Uuid> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Subdivided)
        .map(|t| t.id)
        .collect();

    fn expand(
        id: Uuid,
        children: &HashMap<Uuid, Vec<Uuid>>,
        subdivided: &HashSet<Uuid>,
        seen: &mut HashSet<Uuid>,
        out: &mut Vec<Uuid>,
    ) {
        if !seen.insert(id) {
            return;
        }
        if subdivided.contains(&id) {
            for &child in children.get(&id).into_iter().flatten() {
                expand(child, children, subdivided, seen, out);
            }
        } else {
            out.push(id);
        }
    }

    tasks
        .iter()
        .map(|task| {
            let mut seen = HashSet::from([task.id]);
            let mut out = Vec::new();
            for &dep in &task.dependencies {
                expand(dep, &children, &subdivided, &mut seen, &mut out);
            }
            (task.id, out)
        })
        .collect()
}

/// Tasks that still have to pass `phase` and whose dependencies already have,
/// ordered by ascending priority, then creation order.
///
/// `tasks` must be in creation order. Subdivided and failed tasks are never
/// ready.
pub fn ready_tasks(tasks: &[Task], phase: Phase) -> Vec<&Task> {
    let dependencies = effective_dependencies(tasks);
    let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|t| (t.id, t)).collect();

    let mut ready: Vec<(usize, &Task)> = tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.status.is_terminal() && !t.status.has_completed(phase))
        .filter(|(_, t)| {
            dependencies.get(&t.id).into_iter().flatten().all(|dep| {
                by_id
                    .get(dep)
                    .is_some_and(|d| d.status.has_completed(phase))
            })
        })
        .collect();

    ready.sort_by_key(|(index, t)| (t.priority, *index));
    ready.into_iter().map(|(_, t)| t).collect()
}

/// Tasks that still have to pass `phase`, whether ready or blocked.
pub fn pending_tasks(tasks: &[Task], phase: Phase) -> Vec<&Task> {
    tasks
        .iter()
        .filter(|t| !t.status.is_terminal() && !t.status.has_completed(phase))
        .collect()
}

/// Topological order of the executable tasks (subdivided tasks excluded),
/// breaking ties by ascending priority, then creation order.
pub fn execution_order(tasks: &[Task]) -> Result<Vec<&Task>> {
    let dependencies = effective_dependencies(tasks);
    let executable: Vec<(usize, &Task)> = tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.status != TaskStatus::Subdivided)
        .collect();
    let position: HashMap<Uuid, usize> = executable
        .iter()
        .enumerate()
        .map(|(slot, (_, t))| (t.id, slot))
        .collect();

    let mut indegree = vec![0usize; executable.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); executable.len()];
    for (slot, (_, task)) in executable.iter().enumerate() {
        for dep in dependencies.get(&task.id).into_iter().flatten() {
            if let Some(&from) = position.get(dep) {
                indegree[slot] += 1;
                dependents[from].push(slot);
            }
        }
    }

    let mut queue: BinaryHeap<Reverse<(i32, usize, usize)>> = executable
        .iter()
        .enumerate()
        .filter(|(slot, _)| indegree[*slot] == 0)
        .map(|(slot, (index, t))| Reverse((t.priority, *index, slot)))
        .collect();

    let mut order = Vec::with_capacity(executable.len());
    while let Some(Reverse((_, _, slot))) = queue.pop() {
        order.push(executable[slot].1);
        for &next in &dependents[slot] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                let (index, task) = executable[next];
                queue.push(Reverse((task.priority, index, next)));
            }
        }
    }

    if order.len() < executable.len() {
        let stuck = executable
            .iter()
            .enumerate()
            .filter(|(slot, _)| indegree[*slot] > 0)
            .map(|(_, (_, t))| t.title.clone())
            .collect();
        return Err(OrchestratorError::DependencyCycle(stuck));
    }

    Ok(order)
}
