use std::collections::{HashMap, HashSet};

use crate::domain::RoleKey;
use crate::error::AccessionError;
use crate::graph::{FileId, TaskId, WorkflowRun};

/// Directed reachability search over the task-invocation graph induced by
/// producer/consumer edges.
///
/// Pipelines form a DAG in practice, but nothing in the metadata enforces
/// that; a cyclic graph fails with [`AccessionError::CyclicLineage`] instead
/// of recursing forever. Results are materialized in traversal order and
/// deduplicated; callers must treat them as a set.
pub struct LineageResolver<'a> {
    run: &'a WorkflowRun,
}

#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    OnStack,
    Done,
}

impl<'a> LineageResolver<'a> {
    pub fn new(run: &'a WorkflowRun) -> Self {
        Self { run }
    }

    /// Walks toward ancestors. On every task whose name matches
    /// `target_task_name`, yields its output files (or input files when
    /// `via_inputs` is set) carrying `role_key`; then recurses into the
    /// distinct producers of the task's input files, stopping at raw inputs.
    pub fn search_up(
        &self,
        from: TaskId,
        target_task_name: &str,
        role_key: &RoleKey,
        via_inputs: bool,
    ) -> Result<Vec<FileId>, AccessionError> {
        self.traverse(from, target_task_name, role_key, via_inputs, Direction::Up)
    }

    /// Walks toward descendants. Yields matching output files on task-name
    /// match; recurses into the distinct union of consumer tasks across the
    /// task's output files.
    pub fn search_down(
        &self,
        from: TaskId,
        target_task_name: &str,
        role_key: &RoleKey,
    ) -> Result<Vec<FileId>, AccessionError> {
        self.traverse(from, target_task_name, role_key, false, Direction::Down)
    }

    fn traverse(
        &self,
        from: TaskId,
        target_task_name: &str,
        role_key: &RoleKey,
        via_inputs: bool,
        direction: Direction,
    ) -> Result<Vec<FileId>, AccessionError> {
        let mut walk = Traversal {
            run: self.run,
            target_task_name,
            role_key,
            via_inputs,
            direction,
            marks: HashMap::new(),
            stack: Vec::new(),
            results: Vec::new(),
            yielded: HashSet::new(),
        };
        walk.enter(from);

        loop {
            let next = {
                let Some(frame) = walk.stack.last_mut() else {
                    break;
                };
                if frame.2 >= frame.1.len() {
                    walk.marks.insert(frame.0, Mark::Done);
                    walk.stack.pop();
                    continue;
                }
                frame.2 += 1;
                frame.1[frame.2 - 1]
            };
            match walk.marks.get(&next) {
                Some(Mark::OnStack) => {
                    return Err(AccessionError::CyclicLineage(
                        self.run.task(next).name.clone(),
                    ));
                }
                Some(Mark::Done) => continue,
                None => walk.enter(next),
            }
        }

        Ok(walk.results)
    }
}

/// Mutable state of one search. Frames carry the task, its neighbor list,
/// and a cursor into it.
struct Traversal<'a> {
    run: &'a WorkflowRun,
    target_task_name: &'a str,
    role_key: &'a RoleKey,
    via_inputs: bool,
    direction: Direction,
    marks: HashMap<TaskId, Mark>,
    stack: Vec<(TaskId, Vec<TaskId>, usize)>,
    results: Vec<FileId>,
    yielded: HashSet<FileId>,
}

impl Traversal<'_> {
    fn enter(&mut self, task: TaskId) {
        self.marks.insert(task, Mark::OnStack);
        let invocation = self.run.task(task);

        if invocation.name == self.target_task_name {
            let candidates = match (self.direction, self.via_inputs) {
                (Direction::Up, true) => &invocation.input_files,
                _ => &invocation.output_files,
            };
            for &file in candidates {
                if self.run.file(file).has_role(self.role_key) && self.yielded.insert(file) {
                    self.results.push(file);
                }
            }
        }

        self.stack.push((task, self.neighbors(task), 0));
    }

    fn neighbors(&self, task: TaskId) -> Vec<TaskId> {
        let invocation = self.run.task(task);
        let mut seen = HashSet::new();
        let mut neighbors = Vec::new();
        match self.direction {
            Direction::Up => {
                for &file in &invocation.input_files {
                    if let Some(producer) = self.run.file(file).producer {
                        if seen.insert(producer) {
                            neighbors.push(producer);
                        }
                    }
                }
            }
            Direction::Down => {
                for &file in &invocation.output_files {
                    for &consumer in &self.run.file(file).consumers {
                        if seen.insert(consumer) {
                            neighbors.push(consumer);
                        }
                    }
                }
            }
        }
        neighbors
    }
}
