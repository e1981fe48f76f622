//! Structural validation for chain definitions.
//!
//! Runs on every set/update before a chain is persisted, and again before
//! execution (definitions can arrive straight from `/v1/execute`). Rejects:
//! empty ids, empty task lists, duplicate task ids, kind/field mismatches,
//! unresolved transition targets, and cycles with no exit edge. A cycle is
//! legal only when some task inside it can transition to a terminal or to a
//! task outside the cycle.

use std::collections::{HashMap, HashSet};

use orq_schemas::{ChainDefinition, TaskKind, TERM_END, TERM_ERROR_END};

use crate::ChainError;

pub fn validate_chain(def: &ChainDefinition) -> Result<(), ChainError> {
    if def.id.trim().is_empty() {
        return Err(ChainError::Validation("chain id must not be empty".into()));
    }
    if def.tasks.is_empty() {
        return Err(ChainError::Validation(format!(
            "chain {} has no tasks",
            def.id
        )));
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for task in &def.tasks {
        if task.id.trim().is_empty() {
            return Err(ChainError::Validation(format!(
                "chain {} contains a task with an empty id",
                def.id
            )));
        }
        if !ids.insert(task.id.as_str()) {
            return Err(ChainError::Validation(format!(
                "duplicate task id: {}",
                task.id
            )));
        }

        match task.kind {
            TaskKind::Hook if task.hook.as_deref().unwrap_or("").is_empty() => {
                return Err(ChainError::Validation(format!(
                    "task {} is a hook task without a hook name",
                    task.id
                )));
            }
            TaskKind::Model if task.prompt_template.as_deref().unwrap_or("").is_empty() => {
                return Err(ChainError::Validation(format!(
                    "task {} is a model task without a prompt template",
                    task.id
                )));
            }
            _ => {}
        }
    }

    // Every transition target must resolve to a task or a terminal.
    for task in &def.tasks {
        for tr in &task.transitions {
            let target = tr.next.as_str();
            if target == TERM_END || target == TERM_ERROR_END {
                continue;
            }
            if !ids.contains(target) {
                return Err(ChainError::Validation(format!(
                    "task {} transitions to unknown target {}",
                    task.id, target
                )));
            }
        }
    }

    check_cycles(def)?;
    Ok(())
}

/// Reject cycles with no exit. Strongly connected components of the task
/// graph are computed; any SCC that loops (size > 1, or a self-loop) must
/// contain at least one edge leaving the component or reaching a terminal.
fn check_cycles(def: &ChainDefinition) -> Result<(), ChainError> {
    let index: HashMap<&str, usize> = def
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let n = def.tasks.len();
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut terminal_edge: Vec<bool> = vec![false; n];
    for (i, task) in def.tasks.iter().enumerate() {
        for tr in &task.transitions {
            match tr.next.as_str() {
                TERM_END | TERM_ERROR_END => terminal_edge[i] = true,
                other => {
                    if let Some(&j) = index.get(other) {
                        edges[i].push(j);
                    }
                }
            }
        }
    }

    let sccs = tarjan_sccs(n, &edges);
    for scc in &sccs {
        let in_scc: HashSet<usize> = scc.iter().copied().collect();
        let loops = scc.len() > 1 || edges[scc[0]].contains(&scc[0]);
        if !loops {
            continue;
        }

        let has_exit = scc.iter().any(|&i| {
            terminal_edge[i] || edges[i].iter().any(|j| !in_scc.contains(j))
        });
        if !has_exit {
            let names: Vec<&str> = scc.iter().map(|&i| def.tasks[i].id.as_str()).collect();
            return Err(ChainError::Validation(format!(
                "cycle without a terminal exit: {}",
                names.join(" -> ")
            )));
        }
    }
    Ok(())
}

/// Tarjan's strongly-connected components.
fn tarjan_sccs(n: usize, edges: &[Vec<usize>]) -> Vec<Vec<usize>> {
    struct State<'a> {
        edges: &'a [Vec<usize>],
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        counter: usize,
        sccs: Vec<Vec<usize>>,
    }

    fn strongconnect(st: &mut State, v: usize) {
        st.index[v] = Some(st.counter);
        st.lowlink[v] = st.counter;
        st.counter += 1;
        st.stack.push(v);
        st.on_stack[v] = true;

        for &w in &st.edges[v].to_vec() {
            match st.index[w] {
                None => {
                    strongconnect(st, w);
                    st.lowlink[v] = st.lowlink[v].min(st.lowlink[w]);
                }
                Some(widx) if st.on_stack[w] => {
                    st.lowlink[v] = st.lowlink[v].min(widx);
                }
                _ => {}
            }
        }

        if st.lowlink[v] == st.index[v].unwrap_or(usize::MAX) {
            let mut scc = Vec::new();
            loop {
                let w = st.stack.pop().expect("tarjan stack underflow");
                st.on_stack[w] = false;
                scc.push(w);
                if w == v {
                    break;
                }
            }
            st.sccs.push(scc);
        }
    }

    let mut st = State {
        edges,
        index: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        counter: 0,
        sccs: Vec::new(),
    };

    for v in 0..n {
        if st.index[v].is_none() {
            strongconnect(&mut st, v);
        }
    }
    st.sccs
}

#[cfg(test)]
mod tests {
    use super::*;
    use orq_schemas::{TaskDef, Transition};

    fn task(id: &str, transitions: &[(&str, &str)]) -> TaskDef {
        TaskDef {
            id: id.to_string(),
            kind: TaskKind::Noop,
            input: None,
            hook: None,
            prompt_template: None,
            capability: None,
            model_names: vec![],
            transitions: transitions
                .iter()
                .map(|(on, next)| Transition {
                    on: on.to_string(),
                    next: next.to_string(),
                })
                .collect(),
        }
    }

    fn chain(id: &str, tasks: Vec<TaskDef>) -> ChainDefinition {
        ChainDefinition {
            id: id.to_string(),
            description: String::new(),
            tasks,
        }
    }

    #[test]
    fn empty_id_and_empty_tasks_are_rejected() {
        assert!(validate_chain(&chain("", vec![task("a", &[("ok", "end")])])).is_err());
        assert!(validate_chain(&chain("c", vec![])).is_err());
    }

    #[test]
    fn unresolved_transition_target_is_rejected() {
        let def = chain("c", vec![task("a", &[("ok", "nowhere")])]);
        let err = validate_chain(&def).unwrap_err();
        assert!(err.to_string().contains("unknown target"));
    }

    #[test]
    fn duplicate_task_ids_are_rejected() {
        let def = chain(
            "c",
            vec![task("a", &[("ok", "end")]), task("a", &[("ok", "end")])],
        );
        assert!(validate_chain(&def).is_err());
    }

    #[test]
    fn linear_chain_is_valid() {
        let def = chain(
            "c",
            vec![task("a", &[("ok", "b")]), task("b", &[("ok", "end")])],
        );
        assert!(validate_chain(&def).is_ok());
    }

    #[test]
    fn ungated_cycle_is_rejected() {
        let def = chain(
            "c",
            vec![task("a", &[("ok", "b")]), task("b", &[("ok", "a")])],
        );
        let err = validate_chain(&def).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn cycle_with_terminal_exit_is_accepted() {
        // Retry loop: b can either loop back to a or finish.
        let def = chain(
            "c",
            vec![
                task("a", &[("ok", "b")]),
                task("b", &[("retry", "a"), ("ok", "end")]),
            ],
        );
        assert!(validate_chain(&def).is_ok());
    }

    #[test]
    fn self_loop_without_exit_is_rejected() {
        let def = chain("c", vec![task("a", &[("again", "a")])]);
        assert!(validate_chain(&def).is_err());

        let gated = chain("c", vec![task("a", &[("again", "a"), ("done", "end")])]);
        assert!(validate_chain(&gated).is_ok());
    }

    #[test]
    fn hook_task_requires_hook_name() {
        let mut t = task("a", &[("ok", "end")]);
        t.kind = TaskKind::Hook;
        assert!(validate_chain(&chain("c", vec![t])).is_err());
    }
}
