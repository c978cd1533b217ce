//! ---
//! hm_section: "03-orchestration-core"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Deterministic dependency ordering for service startup and teardown."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
use std::collections::HashMap;

use hm_spec::ServiceSpec;
use indexmap::IndexMap;

use crate::errors::StructuralError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

struct Frame<'a> {
    name: &'a str,
    deps: Vec<&'a str>,
    next: usize,
}

impl<'a> Frame<'a> {
    fn new(name: &'a str, services: &'a IndexMap<String, ServiceSpec>) -> Self {
        let mut deps: Vec<&str> = services
            .get(name)
            .map(|spec| spec.dependency_names().collect())
            .unwrap_or_default();
        deps.sort_unstable();
        deps.dedup();
        Self {
            name,
            deps,
            next: 0,
        }
    }
}

/// Order in which services must be started: every service appears exactly
/// once and after all of its transitive dependencies.
///
/// Roots and each node's dependencies are visited in lexicographic order, so
/// the result depends only on the graph, never on declaration order.
pub fn start_order(services: &IndexMap<String, ServiceSpec>) -> Result<Vec<String>, StructuralError> {
    let mut names: Vec<&str> = services.keys().map(String::as_str).collect();
    names.sort_unstable();

    for name in &names {
        let mut deps: Vec<&str> = services[*name].dependency_names().collect();
        deps.sort_unstable();
        if let Some(missing) = deps.into_iter().find(|dep| !services.contains_key(*dep)) {
            return Err(StructuralError::MissingDependency {
                service: (*name).to_string(),
                dependency: missing.to_string(),
            });
        }
    }

    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(names.len());
    let mut order = Vec::with_capacity(names.len());

    for root in names {
        if marks.contains_key(root) {
            continue;
        }
        marks.insert(root, Mark::InProgress);
        let mut stack = vec![Frame::new(root, services)];

        while let Some(frame) = stack.last_mut() {
            if frame.next < frame.deps.len() {
                let dep = frame.deps[frame.next];
                frame.next += 1;
                match marks.get(dep) {
                    Some(Mark::Done) => {}
                    Some(Mark::InProgress) => {
                        let start = stack
                            .iter()
                            .position(|frame| frame.name == dep)
                            .unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|frame| frame.name.to_string()).collect();
                        path.push(dep.to_string());
                        return Err(StructuralError::Cycle { path });
                    }
                    None => {
                        marks.insert(dep, Mark::InProgress);
                        stack.push(Frame::new(dep, services));
                    }
                }
            } else if let Some(done) = stack.pop() {
                marks.insert(done.name, Mark::Done);
                order.push(done.name.to_string());
            }
        }
    }

    Ok(order)
}

/// Exact reverse of [`start_order`].
pub fn stop_order(services: &IndexMap<String, ServiceSpec>) -> Result<Vec<String>, StructuralError> {
    let mut order = start_order(services)?;
    order.reverse();
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `deps` is a whitespace separated list of dependency names.
    fn graph(edges: &[(&str, &str)]) -> IndexMap<String, ServiceSpec> {
        edges
            .iter()
            .map(|(name, deps)| {
                let spec = deps
                    .split_whitespace()
                    .fold(ServiceSpec::new(*name, "busybox"), |spec, dep| spec.depends_on(dep));
                (name.to_string(), spec)
            })
            .collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|entry| entry == name).unwrap()
    }

    #[test]
    fn chain_starts_dependencies_first() {
        let services = graph(&[("a", "b"), ("b", "c"), ("c", "")]);
        assert_eq!(start_order(&services).unwrap(), vec!["c", "b", "a"]);
        assert_eq!(stop_order(&services).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_orders_every_edge() {
        let services = graph(&[
            ("web", "api cache"),
            ("api", "db"),
            ("cache", "db"),
            ("db", ""),
        ]);
        let order = start_order(&services).unwrap();
        assert_eq!(order.len(), 4);
        assert!(position(&order, "db") < position(&order, "api"));
        assert!(position(&order, "db") < position(&order, "cache"));
        assert!(position(&order, "api") < position(&order, "web"));
        assert!(position(&order, "cache") < position(&order, "web"));
    }

    #[test]
    fn independent_services_are_sorted_by_name() {
        let services = graph(&[("zeta", ""), ("alpha", ""), ("mid", "")]);
        assert_eq!(start_order(&services).unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn result_ignores_declaration_order() {
        let forward = graph(&[("a", "c b"), ("b", ""), ("c", "b")]);
        let backward = graph(&[("c", "b"), ("b", ""), ("a", "b c")]);
        assert_eq!(start_order(&forward).unwrap(), start_order(&backward).unwrap());
    }

    #[test]
    fn missing_dependency_is_reported() {
        let services = graph(&[("a", "ghost")]);
        assert_eq!(
            start_order(&services),
            Err(StructuralError::MissingDependency {
                service: "a".into(),
                dependency: "ghost".into()
            })
        );
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let services = graph(&[("a", "b"), ("b", "a")]);
        assert_eq!(
            start_order(&services),
            Err(StructuralError::Cycle {
                path: vec!["a".into(), "b".into(), "a".into()]
            })
        );

        let self_loop = graph(&[("solo", "solo")]);
        assert!(matches!(
            start_order(&self_loop),
            Err(StructuralError::Cycle { path }) if path == vec!["solo", "solo"]
        ));
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let names: Vec<String> = (0..10_000).map(|i| format!("svc{i:05}")).collect();
        let services: IndexMap<String, ServiceSpec> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let spec = ServiceSpec::new(name.clone(), "busybox");
                let spec = match names.get(i + 1) {
                    Some(next) => spec.depends_on(next.clone()),
                    None => spec,
                };
                (name.clone(), spec)
            })
            .collect();
        let order = start_order(&services).unwrap();
        assert_eq!(order.first().map(String::as_str), Some("svc09999"));
        assert_eq!(order.last().map(String::as_str), Some("svc00000"));
    }
}
