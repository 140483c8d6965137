//! Package dependency graph.
//!
//! Packages form a DAG; compilation must visit dependencies first. The order
//! is computed with Kahn's algorithm over a petgraph digraph, breaking ties
//! by package name so a given release always compiles in the same order.

use std::collections::{BTreeMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use super::{Package, Release, ReleaseError};

fn build_graph(release: &Release) -> Result<(DiGraph<usize, ()>, BTreeMap<&str, NodeIndex>), ReleaseError> {
  let mut graph = DiGraph::new();
  let mut nodes: BTreeMap<&str, NodeIndex> = BTreeMap::new();

  for (i, package) in release.packages.iter().enumerate() {
    let idx = graph.add_node(i);
    nodes.insert(package.name.as_str(), idx);
  }

  for package in &release.packages {
    let dependent = nodes[package.name.as_str()];
    for dep in &package.dependencies {
      let dep_idx = *nodes
        .get(dep.as_str())
        .ok_or_else(|| ReleaseError::UnknownDependency {
          package: package.name.clone(),
          dependency: dep.clone(),
        })?;
      // Edge from dependency to dependent
      graph.add_edge(dep_idx, dependent, ());
    }
  }

  Ok((graph, nodes))
}

/// All packages of a release in compilation order.
///
/// Kahn's algorithm; at each step the ready nodes are taken in package name
/// order, which makes the order deterministic.
pub fn compilation_order(release: &Release) -> Result<Vec<&Package>, ReleaseError> {
  let (graph, nodes) = build_graph(release)?;

  let mut in_degree: BTreeMap<NodeIndex, usize> = BTreeMap::new();
  for idx in graph.node_indices() {
    in_degree.insert(idx, graph.neighbors_directed(idx, Direction::Incoming).count());
  }

  let mut order = Vec::with_capacity(release.packages.len());
  let mut remaining: usize = graph.node_count();
  let mut done: HashSet<NodeIndex> = HashSet::new();

  while remaining > 0 {
    // nodes BTreeMap iterates in name order, which is the tie-break
    let ready: Vec<NodeIndex> = nodes
      .values()
      .filter(|&&idx| !done.contains(&idx) && in_degree[&idx] == 0)
      .copied()
      .collect();

    if ready.is_empty() {
      return Err(ReleaseError::DependencyCycle);
    }

    for idx in ready {
      order.push(&release.packages[graph[idx]]);
      done.insert(idx);
      remaining -= 1;
      for neighbor in graph.neighbors_directed(idx, Direction::Outgoing) {
        if let Some(deg) = in_degree.get_mut(&neighbor) {
          *deg = deg.saturating_sub(1);
        }
      }
    }
  }

  Ok(order)
}

/// The transitive dependency closure of the named packages, in compilation
/// order. Dependencies appear even when only transitively referenced.
pub fn transitive_closure<'a>(release: &'a Release, names: &[String]) -> Result<Vec<&'a Package>, ReleaseError> {
  let mut wanted: HashSet<&str> = HashSet::new();
  let mut queue: Vec<&str> = Vec::new();

  for name in names {
    let package = release
      .find_package(name)
      .ok_or_else(|| ReleaseError::UnknownDependency {
        package: name.clone(),
        dependency: name.clone(),
      })?;
    if wanted.insert(package.name.as_str()) {
      queue.push(package.name.as_str());
    }
  }

  while let Some(name) = queue.pop() {
    let package = release.find_package(name).expect("queued package exists");
    for dep in &package.dependencies {
      let dep_package = release
        .find_package(dep)
        .ok_or_else(|| ReleaseError::UnknownDependency {
          package: package.name.clone(),
          dependency: dep.clone(),
        })?;
      if wanted.insert(dep_package.name.as_str()) {
        queue.push(dep_package.name.as_str());
      }
    }
  }

  Ok(
    compilation_order(release)?
      .into_iter()
      .filter(|p| wanted.contains(p.name.as_str()))
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use super::*;

  fn package(name: &str, deps: &[&str]) -> Package {
    Package {
      name: name.to_string(),
      fingerprint: format!("{}-fp", name),
      dependencies: deps.iter().map(|d| d.to_string()).collect(),
      archive_path: PathBuf::new(),
    }
  }

  fn release(packages: Vec<Package>) -> Release {
    Release::for_test("test-release", "1", vec![], packages)
  }

  fn names(packages: &[&Package]) -> Vec<String> {
    packages.iter().map(|p| p.name.clone()).collect()
  }

  #[test]
  fn order_respects_linear_chain() {
    // cpi -> ruby -> libyaml
    let release = release(vec![
      package("cpi", &["ruby"]),
      package("ruby", &["libyaml"]),
      package("libyaml", &[]),
    ]);

    let order = compilation_order(&release).unwrap();
    assert_eq!(names(&order), vec!["libyaml", "ruby", "cpi"]);
  }

  #[test]
  fn order_breaks_ties_by_name() {
    let release = release(vec![package("zebra", &[]), package("alpha", &[]), package("mango", &[])]);

    let order = compilation_order(&release).unwrap();
    assert_eq!(names(&order), vec!["alpha", "mango", "zebra"]);
  }

  #[test]
  fn order_handles_diamond() {
    //     base
    //    /    \
    //  left  right
    //    \    /
    //     top
    let release = release(vec![
      package("top", &["left", "right"]),
      package("left", &["base"]),
      package("right", &["base"]),
      package("base", &[]),
    ]);

    let order = compilation_order(&release).unwrap();
    assert_eq!(names(&order), vec!["base", "left", "right", "top"]);
  }

  #[test]
  fn cycle_is_rejected() {
    let release = release(vec![package("a", &["b"]), package("b", &["a"])]);

    assert!(matches!(
      compilation_order(&release),
      Err(ReleaseError::DependencyCycle)
    ));
  }

  #[test]
  fn unknown_dependency_is_rejected() {
    let release = release(vec![package("a", &["ghost"])]);

    assert!(matches!(
      compilation_order(&release),
      Err(ReleaseError::UnknownDependency { .. })
    ));
  }

  #[test]
  fn closure_includes_transitive_dependencies() {
    let release = release(vec![
      package("cpi", &["ruby"]),
      package("ruby", &["libyaml"]),
      package("libyaml", &[]),
      package("unrelated", &[]),
    ]);

    let closure = transitive_closure(&release, &["cpi".to_string()]).unwrap();
    assert_eq!(names(&closure), vec!["libyaml", "ruby", "cpi"]);
  }

  #[test]
  fn closure_of_leaf_is_itself() {
    let release = release(vec![package("cpi", &["ruby"]), package("ruby", &[]), package("solo", &[])]);

    let closure = transitive_closure(&release, &["solo".to_string()]).unwrap();
    assert_eq!(names(&closure), vec!["solo"]);
  }
}
