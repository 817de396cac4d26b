//! Layered dependency resolution.
//!
//! Nodes name at most one dependency. [`resolve_batches`] groups them into
//! batches where every dependency lives in a strictly earlier batch and
//! nothing inside a batch depends on anything else in it, so the members of
//! one batch can be built at the same time.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct Node<T> {
    pub name: String,
    pub dependency: Option<String>,
    pub payload: Option<T>,
}

impl<T> Node<T> {
    pub fn new(name: impl Into<String>, dependency: Option<String>, payload: T) -> Node<T> {
        Node {
            name: name.into(),
            dependency,
            payload: Some(payload),
        }
    }

    /// A node standing in for an externally supplied base image. It
    /// satisfies dependencies on its name but is never scheduled.
    pub fn anchor(name: impl Into<String>) -> Node<T> {
        Node {
            name: name.into(),
            dependency: None,
            payload: None,
        }
    }

    pub fn is_anchor(&self) -> bool {
        self.payload.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct Batch<T> {
    pub nodes: Vec<Node<T>>,
}

impl<T> Batch<T> {
    pub fn names(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub fn resolve_batches<T>(nodes: Vec<Node<T>>) -> Result<Vec<Batch<T>>> {
    let mut instances: BTreeMap<String, Node<T>> = BTreeMap::new();
    for node in nodes {
        if instances.contains_key(&node.name) {
            return Err(Error::DuplicateNode(node.name));
        }
        instances.insert(node.name.clone(), node);
    }

    let unknown = instances
        .values()
        .filter_map(|node| {
            node.dependency
                .as_ref()
                .filter(|dependency| !instances.contains_key(*dependency))
                .map(|dependency| (node.name.clone(), dependency.clone()))
        })
        .collect::<Vec<_>>();
    if !unknown.is_empty() {
        return Err(Error::UnresolvedDependency(unknown));
    }

    let mut pending: BTreeMap<String, BTreeSet<String>> = instances
        .values()
        .map(|node| {
            (
                node.name.clone(),
                node.dependency.iter().cloned().collect::<BTreeSet<_>>(),
            )
        })
        .collect();

    let mut batches = Vec::new();
    while !pending.is_empty() {
        let ready = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| name.clone())
            .collect::<BTreeSet<_>>();

        if ready.is_empty() {
            let edges = pending
                .iter()
                .flat_map(|(name, deps)| {
                    deps.iter()
                        .map(move |dependency| (name.clone(), dependency.clone()))
                })
                .collect::<Vec<_>>();
            return Err(Error::CircularDependency(edges));
        }

        for name in &ready {
            pending.remove(name);
        }

        for deps in pending.values_mut() {
            deps.retain(|dependency| !ready.contains(dependency));
        }

        let nodes = ready
            .iter()
            .filter_map(|name| instances.remove(name))
            .filter(|node| !node.is_anchor())
            .collect::<Vec<_>>();
        if nodes.is_empty() {
            continue;
        }
        debug!(
            "resolved batch index={} nodes={}",
            batches.len(),
            ready.iter().cloned().collect::<Vec<_>>().join(",")
        );
        batches.push(Batch { nodes });
    }

    Ok(batches)
}
