use std::collections::HashMap;

use serde::Serialize;

use crate::matrix::ConnectivityMatrix;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub weight: f64,
}

/// Directed graph of a thresholded connectivity matrix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkGraph {
    pub threshold: f64,
    nodes: Vec<String>,
    edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDegree {
    pub node: String,
    pub in_degree: usize,
    pub out_degree: usize,
    pub in_weight: f64,
    pub out_weight: f64,
}

impl NetworkGraph {
    /// Every channel is a node; `s→t` is an edge when `M[s,t] > threshold`.
    pub fn from_matrix(matrix: &ConnectivityMatrix, threshold: f64) -> Self {
        let ch = matrix.channels();
        let edges = matrix
            .off_diagonal()
            .filter(|&(_, _, v)| v > threshold)
            .map(|(i, j, weight)| Edge {
                source: ch[i].clone(),
                target: ch[j].clone(),
                weight,
            })
            .collect();
        Self {
            threshold,
            nodes: ch.to_vec(),
            edges,
        }
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn has_edge(&self, source: &str, target: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.source == source && e.target == target)
    }

    pub fn out_degree(&self, node: &str) -> usize {
        self.edges.iter().filter(|e| e.source == node).count()
    }

    pub fn in_degree(&self, node: &str) -> usize {
        self.edges.iter().filter(|e| e.target == node).count()
    }

    pub fn successors(&self, node: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.source == node)
            .map(|e| e.target.as_str())
            .collect()
    }

    /// Degrees of every node, in node order.
    pub fn degrees(&self) -> Vec<NodeDegree> {
        let mut acc: HashMap<&str, NodeDegree> = self
            .nodes
            .iter()
            .map(|n| {
                (
                    n.as_str(),
                    NodeDegree {
                        node: n.clone(),
                        in_degree: 0,
                        out_degree: 0,
                        in_weight: 0.0,
                        out_weight: 0.0,
                    },
                )
            })
            .collect();
        for e in &self.edges {
            if let Some(d) = acc.get_mut(e.source.as_str()) {
                d.out_degree += 1;
                d.out_weight += e.weight;
            }
            if let Some(d) = acc.get_mut(e.target.as_str()) {
                d.in_degree += 1;
                d.in_weight += e.weight;
            }
        }
        self.nodes
            .iter()
            .filter_map(|n| acc.remove(n.as_str()))
            .collect()
    }
}
