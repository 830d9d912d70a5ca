//! Array-based decision trees.
//!
//! Both frozen ensembles store their trees as parallel arrays, the layout
//! scikit-learn exports: node `i` splits on `feature[i]` at `threshold[i]`,
//! samples with `x <= threshold` go to `left[i]`, the rest to `right[i]`, and a
//! negative `feature` marks a leaf whose payload is `value[i]`.
//!
//! Trees are checked once with [`TreeArrays::check`] when an artifact is
//! loaded. After that, traversal cannot index out of bounds or loop.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TreeError {
    #[error("tree has no nodes")]
    Empty,
    #[error("node arrays have inconsistent lengths (feature={feature}, threshold={threshold}, left={left}, right={right}, value={value})")]
    InconsistentLengths {
        feature: usize,
        threshold: usize,
        left: usize,
        right: usize,
        value: usize,
    },
    #[error("node {node} splits on feature {feature}, but the model only has {n_features} features")]
    FeatureOutOfRange {
        node: usize,
        feature: i32,
        n_features: usize,
    },
    #[error("node {node} has a child index that is out of range or does not point forward")]
    BadChild { node: usize },
    #[error("node {node} has a non-finite split threshold")]
    BadThreshold { node: usize },
}

/// One tree in parallel-array form, generic over the leaf payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeArrays<L> {
    pub feature: Vec<i32>,
    pub threshold: Vec<f64>,
    pub left: Vec<i32>,
    pub right: Vec<i32>,
    pub value: Vec<L>,
}

impl<L> TreeArrays<L> {
    pub fn n_nodes(&self) -> usize {
        self.feature.len()
    }

    pub fn n_leaves(&self) -> usize {
        self.feature.iter().filter(|&&f| f < 0).count()
    }

    /// Structural check run once at load time.
    ///
    /// Children must point strictly forward, which rules out cycles and
    /// guarantees every traversal ends at a leaf.
    pub fn check(&self, n_features: usize) -> Result<(), TreeError> {
        let n = self.feature.len();
        if n == 0 {
            return Err(TreeError::Empty);
        }
        if self.threshold.len() != n || self.left.len() != n || self.right.len() != n || self.value.len() != n {
            return Err(TreeError::InconsistentLengths {
                feature: n,
                threshold: self.threshold.len(),
                left: self.left.len(),
                right: self.right.len(),
                value: self.value.len(),
            });
        }

        for node in 0..n {
            let feature = self.feature[node];
            if feature < 0 {
                continue;
            }
            if feature as usize >= n_features {
                return Err(TreeError::FeatureOutOfRange {
                    node,
                    feature,
                    n_features,
                });
            }
            if !self.threshold[node].is_finite() {
                return Err(TreeError::BadThreshold { node });
            }
            for child in [self.left[node], self.right[node]] {
                if child <= node as i32 || child as usize >= n {
                    return Err(TreeError::BadChild { node });
                }
            }
        }
        Ok(())
    }

    /// Index of the leaf reached by `sample`.
    pub fn leaf_index(&self, sample: ArrayView1<f64>) -> usize {
        let mut idx = 0usize;
        loop {
            let feature = self.feature[idx];
            if feature < 0 {
                return idx;
            }
            idx = if sample[feature as usize] <= self.threshold[idx] {
                self.left[idx] as usize
            } else {
                self.right[idx] as usize
            };
        }
    }

    /// Leaf payload reached by `sample`.
    pub fn leaf(&self, sample: ArrayView1<f64>) -> &L {
        &self.value[self.leaf_index(sample)]
    }

    /// Longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        // Children point forward, so a reverse sweep sees them before their parent.
        let mut depth = vec![0usize; self.n_nodes()];
        for node in (0..self.n_nodes()).rev() {
            if self.feature[node] >= 0 {
                let left = depth[self.left[node] as usize];
                let right = depth[self.right[node] as usize];
                depth[node] = 1 + left.max(right);
            }
        }
        depth.first().copied().unwrap_or(0)
    }
}
