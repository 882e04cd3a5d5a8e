use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Node of a regression tree. Children are indices into the owning arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        prediction: f64,
        samples: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        gain: f64,
        samples: usize,
    },
}

impl TreeNode {
    pub fn samples(&self) -> usize {
        match self {
            TreeNode::Leaf { samples, .. } | TreeNode::Split { samples, .. } => *samples,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, TreeNode::Leaf { .. })
    }
}

/// Arena-backed regression tree; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn leaf(prediction: f64, samples: usize) -> Self {
        Self {
            nodes: vec![TreeNode::Leaf { prediction, samples }],
        }
    }

    /// Output for a standardized row.
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { prediction, .. } => return *prediction,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], idx: usize) -> usize {
            match &nodes[idx] {
                TreeNode::Leaf { .. } => 0,
                TreeNode::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Growth limits for one tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub min_samples_split: usize,
    pub lambda: f64,
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Second-order tree grower over a standardized feature matrix.
pub(crate) struct TreeBuilder<'a> {
    x: &'a Array2<f64>,
    grad: &'a [f64],
    hess: &'a [f64],
    features: &'a [usize],
    params: TreeParams,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        x: &'a Array2<f64>,
        grad: &'a [f64],
        hess: &'a [f64],
        features: &'a [usize],
        params: TreeParams,
    ) -> Self {
        Self {
            x,
            grad,
            hess,
            features,
            params,
        }
    }

    /// Grow a tree on `rows` (may contain repeats from bootstrap sampling).
    pub fn build(&self, rows: &[usize]) -> RegressionTree {
        let mut nodes = Vec::new();
        self.grow(rows, 0, &mut nodes);
        RegressionTree { nodes }
    }

    fn leaf_value(&self, rows: &[usize]) -> f64 {
        let g: f64 = rows.iter().map(|&i| self.grad[i]).sum();
        let h: f64 = rows.iter().map(|&i| self.hess[i]).sum();
        newton_step(g, h, self.params.lambda)
    }

    fn grow(&self, rows: &[usize], depth: usize, nodes: &mut Vec<TreeNode>) -> usize {
        let samples = rows.len();
        let make_leaf = |nodes: &mut Vec<TreeNode>| {
            nodes.push(TreeNode::Leaf {
                prediction: self.leaf_value(rows),
                samples,
            });
            nodes.len() - 1
        };

        if depth >= self.params.max_depth || samples < self.params.min_samples_split {
            return make_leaf(nodes);
        }

        let Some(best) = self.best_split(rows) else {
            return make_leaf(nodes);
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&i| self.x[[i, best.feature]] <= best.threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            return make_leaf(nodes);
        }

        let node_idx = nodes.len();
        nodes.push(TreeNode::Leaf {
            prediction: 0.0,
            samples: 0,
        }); // placeholder

        let left = self.grow(&left_rows, depth + 1, nodes);
        let right = self.grow(&right_rows, depth + 1, nodes);

        nodes[node_idx] = TreeNode::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
            gain: best.gain,
            samples,
        };
        node_idx
    }

    /// Exhaustive threshold search over the candidate columns. Only splits
    /// with strictly positive gain and `min_samples_leaf` on both sides count.
    fn best_split(&self, rows: &[usize]) -> Option<SplitCandidate> {
        let lambda = self.params.lambda;
        let min_leaf = self.params.min_samples_leaf.max(1);
        let g_total: f64 = rows.iter().map(|&i| self.grad[i]).sum();
        let h_total: f64 = rows.iter().map(|&i| self.hess[i]).sum();
        let parent_score = g_total * g_total / (h_total + lambda);

        let mut best: Option<SplitCandidate> = None;
        let mut sorted = rows.to_vec();

        for &feature in self.features {
            // NaN sorts after every finite value
            sorted.sort_by(|&a, &b| self.x[[a, feature]].total_cmp(&self.x[[b, feature]]));

            let mut g_left = 0.0;
            let mut h_left = 0.0;
            for pos in 0..sorted.len() - 1 {
                let idx = sorted[pos];
                g_left += self.grad[idx];
                h_left += self.hess[idx];

                let value = self.x[[idx, feature]];
                let next = self.x[[sorted[pos + 1], feature]];
                // equal values cannot be separated, and a NaN neighbour gives no threshold
                if value == next || value.is_nan() || next.is_nan() {
                    continue;
                }

                let n_left = pos + 1;
                if n_left < min_leaf || sorted.len() - n_left < min_leaf {
                    continue;
                }

                let g_right = g_total - g_left;
                let h_right = h_total - h_left;
                let gain = g_left * g_left / (h_left + lambda) + g_right * g_right / (h_right + lambda)
                    - parent_score;

                if gain > 0.0 && best.map_or(true, |b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: (value + next) / 2.0,
                        gain,
                    });
                }
            }
        }

        best
    }
}

/// Closed-form leaf weight `-G / (H + lambda)`; 0 when the denominator
/// vanishes.
pub fn newton_step(g: f64, h: f64, lambda: f64) -> f64 {
    let denom = h + lambda;
    if denom <= 0.0 || !denom.is_finite() {
        return 0.0;
    }
    -g / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_depth: usize) -> TreeParams {
        TreeParams {
            max_depth,
            min_samples_leaf: 1,
            min_samples_split: 2,
            lambda: 1.0,
        }
    }

    #[test]
    fn test_newton_step() {
        assert_eq!(newton_step(2.0, 3.0, 1.0), -0.5);
        assert_eq!(newton_step(1.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_nan_values_never_become_thresholds() {
        let x = Array2::from_shape_vec(
            (8, 1),
            vec![-3.0, -2.0, f64::NAN, -1.0, 1.0, f64::NAN, 2.0, 3.0],
        )
        .unwrap();
        let grad = vec![0.5, 0.5, 0.0, 0.5, -0.5, 0.0, -0.5, -0.5];
        let hess = vec![0.25; 8];
        let rows: Vec<usize> = (0..8).collect();
        let features = [0usize];
        let tree = TreeBuilder::new(&x, &grad, &hess, &features, params(1)).build(&rows);

        match tree.root() {
            TreeNode::Split { threshold, .. } => assert_eq!(*threshold, 0.0),
            other => panic!("expected a split, got {:?}", other),
        }
    }

    #[test]
    fn test_single_split_separates_gradients() {
        // rows 0..4 have x < 0 and positive gradient, rows 4..8 the opposite
        let x = Array2::from_shape_vec((8, 1), vec![-4.0, -3.0, -2.0, -1.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
        let grad = vec![0.5, 0.5, 0.5, 0.5, -0.5, -0.5, -0.5, -0.5];
        let hess = vec![0.25; 8];
        let rows: Vec<usize> = (0..8).collect();
        let features = [0usize];
        let tree = TreeBuilder::new(&x, &grad, &hess, &features, params(1)).build(&rows);

        match tree.root() {
            TreeNode::Split { feature, threshold, samples, gain, .. } => {
                assert_eq!(*feature, 0);
                assert_eq!(*threshold, 0.0);
                assert_eq!(*samples, 8);
                assert!(*gain > 0.0);
            }
            other => panic!("expected split, got {:?}", other),
        }
        assert!(tree.predict(&[-2.0]) < 0.0);
        assert!(tree.predict(&[2.0]) > 0.0);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.leaf_count(), 2);
    }

    #[test]
    fn test_tied_values_are_not_split() {
        let x = Array2::from_shape_vec((4, 1), vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        let grad = vec![1.0, -1.0, 1.0, -1.0];
        let hess = vec![0.25; 4];
        let rows: Vec<usize> = (0..4).collect();
        let tree = TreeBuilder::new(&x, &grad, &hess, &[0], params(3)).build(&rows);
        assert!(tree.root().is_leaf());
    }

    #[test]
    fn test_min_samples_split_forces_leaf() {
        let x = Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let grad = vec![1.0, 1.0, -1.0, -1.0];
        let hess = vec![0.25; 4];
        let rows: Vec<usize> = (0..4).collect();
        let p = TreeParams {
            min_samples_split: 5,
            ..params(3)
        };
        let tree = TreeBuilder::new(&x, &grad, &hess, &[0], p).build(&rows);
        assert!(tree.root().is_leaf());
        assert_eq!(tree.root().samples(), 4);
    }

    #[test]
    fn test_tree_serde_tagged() {
        let tree = RegressionTree::leaf(0.25, 10);
        let json = serde_json::to_string(&tree).unwrap();
        assert!(json.contains("\"kind\":\"leaf\""));
        let back: RegressionTree = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
    }
}
