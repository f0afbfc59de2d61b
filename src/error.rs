use thiserror::Error;

use crate::tree::NodeId;

/// Ways the topology tables can turn out to be malformed once we try to walk
/// them. Any of these aborts the whole batch call; they indicate a bug in the
/// supplied tables, not a condition worth retrying.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("node id {0} is not a node of the tree")]
    UnknownNode(NodeId),
    #[error("node {0} has no parent in the tree")]
    MissingParent(NodeId),
    #[error("node {0} has no registered children")]
    MissingFamily(NodeId),
    #[error("node {node} claims position {position} in a family of {child_count}")]
    PositionOutOfFamily {
        node: NodeId,
        position: usize,
        child_count: usize,
    },
    #[error("node {0} is already placed under a parent")]
    AlreadyPlaced(NodeId),
    #[error("the path from class {class} exceeds the longest-path bound {limit}")]
    PathTooLong { class: NodeId, limit: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayerError {
    #[error("input feature dimensionality {actual} does not match the layer's {expected}")]
    DimensionalityMismatch { expected: usize, actual: usize },
    #[error("batch size mismatch: {inputs} input rows but {targets} targets")]
    BatchSizeMismatch { inputs: usize, targets: usize },
    #[error("gradient batch length {gradients} does not match {inputs} input rows")]
    GradientBatchMismatch { inputs: usize, gradients: usize },
    #[error("backward pass does not match the cached forward pass")]
    StaleCache,
    #[error(transparent)]
    Tree(#[from] TreeError),
}
