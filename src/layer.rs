#![allow(dead_code)]

use std::collections::HashMap;

use log::{debug, info};
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::error::LayerError;
use crate::tree::{Family, NodeId, Topology};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CacheStage {
    Empty,
    Forwarded,
    Differentiated,
}

/// Scratch shared between the passes: the forward pass fills
/// `log_probabilities` with one log-softmax vector per visited node, the
/// input-gradient pass turns those into `local_gradients`, and the
/// parameter-gradient pass reads the latter back. Buffers grow on demand and
/// never shrink; `spans` records where each sample's stretch starts, and
/// `stage` says which passes the current contents are good for.
struct PathCache {
    log_probabilities: Vec<f32>,
    local_gradients: Vec<f32>,
    spans: Vec<usize>,
    cursor: usize,
    stage: CacheStage,
}

impl PathCache {
    fn new() -> PathCache {
        PathCache {
            log_probabilities: Vec::new(),
            local_gradients: Vec::new(),
            spans: Vec::new(),
            cursor: 0,
            stage: CacheStage::Empty,
        }
    }

    fn begin_forward(&mut self) {
        self.stage = CacheStage::Empty;
        self.spans.clear();
        self.spans.push(0);
        self.cursor = 0;
    }

    fn record(&mut self, log_softmax: &Array1<f32>) {
        let needed = self.cursor + log_softmax.len();
        if self.log_probabilities.len() < needed {
            debug!("growing path cache to {} entries", needed);
            self.log_probabilities.resize(needed, 0.0);
        }
        for (slot, &value) in self.log_probabilities[self.cursor..needed]
            .iter_mut()
            .zip(log_softmax.iter())
        {
            *slot = value;
        }
        self.cursor = needed;
    }

    fn end_sample(&mut self) {
        self.spans.push(self.cursor);
    }

    fn finish_forward(&mut self) {
        self.stage = CacheStage::Forwarded;
    }

    fn span(&self, sample: usize) -> (usize, usize) {
        (self.spans[sample], self.spans[sample + 1])
    }

    fn usable_for_backward(&self, batch_size: usize) -> bool {
        self.stage != CacheStage::Empty && self.spans.len() == batch_size + 1
    }

    fn usable_for_accumulation(&self, batch_size: usize) -> bool {
        self.stage == CacheStage::Differentiated && self.spans.len() == batch_size + 1
    }

    fn begin_differentiation(&mut self) {
        // a failed pass must not leave stale local gradients looking current
        self.stage = CacheStage::Forwarded;
        let total = self.spans.last().copied().unwrap_or(0);
        if self.local_gradients.len() < total {
            self.local_gradients.resize(total, 0.0);
        }
    }

    /// Turn the cached log-softmax vector at `start` into the local softmax
    /// gradient: −exp(logp_d)·g everywhere, plus g at the branch actually
    /// taken. Returns the freshly written stretch.
    fn differentiate(
        &mut self,
        start: usize,
        width: usize,
        position: usize,
        upstream: f32,
    ) -> &[f32] {
        for offset in 0..width {
            self.local_gradients[start + offset] =
                -self.log_probabilities[start + offset].exp() * upstream;
        }
        self.local_gradients[start + position] += upstream;
        &self.local_gradients[start..start + width]
    }

    fn finish_differentiation(&mut self) {
        self.stage = CacheStage::Differentiated;
    }

    fn local_gradient(&self, start: usize, width: usize) -> &[f32] {
        &self.local_gradients[start..start + width]
    }
}

/// A tree-softmax output layer: the probability of a class is the product of
/// local softmax probabilities along the path from the root down to the
/// class's leaf, so scoring a target only ever touches the families on that
/// one path. Parameters live in flat tables, one weight row and bias entry
/// per child slot, addressed through the topology's family offsets.
pub struct SoftMaxTree {
    identifier: String,
    tree: Topology,
    in_dimensionality: usize,
    weights: Array2<f32>,
    biases: Array1<f32>,
    weight_gradients: Array2<f32>,
    bias_gradients: Array1<f32>,
    update_totals: HashMap<NodeId, f32>,
    cache: PathCache,
}

impl SoftMaxTree {
    pub fn from_weights(
        identifier: &str,
        tree: Topology,
        weights: Array2<f32>,
        biases: Array1<f32>,
    ) -> SoftMaxTree {
        assert_eq!(
            weights.nrows(),
            tree.slot_count(),
            "one weight row per child slot"
        );
        assert_eq!(
            biases.len(),
            tree.slot_count(),
            "one bias entry per child slot"
        );
        let in_dimensionality = weights.ncols();
        let weight_gradients = Array2::zeros(weights.raw_dim());
        let bias_gradients = Array1::zeros(biases.raw_dim());
        SoftMaxTree {
            identifier: identifier.to_owned(),
            tree,
            in_dimensionality,
            weights,
            biases,
            weight_gradients,
            bias_gradients,
            update_totals: HashMap::new(),
            cache: PathCache::new(),
        }
    }

    pub fn new(identifier: &str, in_dimensionality: usize, tree: Topology) -> SoftMaxTree {
        let k = 1. / (in_dimensionality as f32);
        let weights = Array::random(
            (tree.slot_count(), in_dimensionality),
            Uniform::new(-k.sqrt(), k.sqrt()),
        );
        let biases = Array::random((tree.slot_count(),), Uniform::new(-k.sqrt(), k.sqrt()));
        info!(
            "creating tree-softmax layer {} with {} slots over {} features",
            identifier,
            tree.slot_count(),
            in_dimensionality
        );
        Self::from_weights(identifier, tree, weights, biases)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn tree(&self) -> &Topology {
        &self.tree
    }

    pub fn in_dimensionality(&self) -> usize {
        self.in_dimensionality
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn biases(&self) -> &Array1<f32> {
        &self.biases
    }

    pub fn weight_gradients(&self) -> &Array2<f32> {
        &self.weight_gradients
    }

    pub fn bias_gradients(&self) -> &Array1<f32> {
        &self.bias_gradients
    }

    /// Accumulated scale per parent node, for whoever normalizes the sparse
    /// gradient updates (only families on sampled paths get touched).
    pub fn update_totals(&self) -> &HashMap<NodeId, f32> {
        &self.update_totals
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn check_batch(&self, input: &ArrayView2<f32>, targets: &[NodeId]) -> Result<(), LayerError> {
        let (batch_size, dimensionality) = input.dim();
        if dimensionality != self.in_dimensionality {
            return Err(LayerError::DimensionalityMismatch {
                expected: self.in_dimensionality,
                actual: dimensionality,
            });
        }
        if targets.len() != batch_size {
            return Err(LayerError::BatchSizeMismatch {
                inputs: batch_size,
                targets: targets.len(),
            });
        }
        Ok(())
    }

    /// The log-likelihood of each sample's target class: walk from the leaf
    /// to the root, and at every family on the way compute the local affine
    /// projection, log-softmax it, and take the entry for the branch the path
    /// came up through. The full local log-softmax vectors are cached for the
    /// backward passes.
    pub fn forward(
        &mut self,
        input: ArrayView2<f32>,
        targets: &[NodeId],
    ) -> Result<Array1<f32>, LayerError> {
        self.check_batch(&input, targets)?;
        let batch_size = input.nrows();

        self.cache.begin_forward();
        let mut output = Array1::zeros(batch_size);
        for (i, (features, &class)) in input.rows().into_iter().zip(targets.iter()).enumerate() {
            let mut log_likelihood = 0.0;
            for step in self.tree.walk(class) {
                let step = step?;
                let Family {
                    first_slot,
                    child_count,
                } = step.family;
                let weights = self.weights.slice(s![first_slot..first_slot + child_count, ..]);
                let biases = self.biases.slice(s![first_slot..first_slot + child_count]);
                let mut local = weights.dot(&features) + &biases;
                // subtract the maximum before exponentiating, so that the
                // normalizer can't overflow
                let max = local.fold(f32::NEG_INFINITY, |running, &value| running.max(value));
                let normalizer = max + local.mapv(|value| (value - max).exp()).sum().ln();
                local -= normalizer;
                log_likelihood += local[step.position];
                self.cache.record(&local);
            }
            output[i] = log_likelihood;
            self.cache.end_sample();
        }
        self.cache.finish_forward();
        Ok(output)
    }

    /// Gradient of the loss with respect to the input features, given the
    /// per-sample downstream gradient. Must follow a `forward` over the same
    /// batch: the walk replays against the cached spans, and running past
    /// what forward recorded is the stale-cache condition.
    pub fn backward(
        &mut self,
        input: ArrayView2<f32>,
        targets: &[NodeId],
        output_gradients: ArrayView1<f32>,
    ) -> Result<Array2<f32>, LayerError> {
        self.check_batch(&input, targets)?;
        let batch_size = input.nrows();
        if output_gradients.len() != batch_size {
            return Err(LayerError::GradientBatchMismatch {
                inputs: batch_size,
                gradients: output_gradients.len(),
            });
        }
        if !self.cache.usable_for_backward(batch_size) {
            return Err(LayerError::StaleCache);
        }

        self.cache.begin_differentiation();
        let mut input_gradients = Array2::zeros((batch_size, self.in_dimensionality));
        for (i, &class) in targets.iter().enumerate() {
            let upstream = output_gradients[i];
            let (mut cursor, end) = self.cache.span(i);
            for step in self.tree.walk(class) {
                let step = step?;
                let Family {
                    first_slot,
                    child_count,
                } = step.family;
                if cursor + child_count > end {
                    return Err(LayerError::StaleCache);
                }
                let local = ArrayView1::from(self.cache.differentiate(
                    cursor,
                    child_count,
                    step.position,
                    upstream,
                ));
                let weights = self.weights.slice(s![first_slot..first_slot + child_count, ..]);
                let contribution = weights.t().dot(&local);
                let mut row = input_gradients.row_mut(i);
                row += &contribution;
                cursor += child_count;
            }
        }
        self.cache.finish_differentiation();
        Ok(input_gradients)
    }

    /// Accumulate parameter gradients from the local gradients the
    /// input-gradient pass left in the cache: per visited family, the outer
    /// product of the local gradient and the sample's features into the
    /// weight-gradient slice, the local gradient itself into the
    /// bias-gradient slice, both times `scale`; and `scale` into the
    /// per-parent update total.
    pub fn accumulate_gradients(
        &mut self,
        input: ArrayView2<f32>,
        targets: &[NodeId],
        scale: f32,
    ) -> Result<(), LayerError> {
        self.check_batch(&input, targets)?;
        let batch_size = input.nrows();
        if !self.cache.usable_for_accumulation(batch_size) {
            return Err(LayerError::StaleCache);
        }

        for (i, (features, &class)) in input.rows().into_iter().zip(targets.iter()).enumerate() {
            let (mut cursor, end) = self.cache.span(i);
            for step in self.tree.walk(class) {
                let step = step?;
                let Family {
                    first_slot,
                    child_count,
                } = step.family;
                if cursor + child_count > end {
                    return Err(LayerError::StaleCache);
                }
                let local = self.cache.local_gradient(cursor, child_count);
                let mut weight_slice = self
                    .weight_gradients
                    .slice_mut(s![first_slot..first_slot + child_count, ..]);
                for (offset, &gradient) in local.iter().enumerate() {
                    weight_slice
                        .row_mut(offset)
                        .scaled_add(scale * gradient, &features);
                }
                let mut bias_slice = self
                    .bias_gradients
                    .slice_mut(s![first_slot..first_slot + child_count]);
                for (offset, &gradient) in local.iter().enumerate() {
                    bias_slice[offset] += scale * gradient;
                }
                *self.update_totals.entry(step.parent).or_insert(0.0) += scale;
                cursor += child_count;
            }
        }
        Ok(())
    }

    /// Descend along the accumulated gradients, visiting only the families
    /// that were actually touched, each normalized by the scale it
    /// accumulated. Gradient buffers are left intact; `zero_gradients`
    /// resets them.
    pub fn apply_updates(&mut self, learning_rate: f32) {
        for (&parent, &total) in &self.update_totals {
            if total <= 0.0 {
                continue;
            }
            let Ok(family) = self.tree.family(parent) else {
                continue;
            };
            let Family {
                first_slot,
                child_count,
            } = family;
            let step_size = -learning_rate / total;
            self.weights
                .slice_mut(s![first_slot..first_slot + child_count, ..])
                .scaled_add(
                    step_size,
                    &self
                        .weight_gradients
                        .slice(s![first_slot..first_slot + child_count, ..]),
                );
            self.biases
                .slice_mut(s![first_slot..first_slot + child_count])
                .scaled_add(
                    step_size,
                    &self
                        .bias_gradients
                        .slice(s![first_slot..first_slot + child_count]),
                );
        }
    }

    pub fn zero_gradients(&mut self) {
        self.weight_gradients.fill(0.0);
        self.bias_gradients.fill(0.0);
        self.update_totals.clear();
    }
}
