use crate::layer::SoftMaxTree;

/// Plain gradient descent over a tree-softmax layer's parameters. Only the
/// families recorded in the layer's update totals get visited, and each
/// family's accumulated gradient is averaged over the scale it accumulated,
/// so a node touched by many samples in the batch doesn't take an
/// outsized step.
pub struct StochasticGradientDescentOptimizer {
    learning_rate: f32,
    step_count: usize,
}

impl StochasticGradientDescentOptimizer {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            step_count: 0,
        }
    }

    pub fn step(&mut self, layer: &mut SoftMaxTree) {
        layer.apply_updates(self.learning_rate);
        self.step_count += 1;
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn unset_gradients(&self, layer: &mut SoftMaxTree) {
        layer.zero_gradients();
    }
}
