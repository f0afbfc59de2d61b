use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::Normal;

use crate::layer::SoftMaxTree;
use crate::optimization::StochasticGradientDescentOptimizer;
use crate::tree::{NodeId, Topology};

const CLASS_COUNT: usize = 8;
const DIMENSIONALITY: usize = 16;

// Eight classes under two internal nodes (9 and 10) under the root (11).
fn class_tree() -> Topology {
    Topology::build(
        11,
        &[
            (11, vec![9, 10]),
            (9, vec![1, 2, 3, 4]),
            (10, vec![5, 6, 7, 8]),
        ],
    )
    .expect("tree should assemble")
}

fn generate_centroids() -> Vec<Array1<f32>> {
    (0..CLASS_COUNT)
        .map(|_| Array::random(DIMENSIONALITY, Normal::new(0., 1.).expect("distribution exists")))
        .collect()
}

fn sample_batch(centroids: &[Array1<f32>], batch_size: usize) -> (Array2<f32>, Vec<NodeId>) {
    let mut rng = rand::thread_rng();
    let noise = Normal::new(0., 0.25).expect("distribution exists");
    let mut inputs = Array2::zeros((batch_size, DIMENSIONALITY));
    let mut targets = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let class = rng.gen_range(0..centroids.len());
        let features = &centroids[class] + &Array::random(DIMENSIONALITY, noise);
        inputs.row_mut(i).assign(&features);
        targets.push(class + 1);
    }
    (inputs, targets)
}

fn classify(layer: &mut SoftMaxTree, features: ArrayView2<f32>) -> NodeId {
    // argmax by scoring every class in turn; fine for eight of them
    let mut best = (f32::NEG_INFINITY, 0);
    for class in 1..=CLASS_COUNT {
        let output = layer
            .forward(features, &[class])
            .expect("forward should succeed");
        if output[0] > best.0 {
            best = (output[0], class);
        }
    }
    best.1
}

pub fn demo() {
    let centroids = generate_centroids();
    let mut layer = SoftMaxTree::new("demo", DIMENSIONALITY, class_tree());
    println!("parameter count: {}", layer.parameter_count());

    let mut optimizer = StochasticGradientDescentOptimizer::new(0.1);
    let batch_size = 32;
    for step in 0..600 {
        let (inputs, targets) = sample_batch(&centroids, batch_size);
        let outputs = layer
            .forward(inputs.view(), &targets)
            .expect("forward should succeed");
        let mean_negative_log_likelihood = -outputs.sum() / batch_size as f32;

        // each sample's negated log-likelihood contributes −1 downstream;
        // the optimizer's update-total normalization does the averaging
        let upstream = Array1::from_elem(batch_size, -1.0);
        layer
            .backward(inputs.view(), &targets, upstream.view())
            .expect("backward should succeed");
        layer
            .accumulate_gradients(inputs.view(), &targets, 1.0)
            .expect("gradients should accumulate");
        optimizer.step(&mut layer);
        optimizer.unset_gradients(&mut layer);

        if step % 100 == 0 {
            println!(
                "step {}: mean negative log-likelihood {}",
                step, mean_negative_log_likelihood
            );
        }
    }
    println!("layer trained ({} steps)!", optimizer.step_count());

    let held_out = 200;
    let (inputs, targets) = sample_batch(&centroids, held_out);
    let mut correct = 0;
    for (i, &target) in targets.iter().enumerate() {
        let row = inputs.slice(s![i..i + 1, ..]);
        if classify(&mut layer, row) == target {
            correct += 1;
        }
    }
    println!("held-out accuracy: {}/{}", correct, held_out);
}
