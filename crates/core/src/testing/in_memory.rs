use std::collections::HashMap;

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::source::{ExpertWeightSource, ExpertWeights, Projection};

/// In-memory original-model collaborator with deterministic seeded weights.
pub struct InMemoryExpertSource {
    experts: Vec<ExpertWeights>,
    router: Tensor,
    shared: ExpertWeights,
    shared_gate: Tensor,
    freq: Vec<f64>,
    fisher: HashMap<(Projection, usize), f64>,
    scales: HashMap<(Projection, usize), Tensor>,
}

impl InMemoryExpertSource {
    /// Build from explicit tensors.
    pub fn new(
        experts: Vec<ExpertWeights>,
        router: Tensor,
        shared: ExpertWeights,
        shared_gate: Tensor,
        freq: Vec<f64>,
    ) -> Self {
        Self {
            experts,
            router,
            shared,
            shared_gate,
            freq,
            fisher: HashMap::new(),
            scales: HashMap::new(),
        }
    }

    /// Deterministic pseudo-random layer. The shared expert uses an
    /// intermediate size of `intermediate·3/2`, following the common
    /// wider-shared-expert layout.
    pub fn seeded(
        num_experts: usize,
        intermediate: usize,
        hidden: usize,
        seed: u64,
        device: &Device,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut mk = |rows: usize, cols: usize| {
            let data: Vec<f32> = (0..rows * cols)
                .map(|_| rng.gen_range(-0.5f32..0.5) * 0.4)
                .collect();
            Tensor::from_vec(data, (rows, cols), device).unwrap()
        };

        let experts = (0..num_experts)
            .map(|_| ExpertWeights {
                gate: mk(intermediate, hidden),
                up: mk(intermediate, hidden),
                down: mk(hidden, intermediate),
            })
            .collect();

        let shared_intermediate = intermediate * 3 / 2;
        let shared = ExpertWeights {
            gate: mk(shared_intermediate, hidden),
            up: mk(shared_intermediate, hidden),
            down: mk(hidden, shared_intermediate),
        };

        let router = mk(num_experts, hidden);
        let shared_gate = mk(1, hidden);

        Self::new(experts, router, shared, shared_gate, vec![1.0; num_experts])
    }

    pub fn set_frequency(&mut self, freq: Vec<f64>) {
        self.freq = freq;
    }

    /// Attach the same Fisher scalar to every (projection, expert) pair.
    pub fn set_fisher_uniform(&mut self, value: f64) {
        for projection in Projection::ALL {
            for i in 0..self.experts.len() {
                self.fisher.insert((projection, i), value);
            }
        }
    }

    pub fn set_fisher(&mut self, projection: Projection, expert: usize, value: f64) {
        self.fisher.insert((projection, expert), value);
    }

    pub fn set_scale(&mut self, projection: Projection, expert: usize, scale: Tensor) {
        self.scales.insert((projection, expert), scale);
    }
}

impl ExpertWeightSource for InMemoryExpertSource {
    fn num_experts(&self) -> usize {
        self.experts.len()
    }

    fn expert_weight(&self, projection: Projection, expert: usize) -> Result<Tensor> {
        Ok(self.experts[expert].get(projection).clone())
    }

    fn router_weight(&self) -> Result<Tensor> {
        Ok(self.router.clone())
    }

    fn shared_expert_weight(&self, projection: Projection) -> Result<Tensor> {
        Ok(self.shared.get(projection).clone())
    }

    fn shared_expert_gate_weight(&self) -> Result<Tensor> {
        Ok(self.shared_gate.clone())
    }

    fn expert_frequency(&self) -> &[f64] {
        &self.freq
    }

    fn scale(&self, projection: Projection, expert: usize) -> Option<Tensor> {
        self.scales.get(&(projection, expert)).cloned()
    }

    fn fisher(&self, projection: Projection, expert: usize) -> Option<f64> {
        self.fisher.get(&(projection, expert)).copied()
    }
}
