//! Policy observations.
//!
//! One step is `[ang_vel, projected_gravity, dof_pos, dof_vel, actions, rescale]`
//! with per-channel scales and uniform noise. Steps are stacked into a
//! fixed-depth history, newest last, and the result is clipped.

use nalgebra as na;
use rand::Rng;

use crate::config::{NoiseSection, ObsScales};
use crate::state::SimulationState;

/// Noise amplitude for every entry of one observation step.
pub fn noise_scale_vec(noise: &NoiseSection, scales: &ObsScales, num_dofs: usize, num_actions: usize) -> Vec<f32> {
    let level = noise.noise_level;
    let n = &noise.noise_scales;
    let mut vec = Vec::with_capacity(3 + 3 + 2 * num_dofs + num_actions + 1);
    vec.extend(std::iter::repeat(n.ang_vel * level * scales.ang_vel).take(3));
    vec.extend(std::iter::repeat(n.gravity * level).take(3));
    vec.extend(std::iter::repeat(n.dof_pos * level * scales.dof_pos).take(num_dofs));
    vec.extend(std::iter::repeat(n.dof_vel * level * scales.dof_vel).take(num_dofs));
    vec.extend(std::iter::repeat(0.0).take(num_actions + 1));
    vec
}

/// Stacked history of `depth` steps, each `width` wide. Row-major per instance,
/// oldest step first.
#[derive(Clone, Debug)]
pub struct ObservationHistory {
    depth: usize,
    width: usize,
    buf: na::DMatrix<f32>,
}

impl ObservationHistory {
    pub fn new(num_envs: usize, depth: usize, width: usize) -> Self {
        Self {
            depth,
            width,
            buf: na::DMatrix::zeros(num_envs, depth * width),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Drop the oldest step of every instance and append `step` (N x width).
    pub fn push(&mut self, step: &na::DMatrix<f32>) {
        let w = self.width;
        let total = self.depth * w;
        for env in 0..self.buf.nrows() {
            for k in 0..total - w {
                self.buf[(env, k)] = self.buf[(env, k + w)];
            }
            for k in 0..w {
                self.buf[(env, total - w + k)] = step[(env, k)];
            }
        }
    }

    /// Step `index` of instance `env`, 0 being the oldest.
    pub fn step(&self, env: usize, index: usize) -> Vec<f32> {
        let start = index * self.width;
        (start..start + self.width).map(|k| self.buf[(env, k)]).collect()
    }

    pub fn as_matrix(&self) -> &na::DMatrix<f32> {
        &self.buf
    }
}

pub struct ObservationPipeline {
    scales: ObsScales,
    add_noise: bool,
    noise_vec: Vec<f32>,
    clip: f32,
    one_step: na::DMatrix<f32>,
    pub history: ObservationHistory,
}

impl ObservationPipeline {
    pub fn new(
        num_envs: usize,
        num_dofs: usize,
        num_actions: usize,
        depth: usize,
        noise: &NoiseSection,
        scales: &ObsScales,
        clip: f32,
    ) -> Self {
        let noise_vec = noise_scale_vec(noise, scales, num_dofs, num_actions);
        let width = noise_vec.len();
        Self {
            scales: scales.clone(),
            add_noise: noise.add_noise,
            noise_vec,
            clip,
            one_step: na::DMatrix::zeros(num_envs, width),
            history: ObservationHistory::new(num_envs, depth, width),
        }
    }

    pub fn num_one_step_obs(&self) -> usize {
        self.noise_vec.len()
    }

    pub fn noise_vec(&self) -> &[f32] {
        &self.noise_vec
    }

    /// Assemble, perturb and stack one observation step. Instances inside their
    /// warm-up window observe all zeros.
    pub fn compute<R: Rng + ?Sized>(
        &mut self,
        state: &SimulationState,
        actions: &na::DMatrix<f32>,
        rescale: &[f32],
        unactuated_steps: f32,
        rng: &mut R,
    ) -> na::DMatrix<f32> {
        let dofs = state.num_dofs;
        let num_actions = actions.ncols();
        let width = self.noise_vec.len();

        for env in 0..state.num_envs {
            let mut row = Vec::with_capacity(width);
            row.extend((state.base_ang_vel[env] * self.scales.ang_vel).iter().copied());
            row.extend(state.projected_gravity[env].iter().copied());
            row.extend((0..dofs).map(|j| state.dof_pos[(env, j)] * self.scales.dof_pos));
            row.extend((0..dofs).map(|j| state.dof_vel[(env, j)] * self.scales.dof_vel));
            row.extend((0..num_actions).map(|j| actions[(env, j)]));
            row.push(rescale[env] + (rng.random::<f32>() - 0.5) * 0.05);

            if self.add_noise {
                for (value, amp) in row.iter_mut().zip(&self.noise_vec) {
                    *value += (2.0 * rng.random::<f32>() - 1.0) * amp;
                }
            }

            let live = state.is_actuated(env, unactuated_steps);
            for (k, value) in row.into_iter().enumerate() {
                self.one_step[(env, k)] = if live { value } else { 0.0 };
            }
        }

        self.history.push(&self.one_step);
        let clip = self.clip;
        self.history.as_matrix().map(|v| v.clamp(-clip, clip))
    }
}
