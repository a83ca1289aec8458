//! Assistive-force and action-scale curriculum.
//!
//! Each instance starts with a vertical pull on its base and a generous action
//! rescale. Finishing an episode with the head above the threshold weakens
//! both for that instance. Neither ever grows back.

use nalgebra as na;

use crate::config::CurriculumSection;
use crate::state::SimulationState;

#[derive(Clone, Debug)]
pub struct CurriculumState {
    pub force: Vec<f32>,
    pub action_rescale: Vec<f32>,
    params: CurriculumSection,
}

impl CurriculumState {
    pub fn new(num_envs: usize, params: &CurriculumSection, action_scale: f32) -> Self {
        Self {
            force: vec![params.force; num_envs],
            action_rescale: vec![action_scale; num_envs],
            params: params.clone(),
        }
    }

    /// Advance the instances in `ids` whose last head height clears the threshold.
    pub fn update(&mut self, ids: &[usize], head_heights: &[f32]) {
        let p = &self.params;
        let mut advanced = 0;
        for &env in ids {
            if head_heights[env] > p.threshold_height {
                self.force[env] = (self.force[env] - p.force_step).max(0.0);
                self.action_rescale[env] = (self.action_rescale[env] - p.action_scale_step).max(p.min_action_scale);
                advanced += 1;
            }
        }
        if advanced > 0 {
            log::debug!("curriculum advanced {} of {} reset instances", advanced, ids.len());
        }
    }

    pub fn mean_force(&self) -> f32 {
        mean(&self.force)
    }

    pub fn mean_action_rescale(&self) -> f32 {
        mean(&self.action_rescale)
    }

    /// World-frame force on every body, laid out `[env * num_bodies + body]`.
    /// `None` when the pull force is switched off.
    pub fn pull_forces(
        &self,
        state: &SimulationState,
        base_bodies: &[usize],
        unactuated_steps: f32,
    ) -> Option<Vec<na::Vector3<f32>>> {
        if !self.params.pull_force {
            return None;
        }
        let n = state.num_bodies;
        let mut forces = vec![na::Vector3::zeros(); state.num_envs * n];
        for env in 0..state.num_envs {
            let upright_enough = self.params.no_orientation || state.projected_gravity[env].z < -0.8;
            if !state.is_actuated(env, unactuated_steps) || !upright_enough {
                continue;
            }
            for &b in base_bodies {
                forces[env * n + b].z = self.force[env];
            }
        }
        Some(forces)
    }

    pub fn reset_all(&mut self, action_scale: f32) {
        self.force.fill(self.params.force);
        self.action_rescale.fill(action_scale);
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_decreases_only_above_threshold() {
        let mut curriculum = CurriculumState::new(3, &CurriculumSection::default(), 1.0);
        curriculum.update(&[0, 1], &[0.95, 0.5, 2.0]);
        assert_eq!(curriculum.force, vec![80.0, 100.0, 100.0]);
        assert_relative_eq!(curriculum.action_rescale[0], 0.98);
        assert_eq!(curriculum.action_rescale[1], 1.0);
        // Not in the reset set, untouched despite its height.
        assert_eq!(curriculum.action_rescale[2], 1.0);
    }

    #[test]
    fn test_floors() {
        let mut curriculum = CurriculumState::new(1, &CurriculumSection::default(), 0.26);
        for _ in 0..10 {
            curriculum.update(&[0], &[1.0]);
        }
        assert_eq!(curriculum.force[0], 0.0);
        assert_relative_eq!(curriculum.action_rescale[0], 0.25);
    }

    #[test]
    fn test_at_threshold_does_not_advance() {
        let mut curriculum = CurriculumState::new(1, &CurriculumSection::default(), 1.0);
        curriculum.update(&[0], &[0.9]);
        assert_eq!(curriculum.force[0], 100.0);
    }

    #[test]
    fn test_pull_force_gating() {
        let curriculum = CurriculumState::new(3, &CurriculumSection::default(), 1.0);
        let mut state = SimulationState::new(3, 1, 2);
        state.real_episode_length = vec![40, 10, 40];
        state.projected_gravity[2] = na::Vector3::new(1.0, 0.0, 0.0);

        let forces = curriculum.pull_forces(&state, &[0], 30.0).unwrap();
        assert_eq!(forces[0].z, 100.0);
        assert_eq!(forces[1].z, 0.0);
        assert_eq!(forces[2].z, 0.0);
        assert_eq!(forces[4].z, 0.0);
    }

    #[test]
    fn test_pull_force_without_orientation_check() {
        let params = CurriculumSection {
            no_orientation: true,
            ..CurriculumSection::default()
        };
        let curriculum = CurriculumState::new(1, &params, 1.0);
        let mut state = SimulationState::new(1, 1, 1);
        state.real_episode_length[0] = 40;
        state.projected_gravity[0] = na::Vector3::new(0.0, 0.0, 1.0);
        assert_eq!(curriculum.pull_forces(&state, &[0], 30.0).unwrap()[0].z, 100.0);

        let off = CurriculumState::new(1, &CurriculumSection { pull_force: false, ..params }, 1.0);
        assert!(off.pull_forces(&state, &[0], 30.0).is_none());
    }
}
