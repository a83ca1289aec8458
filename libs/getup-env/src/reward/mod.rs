//! Grouped reward aggregation.
//!
//! The task group starts at 1 each step and multiplies in every task term.
//! Constraint terms are added into the group named by their prefix. Each
//! group is reported as its own column so the learner can weight them.

pub mod registry;
pub mod terms;

use std::collections::BTreeMap;

use nalgebra as na;

pub use registry::{RewardRegistry, RewardTerm, TermDecl, TermFn, CATALOGUE};
pub use terms::{head_height_of, RewardContext};

use crate::robot::RobotModel;
use crate::state::SimulationState;

/// Last and best head height of each instance in the current episode.
#[derive(Clone, Debug)]
pub struct HeadHeightTracker {
    pub last: Vec<f32>,
    pub max: Vec<f32>,
}

impl HeadHeightTracker {
    pub fn new(num_envs: usize) -> Self {
        Self {
            last: vec![0.0; num_envs],
            max: vec![0.0; num_envs],
        }
    }

    pub fn update(&mut self, state: &SimulationState, robot: &RobotModel) {
        for env in 0..state.num_envs {
            let h = head_height_of(state, robot, env);
            self.last[env] = h;
            self.max[env] = self.max[env].max(h);
        }
    }

    pub fn reset(&mut self, ids: &[usize]) {
        for &env in ids {
            self.last[env] = 0.0;
            self.max[env] = 0.0;
        }
    }
}

pub struct RewardEngine {
    registry: RewardRegistry,
    only_positive: bool,
    rew: na::DMatrix<f32>,
    term_sums: BTreeMap<String, Vec<f32>>,
    group_sums: na::DMatrix<f32>,
    pub head: HeadHeightTracker,
}

impl RewardEngine {
    /// `only_positive` floors constraint groups at zero. The task group is never clipped.
    pub fn new(registry: RewardRegistry, num_envs: usize, only_positive: bool) -> Self {
        let groups = registry.groups.len();
        let term_sums = registry.terms().map(|t| (t.name.clone(), vec![0.0; num_envs])).collect();
        Self {
            registry,
            only_positive,
            rew: na::DMatrix::zeros(num_envs, groups),
            term_sums,
            group_sums: na::DMatrix::zeros(num_envs, groups),
            head: HeadHeightTracker::new(num_envs),
        }
    }

    pub fn registry(&self) -> &RewardRegistry {
        &self.registry
    }

    pub fn groups(&self) -> &[String] {
        &self.registry.groups
    }

    /// Evaluate every term and aggregate per group (N x groups).
    pub fn compute(&mut self, ctx: &RewardContext<'_>) -> &na::DMatrix<f32> {
        let num_envs = ctx.state.num_envs;
        let task_group = self.registry.task_group;
        self.rew.fill(0.0);
        self.rew.column_mut(task_group).fill(1.0);

        for term in &self.registry.task {
            let values = (term.func)(ctx);
            let sums = self.term_sums.entry(term.name.clone()).or_insert_with(|| vec![0.0; num_envs]);
            for env in 0..num_envs {
                let r = values[env] * term.scale;
                self.rew[(env, task_group)] *= r;
                sums[env] += r;
            }
        }

        // A group is floored at zero after every term it receives, so a later
        // positive term starts from the clipped value.
        for term in &self.registry.constraints {
            let values = (term.func)(ctx);
            let sums = self.term_sums.entry(term.name.clone()).or_insert_with(|| vec![0.0; num_envs]);
            for env in 0..num_envs {
                let r = values[env] * term.scale;
                self.rew[(env, term.group)] += r;
                sums[env] += r;
            }
            if self.only_positive {
                self.rew.column_mut(term.group).apply(|v| *v = v.max(0.0));
            }
        }

        if let Some(term) = &self.registry.termination {
            let values = (term.func)(ctx);
            let sums = self.term_sums.entry(term.name.clone()).or_insert_with(|| vec![0.0; num_envs]);
            for env in 0..num_envs {
                let r = values[env] * term.scale;
                self.rew.row_mut(env).add_scalar_mut(r);
                sums[env] += r;
            }
        }

        self.group_sums += &self.rew;
        self.head.update(ctx.state, ctx.robot);
        &self.rew
    }

    pub fn rewards(&self) -> &na::DMatrix<f32> {
        &self.rew
    }

    pub fn term_sum(&self, name: &str) -> Option<&[f32]> {
        self.term_sums.get(name).map(Vec::as_slice)
    }

    pub fn group_sum(&self, env: usize, group: usize) -> f32 {
        self.group_sums[(env, group)]
    }

    /// Per-term and per-group means over `ids`, normalized by the episode length in seconds.
    pub fn episode_means(&self, ids: &[usize], episode_length_s: f32) -> BTreeMap<String, f32> {
        let mut out = BTreeMap::new();
        if ids.is_empty() {
            return out;
        }
        let n = ids.len() as f32;
        for (name, sums) in &self.term_sums {
            let mean = ids.iter().map(|&e| sums[e]).sum::<f32>() / n;
            out.insert(format!("rew_{}", name), mean / episode_length_s);
        }
        for (g, group) in self.registry.groups.iter().enumerate() {
            let mean = ids.iter().map(|&e| self.group_sums[(e, g)]).sum::<f32>() / n;
            out.insert(format!("rew_group_{}", group), mean / episode_length_s);
        }
        out
    }

    /// Zero accumulators and trackers of the listed instances.
    pub fn reset(&mut self, ids: &[usize]) {
        for sums in self.term_sums.values_mut() {
            for &env in ids {
                sums[env] = 0.0;
            }
        }
        for &env in ids {
            self.group_sums.row_mut(env).fill(0.0);
        }
        self.head.reset(ids);
    }
}

#[cfg(test)]
mod tests {
    use super::registry::TERMINATION;
    use super::terms::fixtures::Scene;
    use super::*;
    use crate::config::{ConstraintsSection, RewardsSection};
    use approx::assert_relative_eq;

    fn zero(ctx: &RewardContext<'_>) -> Vec<f32> {
        vec![0.0; ctx.state.num_envs]
    }

    fn half(ctx: &RewardContext<'_>) -> Vec<f32> {
        vec![0.5; ctx.state.num_envs]
    }

    fn two(ctx: &RewardContext<'_>) -> Vec<f32> {
        vec![2.0; ctx.state.num_envs]
    }

    const TEST_TERMS: &[TermDecl] = &[
        TermDecl { key: "zero", func: zero },
        TermDecl { key: "half", func: half },
        TermDecl { key: "two", func: two },
        TermDecl { key: TERMINATION, func: terms::termination },
    ];

    fn engine(task: &[(&str, f32)], constraints: &[(&str, f32)], only_positive: bool) -> RewardEngine {
        let rewards = RewardsSection {
            scales: task.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ..RewardsSection::default()
        };
        let constraints = ConstraintsSection {
            scales: constraints.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            only_positive_rewards: only_positive,
            ..ConstraintsSection::default()
        };
        let registry = RewardRegistry::build_with(TEST_TERMS, &rewards, &constraints, 0.02).unwrap();
        RewardEngine::new(registry, 2, only_positive)
    }

    #[test]
    fn test_zero_task_term_zeroes_task_group() {
        let scene = Scene::new(2);
        let mut engine = engine(&[("task_zero", 1.0), ("task_half", 1.0)], &[], false);
        let rew = engine.compute(&scene.ctx());
        assert_eq!(rew[(0, 0)], 0.0);
        assert_eq!(rew[(1, 0)], 0.0);
    }

    #[test]
    fn test_task_terms_multiply_without_dt() {
        let scene = Scene::new(2);
        let mut engine = engine(&[("task_half", 1.0), ("task_two", 3.0)], &[], false);
        let rew = engine.compute(&scene.ctx());
        assert_relative_eq!(rew[(0, 0)], 3.0);
    }

    #[test]
    fn test_constraint_scaled_by_dt() {
        let scene = Scene::new(2);
        let mut engine = engine(&[("task_half", 1.0)], &[("regu_two", -0.01)], false);
        let rew = engine.compute(&scene.ctx()).clone();
        assert_relative_eq!(rew[(0, 1)], -0.0004, epsilon = 1e-9);
        assert_eq!(rew[(0, 2)], 0.0);
        assert_relative_eq!(engine.term_sum("regu_two").unwrap()[1], -0.0004, epsilon = 1e-9);
    }

    #[test]
    fn test_only_positive_clips_constraint_groups() {
        let scene = Scene::new(2);
        let mut engine = engine(&[("task_half", 1.0)], &[("regu_two", -1.0), ("style_two", 1.0)], true);
        let rew = engine.compute(&scene.ctx());
        assert_eq!(rew[(0, 1)], 0.0);
        assert_relative_eq!(rew[(0, 2)], 0.04, epsilon = 1e-7);
    }

    #[test]
    fn test_clip_applies_after_each_constraint_term() {
        let scene = Scene::new(2);
        // regu_half (-0.1) is evaluated before regu_two (+0.04).
        let mut engine = engine(&[("task_half", -1.0)], &[("regu_half", -10.0), ("regu_two", 1.0)], true);
        let rew = engine.compute(&scene.ctx());
        assert_relative_eq!(rew[(0, 1)], 0.04, epsilon = 1e-7);
        assert_relative_eq!(rew[(1, 1)], 0.04, epsilon = 1e-7);
        // Task group is never floored.
        assert_relative_eq!(rew[(0, 0)], -0.5);
    }

    #[test]
    fn test_termination_added_to_every_group() {
        let mut scene = Scene::new(2);
        scene.reset = vec![true, false];
        let mut engine = engine(&[("task_half", 1.0)], &[(TERMINATION, -50.0)], false);
        let rew = engine.compute(&scene.ctx());
        for g in 0..4 {
            assert_eq!(rew[(1, g)], if g == 0 { 0.5 } else { 0.0 });
        }
        assert_relative_eq!(rew[(0, 0)], -0.5, epsilon = 1e-6);
        assert_relative_eq!(rew[(0, 3)], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_episode_sums_accumulate_and_reset() {
        let scene = Scene::new(2);
        let mut engine = engine(&[("task_half", 1.0)], &[("regu_two", 1.0)], false);
        for _ in 0..3 {
            engine.compute(&scene.ctx());
        }
        assert_relative_eq!(engine.term_sum("task_half").unwrap()[0], 1.5);
        assert_relative_eq!(engine.group_sum(0, 0), 1.5);

        let means = engine.episode_means(&[0, 1], 10.0);
        assert_relative_eq!(means["rew_task_half"], 0.15, epsilon = 1e-6);
        assert_relative_eq!(means["rew_regu_two"], 0.012, epsilon = 1e-6);
        assert!(means.contains_key("rew_group_style"));

        engine.reset(&[1]);
        assert_eq!(engine.term_sum("task_half").unwrap()[1], 0.0);
        assert_relative_eq!(engine.term_sum("task_half").unwrap()[0], 1.5);
        assert_eq!(engine.group_sum(1, 0), 0.0);
    }

    #[test]
    fn test_head_tracker_keeps_running_max() {
        let mut scene = Scene::new(2);
        let mut engine = engine(&[("task_half", 1.0)], &[], false);
        scene.set_body(0, 1, [0.0, 0.0, 1.0]);
        engine.compute(&scene.ctx());
        scene.set_body(0, 1, [0.0, 0.0, 0.4]);
        engine.compute(&scene.ctx());
        assert_relative_eq!(engine.head.last[0], 0.4);
        assert_relative_eq!(engine.head.max[0], 1.0);
        engine.reset(&[0]);
        assert_eq!(engine.head.max[0], 0.0);
    }
}
