//! Reward and constraint term implementations.
//!
//! Every term maps the batch to one value per instance and reads nothing but
//! its [`RewardContext`].

use nalgebra as na;

use crate::config::RewardsSection;
use crate::controller::ActionHistory;
use crate::math::{sum_sq, tolerance, variance};
use crate::robot::RobotModel;
use crate::state::SimulationState;

/// Read-only view of everything a term may look at.
pub struct RewardContext<'a> {
    pub state: &'a SimulationState,
    pub actions: &'a ActionHistory,
    pub torques: &'a na::DMatrix<f32>,
    pub joint_pos_target: &'a na::DMatrix<f32>,
    pub robot: &'a RobotModel,
    pub params: &'a RewardsSection,
    pub post_task: bool,
    /// Policy step [s].
    pub dt: f32,
    pub reset: &'a [bool],
    pub time_out: &'a [bool],
}

impl RewardContext<'_> {
    fn each(&self, f: impl Fn(usize) -> f32) -> Vec<f32> {
        (0..self.state.num_envs).map(f).collect()
    }

    fn row_sum(&self, f: impl Fn(usize) -> f32) -> f32 {
        (0..self.state.num_dofs).map(f).sum()
    }

    fn first(&self, env: usize, bodies: &[usize]) -> na::Vector3<f32> {
        bodies
            .first()
            .map(|&b| *self.state.body(env, b))
            .unwrap_or_else(na::Vector3::zeros)
    }

    fn above(&self, env: usize, height: f32) -> f32 {
        indicator(self.state.base_height(env) > height)
    }

    fn standup(&self, env: usize) -> f32 {
        self.above(env, self.params.target_base_height_phase3)
    }

    /// Once stood up, post-task style terms saturate at 1.
    fn post_task(&self, env: usize, reward: f32) -> f32 {
        if self.post_task && self.standup(env) > 0.0 {
            1.0
        } else {
            reward
        }
    }
}

#[inline]
fn indicator(flag: bool) -> f32 {
    if flag {
        1.0
    } else {
        0.0
    }
}

/// Head height above the mean foot height.
pub fn head_height_of(state: &SimulationState, robot: &RobotModel, env: usize) -> f32 {
    let head = robot.bodies.head.first().map_or(0.0, |&b| state.body(env, b).z);
    let feet = &robot.bodies.feet;
    if feet.is_empty() {
        return head;
    }
    let feet_z = feet.iter().map(|&b| state.body(env, b).z).sum::<f32>() / feet.len() as f32;
    head - feet_z
}

fn dof_abs<'a>(state: &'a SimulationState, env: usize, joints: &'a [usize]) -> impl Iterator<Item = f32> + 'a {
    joints.iter().map(move |&j| state.dof_pos[(env, j)].abs())
}

/// `max|q| > 1.4 || min|q| > 0.9` over a joint group; 0 for an empty group.
fn splayed(state: &SimulationState, env: usize, joints: &[usize]) -> f32 {
    if joints.is_empty() {
        return 0.0;
    }
    let max = dof_abs(state, env, joints).fold(f32::MIN, f32::max);
    let min = dof_abs(state, env, joints).fold(f32::MAX, f32::min);
    indicator(max > 1.4 || min > 0.9)
}

// task

pub fn orientation(ctx: &RewardContext<'_>) -> Vec<f32> {
    let threshold = ctx.params.orientation_threshold;
    ctx.each(|env| tolerance(-ctx.state.projected_gravity[env].z, (threshold, f32::INFINITY), 1.0, 0.05))
}

pub fn head_height(ctx: &RewardContext<'_>) -> Vec<f32> {
    let p = ctx.params;
    ctx.each(|env| {
        let h = head_height_of(ctx.state, ctx.robot, env);
        tolerance(h, (p.target_head_height, f32::INFINITY), p.target_head_margin, 0.1)
    })
}

// regularization

pub fn dof_acc(ctx: &RewardContext<'_>) -> Vec<f32> {
    let s = ctx.state;
    ctx.each(|env| ctx.row_sum(|j| ((s.last_dof_vel[(env, j)] - s.dof_vel[(env, j)]) / ctx.dt).powi(2)))
}

pub fn action_rate(ctx: &RewardContext<'_>) -> Vec<f32> {
    let a = ctx.actions;
    ctx.each(|env| ctx.row_sum(|j| (a.last_actions[(env, j)] - a.actions[(env, j)]).powi(2)))
}

/// Second difference of consecutive actions.
pub fn smoothness(ctx: &RewardContext<'_>) -> Vec<f32> {
    let a = ctx.actions;
    ctx.each(|env| {
        ctx.row_sum(|j| {
            let second = a.actions[(env, j)] - 2.0 * a.last_actions[(env, j)] + a.last_last_actions[(env, j)];
            second * second
        })
    })
}

pub fn torques(ctx: &RewardContext<'_>) -> Vec<f32> {
    ctx.each(|env| sum_sq(ctx.torques.row(env).iter()))
}

pub fn joint_power(ctx: &RewardContext<'_>) -> Vec<f32> {
    let s = ctx.state;
    ctx.each(|env| ctx.row_sum(|j| s.dof_vel[(env, j)].abs() * ctx.torques[(env, j)].abs()))
}

pub fn dof_vel(ctx: &RewardContext<'_>) -> Vec<f32> {
    ctx.each(|env| sum_sq(ctx.state.dof_vel.row(env).iter()))
}

pub fn joint_tracking_error(ctx: &RewardContext<'_>) -> Vec<f32> {
    let s = ctx.state;
    ctx.each(|env| ctx.row_sum(|j| (ctx.joint_pos_target[(env, j)] - s.dof_pos[(env, j)]).powi(2)))
}

pub fn dof_pos_limits(ctx: &RewardContext<'_>) -> Vec<f32> {
    let limits = &ctx.robot.limits;
    ctx.each(|env| {
        ctx.row_sum(|j| {
            let q = ctx.state.dof_pos[(env, j)];
            (limits.soft_pos_lower[j] - q).max(0.0) + (q - limits.soft_pos_upper[j]).max(0.0)
        })
    })
}

pub fn dof_vel_limits(ctx: &RewardContext<'_>) -> Vec<f32> {
    let soft = ctx.params.soft_dof_vel_limit;
    let limits = &ctx.robot.limits.vel;
    ctx.each(|env| {
        ctx.row_sum(|j| (ctx.state.dof_vel[(env, j)].abs() - limits[j] * soft).clamp(0.0, 1.0))
    })
}

pub fn torque_limits(ctx: &RewardContext<'_>) -> Vec<f32> {
    let soft = ctx.params.soft_torque_limit;
    let limits = &ctx.robot.limits.torque;
    ctx.each(|env| ctx.row_sum(|j| (ctx.torques[(env, j)].abs() - limits[j] * soft).max(0.0)))
}

// style

pub fn waist_deviation(ctx: &RewardContext<'_>) -> Vec<f32> {
    let waist = &ctx.robot.joints.waist;
    ctx.each(|env| indicator(dof_abs(ctx.state, env, waist).any(|q| q > 1.4)))
}

pub fn hip_yaw_deviation(ctx: &RewardContext<'_>) -> Vec<f32> {
    ctx.each(|env| splayed(ctx.state, env, &ctx.robot.joints.hip_yaw))
}

pub fn hip_roll_deviation(ctx: &RewardContext<'_>) -> Vec<f32> {
    ctx.each(|env| splayed(ctx.state, env, &ctx.robot.joints.hip_roll))
}

/// Left shoulder rolled inwards or right shoulder rolled inwards.
pub fn shoulder_roll_deviation(ctx: &RewardContext<'_>) -> Vec<f32> {
    let joints = &ctx.robot.joints.shoulder_roll;
    ctx.each(|env| match (joints.first(), joints.get(1)) {
        (Some(&left), Some(&right)) => {
            indicator(ctx.state.dof_pos[(env, left)] < -0.02 || ctx.state.dof_pos[(env, right)] > 0.02)
        }
        _ => 0.0,
    })
}

fn foot_displacement(ctx: &RewardContext<'_>, foot: &[usize], sigma: f32) -> Vec<f32> {
    ctx.each(|env| {
        let base = ctx.state.root_pos[env].xy();
        let foot = ctx.first(env, foot);
        let mse = (base - foot.xy()).norm_squared().max(0.3);
        (mse * sigma).exp() * indicator(foot.z < 0.3) * ctx.standup(env)
    })
}

pub fn left_foot_displacement(ctx: &RewardContext<'_>) -> Vec<f32> {
    foot_displacement(ctx, &ctx.robot.bodies.left_foot, ctx.params.left_foot_displacement_sigma)
}

pub fn right_foot_displacement(ctx: &RewardContext<'_>) -> Vec<f32> {
    foot_displacement(ctx, &ctx.robot.bodies.right_foot, ctx.params.right_foot_displacement_sigma)
}

pub fn knee_deviation(ctx: &RewardContext<'_>) -> Vec<f32> {
    let knees = &ctx.robot.joints.knee;
    ctx.each(|env| {
        if knees.is_empty() {
            return 0.0;
        }
        let max_abs = dof_abs(ctx.state, env, knees).fold(f32::MIN, f32::max);
        let min = knees.iter().map(|&j| ctx.state.dof_pos[(env, j)]).fold(f32::MAX, f32::min);
        indicator(max_abs > 2.85 || min < -0.06)
    })
}

/// Shanks pointing up: vertical component of the foot-to-knee direction.
pub fn shank_orientation(ctx: &RewardContext<'_>) -> Vec<f32> {
    let b = &ctx.robot.bodies;
    ctx.each(|env| {
        let verticality = |knee: &[usize], foot: &[usize]| {
            let shank = ctx.first(env, knee) - ctx.first(env, foot);
            let len = shank.norm();
            if len > 0.0 {
                shank.z / len
            } else {
                0.0
            }
        };
        let mean = 0.5 * (verticality(&b.left_knee, &b.left_foot) + verticality(&b.right_knee, &b.right_foot));
        let reward = tolerance(mean, (0.8, f32::INFINITY), 1.0, 0.1)
            * ctx.above(env, ctx.params.target_base_height_phase1);
        ctx.post_task(env, reward)
    })
}

/// Ankle bodies level with each other. No ankle bodies means no reward.
pub fn ground_parallel(ctx: &RewardContext<'_>) -> Vec<f32> {
    let b = &ctx.robot.bodies;
    ctx.each(|env| {
        if b.left_ankle.is_empty() || b.right_ankle.is_empty() {
            return ctx.post_task(env, 0.0);
        }
        let heights = |bodies: &[usize]| -> Vec<f32> {
            bodies.iter().map(|&i| ctx.state.body(env, i).z * 10.0).collect()
        };
        let var = 0.5 * (variance(&heights(&b.left_ankle)) + variance(&heights(&b.right_ankle)));
        ctx.post_task(env, indicator(var < 0.05))
    })
}

pub fn feet_distance(ctx: &RewardContext<'_>) -> Vec<f32> {
    let b = &ctx.robot.bodies;
    ctx.each(|env| indicator((ctx.first(env, &b.left_foot) - ctx.first(env, &b.right_foot)).norm() > 0.9))
}

pub fn style_ang_vel_xy(ctx: &RewardContext<'_>) -> Vec<f32> {
    ctx.each(|env| {
        let w = ctx.state.base_ang_vel[env];
        (-2.0 * (w.x * w.x + w.y * w.y)).exp() * ctx.above(env, ctx.params.target_base_height_phase1)
    })
}

// target

pub fn ang_vel_xy(ctx: &RewardContext<'_>) -> Vec<f32> {
    ctx.each(|env| {
        let w = ctx.state.base_ang_vel[env];
        (-2.0 * (w.x * w.x + w.y * w.y)).exp() * ctx.standup(env)
    })
}

pub fn lin_vel_xy(ctx: &RewardContext<'_>) -> Vec<f32> {
    ctx.each(|env| {
        let v = ctx.state.base_lin_vel[env];
        (-5.0 * (v.x * v.x + v.y * v.y)).exp() * ctx.standup(env)
    })
}

pub fn feet_height_var(ctx: &RewardContext<'_>) -> Vec<f32> {
    let b = &ctx.robot.bodies;
    ctx.each(|env| {
        let left = ctx.first(env, &b.left_foot).z * 10.0;
        let right = ctx.first(env, &b.right_foot).z * 10.0;
        let gap = (left - right).abs().max(0.2);
        (-2.0 * gap).exp() * ctx.standup(env)
    })
}

pub fn target_upper_dof_pos(ctx: &RewardContext<'_>) -> Vec<f32> {
    let upper = &ctx.robot.joints.upper_body;
    let target = &ctx.robot.target_dof_pos;
    ctx.each(|env| {
        let mse: f32 = upper
            .iter()
            .map(|&j| (ctx.state.dof_pos[(env, j)] - target[j]).powi(2))
            .sum();
        (mse * ctx.params.target_dof_pos_sigma).exp() * ctx.standup(env)
    })
}

pub fn target_orientation(ctx: &RewardContext<'_>) -> Vec<f32> {
    ctx.each(|env| {
        let g = ctx.state.projected_gravity[env];
        (-5.0 * (g.x * g.x + g.y * g.y)).exp() * ctx.standup(env)
    })
}

pub fn target_base_height(ctx: &RewardContext<'_>) -> Vec<f32> {
    let target = ctx.params.base_height_target;
    ctx.each(|env| (-20.0 * (ctx.state.base_height(env) - target).abs()).exp() * ctx.standup(env))
}

// global

/// Terminated for a reason other than running out of time.
pub fn termination(ctx: &RewardContext<'_>) -> Vec<f32> {
    ctx.each(|env| indicator(ctx.reset[env] && !ctx.time_out[env]))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::config::EnvConfig;
    use crate::physics::testing::kbot_asset;

    /// Owned data behind a [`RewardContext`].
    pub struct Scene {
        pub config: EnvConfig,
        pub robot: RobotModel,
        pub state: SimulationState,
        pub actions: ActionHistory,
        pub torques: na::DMatrix<f32>,
        pub target: na::DMatrix<f32>,
        pub reset: Vec<bool>,
        pub time_out: Vec<bool>,
    }

    impl Scene {
        pub fn new(num_envs: usize) -> Self {
            let config = EnvConfig::default();
            let asset = kbot_asset();
            let robot = RobotModel::resolve(&asset, &config).unwrap();
            let dofs = robot.num_dofs();
            Self {
                state: SimulationState::new(num_envs, dofs, robot.num_bodies),
                actions: ActionHistory::new(num_envs, dofs),
                torques: na::DMatrix::zeros(num_envs, dofs),
                target: na::DMatrix::zeros(num_envs, dofs),
                reset: vec![false; num_envs],
                time_out: vec![false; num_envs],
                config,
                robot,
            }
        }

        pub fn set_body(&mut self, env: usize, body: usize, pos: [f32; 3]) {
            let n = self.state.num_bodies;
            self.state.body_pos[env * n + body] = na::Vector3::new(pos[0], pos[1], pos[2]);
        }

        pub fn ctx(&self) -> RewardContext<'_> {
            RewardContext {
                state: &self.state,
                actions: &self.actions,
                torques: &self.torques,
                joint_pos_target: &self.target,
                robot: &self.robot,
                params: &self.config.rewards,
                post_task: self.config.constraints.post_task,
                dt: self.config.dt(),
                reset: &self.reset,
                time_out: &self.time_out,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::Scene;
    use super::*;
    use approx::assert_relative_eq;

    // Body layout of the scripted asset.
    const HEAD: usize = 1;
    const L_KNEE: usize = 2;
    const R_KNEE: usize = 3;
    const L_FOOT: usize = 4;
    const R_FOOT: usize = 5;

    #[test]
    fn test_orientation_upright_and_lying() {
        let mut scene = Scene::new(2);
        scene.state.projected_gravity[1] = na::Vector3::new(1.0, 0.0, 0.0);
        let r = orientation(&scene.ctx());
        assert_eq!(r[0], 1.0);
        assert!(r[1] > 0.05 && r[1] < 0.06);
    }

    #[test]
    fn test_head_height_relative_to_feet() {
        let mut scene = Scene::new(1);
        scene.set_body(0, HEAD, [0.0, 0.0, 1.3]);
        scene.set_body(0, L_FOOT, [0.0, 0.0, 0.2]);
        scene.set_body(0, R_FOOT, [0.0, 0.0, 0.2]);
        assert_relative_eq!(head_height_of(&scene.state, &scene.robot, 0), 1.1, epsilon = 1e-6);
        assert_eq!(head_height(&scene.ctx())[0], 1.0);

        scene.set_body(0, HEAD, [0.0, 0.0, 0.2]);
        assert_relative_eq!(head_height(&scene.ctx())[0], 0.1, epsilon = 1e-4);
    }

    #[test]
    fn test_regularization_sums() {
        let mut scene = Scene::new(1);
        scene.actions.actions[(0, 0)] = 1.0;
        scene.actions.last_actions[(0, 0)] = 0.5;
        scene.torques[(0, 2)] = 3.0;
        scene.state.dof_vel[(0, 2)] = -2.0;
        let ctx = scene.ctx();
        assert_relative_eq!(action_rate(&ctx)[0], 0.25);
        assert_relative_eq!(smoothness(&ctx)[0], 0.0);
        assert_relative_eq!(torques(&ctx)[0], 9.0);
        assert_relative_eq!(joint_power(&ctx)[0], 6.0);
        assert_relative_eq!(dof_vel(&ctx)[0], 4.0);
        assert_relative_eq!(dof_acc(&ctx)[0], 4.0 / (0.02 * 0.02), max_relative = 1e-5);
    }

    #[test]
    fn test_dof_limit_terms() {
        let mut scene = Scene::new(1);
        // Soft window is [-1.35, 1.35].
        scene.state.dof_pos[(0, 0)] = 1.45;
        scene.state.dof_pos[(0, 1)] = -1.40;
        scene.state.dof_vel[(0, 3)] = 18.5;
        scene.torques[(0, 4)] = -52.0;
        let ctx = scene.ctx();
        assert_relative_eq!(dof_pos_limits(&ctx)[0], 0.15, epsilon = 1e-5);
        assert_relative_eq!(dof_vel_limits(&ctx)[0], 0.5, epsilon = 1e-5);
        assert_relative_eq!(torque_limits(&ctx)[0], 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_joint_style_indicators() {
        let mut scene = Scene::new(3);
        // hip yaw joints are dofs 0 and 5, knees 3 and 8, shoulder rolls 11 and 16.
        scene.state.dof_pos[(0, 0)] = 1.5;
        scene.state.dof_pos[(1, 0)] = 1.0;
        scene.state.dof_pos[(1, 5)] = -1.0;
        scene.state.dof_pos[(2, 8)] = -0.1;
        scene.state.dof_pos[(2, 16)] = 0.05;
        let ctx = scene.ctx();
        assert_eq!(hip_yaw_deviation(&ctx), vec![1.0, 1.0, 0.0]);
        assert_eq!(knee_deviation(&ctx), vec![0.0, 0.0, 1.0]);
        assert_eq!(shoulder_roll_deviation(&ctx), vec![0.0, 0.0, 1.0]);
        assert_eq!(waist_deviation(&ctx), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_shank_orientation_needs_raised_base() {
        let mut scene = Scene::new(2);
        for env in 0..2 {
            scene.set_body(env, L_KNEE, [0.0, 0.1, 0.5]);
            scene.set_body(env, R_KNEE, [0.0, -0.1, 0.5]);
            scene.set_body(env, L_FOOT, [0.0, 0.1, 0.05]);
            scene.set_body(env, R_FOOT, [0.0, -0.1, 0.05]);
        }
        scene.state.root_pos[0].z = 0.7;
        scene.state.root_pos[1].z = 0.2;
        assert_eq!(shank_orientation(&scene.ctx()), vec![1.0, 0.0]);
    }

    #[test]
    fn test_ground_parallel_without_ankle_bodies() {
        let scene = Scene::new(1);
        assert!(scene.robot.bodies.left_ankle.is_empty());
        assert_eq!(ground_parallel(&scene.ctx()), vec![0.0]);
    }

    #[test]
    fn test_target_terms_gate_on_standing() {
        let mut scene = Scene::new(2);
        scene.state.root_pos[0].z = 0.75;
        scene.state.root_pos[1].z = 0.3;
        let ctx = scene.ctx();
        assert_eq!(target_base_height(&ctx), vec![1.0, 0.0]);
        assert_eq!(target_orientation(&ctx), vec![1.0, 0.0]);
        assert_eq!(lin_vel_xy(&ctx), vec![1.0, 0.0]);
    }

    #[test]
    fn test_termination_excludes_time_outs() {
        let mut scene = Scene::new(3);
        scene.reset = vec![true, true, false];
        scene.time_out = vec![false, true, false];
        assert_eq!(termination(&scene.ctx()), vec![1.0, 0.0, 0.0]);
    }
}
