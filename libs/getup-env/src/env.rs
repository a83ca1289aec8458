//! Vectorized get-up environment.
//!
//! [`LeggedEnv`] owns every per-instance buffer and drives one policy step:
//! actions to torques for `decimation` physics sub-steps, then termination,
//! rewards, resets and observations.

use std::collections::BTreeMap;

use nalgebra as na;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::EnvConfig;
use crate::controller::{PdController, PdGains};
use crate::curriculum::CurriculumState;
use crate::error::{EnvError, Result};
use crate::math::quat_from_xyzw;
use crate::observation::ObservationPipeline;
use crate::physics::PhysicsBackend;
use crate::randomization::{ActuatorRandomization, BodyProperties, DomainRandomizer};
use crate::reward::{RewardContext, RewardEngine, RewardRegistry};
use crate::robot::RobotModel;
use crate::state::SimulationState;
use crate::termination::{EpisodeStatus, TerminationLimits, TerminationReport};

/// Episode statistics emitted on steps where at least one instance resets.
#[derive(Clone, Debug, PartialEq)]
pub struct EpisodeSummary {
    /// Mean last head height of the reset instances.
    pub head_height: f32,
    /// `rew_<term>` and `rew_group_<group>` means, per second of episode.
    pub terms: BTreeMap<String, f32>,
    /// Mean assistive force over all instances, before this reset's update.
    pub force: f32,
    /// Mean action rescale over all instances, before this reset's update.
    pub action_scale: f32,
    pub num_reset: usize,
}

#[derive(Clone, Debug, Default)]
pub struct StepInfo {
    pub episode: Option<EpisodeSummary>,
    /// Present when time-outs are reported to the learner.
    pub time_outs: Option<Vec<bool>>,
    pub status: Vec<EpisodeStatus>,
}

#[derive(Clone, Debug)]
pub struct StepResult {
    /// N x (history * one-step width), clipped.
    pub observations: na::DMatrix<f32>,
    /// N x reward groups.
    pub rewards: na::DMatrix<f32>,
    pub dones: Vec<bool>,
    pub info: StepInfo,
}

/// Root state every instance returns to, before its grid offset.
#[derive(Clone, Debug)]
struct BaseInitState {
    pos: na::Vector3<f32>,
    rot: na::UnitQuaternion<f32>,
    lin_vel: na::Vector3<f32>,
    ang_vel: na::Vector3<f32>,
}

pub struct LeggedEnv<P: PhysicsBackend> {
    config: EnvConfig,
    physics: P,
    robot: RobotModel,
    state: SimulationState,
    randomizer: DomainRandomizer,
    actuators: ActuatorRandomization,
    body_props: Vec<BodyProperties>,
    controller: PdController,
    observations: ObservationPipeline,
    obs_buf: na::DMatrix<f32>,
    rewards: RewardEngine,
    termination: TerminationReport,
    limits: TerminationLimits,
    curriculum: CurriculumState,
    base_init: BaseInitState,
    env_origins: Vec<na::Vector3<f32>>,
    gravity_dir: na::Vector3<f32>,
    rng: StdRng,
    common_step_counter: u64,
}

impl<P: PhysicsBackend> LeggedEnv<P> {
    pub fn new(config: EnvConfig, mut physics: P) -> Result<Self> {
        config.validate()?;
        let robot = RobotModel::resolve(physics.asset(), &config)?;
        let num_envs = config.env.num_envs;
        for (what, expected, actual) in [
            ("physics instances", num_envs, physics.num_envs()),
            ("physics bodies", robot.num_bodies, physics.num_bodies()),
        ] {
            if actual != expected {
                return Err(EnvError::ShapeMismatch { what, expected, actual });
            }
        }
        let dofs = robot.num_dofs();
        let mut rng = StdRng::seed_from_u64(config.seed);

        let randomizer = DomainRandomizer::new(&config.domain_rand)?;
        let body_props: Vec<BodyProperties> = (0..num_envs)
            .map(|env| {
                let props = randomizer.sample_body(robot.num_bodies, &mut rng);
                physics.bake_body_properties(env, &props);
                props
            })
            .collect();

        let mut actuators = ActuatorRandomization::nominal(num_envs, dofs);
        let all: Vec<usize> = (0..num_envs).collect();
        randomizer.resample_actuators(&mut actuators, &all, &robot.limits.torque, &mut rng);

        let gains = PdGains::resolve(
            &robot.dof_names,
            &config.control.stiffness,
            &config.control.damping,
            config.control.control_type,
        );
        let controller = PdController::new(
            config.control.control_type,
            gains,
            robot.limits.torque.clone(),
            config.sim.dt,
            num_envs,
            randomizer.delay_enabled().then(|| randomizer.max_delay()),
        );

        let observations = ObservationPipeline::new(
            num_envs,
            dofs,
            config.env.num_actions,
            config.env.num_actor_history,
            &config.noise,
            &config.normalization.obs_scales,
            config.normalization.clip_observations,
        );

        let registry = RewardRegistry::build(&config.rewards, &config.constraints, config.dt())?;
        let rewards = RewardEngine::new(registry, num_envs, config.constraints.only_positive_rewards);

        let limits = TerminationLimits {
            contact_force: config.env.termination_contact_force,
            max_episode_length: config.max_episode_length(),
            dof_vel: config.curriculum.dof_vel_limit,
            base_lin_vel: config.curriculum.base_vel_limit,
            unactuated_steps: config.unactuated_steps(),
        };

        let init = &config.init_state;
        let base_init = BaseInitState {
            pos: na::Vector3::from(init.pos),
            rot: quat_from_xyzw(init.rot),
            lin_vel: na::Vector3::from(init.lin_vel),
            ang_vel: na::Vector3::from(init.ang_vel),
        };

        let gravity = na::Vector3::from(config.sim.gravity);
        let gravity_dir = gravity
            .try_normalize(f32::EPSILON)
            .unwrap_or_else(|| na::Vector3::new(0.0, 0.0, -1.0));

        let mut state = SimulationState::new(num_envs, dofs, robot.num_bodies);
        physics.refresh_state(&mut state);
        physics.refresh_dof_state(&mut state);
        state.refresh_derived(&gravity_dir);

        log::info!(
            "Created {} instances: {} dofs, {} obs, {} reward groups, dt {}s",
            num_envs,
            dofs,
            config.num_observations(),
            config.rewards.reward_groups.len(),
            config.dt()
        );

        Ok(Self {
            curriculum: CurriculumState::new(num_envs, &config.curriculum, config.control.action_scale),
            env_origins: grid_origins(num_envs, config.env.env_spacing),
            obs_buf: na::DMatrix::zeros(num_envs, config.num_observations()),
            termination: TerminationReport::new(num_envs),
            config,
            physics,
            robot,
            state,
            randomizer,
            actuators,
            body_props,
            controller,
            observations,
            rewards,
            limits,
            base_init,
            gravity_dir,
            rng,
            common_step_counter: 0,
        })
    }

    /// Reset every instance and take one zero-action step.
    pub fn reset(&mut self) -> Result<na::DMatrix<f32>> {
        let all: Vec<usize> = (0..self.num_envs()).collect();
        self.reset_idx(&all);
        let zeros = na::DMatrix::zeros(self.num_envs(), self.config.env.num_actions);
        Ok(self.step(&zeros)?.observations)
    }

    pub fn step(&mut self, actions: &na::DMatrix<f32>) -> Result<StepResult> {
        let (rows, cols) = actions.shape();
        if rows != self.num_envs() {
            return Err(EnvError::ShapeMismatch {
                what: "action rows",
                expected: self.num_envs(),
                actual: rows,
            });
        }
        if cols != self.config.env.num_actions {
            return Err(EnvError::ShapeMismatch {
                what: "action columns",
                expected: self.config.env.num_actions,
                actual: cols,
            });
        }

        let warm_up = self.limits.unactuated_steps;
        self.controller.history.set(actions, self.config.normalization.clip_actions);
        for _ in 0..self.config.control.decimation {
            self.controller.history.gate(&self.state, warm_up);
            let forces = self
                .curriculum
                .pull_forces(&self.state, &self.robot.bodies.base, warm_up);
            let torques =
                self.controller
                    .compute_torques(&self.state, &self.curriculum.action_rescale, &self.actuators);
            self.physics.simulate(torques, forces.as_deref());
            self.physics.refresh_dof_state(&mut self.state);
        }

        let episode = self.post_physics_step();
        let info = StepInfo {
            episode,
            time_outs: self
                .config
                .env
                .send_timeouts
                .then(|| self.termination.time_out.clone()),
            status: (0..self.num_envs()).map(|env| self.termination.status(env)).collect(),
        };

        Ok(StepResult {
            observations: self.obs_buf.clone(),
            rewards: self.rewards.rewards().clone(),
            dones: self.termination.reset.clone(),
            info,
        })
    }

    fn post_physics_step(&mut self) -> Option<EpisodeSummary> {
        self.physics.refresh_state(&mut self.state);
        self.state.advance_counters();
        self.common_step_counter += 1;
        self.state.refresh_derived(&self.gravity_dir);

        let interval = self.config.push_interval().max(1) as u64;
        if self.config.domain_rand.push_robots && self.common_step_counter % interval == 0 {
            self.push_robots();
        }

        self.termination.check(&self.state, &self.robot, &self.limits);

        let ctx = RewardContext {
            state: &self.state,
            actions: &self.controller.history,
            torques: &self.controller.torques,
            joint_pos_target: &self.controller.joint_pos_target,
            robot: &self.robot,
            params: &self.config.rewards,
            post_task: self.config.constraints.post_task,
            dt: self.config.dt(),
            reset: &self.termination.reset,
            time_out: &self.termination.time_out,
        };
        self.rewards.compute(&ctx);

        let ids = self.termination.reset_ids();
        let episode = self.reset_idx(&ids);

        self.obs_buf = self.observations.compute(
            &self.state,
            &self.controller.history.actions,
            &self.curriculum.action_rescale,
            self.limits.unactuated_steps,
            &mut self.rng,
        );

        self.controller.history.roll();
        self.state.roll_dof_history();
        episode
    }

    /// Reset the listed instances. Returns `None` for an empty list.
    pub fn reset_idx(&mut self, ids: &[usize]) -> Option<EpisodeSummary> {
        if ids.is_empty() {
            return None;
        }

        let head = &self.rewards.head.last;
        let summary = EpisodeSummary {
            head_height: ids.iter().map(|&e| head[e]).sum::<f32>() / ids.len() as f32,
            terms: self.rewards.episode_means(ids, self.config.env.episode_length_s),
            force: self.curriculum.mean_force(),
            action_scale: self.curriculum.mean_action_rescale(),
            num_reset: ids.len(),
        };

        self.curriculum.update(ids, &self.rewards.head.last);
        self.reset_dofs(ids);
        self.reset_root_states(ids);

        self.controller.reset(ids);
        self.state.clear(ids);
        self.rewards.reset(ids);
        self.randomizer
            .resample_actuators(&mut self.actuators, ids, &self.robot.limits.torque, &mut self.rng);

        log::debug!(
            "reset {} instances, mean head height {:.3}",
            summary.num_reset,
            summary.head_height
        );
        Some(summary)
    }

    fn reset_dofs(&mut self, ids: &[usize]) {
        let limits = &self.robot.limits;
        for &env in ids {
            let pose = self.randomizer.initial_dof_pos(
                &self.robot.default_dof_pos,
                &limits.soft_pos_lower,
                &limits.soft_pos_upper,
                &mut self.rng,
            );
            for (j, q) in pose.into_iter().enumerate() {
                self.state.dof_pos[(env, j)] = q;
            }
            self.state.dof_vel.row_mut(env).fill(0.0);
        }
        self.physics.write_dof_state(ids, &self.state);
    }

    fn reset_root_states(&mut self, ids: &[usize]) {
        let init = &self.base_init;
        for &env in ids {
            self.state.root_pos[env] = init.pos + self.env_origins[env];
            self.state.root_quat[env] = init.rot;
            self.state.root_lin_vel[env] = init.lin_vel;
            self.state.root_ang_vel[env] = init.ang_vel;
        }
        self.physics.write_root_state(ids, &self.state);
    }

    /// Kick every instance with a random horizontal base velocity.
    fn push_robots(&mut self) {
        for env in 0..self.num_envs() {
            let (vx, vy) = self.randomizer.push_velocity(&mut self.rng);
            self.state.root_lin_vel[env].x = vx;
            self.state.root_lin_vel[env].y = vy;
        }
        let all: Vec<usize> = (0..self.num_envs()).collect();
        self.physics.write_root_state(&all, &self.state);
    }

    /// Spread episode counters over `[0, max_episode_length)` so time-outs do
    /// not all land on the same step. Warm-up counters are left alone.
    pub fn randomize_episode_lengths(&mut self) {
        let max = self.limits.max_episode_length.max(1);
        for len in self.state.episode_length.iter_mut() {
            *len = self.rng.random_range(0..max);
        }
    }

    pub fn num_envs(&self) -> usize {
        self.state.num_envs
    }

    pub fn num_observations(&self) -> usize {
        self.obs_buf.ncols()
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn robot(&self) -> &RobotModel {
        &self.robot
    }

    pub fn physics(&self) -> &P {
        &self.physics
    }

    pub fn physics_mut(&mut self) -> &mut P {
        &mut self.physics
    }

    pub fn observations(&self) -> &na::DMatrix<f32> {
        &self.obs_buf
    }

    pub fn torques(&self) -> &na::DMatrix<f32> {
        &self.controller.torques
    }

    pub fn controller(&self) -> &PdController {
        &self.controller
    }

    pub fn actuators(&self) -> &ActuatorRandomization {
        &self.actuators
    }

    pub fn body_properties(&self) -> &[BodyProperties] {
        &self.body_props
    }

    pub fn curriculum(&self) -> &CurriculumState {
        &self.curriculum
    }

    pub fn rewards(&self) -> &RewardEngine {
        &self.rewards
    }

    pub fn reward_groups(&self) -> &[String] {
        self.rewards.groups()
    }

    pub fn reward_group_weights(&self) -> &[f32] {
        &self.config.rewards.reward_group_weights
    }
}

/// Square-ish grid of instance origins on the ground plane.
fn grid_origins(num_envs: usize, spacing: f32) -> Vec<na::Vector3<f32>> {
    let cols = ((num_envs as f32).sqrt().floor() as usize).max(1);
    (0..num_envs)
        .map(|env| na::Vector3::new((env / cols) as f32 * spacing, (env % cols) as f32 * spacing, 0.0))
        .collect()
}
