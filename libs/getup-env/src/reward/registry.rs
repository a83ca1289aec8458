//! Fixed catalogue of reward functions and the configured term list built from it.

use std::collections::BTreeMap;

use super::terms::{self, RewardContext};
use crate::config::{ConstraintsSection, RewardsSection};
use crate::error::{EnvError, Result};

pub type TermFn = fn(&RewardContext<'_>) -> Vec<f32>;

/// One catalogue entry: the function key used in configured term names.
#[derive(Clone, Copy)]
pub struct TermDecl {
    pub key: &'static str,
    pub func: TermFn,
}

const fn decl(key: &'static str, func: TermFn) -> TermDecl {
    TermDecl { key, func }
}

/// Configured name of the term added to every group.
pub const TERMINATION: &str = "termination";

pub const CATALOGUE: &[TermDecl] = &[
    decl("orientation", terms::orientation),
    decl("head_height", terms::head_height),
    decl("dof_acc", terms::dof_acc),
    decl("action_rate", terms::action_rate),
    decl("smoothness", terms::smoothness),
    decl("torques", terms::torques),
    decl("joint_power", terms::joint_power),
    decl("dof_vel", terms::dof_vel),
    decl("joint_tracking_error", terms::joint_tracking_error),
    decl("dof_pos_limits", terms::dof_pos_limits),
    decl("dof_vel_limits", terms::dof_vel_limits),
    decl("torque_limits", terms::torque_limits),
    decl("waist_deviation", terms::waist_deviation),
    decl("hip_yaw_deviation", terms::hip_yaw_deviation),
    decl("hip_roll_deviation", terms::hip_roll_deviation),
    decl("shoulder_roll_deviation", terms::shoulder_roll_deviation),
    decl("left_foot_displacement", terms::left_foot_displacement),
    decl("right_foot_displacement", terms::right_foot_displacement),
    decl("knee_deviation", terms::knee_deviation),
    decl("shank_orientation", terms::shank_orientation),
    decl("ground_parallel", terms::ground_parallel),
    decl("feet_distance", terms::feet_distance),
    decl("style_ang_vel_xy", terms::style_ang_vel_xy),
    decl("ang_vel_xy", terms::ang_vel_xy),
    decl("lin_vel_xy", terms::lin_vel_xy),
    decl("feet_height_var", terms::feet_height_var),
    decl("target_upper_dof_pos", terms::target_upper_dof_pos),
    decl("target_orientation", terms::target_orientation),
    decl("target_base_height", terms::target_base_height),
    decl(TERMINATION, terms::termination),
];

/// A configured, non-zero term.
#[derive(Clone)]
pub struct RewardTerm {
    /// Full configured name, e.g. `regu_action_rate`.
    pub name: String,
    /// Index into the reward groups this term contributes to.
    pub group: usize,
    /// Effective scale (constraint scales already multiplied by dt).
    pub scale: f32,
    pub func: TermFn,
}

impl std::fmt::Debug for RewardTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardTerm")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("scale", &self.scale)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct RewardRegistry {
    pub groups: Vec<String>,
    pub task_group: usize,
    /// Multiplied into the task group.
    pub task: Vec<RewardTerm>,
    /// Added into their own group.
    pub constraints: Vec<RewardTerm>,
    /// Added into every group.
    pub termination: Option<RewardTerm>,
}

impl RewardRegistry {
    pub fn build(rewards: &RewardsSection, constraints: &ConstraintsSection, dt: f32) -> Result<Self> {
        Self::build_with(CATALOGUE, rewards, constraints, dt)
    }

    /// Build against an explicit catalogue.
    pub fn build_with(
        catalogue: &[TermDecl],
        rewards: &RewardsSection,
        constraints: &ConstraintsSection,
        dt: f32,
    ) -> Result<Self> {
        if !rewards.is_gaussian {
            return Err(EnvError::UnsupportedRewardMode);
        }
        let groups = rewards.reward_groups.clone();
        let task_group = group_index(&groups, "task").ok_or_else(|| EnvError::UnknownRewardGroup {
            term: "task".to_string(),
            group: "task".to_string(),
        })?;

        let mut task = Vec::new();
        for (name, scale) in non_zero(&rewards.scales) {
            if name == TERMINATION {
                log::warn!("termination is a constraint term; ignoring it among task rewards");
                continue;
            }
            let (_, key) = split_name(name)?;
            task.push(RewardTerm {
                name: name.clone(),
                group: task_group,
                scale,
                func: lookup(catalogue, key, name)?,
            });
        }

        let mut additive = Vec::new();
        let mut termination = None;
        for (name, scale) in non_zero(&constraints.scales) {
            if name == TERMINATION {
                termination = Some(RewardTerm {
                    name: name.clone(),
                    group: task_group,
                    scale: scale * dt,
                    func: lookup(catalogue, TERMINATION, name)?,
                });
                continue;
            }
            let (prefix, key) = split_name(name)?;
            let group = group_index(&groups, prefix).ok_or_else(|| EnvError::UnknownRewardGroup {
                term: name.clone(),
                group: prefix.to_string(),
            })?;
            additive.push(RewardTerm {
                name: name.clone(),
                group,
                scale: scale * dt,
                func: lookup(catalogue, key, name)?,
            });
        }

        log::info!(
            "Reward registry: {} task terms, {} constraint terms, groups {:?}",
            task.len(),
            additive.len() + termination.is_some() as usize,
            groups
        );

        Ok(Self {
            groups,
            task_group,
            task,
            constraints: additive,
            termination,
        })
    }

    /// Every configured term, in evaluation order.
    pub fn terms(&self) -> impl Iterator<Item = &RewardTerm> {
        self.task.iter().chain(&self.constraints).chain(&self.termination)
    }
}

fn non_zero(scales: &BTreeMap<String, f32>) -> impl Iterator<Item = (&String, f32)> {
    scales.iter().filter(|(_, &s)| s != 0.0).map(|(n, &s)| (n, s))
}

fn group_index(groups: &[String], name: &str) -> Option<usize> {
    groups.iter().position(|g| g == name)
}

/// `<group>_<function>`: everything after the first underscore names the function.
fn split_name(name: &str) -> Result<(&str, &str)> {
    name.split_once('_')
        .filter(|(prefix, key)| !prefix.is_empty() && !key.is_empty())
        .ok_or_else(|| EnvError::UnknownRewardTerm(name.to_string()))
}

fn lookup(catalogue: &[TermDecl], key: &str, name: &str) -> Result<TermFn> {
    catalogue
        .iter()
        .find(|d| d.key == key)
        .map(|d| d.func)
        .ok_or_else(|| EnvError::UnknownRewardTerm(name.to_string()))
}
