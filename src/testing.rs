use anyhow::Result;

use crate::env::{Env, Frame, Step, StepInfo};

/// Deterministic env for unit tests: rewards cycle through a script, episodes
/// last `episode_len` steps, and every pixel holds the current step index.
pub struct ScriptedEnv {
    rewards: Vec<f64>,
    episode_len: u64,
    t: u64,
    height: usize,
    width: usize,
    actions: Vec<usize>,
}

impl ScriptedEnv {
    pub fn new(rewards: Vec<f64>, episode_len: u64) -> Self {
        Self {
            rewards,
            episode_len,
            t: 0,
            height: 4,
            width: 4,
            actions: Vec::new(),
        }
    }

    pub fn with_frame_size(mut self, height: usize, width: usize) -> Self {
        self.height = height;
        self.width = width;
        self
    }

    pub fn actions(&self) -> &[usize] {
        &self.actions
    }

    fn frame(&self, channels: usize) -> Frame {
        Frame {
            channels,
            height: self.height,
            width: self.width,
            data: vec![self.t as u8; channels * self.height * self.width],
        }
    }
}

impl Env for ScriptedEnv {
    type Obs = Frame;

    fn reset(&mut self) -> Result<Frame> {
        self.t = 0;
        Ok(self.frame(1))
    }

    fn step(&mut self, action: usize) -> Result<Step<Frame>> {
        self.actions.push(action);
        let reward = if self.rewards.is_empty() {
            0.0
        } else {
            self.rewards[(self.t as usize) % self.rewards.len()]
        };
        self.t += 1;
        Ok(Step {
            obs: self.frame(1),
            reward,
            done: self.t >= self.episode_len,
            info: StepInfo::default(),
        })
    }

    fn render(&mut self) -> Result<Frame> {
        Ok(self.frame(3))
    }

    fn num_actions(&self) -> usize {
        3
    }

    fn seed(&mut self, _seed: u64) {}
}
