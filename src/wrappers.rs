use anyhow::Result;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::env::{Env, EnvConfig, Frame, GameProfile, ShooterEnv, Step};
use crate::monitor::Monitor;

// =============================================================================
// Observation pipeline knobs
// =============================================================================

pub struct WrapperConfig {
    pub frame_skip: usize,
    pub sticky_action_prob: f64,
    pub downsample_ratio: usize,
    pub frame_stack: usize,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            frame_skip: 4,
            sticky_action_prob: 0.25,
            downsample_ratio: 2,
            frame_stack: 4,
        }
    }
}

impl WrapperConfig {
    /// Shape of the observations the pipeline produces from `height x width` frames.
    pub fn observation_shape(&self, height: usize, width: usize) -> (usize, usize, usize) {
        let ratio = self.downsample_ratio.max(1);
        (self.frame_stack.max(1), height / ratio, width / ratio)
    }
}

/// Network input: `channels x height x width` floats in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl Observation {
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }
}

// =============================================================================
// Frame skip with sticky actions
// =============================================================================

/// Repeats each action for `n` frames. On the first frame of a step the previous
/// action sticks with probability `stickprob`; from the second frame on the new
/// action always applies.
pub struct StochasticFrameSkip<E: Env> {
    env: E,
    n: usize,
    stickprob: f64,
    current: Option<usize>,
    rng: SmallRng,
}

impl<E: Env> StochasticFrameSkip<E> {
    pub fn new(env: E, n: usize, stickprob: f64) -> Self {
        Self {
            env,
            n: n.max(1),
            stickprob,
            current: None,
            rng: SmallRng::from_os_rng(),
        }
    }
}

impl<E: Env> Env for StochasticFrameSkip<E> {
    type Obs = E::Obs;

    fn reset(&mut self) -> Result<E::Obs> {
        self.current = None;
        self.env.reset()
    }

    fn step(&mut self, action: usize) -> Result<Step<E::Obs>> {
        let mut total_reward = 0.0;
        let mut last = None;
        for i in 0..self.n {
            let applied = match self.current {
                None => action,
                Some(prev) if i == 0 => {
                    if self.rng.random::<f64>() > self.stickprob {
                        action
                    } else {
                        prev
                    }
                }
                Some(_) => action,
            };
            self.current = Some(applied);

            let step = self.env.step(applied)?;
            total_reward += step.reward;
            let done = step.done;
            last = Some(step);
            if done {
                break;
            }
        }
        // n >= 1, so at least one inner step ran.
        let mut step = last.ok_or_else(|| anyhow::anyhow!("frame skip ran no frames"))?;
        step.reward = total_reward;
        Ok(step)
    }

    fn render(&mut self) -> Result<Frame> {
        self.env.render()
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }

    fn seed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
        self.env.seed(seed.wrapping_add(1));
    }
}

// =============================================================================
// Observation transforms
// =============================================================================

/// Area-average downscale by an integer ratio; trailing rows/columns that do not
/// fill a whole block are dropped.
pub fn downsample(frame: &Frame, ratio: usize) -> Frame {
    if ratio <= 1 {
        return frame.clone();
    }
    let (oh, ow) = (frame.height / ratio, frame.width / ratio);
    let block = (ratio * ratio) as u32;
    let mut data = Vec::with_capacity(frame.channels * oh * ow);
    for c in 0..frame.channels {
        let plane = frame.plane(c);
        for oy in 0..oh {
            for ox in 0..ow {
                let mut sum = 0u32;
                for dy in 0..ratio {
                    let row = (oy * ratio + dy) * frame.width;
                    for dx in 0..ratio {
                        sum += plane[row + ox * ratio + dx] as u32;
                    }
                }
                data.push(((sum + block / 2) / block) as u8);
            }
        }
    }
    Frame {
        channels: frame.channels,
        height: oh,
        width: ow,
        data,
    }
}

/// BT.601 luma in 14-bit fixed point (0.299 R + 0.587 G + 0.114 B, rounded).
pub fn rgb_to_gray(frame: &Frame) -> Result<Frame> {
    anyhow::ensure!(
        frame.channels == 3,
        "grayscale conversion needs an RGB frame, got {} channels",
        frame.channels
    );
    let (r, g, b) = (frame.plane(0), frame.plane(1), frame.plane(2));
    let data = r
        .iter()
        .zip(g)
        .zip(b)
        .map(|((&r, &g), &b)| {
            ((r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + 8192) >> 14) as u8
        })
        .collect();
    Frame::new(1, frame.height, frame.width, data)
}

pub fn scale_to_unit(frame: &Frame) -> Observation {
    Observation {
        channels: frame.channels,
        height: frame.height,
        width: frame.width,
        data: frame.data.iter().map(|&p| p as f32 / 255.0).collect(),
    }
}

pub struct Downsample<E> {
    env: E,
    ratio: usize,
}

impl<E: Env<Obs = Frame>> Downsample<E> {
    pub fn new(env: E, ratio: usize) -> Self {
        Self { env, ratio }
    }
}

impl<E: Env<Obs = Frame>> Env for Downsample<E> {
    type Obs = Frame;

    fn reset(&mut self) -> Result<Frame> {
        Ok(downsample(&self.env.reset()?, self.ratio))
    }

    fn step(&mut self, action: usize) -> Result<Step<Frame>> {
        let ratio = self.ratio;
        Ok(self.env.step(action)?.map_obs(|f| downsample(&f, ratio)))
    }

    fn render(&mut self) -> Result<Frame> {
        self.env.render()
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }

    fn seed(&mut self, seed: u64) {
        self.env.seed(seed);
    }
}

pub struct Rgb2Gray<E> {
    env: E,
}

impl<E: Env<Obs = Frame>> Rgb2Gray<E> {
    pub fn new(env: E) -> Self {
        Self { env }
    }
}

impl<E: Env<Obs = Frame>> Env for Rgb2Gray<E> {
    type Obs = Frame;

    fn reset(&mut self) -> Result<Frame> {
        rgb_to_gray(&self.env.reset()?)
    }

    fn step(&mut self, action: usize) -> Result<Step<Frame>> {
        let step = self.env.step(action)?;
        let obs = rgb_to_gray(&step.obs)?;
        Ok(step.map_obs(|_| obs))
    }

    fn render(&mut self) -> Result<Frame> {
        self.env.render()
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }

    fn seed(&mut self, seed: u64) {
        self.env.seed(seed);
    }
}

/// Keeps the last `k` frames and exposes them concatenated along channels,
/// oldest first.
pub struct FrameStack<E> {
    env: E,
    k: usize,
    frames: VecDeque<Frame>,
}

impl<E: Env<Obs = Frame>> FrameStack<E> {
    pub fn new(env: E, k: usize) -> Self {
        let k = k.max(1);
        Self {
            env,
            k,
            frames: VecDeque::with_capacity(k),
        }
    }

    fn stacked(&self) -> Frame {
        let first = &self.frames[0];
        let mut data = Vec::with_capacity(first.data.len() * self.k);
        for frame in &self.frames {
            data.extend_from_slice(&frame.data);
        }
        Frame {
            channels: first.channels * self.k,
            height: first.height,
            width: first.width,
            data,
        }
    }
}

impl<E: Env<Obs = Frame>> Env for FrameStack<E> {
    type Obs = Frame;

    fn reset(&mut self) -> Result<Frame> {
        let frame = self.env.reset()?;
        self.frames.clear();
        for _ in 0..self.k {
            self.frames.push_back(frame.clone());
        }
        Ok(self.stacked())
    }

    fn step(&mut self, action: usize) -> Result<Step<Frame>> {
        let mut step = self.env.step(action)?;
        anyhow::ensure!(!self.frames.is_empty(), "FrameStack stepped before reset");
        let frame = std::mem::replace(&mut step.obs, Frame::zeros(0, 0, 0));
        if self.frames.len() == self.k {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
        let stacked = self.stacked();
        Ok(step.map_obs(|_| stacked))
    }

    fn render(&mut self) -> Result<Frame> {
        self.env.render()
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }

    fn seed(&mut self, seed: u64) {
        self.env.seed(seed);
    }
}

pub struct ScaledFloatFrame<E> {
    env: E,
}

impl<E: Env<Obs = Frame>> ScaledFloatFrame<E> {
    pub fn new(env: E) -> Self {
        Self { env }
    }
}

impl<E: Env<Obs = Frame>> Env for ScaledFloatFrame<E> {
    type Obs = Observation;

    fn reset(&mut self) -> Result<Observation> {
        Ok(scale_to_unit(&self.env.reset()?))
    }

    fn step(&mut self, action: usize) -> Result<Step<Observation>> {
        Ok(self.env.step(action)?.map_obs(|f| scale_to_unit(&f)))
    }

    fn render(&mut self) -> Result<Frame> {
        self.env.render()
    }

    fn num_actions(&self) -> usize {
        self.env.num_actions()
    }

    fn seed(&mut self, seed: u64) {
        self.env.seed(seed);
    }
}

// =============================================================================
// Assembly
// =============================================================================

pub type ShooterPipeline =
    ScaledFloatFrame<FrameStack<Rgb2Gray<Downsample<StochasticFrameSkip<ShooterEnv>>>>>;

pub struct EnvSettings {
    pub rom: PathBuf,
    pub profile: GameProfile,
    pub seed: u64,
    pub env: EnvConfig,
    pub wrappers: WrapperConfig,
}

/// Emulator plus the full observation pipeline, without an episode log.
pub fn build_pipeline(settings: EnvSettings) -> Result<ShooterPipeline> {
    let EnvSettings {
        rom,
        profile,
        seed,
        env,
        wrappers,
    } = settings;
    let env = ShooterEnv::new(rom, profile, env)?;
    let env = StochasticFrameSkip::new(env, wrappers.frame_skip, wrappers.sticky_action_prob);
    let env = Downsample::new(env, wrappers.downsample_ratio);
    let env = Rgb2Gray::new(env);
    let env = FrameStack::new(env, wrappers.frame_stack);
    let mut env = ScaledFloatFrame::new(env);
    env.seed(seed);
    Ok(env)
}

/// Training environment: the pipeline with an episode log written to `log_dir`.
pub fn make_environment<P: AsRef<Path>>(
    settings: EnvSettings,
    log_dir: P,
) -> Result<Monitor<ShooterPipeline>> {
    let env_id = settings.profile.name.clone();
    let env = build_pipeline(settings)?;
    Monitor::new(env, log_dir, &env_id, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEnv;

    #[test]
    fn frame_skip_sums_rewards_and_repeats_the_action() {
        let env = ScriptedEnv::new(vec![1.0, 2.0, 3.0, 4.0], 100);
        let mut env = StochasticFrameSkip::new(env, 4, 0.0);
        env.reset().unwrap();
        let step = env.step(2).unwrap();
        assert_eq!(step.reward, 10.0);
        assert_eq!(env.env.actions(), &[2, 2, 2, 2]);
    }

    #[test]
    fn frame_skip_sticks_only_on_the_first_subframe() {
        let env = ScriptedEnv::new(vec![0.0], 100);
        let mut env = StochasticFrameSkip::new(env, 4, 1.0);
        env.reset().unwrap();
        // No previous action right after reset: the new action applies immediately.
        env.step(1).unwrap();
        env.step(2).unwrap();
        assert_eq!(env.env.actions(), &[1, 1, 1, 1, 1, 2, 2, 2]);

        env.reset().unwrap();
        env.step(0).unwrap();
        assert_eq!(&env.env.actions()[8..], &[0, 0, 0, 0]);
    }

    #[test]
    fn frame_skip_stops_on_done() {
        let env = ScriptedEnv::new(vec![1.0], 2);
        let mut env = StochasticFrameSkip::new(env, 4, 0.0);
        env.reset().unwrap();
        let step = env.step(0).unwrap();
        assert!(step.done);
        assert_eq!(step.reward, 2.0);
        assert_eq!(env.env.actions().len(), 2);
    }

    #[test]
    fn downsample_averages_blocks_per_channel() {
        let frame = Frame::new(
            2,
            2,
            4,
            vec![
                0, 2, 10, 10, //
                4, 6, 10, 11, //
                100, 100, 0, 0, //
                100, 100, 0, 1,
            ],
        )
        .unwrap();
        let out = downsample(&frame, 2);
        assert_eq!((out.channels, out.height, out.width), (2, 1, 2));
        // (0+2+4+6)/4 = 3; (10+10+10+11)/4 = 10.25 -> 10; (0+0+0+1)/4 rounds to 0
        assert_eq!(out.data, vec![3, 10, 100, 0]);
    }

    #[test]
    fn gray_matches_bt601_weights() {
        let frame = Frame::new(3, 1, 3, vec![255, 0, 0, 0, 255, 0, 0, 0, 255]).unwrap();
        let gray = rgb_to_gray(&frame).unwrap();
        assert_eq!(gray.channels, 1);
        assert_eq!(gray.data, vec![76, 150, 29]);

        let white = Frame::new(3, 1, 1, vec![255, 255, 255]).unwrap();
        assert_eq!(rgb_to_gray(&white).unwrap().data, vec![255]);
        assert!(rgb_to_gray(&Frame::zeros(1, 1, 1)).is_err());
    }

    #[test]
    fn frame_stack_fills_on_reset_and_slides_on_step() {
        let env = ScriptedEnv::new(vec![0.0], 100).with_frame_size(1, 1);
        let mut env = FrameStack::new(env, 3);
        // Scripted frames carry the step counter as their pixel value.
        let obs = env.reset().unwrap();
        assert_eq!(obs.channels, 3);
        assert_eq!(obs.data, vec![0, 0, 0]);
        let obs = env.step(0).unwrap().obs;
        assert_eq!(obs.data, vec![0, 0, 1]);
        env.step(0).unwrap();
        let obs = env.step(0).unwrap().obs;
        assert_eq!(obs.data, vec![1, 2, 3]);
    }

    #[test]
    fn observation_shape_follows_downsample_and_stack() {
        let cfg = WrapperConfig::default();
        assert_eq!(cfg.observation_shape(240, 256), (4, 120, 128));

        let env = ScriptedEnv::new(vec![0.0], 100).with_frame_size(8, 6);
        let cfg = WrapperConfig {
            frame_stack: 3,
            ..WrapperConfig::default()
        };
        let mut env = ScaledFloatFrame::new(FrameStack::new(
            Downsample::new(env, cfg.downsample_ratio),
            cfg.frame_stack,
        ));
        assert_eq!(env.reset().unwrap().shape(), cfg.observation_shape(8, 6));
    }

    #[test]
    fn scaled_frames_are_in_unit_range() {
        let obs = scale_to_unit(&Frame::new(1, 1, 3, vec![0, 51, 255]).unwrap());
        assert_eq!(obs.shape(), (1, 1, 3));
        assert_eq!(obs.data, vec![0.0, 0.2, 1.0]);
    }
}
