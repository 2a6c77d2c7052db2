use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tetanes_core::mem::Read;
use tetanes_core::prelude::*;

use crate::monitor::EpisodeInfo;

pub const NES_WIDTH: usize = 256;
pub const NES_HEIGHT: usize = 240;

// =============================================================================
// Environment interface
// =============================================================================

/// Planar (channel-major) 8-bit image: `data[c * h * w + y * w + x]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<u8>) -> Result<Self> {
        anyhow::ensure!(
            data.len() == channels * height * width,
            "frame data has {} bytes, expected {channels}x{height}x{width}",
            data.len()
        );
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![0; channels * height * width],
        }
    }

    pub fn plane(&self, c: usize) -> &[u8] {
        let len = self.height * self.width;
        &self.data[c * len..(c + 1) * len]
    }

    /// Convert an interleaved RGBA buffer (the emulator's frame buffer) to planar RGB.
    pub fn from_rgba(rgba: &[u8], height: usize, width: usize) -> Result<Self> {
        anyhow::ensure!(
            rgba.len() == height * width * 4,
            "RGBA buffer has {} bytes, expected {height}x{width}x4",
            rgba.len()
        );
        let len = height * width;
        let mut data = vec![0u8; 3 * len];
        for (i, px) in rgba.chunks_exact(4).enumerate() {
            data[i] = px[0];
            data[len + i] = px[1];
            data[2 * len + i] = px[2];
        }
        Self::new(3, height, width, data)
    }

    /// Pack an RGB frame into 0x00RRGGBB pixels for a minifb window.
    pub fn to_u32_rgb(&self, out: &mut Vec<u32>) {
        let len = self.height * self.width;
        out.clear();
        out.reserve(len);
        for i in 0..len {
            let (r, g, b) = if self.channels >= 3 {
                (self.data[i], self.data[len + i], self.data[2 * len + i])
            } else {
                (self.data[i], self.data[i], self.data[i])
            };
            out.push(((r as u32) << 16) | ((g as u32) << 8) | (b as u32));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInfo {
    pub score: u32,
    pub lives: Option<u8>,
    pub game_over: bool,
    /// Set by `Monitor` on the step that finishes an episode.
    pub episode: Option<EpisodeInfo>,
}

#[derive(Debug, Clone)]
pub struct Step<O> {
    pub obs: O,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

impl<O> Step<O> {
    pub fn map_obs<T>(self, f: impl FnOnce(O) -> T) -> Step<T> {
        Step {
            obs: f(self.obs),
            reward: self.reward,
            done: self.done,
            info: self.info,
        }
    }
}

/// Gym-style environment. Wrappers own their inner env and forward what they don't change.
pub trait Env {
    type Obs;

    fn reset(&mut self) -> Result<Self::Obs>;
    fn step(&mut self, action: usize) -> Result<Step<Self::Obs>>;
    /// Full-resolution RGB frame of the current screen.
    fn render(&mut self) -> Result<Frame>;
    fn num_actions(&self) -> usize;
    fn seed(&mut self, seed: u64);
}

// =============================================================================
// Environment Constants
// =============================================================================

pub struct EnvConfig {
    pub reward_scale: f64,
    pub max_episode_frames: u64,
    pub random_noop_range: std::ops::Range<u32>,
    pub start_press_frames: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            reward_scale: 1.0 / 20.0,
            max_episode_frames: 40_000,
            random_noop_range: 1..30,
            start_press_frames: 2,
        }
    }
}

// =============================================================================
// Game Profile (RAM map)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamFlag {
    pub address: u16,
    pub value: u8,
}

/// Per-ROM RAM map. Addresses are CPU addresses in decimal (JSON has no hex literals).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameProfile {
    pub name: String,
    /// BCD score digits, most significant first; only the low nibble is read.
    pub score_digits: Vec<u16>,
    /// Many games draw a trailing fixed zero that is not stored in RAM.
    pub score_multiplier: u32,
    pub lives: Option<u16>,
    pub gameover: Option<RamFlag>,
    pub boot_frames: u32,
    pub start_presses: u32,
    pub start_press_interval: u32,
}

impl Default for GameProfile {
    fn default() -> Self {
        Self {
            name: "shooter".to_string(),
            score_digits: Vec::new(),
            score_multiplier: 1,
            lives: None,
            gameover: None,
            boot_frames: 120,
            start_presses: 1,
            start_press_interval: 60,
        }
    }
}

impl GameProfile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open game profile: {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let profile = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse game profile: {}", path.display()))?;
        Ok(profile)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                tracing::warn!("no game profile given; rewards and game-over detection are disabled");
                Ok(Self::default())
            }
        }
    }

    /// Frames to idle after a reset before pressing START.
    pub fn settle_frames(&self, noops: u32) -> u32 {
        noops.saturating_add(self.boot_frames)
    }

    pub fn decode_score(&self, digits: impl IntoIterator<Item = u8>) -> u32 {
        let score = digits
            .into_iter()
            .fold(0u32, |acc, d| acc.saturating_mul(10).saturating_add((d & 0x0F) as u32));
        score.saturating_mul(self.score_multiplier)
    }
}

// =============================================================================
// Action Space
// =============================================================================

/// Discretized action set: only these button combinations reach the joypad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Left,
    Right,
    Fire,
}

impl Action {
    pub const COUNT: usize = 3;
    pub const ALL: [Action; Self::COUNT] = [Action::Left, Action::Right, Action::Fire];

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }

    /// Convert to tetanes Joypad button flags
    pub fn to_joypad(self) -> tetanes_core::input::JoypadBtnState {
        use tetanes_core::input::{JoypadBtn, JoypadBtnState};
        let mut state = JoypadBtnState::empty();
        match self {
            Action::Left => state.set(JoypadBtn::Left.into(), true),
            Action::Right => state.set(JoypadBtn::Right.into(), true),
            // B fires in most NES shooters
            Action::Fire => state.set(JoypadBtn::B.into(), true),
        }
        state
    }
}

// =============================================================================
// NES Environment
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct GameState {
    score: u32,
    lives: Option<u8>,
    game_over: bool,
}

pub struct ShooterEnv {
    deck: ControlDeck,
    profile: GameProfile,
    config: EnvConfig,
    prev_state: GameState,
    frames: u64,
    debug_state: bool,
    rng: SmallRng,
}

impl ShooterEnv {
    pub fn new(rom_path: PathBuf, profile: GameProfile, config: EnvConfig) -> Result<Self> {
        let mut deck = ControlDeck::new();
        // Pixels are the observation, so only audio can be skipped.
        deck.set_headless_mode(tetanes_core::control_deck::HeadlessMode::NO_AUDIO);
        deck.load_rom_path(&rom_path)
            .with_context(|| format!("Failed to load ROM: {}", rom_path.display()))?;

        Ok(Self {
            deck,
            profile,
            config,
            prev_state: GameState::default(),
            frames: 0,
            debug_state: Self::debug_state_enabled(),
            rng: SmallRng::from_os_rng(),
        })
    }

    fn debug_state_enabled() -> bool {
        match std::env::var("SHOOTER_DEBUG_STATE") {
            Ok(val) => matches!(val.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
            Err(_) => false,
        }
    }

    pub fn profile(&self) -> &GameProfile {
        &self.profile
    }

    fn peek(&self, addr: u16) -> u8 {
        self.deck.bus().peek(addr)
    }

    fn read_state(&self) -> GameState {
        let score = self
            .profile
            .decode_score(self.profile.score_digits.iter().map(|&addr| self.peek(addr)));
        let lives = self.profile.lives.map(|addr| self.peek(addr));
        let game_over = self
            .profile
            .gameover
            .is_some_and(|flag| self.peek(flag.address) == flag.value);
        GameState {
            score,
            lives,
            game_over,
        }
    }

    fn log_state(&self, tag: &str, state: &GameState) {
        if !self.debug_state {
            return;
        }
        eprintln!(
            "[state:{tag}] frame={frames} score={score} lives={lives:?} game_over={game_over}",
            frames = self.frames,
            score = state.score,
            lives = state.lives,
            game_over = state.game_over,
        );
    }

    fn clock_frame(&mut self) -> Result<()> {
        self.deck.clock_frame()?;
        Ok(())
    }

    /// Latch `btn_state` onto player one. Only the buttons this env ever presses are
    /// driven; the rest stay released from the soft reset on.
    fn set_input_state(&mut self, btn_state: tetanes_core::input::JoypadBtnState) {
        use tetanes_core::input::JoypadBtnState;
        const DRIVEN: [JoypadBtnState; 4] = [
            JoypadBtnState::LEFT,
            JoypadBtnState::RIGHT,
            JoypadBtnState::B,
            JoypadBtnState::START,
        ];
        let joypad = self.deck.joypad_mut(Player::One);
        for button in DRIVEN {
            joypad.set_button(button, btn_state.contains(button));
        }
    }

    fn press_start(&mut self, frames: u32) -> Result<()> {
        use tetanes_core::input::JoypadBtnState;
        let mut btn_state = JoypadBtnState::empty();
        btn_state.set(JoypadBtnState::START, true);
        for _ in 0..frames {
            self.set_input_state(btn_state);
            self.clock_frame()?;
        }
        self.set_input_state(JoypadBtnState::empty());
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Frame> {
        Frame::from_rgba(self.deck.frame_buffer(), NES_HEIGHT, NES_WIDTH)
    }

    /// Score delta scaled down; score resets after a game over count as zero.
    fn compute_reward(&self, cur: &GameState) -> f64 {
        let delta = cur.score as i64 - self.prev_state.score as i64;
        if delta <= 0 {
            return 0.0;
        }
        delta as f64 * self.config.reward_scale
    }

    fn is_done(&self, cur: &GameState) -> bool {
        if cur.game_over {
            return true;
        }
        let lives_lost = matches!(
            (self.prev_state.lives, cur.lives),
            (Some(prev), Some(0)) if prev > 0
        );
        lives_lost || self.frames >= self.config.max_episode_frames
    }
}

impl Env for ShooterEnv {
    type Obs = Frame;

    fn reset(&mut self) -> Result<Frame> {
        self.deck.reset(ResetKind::Soft);
        self.set_input_state(tetanes_core::input::JoypadBtnState::empty());

        let noops = self
            .rng
            .random_range(self.config.random_noop_range.clone());
        for _ in 0..self.profile.settle_frames(noops) {
            self.clock_frame()?;
        }
        for _ in 0..self.profile.start_presses {
            self.press_start(self.config.start_press_frames)?;
            for _ in 0..self.profile.start_press_interval {
                self.clock_frame()?;
            }
        }

        self.prev_state = self.read_state();
        self.frames = 0;
        self.log_state("reset", &self.prev_state);
        self.current_frame()
    }

    fn step(&mut self, action: usize) -> Result<Step<Frame>> {
        let action = Action::from_index(action)
            .with_context(|| format!("action index {action} out of range 0..{}", Action::COUNT))?;
        self.set_input_state(action.to_joypad());
        self.clock_frame()?;
        self.frames += 1;

        let state = self.read_state();
        let reward = self.compute_reward(&state);
        let done = self.is_done(&state);
        if done {
            self.log_state("done", &state);
        }
        self.prev_state = state;

        Ok(Step {
            obs: self.current_frame()?,
            reward,
            done,
            info: StepInfo {
                score: state.score,
                lives: state.lives,
                game_over: state.game_over,
                episode: None,
            },
        })
    }

    fn render(&mut self) -> Result<Frame> {
        self.current_frame()
    }

    fn num_actions(&self) -> usize {
        Action::COUNT
    }

    fn seed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }
}
