//! Training progress monitor.
//!
//! Called once per optimization update. Every `check_interval` updates it re-reads
//! the whole episode log, averages the most recent `reward_window` episode rewards
//! and snapshots the model to `{log_dir}/{prefix}_{nupdates}` whenever that mean
//! beats the best seen so far in this run.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Local};
use std::io::{Stdout, Write};
use std::path::{Path, PathBuf};

use crate::monitor::{EpisodeLogError, XAxis, load_results, ts2xy};

pub const CHECK_INTERVAL: u64 = 10;
pub const REWARD_WINDOW: usize = 10;

/// What the training loop should do after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Anything that can write a snapshot of itself to disk.
pub trait SavePolicy {
    fn save(&self, path: &Path) -> Result<()>;
}

/// Hook slot of the training loop, invoked once per update.
pub trait TrainCallback {
    fn on_update(&mut self, model: &dyn SavePolicy) -> Result<CallbackAction>;
}

/// Mean of the last `window` rewards (all of them if fewer), `None` when empty.
pub fn rolling_mean(rewards: &[f64], window: usize) -> Option<f64> {
    if rewards.is_empty() || window == 0 {
        return None;
    }
    let tail = &rewards[rewards.len().saturating_sub(window)..];
    Some(tail.iter().sum::<f64>() / tail.len() as f64)
}

pub fn format_status(
    time: &DateTime<FixedOffset>,
    nupdates: u64,
    mean: f64,
    best_mean: f64,
    model_updated: bool,
) -> String {
    format!(
        "time: {}, nupdates: {nupdates}, mean: {mean:.2}, best_mean: {best_mean:.2}, model_updated: {}",
        time.format("%Y-%m-%d %H:%M:%S%.6f%:z"),
        if model_updated { "True" } else { "False" },
    )
}

pub struct TrainHook<W: Write = Stdout> {
    log_dir: PathBuf,
    saved_file_name: String,
    best_mean_reward: f64,
    nupdates: u64,
    check_interval: u64,
    reward_window: usize,
    out: W,
}

impl TrainHook<Stdout> {
    pub fn new(log_dir: impl Into<PathBuf>, saved_file_name: impl Into<String>) -> Self {
        Self::with_writer(log_dir, saved_file_name, std::io::stdout())
    }
}

impl<W: Write> TrainHook<W> {
    /// Same as `new`, but status lines go to `out`.
    pub fn with_writer(
        log_dir: impl Into<PathBuf>,
        saved_file_name: impl Into<String>,
        out: W,
    ) -> Self {
        Self {
            log_dir: log_dir.into(),
            saved_file_name: saved_file_name.into(),
            best_mean_reward: f64::NEG_INFINITY,
            nupdates: 0,
            check_interval: CHECK_INTERVAL,
            reward_window: REWARD_WINDOW,
            out,
        }
    }

    pub fn check_interval(mut self, updates: u64) -> Self {
        self.check_interval = updates.max(1);
        self
    }

    pub fn reward_window(mut self, episodes: usize) -> Self {
        self.reward_window = episodes.max(1);
        self
    }

    pub fn nupdates(&self) -> u64 {
        self.nupdates
    }

    pub fn best_mean_reward(&self) -> f64 {
        self.best_mean_reward
    }

    pub fn writer(&self) -> &W {
        &self.out
    }

    pub fn checkpoint_path(&self, nupdates: u64) -> PathBuf {
        self.log_dir
            .join(format!("{}_{nupdates}", self.saved_file_name))
    }

    /// Reward series of every finished episode; a log that does not exist yet is empty.
    fn load_rewards(&self) -> Result<Vec<f64>> {
        match load_results(&self.log_dir) {
            Ok(records) => Ok(ts2xy(&records, XAxis::Timesteps).1),
            Err(EpisodeLogError::NoMonitorFiles(dir)) => {
                tracing::debug!(dir = %dir.display(), "no episode log yet");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn update_model(&mut self, model: &dyn SavePolicy, mean_reward: f64) -> Result<bool> {
        let need_update = mean_reward > self.best_mean_reward;
        if need_update {
            self.best_mean_reward = mean_reward;
            let path = self.checkpoint_path(self.nupdates);
            model.save(&path)?;
            tracing::info!(
                path = %path.display(),
                nupdates = self.nupdates,
                mean_reward,
                "new best policy saved"
            );
        }
        Ok(need_update)
    }

    fn debug_log(&mut self, mean_reward: f64, model_updated: bool) -> Result<()> {
        let now = Local::now().fixed_offset();
        let line = format_status(
            &now,
            self.nupdates,
            mean_reward,
            self.best_mean_reward,
            model_updated,
        );
        writeln!(self.out, "{line}")?;
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> TrainCallback for TrainHook<W> {
    fn on_update(&mut self, model: &dyn SavePolicy) -> Result<CallbackAction> {
        if (self.nupdates + 1).is_multiple_of(self.check_interval) {
            let rewards = self.load_rewards()?;
            match rolling_mean(&rewards, self.reward_window) {
                Some(mean_reward) => {
                    let model_updated = self.update_model(model, mean_reward)?;
                    self.debug_log(mean_reward, model_updated)?;
                }
                None => tracing::debug!(nupdates = self.nupdates, "no finished episodes yet"),
            }
        }

        self.nupdates += 1;
        Ok(CallbackAction::Continue)
    }
}
