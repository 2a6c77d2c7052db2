use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{AdamW, Conv2d, Conv2dConfig, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

use crate::env::Env;
use crate::train_hook::{CallbackAction, SavePolicy, TrainCallback};
use crate::wrappers::Observation;

// =============================================================================
// Agent Hyperparameters
// =============================================================================

pub struct PpoConfig {
    pub n_steps: usize,
    pub nminibatches: usize,
    pub noptepochs: usize,
    pub learning_rate: f64,
    pub gamma: f32,
    pub lam: f32,
    pub ent_coef: f64,
    pub vf_coef: f64,
    pub max_grad_norm: f64,
    pub cliprange: f64,
    pub adam_eps: f64,
    pub hidden_size: usize,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            n_steps: 128,
            nminibatches: 4,
            noptepochs: 4,
            learning_rate: 2.5e-4,
            gamma: 0.99,
            lam: 0.95,
            ent_coef: 0.01,
            vf_coef: 0.5,
            max_grad_norm: 0.5,
            cliprange: 0.2,
            adam_eps: 1e-5,
            hidden_size: 512,
        }
    }
}

// =============================================================================
// Actor-critic network (candle)
// =============================================================================

fn conv_out(size: usize, kernel: usize, stride: usize) -> Result<usize> {
    anyhow::ensure!(
        size >= kernel,
        "observation dimension {size} is smaller than conv kernel {kernel}"
    );
    Ok((size - kernel) / stride + 1)
}

/// Nature-DQN convolutional trunk shared by a policy head and a value head.
/// Input: `(batch, C, H, W)` in `[0, 1]`.
pub struct CnnPolicy {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    fc: Linear,
    policy_out: Linear,
    value_out: Linear,
}

impl CnnPolicy {
    pub fn new(
        vs: VarBuilder,
        obs_shape: (usize, usize, usize),
        num_actions: usize,
        hidden_size: usize,
    ) -> Result<Self> {
        let (c, h, w) = obs_shape;
        let stride = |stride| Conv2dConfig {
            stride,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(c, 32, 8, stride(4), vs.pp("c1"))?;
        let conv2 = candle_nn::conv2d(32, 64, 4, stride(2), vs.pp("c2"))?;
        let conv3 = candle_nn::conv2d(64, 64, 3, stride(1), vs.pp("c3"))?;

        let oh = conv_out(conv_out(conv_out(h, 8, 4)?, 4, 2)?, 3, 1)?;
        let ow = conv_out(conv_out(conv_out(w, 8, 4)?, 4, 2)?, 3, 1)?;
        let fc = candle_nn::linear(64 * oh * ow, hidden_size, vs.pp("fc1"))?;
        let policy_out = candle_nn::linear(hidden_size, num_actions, vs.pp("pi"))?;
        let value_out = candle_nn::linear(hidden_size, 1, vs.pp("vf"))?;

        Ok(Self {
            conv1,
            conv2,
            conv3,
            fc,
            policy_out,
            value_out,
        })
    }

    /// Forward pass: observations → (action logits `(B, A)`, state values `(B)`)
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let h = self.conv1.forward(x)?.relu()?;
        let h = self.conv2.forward(&h)?.relu()?;
        let h = self.conv3.forward(&h)?.relu()?;
        let h = self.fc.forward(&h.flatten_from(1)?)?.relu()?;

        let logits = self.policy_out.forward(&h)?;
        let values = self.value_out.forward(&h)?.squeeze(1)?;
        Ok((logits, values))
    }
}

// =============================================================================
// Rollout storage
// =============================================================================

/// One update's worth of on-policy experience from a single env.
struct Rollout {
    obs: Vec<f32>,
    actions: Vec<u32>,
    rewards: Vec<f32>,
    /// `dones[t]`: the step taken at `t` ended the episode.
    dones: Vec<bool>,
    values: Vec<f32>,
    log_probs: Vec<f32>,
    last_value: f32,
}

/// Generalized advantage estimation. Returns `(advantages, returns)`.
pub fn compute_gae(
    rewards: &[f32],
    values: &[f32],
    dones: &[bool],
    last_value: f32,
    gamma: f32,
    lam: f32,
) -> (Vec<f32>, Vec<f32>) {
    let n = rewards.len();
    let mut advantages = vec![0f32; n];
    let mut last_gae = 0f32;
    for t in (0..n).rev() {
        let next_non_terminal = if dones[t] { 0.0 } else { 1.0 };
        let next_value = if t + 1 == n { last_value } else { values[t + 1] };
        let delta = rewards[t] + gamma * next_value * next_non_terminal - values[t];
        last_gae = delta + gamma * lam * next_non_terminal * last_gae;
        advantages[t] = last_gae;
    }
    let returns = advantages.iter().zip(values).map(|(a, v)| a + v).collect();
    (advantages, returns)
}

/// Inverse-CDF draw from a discrete distribution given `u` in `[0, 1)`.
pub fn sample_categorical(probs: &[f32], u: f32) -> usize {
    let mut acc = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

fn normalize(xs: &mut [f32]) {
    let n = xs.len() as f32;
    if n == 0.0 {
        return;
    }
    let mean = xs.iter().sum::<f32>() / n;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
    let std = var.sqrt() + 1e-8;
    for x in xs.iter_mut() {
        *x = (*x - mean) / std;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateStats {
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    pub approx_kl: f32,
    pub clip_fraction: f32,
    /// Gradient norm before clipping.
    pub grad_norm: f32,
}

// =============================================================================
// PPO Agent
// =============================================================================

/// Metal buffers allocated inside `f` are released when it returns (macOS only).
fn in_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    #[cfg(target_os = "macos")]
    let out = objc::rc::autoreleasepool(f);
    #[cfg(not(target_os = "macos"))]
    let out = f();
    out
}

/// Global L2 norm over the gradients of `vars`.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sq = 0f64;
    for g in vars.iter().filter_map(|v| grads.get(v.as_tensor())) {
        sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
    }
    Ok(sq.sqrt())
}

/// Rescale gradients in place so their global norm is at most `max_norm`
/// (no-op when `max_norm <= 0`). Returns the norm before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            let t = var.as_tensor();
            if let Some(scaled) = grads.get(t).map(|g| g.affine(scale, 0.0)).transpose()? {
                grads.insert(t, scaled);
            }
        }
    }
    Ok(norm)
}

/// A path without an extension gets `.safetensors`, the format `VarMap` writes.
pub fn model_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if path.extension().is_some() {
        path.to_path_buf()
    } else {
        let mut with_ext = path.as_os_str().to_owned();
        with_ext.push(".safetensors");
        PathBuf::from(with_ext)
    }
}

pub struct PpoAgent {
    pub varmap: VarMap,
    policy: CnnPolicy,
    optimizer: AdamW,
    device: Device,
    config: PpoConfig,
    obs_shape: (usize, usize, usize),
    num_actions: usize,
    pub num_timesteps: u64,
    episodes: u64,
    rng: SmallRng,
}

impl PpoAgent {
    pub fn new(
        device: &Device,
        obs_shape: (usize, usize, usize),
        num_actions: usize,
        config: PpoConfig,
        seed: u64,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let policy = CnnPolicy::new(vb, obs_shape, num_actions, config.hidden_size)?;

        let opt_params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: config.adam_eps,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(varmap.all_vars(), opt_params)?;

        Ok(Self {
            varmap,
            policy,
            optimizer,
            device: device.clone(),
            config,
            obs_shape,
            num_actions,
            num_timesteps: 0,
            episodes: 0,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn obs_shape(&self) -> (usize, usize, usize) {
        self.obs_shape
    }

    fn obs_tensor(&self, obs: &Observation) -> Result<Tensor> {
        anyhow::ensure!(
            obs.shape() == self.obs_shape,
            "observation shape {:?} does not match policy input {:?}",
            obs.shape(),
            self.obs_shape
        );
        let (c, h, w) = self.obs_shape;
        Ok(Tensor::from_slice(&obs.data, (1, c, h, w), &self.device)?)
    }

    /// Action log-probabilities and state value for one observation.
    fn evaluate(&self, obs: &Observation) -> Result<(Vec<f32>, f32)> {
        let x = self.obs_tensor(obs)?;
        let (logits, values) = self.policy.forward(&x)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_vec1::<f32>()?;
        let value = values.squeeze(0)?.to_scalar::<f32>()?;
        Ok((log_probs, value))
    }

    pub fn action_probs(&self, obs: &Observation) -> Result<Vec<f32>> {
        let (log_probs, _) = self.evaluate(obs)?;
        Ok(log_probs.iter().map(|lp| lp.exp()).collect())
    }

    /// Pick an action: sampled from the policy, or its mode when `deterministic`.
    pub fn predict(&mut self, obs: &Observation, deterministic: bool) -> Result<usize> {
        let probs = self.action_probs(obs)?;
        if deterministic {
            let (best, _) = probs
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .context("policy produced no actions")?;
            return Ok(best);
        }
        Ok(sample_categorical(&probs, self.rng.random::<f32>()))
    }

    fn act(&mut self, obs: &Observation) -> Result<(usize, f32, f32)> {
        let (log_probs, value) = self.evaluate(obs)?;
        let probs: Vec<f32> = log_probs.iter().map(|lp| lp.exp()).collect();
        let action = sample_categorical(&probs, self.rng.random::<f32>());
        Ok((action, value, log_probs[action]))
    }

    fn collect_rollout<E: Env<Obs = Observation>>(
        &mut self,
        env: &mut E,
        obs: &mut Observation,
    ) -> Result<Rollout> {
        let n = self.config.n_steps;
        let mut rollout = Rollout {
            obs: Vec::with_capacity(n * obs.data.len()),
            actions: Vec::with_capacity(n),
            rewards: Vec::with_capacity(n),
            dones: Vec::with_capacity(n),
            values: Vec::with_capacity(n),
            log_probs: Vec::with_capacity(n),
            last_value: 0.0,
        };

        for _ in 0..n {
            let (action, value, log_prob) = in_autorelease_pool(|| self.act(obs))?;
            let step = env.step(action)?;

            rollout.obs.extend_from_slice(&obs.data);
            rollout.actions.push(action as u32);
            rollout.rewards.push(step.reward as f32);
            rollout.dones.push(step.done);
            rollout.values.push(value);
            rollout.log_probs.push(log_prob);
            self.num_timesteps += 1;

            if let Some(ep) = step.info.episode {
                self.episodes += 1;
                tracing::info!(
                    episode = self.episodes,
                    reward = ep.r,
                    length = ep.l,
                    timesteps = self.num_timesteps,
                    "episode finished"
                );
                if self.episodes.is_multiple_of(10) {
                    eprintln!(
                        "Ep {:>5} | Steps {:>8} | R {:>8.2} | Len {:>5}",
                        self.episodes, self.num_timesteps, ep.r, ep.l
                    );
                }
            }

            *obs = if step.done { env.reset()? } else { step.obs };
        }

        rollout.last_value = self.evaluate(obs)?.1;
        Ok(rollout)
    }

    fn train_on(&mut self, rollout: &Rollout) -> Result<UpdateStats> {
        let n = rollout.actions.len();
        let (c, h, w) = self.obs_shape;
        let obs_len = c * h * w;
        let (advantages, returns) = compute_gae(
            &rollout.rewards,
            &rollout.values,
            &rollout.dones,
            rollout.last_value,
            self.config.gamma,
            self.config.lam,
        );

        let minibatch = (n / self.config.nminibatches.max(1)).max(1);
        let cliprange = self.config.cliprange;
        let vars = self.varmap.all_vars();
        let mut indices: Vec<usize> = (0..n).collect();
        let mut totals = UpdateStats::default();
        let mut count = 0f32;

        for _ in 0..self.config.noptepochs {
            indices.shuffle(&mut self.rng);
            for chunk in indices.chunks(minibatch) {
                let stats = in_autorelease_pool(|| {
                    let b = chunk.len();
                    let mut mb_obs = Vec::with_capacity(b * obs_len);
                    for &i in chunk {
                        mb_obs.extend_from_slice(&rollout.obs[i * obs_len..(i + 1) * obs_len]);
                    }
                    let pick = |xs: &[f32]| chunk.iter().map(|&i| xs[i]).collect::<Vec<f32>>();
                    let mut mb_adv = pick(&advantages);
                    normalize(&mut mb_adv);

                    let dev = &self.device;
                    let obs_t = Tensor::from_vec(mb_obs, (b, c, h, w), dev)?;
                    let actions_t = Tensor::from_vec(
                        chunk.iter().map(|&i| rollout.actions[i]).collect::<Vec<u32>>(),
                        b,
                        dev,
                    )?;
                    let adv_t = Tensor::from_vec(mb_adv, b, dev)?;
                    let returns_t = Tensor::from_vec(pick(&returns), b, dev)?;
                    let old_values_t = Tensor::from_vec(pick(&rollout.values), b, dev)?;
                    let old_logp_t = Tensor::from_vec(pick(&rollout.log_probs), b, dev)?;

                    let (logits, values) = self.policy.forward(&obs_t)?;
                    let log_probs_all = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
                    let log_probs = log_probs_all
                        .gather(&actions_t.unsqueeze(1)?, 1)?
                        .squeeze(1)?;
                    let entropy = log_probs_all
                        .exp()?
                        .mul(&log_probs_all)?
                        .sum(D::Minus1)?
                        .neg()?
                        .mean_all()?;

                    // Clipped surrogate objective
                    let log_ratio = log_probs.sub(&old_logp_t)?;
                    let ratio = log_ratio.exp()?;
                    let pg_losses = adv_t.mul(&ratio)?.neg()?;
                    let pg_losses2 = adv_t
                        .mul(&ratio.clamp(1.0 - cliprange, 1.0 + cliprange)?)?
                        .neg()?;
                    let pg_loss = pg_losses.maximum(&pg_losses2)?.mean_all()?;

                    // Clipped value loss
                    let values_clipped = old_values_t
                        .add(&values.sub(&old_values_t)?.clamp(-cliprange, cliprange)?)?;
                    let vf_losses1 = values.sub(&returns_t)?.sqr()?;
                    let vf_losses2 = values_clipped.sub(&returns_t)?.sqr()?;
                    let vf_loss = vf_losses1.maximum(&vf_losses2)?.mean_all()?.affine(0.5, 0.0)?;

                    let loss = pg_loss
                        .sub(&entropy.affine(self.config.ent_coef, 0.0)?)?
                        .add(&vf_loss.affine(self.config.vf_coef, 0.0)?)?;

                    let mut grads = loss.backward()?;
                    let grad_norm = clip_grad_norm(&mut grads, &vars, self.config.max_grad_norm)?;
                    self.optimizer.step(&grads)?;

                    let approx_kl = log_ratio.sqr()?.mean_all()?.to_scalar::<f32>()? * 0.5;
                    let clip_fraction = ratio
                        .affine(1.0, -1.0)?
                        .abs()?
                        .gt(cliprange)?
                        .to_dtype(DType::F32)?
                        .mean_all()?
                        .to_scalar::<f32>()?;
                    Ok(UpdateStats {
                        policy_loss: pg_loss.to_scalar::<f32>()?,
                        value_loss: vf_loss.to_scalar::<f32>()?,
                        entropy: entropy.to_scalar::<f32>()?,
                        approx_kl,
                        clip_fraction,
                        grad_norm: grad_norm as f32,
                    })
                })?;

                totals.policy_loss += stats.policy_loss;
                totals.value_loss += stats.value_loss;
                totals.entropy += stats.entropy;
                totals.approx_kl += stats.approx_kl;
                totals.clip_fraction += stats.clip_fraction;
                totals.grad_norm += stats.grad_norm;
                count += 1.0;
            }
        }

        if count > 0.0 {
            totals.policy_loss /= count;
            totals.value_loss /= count;
            totals.entropy /= count;
            totals.approx_kl /= count;
            totals.clip_fraction /= count;
            totals.grad_norm /= count;
        }
        Ok(totals)
    }

    /// Run `total_timesteps / n_steps` updates, calling `callback` after each one.
    pub fn learn<E: Env<Obs = Observation>>(
        &mut self,
        env: &mut E,
        total_timesteps: u64,
        callback: &mut dyn TrainCallback,
    ) -> Result<()> {
        let n_updates = total_timesteps / self.config.n_steps.max(1) as u64;
        let mut obs = env.reset()?;

        for update in 1..=n_updates {
            let rollout = self.collect_rollout(env, &mut obs)?;
            let stats = self.train_on(&rollout)?;
            tracing::debug!(
                update,
                n_updates,
                timesteps = self.num_timesteps,
                policy_loss = stats.policy_loss,
                value_loss = stats.value_loss,
                entropy = stats.entropy,
                approx_kl = stats.approx_kl,
                clip_fraction = stats.clip_fraction,
                grad_norm = stats.grad_norm,
                "ppo update"
            );

            if callback.on_update(&*self)? == CallbackAction::Stop {
                tracing::info!(update, "callback requested stop");
                break;
            }
        }
        Ok(())
    }

    /// Save model weights
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf> {
        let path = model_path(path);
        self.varmap
            .save(&path)
            .with_context(|| format!("Failed to save model to {}", path.display()))?;
        eprintln!("💾 Model saved to {}", path.display());
        Ok(path)
    }

    /// Load model weights; an extension-less path also tries `.safetensors`.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let path = if path.exists() {
            path.to_path_buf()
        } else {
            model_path(path)
        };
        self.varmap
            .load(&path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;
        eprintln!("📂 Model loaded from {}", path.display());
        Ok(())
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }
}

impl SavePolicy for PpoAgent {
    fn save(&self, path: &Path) -> Result<()> {
        PpoAgent::save(self, path).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEnv;
    use crate::wrappers::ScaledFloatFrame;

    fn tiny_config() -> PpoConfig {
        PpoConfig {
            n_steps: 8,
            nminibatches: 2,
            noptepochs: 2,
            hidden_size: 16,
            ..PpoConfig::default()
        }
    }

    struct CountingCallback {
        calls: u64,
        stop_after: Option<u64>,
    }

    impl TrainCallback for CountingCallback {
        fn on_update(&mut self, _model: &dyn SavePolicy) -> Result<CallbackAction> {
            self.calls += 1;
            Ok(match self.stop_after {
                Some(n) if self.calls >= n => CallbackAction::Stop,
                _ => CallbackAction::Continue,
            })
        }
    }

    #[test]
    fn gae_handles_terminal_and_bootstrapped_steps() {
        let (adv, ret) = compute_gae(&[1.0], &[0.5], &[true], 10.0, 0.99, 0.95);
        assert_eq!(adv, vec![0.5]);
        assert_eq!(ret, vec![1.0]);

        let (adv, ret) = compute_gae(&[1.0, 1.0], &[0.0, 0.0], &[false, false], 0.0, 0.5, 1.0);
        assert_eq!(adv, vec![1.5, 1.0]);
        assert_eq!(ret, vec![1.5, 1.0]);

        // Bootstrap from the value after the last step when it did not end the episode.
        let (adv, _) = compute_gae(&[0.0], &[0.0], &[false], 2.0, 0.5, 1.0);
        assert_eq!(adv, vec![1.0]);
    }

    #[test]
    fn gradients_are_rescaled_to_the_max_norm() {
        let var = Var::new(&[3f32, 4.0], &Device::Cpu).unwrap();
        // d/dx of sum(x^2)/2 is x, so the gradient norm is 5.
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap().affine(0.5, 0.0).unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = [var];

        assert!((clip_grad_norm(&mut grads, &vars, 10.0).unwrap() - 5.0).abs() < 1e-5);
        let g = grads.get(vars[0].as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g, vec![3.0, 4.0]);

        assert!((clip_grad_norm(&mut grads, &vars, 1.0).unwrap() - 5.0).abs() < 1e-5);
        let g = grads.get(vars[0].as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert!((g[0] - 0.6).abs() < 1e-4 && (g[1] - 0.8).abs() < 1e-4);
        assert!((grad_norm(&grads, &vars).unwrap() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn categorical_sampling_follows_cumulative_mass() {
        let probs = [0.2, 0.5, 0.3];
        assert_eq!(sample_categorical(&probs, 0.0), 0);
        assert_eq!(sample_categorical(&probs, 0.19), 0);
        assert_eq!(sample_categorical(&probs, 0.5), 1);
        assert_eq!(sample_categorical(&probs, 0.95), 2);
        // Rounding slack in the last bucket
        assert_eq!(sample_categorical(&[0.5, 0.4999], 0.99995), 1);
    }

    #[test]
    fn model_path_appends_extension_only_when_missing() {
        assert_eq!(model_path("logs/m_9"), PathBuf::from("logs/m_9.safetensors"));
        assert_eq!(model_path("best.safetensors"), PathBuf::from("best.safetensors"));
    }

    #[test]
    fn conv_output_sizes_match_nature_cnn() {
        // 120x128 downsampled NES frame
        let h = conv_out(conv_out(conv_out(120, 8, 4).unwrap(), 4, 2).unwrap(), 3, 1).unwrap();
        let w = conv_out(conv_out(conv_out(128, 8, 4).unwrap(), 4, 2).unwrap(), 3, 1).unwrap();
        assert_eq!((h, w), (11, 12));
        assert!(conv_out(4, 8, 4).is_err());
    }

    #[test]
    fn learn_invokes_callback_once_per_update() {
        let env = ScriptedEnv::new(vec![1.0, 0.0], 5).with_frame_size(36, 36);
        let mut env = ScaledFloatFrame::new(env);
        let mut agent =
            PpoAgent::new(&Device::Cpu, (1, 36, 36), 3, tiny_config(), 7).unwrap();
        let mut callback = CountingCallback {
            calls: 0,
            stop_after: None,
        };
        agent.learn(&mut env, 24, &mut callback).unwrap();
        assert_eq!(callback.calls, 3);
        assert_eq!(agent.num_timesteps, 24);
    }

    #[test]
    fn stop_signal_ends_learning_early() {
        let env = ScriptedEnv::new(vec![1.0], 4).with_frame_size(36, 36);
        let mut env = ScaledFloatFrame::new(env);
        let mut agent =
            PpoAgent::new(&Device::Cpu, (1, 36, 36), 3, tiny_config(), 7).unwrap();
        let mut callback = CountingCallback {
            calls: 0,
            stop_after: Some(1),
        };
        agent.learn(&mut env, 80, &mut callback).unwrap();
        assert_eq!(callback.calls, 1);
        assert_eq!(agent.num_timesteps, 8);
    }

    #[test]
    fn saved_weights_reload_into_a_fresh_agent() {
        let dir = tempfile::tempdir().unwrap();
        let obs = Observation {
            channels: 1,
            height: 36,
            width: 36,
            data: (0..36 * 36).map(|i| (i % 255) as f32 / 255.0).collect(),
        };
        let agent = PpoAgent::new(&Device::Cpu, (1, 36, 36), 3, tiny_config(), 1).unwrap();
        let saved = agent.save(dir.path().join("model")).unwrap();
        assert_eq!(saved, dir.path().join("model.safetensors"));

        let mut other = PpoAgent::new(&Device::Cpu, (1, 36, 36), 3, tiny_config(), 2).unwrap();
        other.load(dir.path().join("model")).unwrap();
        let a = agent.action_probs(&obs).unwrap();
        let b = other.action_probs(&obs).unwrap();
        assert_eq!(a, b);
        assert!((a.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn mismatched_observation_is_rejected() {
        let mut agent = PpoAgent::new(&Device::Cpu, (1, 36, 36), 3, tiny_config(), 1).unwrap();
        let obs = Observation {
            channels: 4,
            height: 36,
            width: 36,
            data: vec![0.0; 4 * 36 * 36],
        };
        assert!(agent.predict(&obs, true).is_err());
    }
}
