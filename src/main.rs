// =============================================================================
// Side-scrolling shooter (NES) — PPO Reinforcement Learning Agent in Rust
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- train --rom shooter.nes --profile shooter.json
//   cargo run --release -- play  --rom shooter.nes --saved-file-name trained_model

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use shooter_rl::env::{Env, EnvConfig, GameProfile, NES_HEIGHT, NES_WIDTH};
use shooter_rl::ppo::{PpoAgent, PpoConfig};
use shooter_rl::train_hook::TrainHook;
use shooter_rl::video::MovieWriter;
use shooter_rl::wrappers::{EnvSettings, WrapperConfig, build_pipeline, make_environment};

fn select_device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
}

fn env_settings(rom: &Path, profile: Option<&Path>, seed: u64) -> Result<EnvSettings> {
    Ok(EnvSettings {
        rom: rom.to_path_buf(),
        profile: GameProfile::load_or_default(profile)?,
        seed,
        env: EnvConfig::default(),
        wrappers: WrapperConfig::default(),
    })
}

// =============================================================================
// Training
// =============================================================================

fn train(args: &TrainArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  TRAINING — Shooter PPO Agent (Rust + candle)");
    eprintln!("═══════════════════════════════════════════════════════════");

    let device = select_device(args.cpu);
    eprintln!("Device: {:?}", device);

    std::fs::create_dir_all(&args.logging_dir)?;

    let settings = env_settings(&args.rom, args.profile.as_deref(), args.seeds)?;
    let obs_shape = settings.wrappers.observation_shape(NES_HEIGHT, NES_WIDTH);
    let mut env = make_environment(settings, &args.logging_dir)?;

    let mut agent = PpoAgent::new(
        &device,
        obs_shape,
        env.num_actions(),
        PpoConfig::default(),
        args.seeds,
    )?;
    let mut hook = TrainHook::new(&args.logging_dir, &args.saved_file_name);

    let t_start = Instant::now();
    agent.learn(&mut env, args.total_timesteps, &mut hook)?;
    agent.save(&args.saved_file_name)?;

    eprintln!(
        "\n✅ Training complete. {} steps in {:.1}s (best mean reward {:.2})",
        agent.num_timesteps,
        t_start.elapsed().as_secs_f64(),
        hook.best_mean_reward()
    );
    Ok(())
}

// =============================================================================
// Play with visualization
// =============================================================================

fn play(args: &PlayArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  PLAYING — Shooter PPO Agent");
    eprintln!("═══════════════════════════════════════════════════════════");

    let device = select_device(args.cpu);

    // No episode log here, so the training log stays intact.
    let settings = env_settings(&args.rom, args.profile.as_deref(), 0)?;
    let obs_shape = settings.wrappers.observation_shape(NES_HEIGHT, NES_WIDTH);
    let mut env = build_pipeline(settings)?;

    let mut agent = PpoAgent::new(
        &device,
        obs_shape,
        env.num_actions(),
        PpoConfig::default(),
        0,
    )?;
    agent.load(&args.saved_file_name)?;

    let mut window = if args.headless {
        None
    } else {
        let mut window = minifb::Window::new(
            "Shooter — RL Agent",
            NES_WIDTH,
            NES_HEIGHT,
            minifb::WindowOptions {
                resize: true,
                scale: minifb::Scale::X2,
                ..Default::default()
            },
        )?;
        window.set_target_fps(60);
        Some(window)
    };

    let mut movie = MovieWriter::new(&args.movie_file_name);
    let mut buf = Vec::with_capacity(NES_WIDTH * NES_HEIGHT);

    let mut state = env.reset()?;
    let mut total_reward = 0.0;
    let mut n_play_count = 0;

    while n_play_count < args.n_episodes {
        let frame = env.render()?;
        movie.write_frame(&frame)?;
        if let Some(window) = window.as_mut() {
            frame.to_u32_rgb(&mut buf);
            window.update_with_buffer(&buf, frame.width, frame.height)?;
            if !window.is_open() {
                break;
            }
        }
        std::thread::sleep(Duration::from_secs_f64(1.0 / 60.0));

        let action = agent.predict(&state, args.deterministic)?;
        let step = env.step(action)?;
        total_reward += step.reward;

        if step.done {
            println!("reward: {total_reward}");
            state = env.reset()?;
            total_reward = 0.0;
            n_play_count += 1;
        } else {
            state = step.obs;
        }
    }

    movie.finish()?;
    eprintln!(
        "🎬 {} frames written to {}",
        movie.frames_written(),
        movie.path().display()
    );
    Ok(())
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "shooter-rl", about = "NES side-scrolling shooter — PPO RL Agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the PPO agent, snapshotting the best policy into the logging dir
    Train(TrainArgs),
    /// Watch the trained agent play and record a movie
    Play(PlayArgs),
}

#[derive(Parser)]
struct TrainArgs {
    #[arg(long)]
    rom: PathBuf,
    /// Game profile JSON (RAM addresses for score, lives and game over)
    #[arg(long)]
    profile: Option<PathBuf>,
    #[arg(long, default_value = "./logs")]
    logging_dir: PathBuf,
    #[arg(long, default_value = "trained_model")]
    saved_file_name: String,
    #[arg(long, default_value = "128000")]
    total_timesteps: u64,
    #[arg(long, default_value = "0")]
    seeds: u64,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct PlayArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long)]
    profile: Option<PathBuf>,
    #[arg(long, default_value = "trained_model")]
    saved_file_name: String,
    #[arg(long, default_value = "ai_play.y4m")]
    movie_file_name: PathBuf,
    #[arg(long, default_value = "5")]
    n_episodes: usize,
    #[arg(long, default_value_t = false)]
    deterministic: bool,
    #[arg(long, default_value_t = false)]
    headless: bool,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => train(args),
        Commands::Play(args) => play(args),
    }
}
