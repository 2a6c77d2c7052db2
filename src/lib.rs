pub mod env;
pub mod monitor;
pub mod ppo;
pub mod train_hook;
pub mod video;
pub mod wrappers;

#[cfg(test)]
pub(crate) mod testing;

pub use env::{Action, Env, EnvConfig, Frame, GameProfile, ShooterEnv, Step, StepInfo};
pub use monitor::{EpisodeLogError, EpisodeRecord, Monitor, XAxis, load_results, ts2xy};
pub use ppo::{PpoAgent, PpoConfig};
pub use train_hook::{CallbackAction, SavePolicy, TrainCallback, TrainHook};
pub use video::MovieWriter;
pub use wrappers::{EnvSettings, Observation, WrapperConfig, build_pipeline, make_environment};
