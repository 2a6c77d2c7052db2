//! Episode log: the `Monitor` env wrapper that appends one row per finished
//! episode, and the reader the training hook uses to recover the reward series.
//!
//! On-disk format (`monitor.csv`):
//!
//! ```text
//! #{"t_start":1729300000.123,"env_id":"shooter"}
//! r,l,t
//! 0.95,412,12.345678
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::env::{Env, Frame, Step};

pub const MONITOR_EXT: &str = "monitor.csv";

#[derive(Debug, thiserror::Error)]
pub enum EpisodeLogError {
    #[error("no monitor files (*monitor.csv) found in {0}")]
    NoMonitorFiles(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("missing '#' JSON header line in {0}")]
    MissingHeader(PathBuf),

    #[error("failed to parse header of {path}: {source}")]
    Header {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("malformed row {line} in {path}: {reason}")]
    Row {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MonitorHeader {
    t_start: f64,
    env_id: String,
}

/// Summary attached to the step that ends an episode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeInfo {
    pub r: f64,
    pub l: u64,
    pub t: f64,
}

/// One row of the episode log after loading; `time` is relative to the earliest file start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeRecord {
    pub reward: f64,
    pub length: u64,
    pub time: f64,
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Resolve where the log lives: a directory gets `monitor.csv`, any other path gets
/// the `.monitor.csv` suffix unless it already ends with it.
pub fn monitor_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        return path.join(MONITOR_EXT);
    }
    let s = path.to_string_lossy();
    if s.ends_with(MONITOR_EXT) {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{s}.{MONITOR_EXT}"))
    }
}

// =============================================================================
// Writer
// =============================================================================

pub struct Monitor<E: Env> {
    env: E,
    writer: BufWriter<File>,
    path: PathBuf,
    started: Instant,
    allow_early_resets: bool,
    needs_reset: bool,
    rewards: Vec<f64>,
    episode_rewards: Vec<f64>,
    episode_lengths: Vec<u64>,
    episode_times: Vec<f64>,
    total_steps: u64,
}

impl<E: Env> Monitor<E> {
    pub fn new<P: AsRef<Path>>(
        env: E,
        log_path: P,
        env_id: &str,
        allow_early_resets: bool,
    ) -> Result<Self> {
        let path = monitor_path(log_path.as_ref());
        let file = File::create(&path)
            .with_context(|| format!("Failed to create episode log: {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        let header = MonitorHeader {
            t_start: unix_now(),
            env_id: env_id.to_string(),
        };
        writeln!(writer, "#{}", serde_json::to_string(&header)?)?;
        writeln!(writer, "r,l,t")?;
        writer.flush()?;

        Ok(Self {
            env,
            writer,
            path,
            started: Instant::now(),
            allow_early_resets,
            needs_reset: true,
            rewards: Vec::new(),
            episode_rewards: Vec::new(),
            episode_lengths: Vec::new(),
            episode_times: Vec::new(),
            total_steps: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn episode_rewards(&self) -> &[f64] {
        &self.episode_rewards
    }

    pub fn episode_lengths(&self) -> &[u64] {
        &self.episode_lengths
    }

    pub fn episode_times(&self) -> &[f64] {
        &self.episode_times
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    pub fn into_inner(self) -> E {
        self.env
    }

    fn finish_episode(&mut self) -> Result<EpisodeInfo> {
        let info = EpisodeInfo {
            r: round6(self.rewards.iter().sum()),
            l: self.rewards.len() as u64,
            t: round6(self.started.elapsed().as_secs_f64()),
        };
        writeln!(self.writer, "{},{},{}", info.r, info.l, info.t)?;
        self.writer.flush()?;

        self.episode_rewards.push(info.r);
        self.episode_lengths.push(info.l);
        self.episode_times.push(info.t);
        Ok(info)
    }
}

impl<E: Env> Env for Monitor<E> {
    type Obs = E::Obs;

    fn reset(&mut self) -> Result<E::Obs> {
        anyhow::ensure!(
            self.allow_early_resets || self.needs_reset,
            "tried to reset an environment before the episode finished; \
             wrap with allow_early_resets = true to permit this"
        );
        self.rewards.clear();
        self.needs_reset = false;
        self.env.reset()
    }

    fn step(&mut self, action: usize) -> Result<Step<E::Obs>> {
        anyhow::ensure!(!self.needs_reset, "tried to step an environment that needs reset");
        let mut step = self.env.step(action)?;
        self.rewards.push(step.reward);
        if step.done {
            self.needs_reset = true;
            step.info.episode = Some(self.finish_episode()?);
        }
        self.total_steps += 1;
        Ok(step)
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
// Reader
// =============================================================================

/// `None` for a zero-byte file: the writer has not flushed its header yet.
fn read_monitor_file(path: &Path) -> Result<Option<(f64, Vec<EpisodeRecord>)>, EpisodeLogError> {
    let read_err = |source: std::io::Error| EpisodeLogError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_err)?;
    let mut lines = BufReader::new(file).lines();

    let first = match lines.next() {
        Some(line) => line.map_err(read_err)?,
        None => return Ok(None),
    };
    let json = first
        .strip_prefix('#')
        .ok_or_else(|| EpisodeLogError::MissingHeader(path.to_path_buf()))?;
    let header: MonitorHeader =
        serde_json::from_str(json).map_err(|source| EpisodeLogError::Header {
            path: path.to_path_buf(),
            source,
        })?;

    let row_err = |line: usize, reason: String| EpisodeLogError::Row {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let columns = match lines.next() {
        Some(line) => line.map_err(read_err)?,
        // Header written, no column line yet: no episodes.
        None => return Ok(Some((header.t_start, Vec::new()))),
    };
    let columns: Vec<&str> = columns.trim().split(',').collect();
    let index_of = |name: &str| {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| row_err(2, format!("missing column '{name}'")))
    };
    let (ri, li, ti) = (index_of("r")?, index_of("l")?, index_of("t")?);

    let mut records = Vec::new();
    for (n, line) in lines.enumerate() {
        let line_no = n + 3;
        let line = line.map_err(read_err)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        let field = |i: usize| {
            fields
                .get(i)
                .copied()
                .ok_or_else(|| row_err(line_no, format!("expected {} fields", columns.len())))
        };
        let reward = field(ri)?
            .parse::<f64>()
            .map_err(|e| row_err(line_no, format!("reward: {e}")))?;
        // Lengths are integers, but tolerate "412.0".
        let length = field(li)?
            .parse::<f64>()
            .map_err(|e| row_err(line_no, format!("length: {e}")))? as u64;
        let time = field(ti)?
            .parse::<f64>()
            .map_err(|e| row_err(line_no, format!("time: {e}")))?;
        records.push(EpisodeRecord {
            reward,
            length,
            time: time + header.t_start,
        });
    }
    Ok(Some((header.t_start, records)))
}

/// Load every `*monitor.csv` in `dir`, merged in wall-clock order.
pub fn load_results<P: AsRef<Path>>(dir: P) -> Result<Vec<EpisodeRecord>, EpisodeLogError> {
    let dir = dir.as_ref();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Err(EpisodeLogError::NoMonitorFiles(dir.to_path_buf())),
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .is_some_and(|name| name.to_string_lossy().ends_with(MONITOR_EXT))
        })
        .collect();
    if files.is_empty() {
        return Err(EpisodeLogError::NoMonitorFiles(dir.to_path_buf()));
    }
    files.sort();

    let mut min_start = f64::INFINITY;
    let mut records = Vec::new();
    for path in &files {
        if let Some((t_start, rows)) = read_monitor_file(path)? {
            min_start = min_start.min(t_start);
            records.extend(rows);
        }
    }
    records.sort_by(|a, b| a.time.total_cmp(&b.time));
    for record in &mut records {
        record.time -= min_start;
    }
    Ok(records)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XAxis {
    Timesteps,
    Episodes,
    WallTime,
}

/// Split the log into an x series (per `axis`) and the reward series.
pub fn ts2xy(records: &[EpisodeRecord], axis: XAxis) -> (Vec<f64>, Vec<f64>) {
    let x = match axis {
        XAxis::Timesteps => records
            .iter()
            .scan(0u64, |acc, r| {
                *acc += r.length;
                Some(*acc as f64)
            })
            .collect(),
        XAxis::Episodes => (0..records.len()).map(|i| i as f64).collect(),
        XAxis::WallTime => records.iter().map(|r| r.time / 3600.0).collect(),
    };
    let y = records.iter().map(|r| r.reward).collect();
    (x, y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEnv;

    #[test]
    fn monitor_writes_header_and_one_row_per_episode() {
        let dir = tempfile::tempdir().unwrap();
        let env = ScriptedEnv::new(vec![1.0, 0.5, 0.25], 3);
        let mut env = Monitor::new(env, dir.path(), "scripted", true).unwrap();

        env.reset().unwrap();
        let mut last = None;
        for _ in 0..3 {
            last = Some(env.step(0).unwrap());
        }
        let last = last.unwrap();
        assert!(last.done);
        let info = last.info.episode.unwrap();
        assert_eq!(info.r, 1.75);
        assert_eq!(info.l, 3);

        let text = std::fs::read_to_string(dir.path().join("monitor.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("#{"));
        assert!(lines[0].contains("\"env_id\":\"scripted\""));
        assert_eq!(lines[1], "r,l,t");
        assert!(lines[2].starts_with("1.75,3,"));
        assert_eq!(lines.len(), 3);
        assert_eq!(env.episode_rewards(), &[1.75]);
        assert_eq!(env.total_steps(), 3);
    }

    #[test]
    fn stepping_a_finished_episode_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = ScriptedEnv::new(vec![1.0], 1);
        let mut env = Monitor::new(env, dir.path(), "scripted", false).unwrap();
        env.reset().unwrap();
        assert!(env.step(0).unwrap().done);
        assert!(env.step(0).is_err());
        env.reset().unwrap();
        assert!(env.step(0).is_ok());
    }

    #[test]
    fn early_reset_requires_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let env = ScriptedEnv::new(vec![1.0], 5);
        let mut env = Monitor::new(env, dir.path(), "scripted", false).unwrap();
        env.reset().unwrap();
        env.step(0).unwrap();
        assert!(env.reset().is_err());
    }

    #[test]
    fn non_directory_paths_get_the_monitor_suffix() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(monitor_path(dir.path()), dir.path().join("monitor.csv"));
        assert_eq!(
            monitor_path(Path::new("/tmp/run0")),
            PathBuf::from("/tmp/run0.monitor.csv")
        );
        assert_eq!(
            monitor_path(Path::new("/tmp/run0.monitor.csv")),
            PathBuf::from("/tmp/run0.monitor.csv")
        );
    }

    #[test]
    fn load_results_merges_files_by_wall_time() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("0.monitor.csv"),
            "#{\"t_start\": 100.0, \"env_id\": \"a\"}\nr,l,t\n1.0,10,5.0\n3.0,30,20.0\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("1.monitor.csv"),
            "#{\"t_start\": 102.0, \"env_id\": \"b\"}\nr,l,t\n2.0,20,8.0\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let records = load_results(dir.path()).unwrap();
        let rewards: Vec<f64> = records.iter().map(|r| r.reward).collect();
        assert_eq!(rewards, vec![1.0, 2.0, 3.0]);
        assert_eq!(records[0].time, 5.0);
        assert_eq!(records[1].time, 10.0);

        let (x, y) = ts2xy(&records, XAxis::Timesteps);
        assert_eq!(x, vec![10.0, 30.0, 60.0]);
        assert_eq!(y, vec![1.0, 2.0, 3.0]);
        let (x, _) = ts2xy(&records, XAxis::Episodes);
        assert_eq!(x, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn missing_log_is_reported_as_no_monitor_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_results(dir.path()),
            Err(EpisodeLogError::NoMonitorFiles(_))
        ));
        assert!(matches!(
            load_results(dir.path().join("absent")),
            Err(EpisodeLogError::NoMonitorFiles(_))
        ));
    }

    #[test]
    fn header_only_log_has_no_episodes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("monitor.csv"),
            "#{\"t_start\": 1.0, \"env_id\": \"a\"}\nr,l,t\n",
        )
        .unwrap();
        assert!(load_results(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn zero_byte_log_has_no_episodes_and_does_not_shift_times() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("monitor.csv"), b"").unwrap();
        assert!(load_results(dir.path()).unwrap().is_empty());

        std::fs::write(
            dir.path().join("1.monitor.csv"),
            "#{\"t_start\": 50.0, \"env_id\": \"a\"}\nr,l,t\n1.0,10,4.0\n",
        )
        .unwrap();
        let records = load_results(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time, 4.0);
    }

    #[test]
    fn malformed_rows_are_typed_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("monitor.csv"),
            "#{\"t_start\": 1.0, \"env_id\": \"a\"}\nr,l,t\nabc,1,1\n",
        )
        .unwrap();
        let err = load_results(dir.path()).unwrap_err();
        assert!(matches!(err, EpisodeLogError::Row { line: 3, .. }));

        std::fs::write(dir.path().join("monitor.csv"), "r,l,t\n").unwrap();
        assert!(matches!(
            load_results(dir.path()),
            Err(EpisodeLogError::MissingHeader(_))
        ));
    }
}
