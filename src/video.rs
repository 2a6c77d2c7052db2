use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::env::Frame;

pub const MOVIE_FPS: u32 = 24;

/// Full-range BT.601 RGB -> YCbCr.
pub fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b;
    let q = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    (q(y), q(cb), q(cr))
}

struct Stream {
    out: BufWriter<File>,
    height: usize,
    width: usize,
}

/// Writes RGB frames to a YUV4MPEG2 (4:4:4) file. The file is created on the
/// first frame, whose size fixes the movie dimensions.
pub struct MovieWriter {
    path: PathBuf,
    fps: u32,
    stream: Option<Stream>,
    frames: u64,
    planes: Vec<u8>,
}

impl MovieWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fps: MOVIE_FPS,
            stream: None,
            frames: 0,
            planes: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    fn open(&self, height: usize, width: usize) -> Result<Stream> {
        let file = File::create(&self.path)
            .with_context(|| format!("Failed to create movie {}", self.path.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(
            out,
            "YUV4MPEG2 W{width} H{height} F{}:1 Ip A1:1 C444 XCOLORRANGE=FULL",
            self.fps
        )?;
        Ok(Stream { out, height, width })
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        anyhow::ensure!(
            frame.channels == 3,
            "movie frames must be RGB, got {} channels",
            frame.channels
        );
        if self.stream.is_none() {
            self.stream = Some(self.open(frame.height, frame.width)?);
        }
        let stream = self.stream.as_mut().context("movie stream not open")?;
        anyhow::ensure!(
            (frame.height, frame.width) == (stream.height, stream.width),
            "frame size {}x{} differs from movie size {}x{}",
            frame.width,
            frame.height,
            stream.width,
            stream.height
        );

        let n = frame.height * frame.width;
        self.planes.resize(3 * n, 0);
        let (r, g, b) = (frame.plane(0), frame.plane(1), frame.plane(2));
        for i in 0..n {
            let (y, cb, cr) = rgb_to_ycbcr(r[i], g[i], b[i]);
            self.planes[i] = y;
            self.planes[n + i] = cb;
            self.planes[2 * n + i] = cr;
        }
        stream.out.write_all(b"FRAME\n")?;
        stream.out.write_all(&self.planes)?;
        self.frames += 1;
        Ok(())
    }

    /// Flush buffered frames to disk. A writer that never saw a frame creates nothing.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .out
                .flush()
                .with_context(|| format!("Failed to flush movie {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl Drop for MovieWriter {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::warn!(error = %err, "movie flush on drop failed");
        }
    }
}
