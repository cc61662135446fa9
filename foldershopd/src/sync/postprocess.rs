use std::path::{Path, PathBuf};
use std::str::FromStr;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::process::Command;

use super::naming;

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watermark image not found: {0}")]
    MissingWatermark(PathBuf),
    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("invalid watermark position: {0}")]
    InvalidPosition(String),
}

/// Transforms a staged file before it is uploaded. Processors that fail leave
/// the file as it was.
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, file_name: &str) -> bool;

    fn process<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), PostProcessError>>;
}

#[derive(Default)]
pub struct PostProcessPipeline {
    processors: Vec<Box<dyn PostProcessor>>,
}

impl PostProcessPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, processor: Box<dyn PostProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Runs every applicable processor in order and returns the path of the
    /// final file, which is `staged` itself when nothing applied or succeeded.
    pub async fn run(&self, staged: &Path, file_name: &str) -> PathBuf {
        let mut current = staged.to_path_buf();
        for (step, processor) in self.processors.iter().enumerate() {
            if !processor.applies_to(file_name) {
                continue;
            }
            let output = step_output(staged, processor.name(), step);
            match processor.process(&current, &output).await {
                Ok(()) => {
                    tracing::debug!("{} processed {file_name}", processor.name());
                    current = output;
                }
                Err(err) => {
                    tracing::warn!(
                        "{} failed for {file_name}, uploading it unmodified: {err}",
                        processor.name()
                    );
                    let _ = tokio::fs::remove_file(&output).await;
                }
            }
        }
        current
    }
}

fn step_output(staged: &Path, name: &str, step: usize) -> PathBuf {
    let file_name = staged
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    staged.with_file_name(format!("{name}{step}_{file_name}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatermarkPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
    Center,
}

impl WatermarkPosition {
    /// ffmpeg `overlay` coordinates with a 10px margin.
    pub fn overlay_expr(&self) -> &'static str {
        match self {
            WatermarkPosition::TopLeft => "10:10",
            WatermarkPosition::TopRight => "main_w-overlay_w-10:10",
            WatermarkPosition::BottomLeft => "10:main_h-overlay_h-10",
            WatermarkPosition::BottomRight => "main_w-overlay_w-10:main_h-overlay_h-10",
            WatermarkPosition::Center => "(main_w-overlay_w)/2:(main_h-overlay_h)/2",
        }
    }
}

impl FromStr for WatermarkPosition {
    type Err = PostProcessError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "top-left" => Ok(WatermarkPosition::TopLeft),
            "top-right" => Ok(WatermarkPosition::TopRight),
            "bottom-left" => Ok(WatermarkPosition::BottomLeft),
            "bottom-right" => Ok(WatermarkPosition::BottomRight),
            "center" | "centre" => Ok(WatermarkPosition::Center),
            other => Err(PostProcessError::InvalidPosition(other.to_string())),
        }
    }
}

/// Overlays a logo onto video files with ffmpeg.
#[derive(Debug, Clone)]
pub struct VideoWatermark {
    pub ffmpeg: String,
    pub image: PathBuf,
    pub position: WatermarkPosition,
    /// Logo width as a percentage of the video width.
    pub size_percent: u32,
}

impl VideoWatermark {
    fn scaled_filter(&self) -> String {
        format!(
            "[1:v][0:v]scale2ref=w=main_w*{}/100:h=ow/mdar[logo][video];[video][logo]overlay={}",
            self.size_percent.clamp(1, 100),
            self.position.overlay_expr()
        )
    }

    fn plain_filter(&self) -> String {
        format!("overlay={}", self.position.overlay_expr())
    }

    async fn run_ffmpeg(
        &self,
        input: &Path,
        output: &Path,
        filter: &str,
    ) -> Result<(), PostProcessError> {
        let result = Command::new(&self.ffmpeg)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-i")
            .arg(&self.image)
            .arg("-filter_complex")
            .arg(filter)
            .arg("-codec:a")
            .arg("copy")
            .arg(output)
            .kill_on_drop(true)
            .output()
            .await?;
        if result.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&result.stderr);
        Err(PostProcessError::CommandFailed {
            program: self.ffmpeg.clone(),
            status: result.status.to_string(),
            stderr: last_line(&stderr).to_string(),
        })
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
}

impl PostProcessor for VideoWatermark {
    fn name(&self) -> &'static str {
        "watermark"
    }

    fn applies_to(&self, file_name: &str) -> bool {
        naming::is_video(file_name)
    }

    fn process<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), PostProcessError>> {
        Box::pin(async move {
            if !tokio::fs::try_exists(&self.image).await.unwrap_or(false) {
                return Err(PostProcessError::MissingWatermark(self.image.clone()));
            }
            match self.run_ffmpeg(input, output, &self.scaled_filter()).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    tracing::debug!("scaled watermark failed, retrying unscaled: {err}");
                    self.run_ffmpeg(input, output, &self.plain_filter()).await
                }
            }
        })
    }
}
