//! Render job orchestration.
//!
//! A job prepares the padded input once, then takes tiles from a
//! [`TileDispatcher`] one at a time, runs them through the model (or the
//! single-colour shortcut), folds the result into the [`SeamBlender`] and
//! writes the finished pixels into the output image.
//!
//! Every call into the engine or the transforms is bracketed by a checkpoint
//! on the [`JobSignal`]: a paused job waits there, a stopped job returns the
//! current tile to the dispatcher and ends with [`JobOutcome::Aborted`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::anyhow;
use ndarray::{concatenate, s, Axis};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blend::SeamBlender;
use crate::convert::{self, RgbaImage, Tensor};
use crate::dispatch::{TileCoord, TileDispatcher};
use crate::engine::{ModelId, RenderServices};
use crate::error::{config_bail, RenderError};
use crate::geometry::{GeometryParams, TileDescriptor, TileGeometry, DEFAULT_BLEND_SIZE};
use crate::timer::StageTimer;
use crate::tta::{TtaFolder, TtaLevel};
use crate::uniform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Stopped,
    Running,
    Paused,
}

/// Sending half of a job's state channel.
#[derive(Debug)]
pub struct JobControl {
    tx: watch::Sender<JobState>,
}

/// Receiving half, handed to [`JobController::start`].
#[derive(Debug, Clone)]
pub struct JobSignal {
    rx: watch::Receiver<JobState>,
}

impl JobControl {
    pub fn new() -> (Self, JobSignal) {
        let (tx, rx) = watch::channel(JobState::Running);
        (Self { tx }, JobSignal { rx })
    }

    pub fn state(&self) -> JobState {
        *self.tx.borrow()
    }

    pub fn pause(&self) {
        self.set(JobState::Paused);
    }

    pub fn resume(&self) {
        self.set(JobState::Running);
    }

    pub fn stop(&self) {
        self.set(JobState::Stopped);
    }

    fn set(&self, state: JobState) {
        self.tx.send_if_modified(|current| {
            // a stopped job stays stopped
            if *current == state || *current == JobState::Stopped {
                return false;
            }
            *current = state;
            true
        });
    }
}

impl JobSignal {
    pub fn state(&self) -> JobState {
        *self.rx.borrow()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct LiveState {
    focus: Option<(f64, f64)>,
    random: bool,
}

/// Tile-selection settings that may change while a job runs.
#[derive(Debug, Clone, Default)]
pub struct LiveParams {
    inner: Arc<Mutex<LiveState>>,
}

impl LiveParams {
    pub fn new(random: bool) -> Self {
        let live = Self::default();
        live.set_random(random);
        live
    }

    /// Focus point in output-image pixels.
    pub fn set_focus(&self, focus: Option<(f64, f64)>) {
        self.update(|s| s.focus = focus);
    }

    pub fn set_random(&self, random: bool) {
        self.update(|s| s.random = random);
    }

    pub fn focus(&self) -> Option<(f64, f64)> {
        self.snapshot().focus
    }

    pub fn random(&self) -> bool {
        self.snapshot().random
    }

    fn snapshot(&self) -> LiveState {
        *self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut LiveState)) {
        let mut state = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderParams {
    pub model: ModelId,
    /// Model for the alpha stream when alpha is kept; defaults to `model`.
    pub alpha_model: Option<ModelId>,
    pub keep_alpha: bool,
    pub scale: u32,
    pub offset: u32,
    pub tile_size: u32,
    pub blend_size: u32,
    pub tta_level: TtaLevel,
    pub antialias: bool,
    /// Pixels with alpha at or below this take the colour of the nearest
    /// visible pixel before upscaling.
    pub alpha_threshold: f32,
    /// Composited under transparent pixels when alpha is discarded.
    pub background: [f32; 3],
    pub linear_light: bool,
    /// Seed for random tile order; entropy when `None`.
    pub seed: Option<u64>,
}

impl RenderParams {
    pub fn new(model: ModelId, scale: u32, offset: u32, tile_size: u32) -> Self {
        Self {
            model,
            alpha_model: None,
            keep_alpha: false,
            scale,
            offset,
            tile_size,
            blend_size: DEFAULT_BLEND_SIZE,
            tta_level: TtaLevel::Off,
            antialias: false,
            alpha_threshold: 0.5,
            background: [1.0, 1.0, 1.0],
            linear_light: false,
            seed: None,
        }
    }

    pub fn alpha_model(&self) -> &ModelId {
        self.alpha_model.as_ref().unwrap_or(&self.model)
    }

    pub fn geometry_params(&self, width: u32, height: u32) -> GeometryParams {
        GeometryParams {
            input_width: width,
            input_height: height,
            scale: self.scale,
            offset: self.offset,
            tile_size: self.tile_size,
            blend_size: self.blend_size,
        }
    }

    fn validate(&self) -> Result<(), RenderError> {
        if !(0.0..=1.0).contains(&self.alpha_threshold) {
            config_bail!("alpha_threshold {} must be within 0..=1", self.alpha_threshold);
        }
        if self.background.iter().any(|c| !(0.0..=1.0).contains(c)) {
            config_bail!("background {:?} must be within 0..=1", self.background);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub tiles_total: usize,
    pub tiles_completed: usize,
    pub pixels_total: u64,
    pub pixels_completed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobReport {
    Started {
        job_id: Uuid,
        output_width: u32,
        output_height: u32,
        progress: Progress,
    },
    Paused,
    Unpaused,
    TileStarted {
        coord: TileCoord,
        progress: Progress,
        tile_pixels: u64,
    },
    TileCompleted {
        coord: TileCoord,
        progress: Progress,
        tile_pixels: u64,
        uniform: bool,
    },
    Completed {
        progress: Progress,
        elapsed_ms: u64,
    },
    Aborted {
        progress: Progress,
        remaining_tiles: usize,
    },
    Errored {
        progress: Progress,
        message: String,
    },
}

pub type Reporter = Arc<dyn Fn(&JobReport) + Send + Sync>;

#[derive(Debug)]
pub enum JobOutcome {
    Completed(RgbaImage),
    Aborted {
        partial: RgbaImage,
        remaining_tiles: usize,
    },
    Errored {
        partial: RgbaImage,
        error: RenderError,
    },
}

impl JobOutcome {
    pub fn image(&self) -> &RgbaImage {
        match self {
            JobOutcome::Completed(image) => image,
            JobOutcome::Aborted { partial, .. } | JobOutcome::Errored { partial, .. } => partial,
        }
    }

    pub fn into_image(self) -> RgbaImage {
        match self {
            JobOutcome::Completed(image) => image,
            JobOutcome::Aborted { partial, .. } | JobOutcome::Errored { partial, .. } => partial,
        }
    }
}

pub struct JobController {
    services: RenderServices,
    busy: AtomicBool,
}

impl JobController {
    pub fn new(services: RenderServices) -> Self {
        Self {
            services,
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run one render job to its end.
    ///
    /// Invalid parameters are rejected with `Err` before any report is sent.
    /// Stops and failures after that point end in an outcome that still
    /// carries every tile finished so far.
    pub async fn start(
        &self,
        image: &RgbaImage,
        params: &RenderParams,
        signal: JobSignal,
        live: LiveParams,
        reporter: Option<Reporter>,
    ) -> Result<JobOutcome, RenderError> {
        params.validate()?;
        let geometry = TileGeometry::compute(&params.geometry_params(image.width(), image.height()))?;

        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RenderError::Busy);
        }
        let _busy = BusyGuard(&self.busy);

        let dispatcher = match params.seed {
            Some(seed) => TileDispatcher::with_seed(&geometry, seed),
            None => TileDispatcher::new(&geometry),
        };

        let mut run = JobRun {
            id: Uuid::new_v4(),
            services: &self.services,
            params,
            tta: TtaFolder::new(self.services.transforms.clone(), params.tta_level),
            signal,
            live,
            reporter,
            timer: StageTimer::new(),
            output: RgbaImage::blank(geometry.output_width, geometry.output_height),
            dispatcher,
            pixels_completed: 0,
            geometry,
        };
        Ok(run.execute(image).await)
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Why the tile loop stopped early.
enum Interrupt {
    Stopped,
    Failed(RenderError),
}

impl From<RenderError> for Interrupt {
    fn from(error: RenderError) -> Self {
        Interrupt::Failed(error)
    }
}

/// Padded whole-image sources, sliced per tile.
struct Sources {
    rgb: Tensor,
    alpha: Option<Tensor>,
}

struct TileResult {
    rgb: Tensor,
    alpha: Option<Tensor>,
    uniform: bool,
}

struct JobRun<'a> {
    id: Uuid,
    services: &'a RenderServices,
    params: &'a RenderParams,
    geometry: TileGeometry,
    tta: TtaFolder,
    signal: JobSignal,
    live: LiveParams,
    reporter: Option<Reporter>,
    timer: StageTimer,
    output: RgbaImage,
    dispatcher: TileDispatcher,
    pixels_completed: u64,
}

impl JobRun<'_> {
    async fn execute(&mut self, image: &RgbaImage) -> JobOutcome {
        let started = Instant::now();
        info!(
            job_id = %self.id,
            width = image.width(),
            height = image.height(),
            scale = self.params.scale,
            tile_size = self.params.tile_size,
            tiles = self.geometry.tile_count(),
            model = %self.params.model,
            tta = %self.params.tta_level,
            keep_alpha = self.params.keep_alpha,
            "Render job started"
        );
        self.report(JobReport::Started {
            job_id: self.id,
            output_width: self.geometry.output_width,
            output_height: self.geometry.output_height,
            progress: self.progress(),
        });

        let result = self.render(image).await;
        self.timer.log_summary();

        match result {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!(job_id = %self.id, elapsed_ms, "Render job completed");
                self.report(JobReport::Completed {
                    progress: self.progress(),
                    elapsed_ms,
                });
                JobOutcome::Completed(self.take_output())
            }
            Err(Interrupt::Stopped) => {
                self.dispatcher.cancel_all();
                let remaining_tiles = self.dispatcher.remaining();
                info!(job_id = %self.id, remaining_tiles, "Render job aborted");
                self.report(JobReport::Aborted {
                    progress: self.progress(),
                    remaining_tiles,
                });
                JobOutcome::Aborted {
                    partial: self.take_output(),
                    remaining_tiles,
                }
            }
            Err(Interrupt::Failed(error)) => {
                self.dispatcher.cancel_all();
                warn!(job_id = %self.id, error = %error_chain(&error), "Render job failed");
                self.report(JobReport::Errored {
                    progress: self.progress(),
                    message: error_chain(&error),
                });
                JobOutcome::Errored {
                    partial: self.take_output(),
                    error,
                }
            }
        }
    }

    async fn render(&mut self, image: &RgbaImage) -> Result<(), Interrupt> {
        self.checkpoint().await?;

        self.timer.push("prepare");
        let prepared = self.prepare(image).await;
        self.timer.pop();
        let (sources, mut blender) = prepared?;

        while let Some(coord) = self.pick() {
            let tile = self.geometry.tile(coord);
            let tile_pixels = self.geometry.owned_pixels(coord);
            debug!(job_id = %self.id, %coord, "Tile started");
            self.report(JobReport::TileStarted {
                coord,
                progress: self.progress(),
                tile_pixels,
            });

            self.timer.push("tile");
            let processed = self.process_tile(&sources, &tile).await;
            let finished = match processed {
                Ok(result) => self.finish_tile(&mut blender, &tile, result),
                Err(interrupt) => Err(interrupt),
            };
            self.timer.pop();

            match finished {
                Ok(uniform) => {
                    self.dispatcher.submit(coord)?;
                    self.pixels_completed += tile_pixels;
                    debug!(job_id = %self.id, %coord, uniform, "Tile completed");
                    self.report(JobReport::TileCompleted {
                        coord,
                        progress: self.progress(),
                        tile_pixels,
                        uniform,
                    });
                }
                Err(interrupt) => {
                    self.dispatcher.cancel(coord)?;
                    return Err(interrupt);
                }
            }

            self.checkpoint().await?;
        }

        Ok(())
    }

    /// Build the padded colour (and stretched alpha) sources, the blend
    /// kernel and the accumulation buffer.
    async fn prepare(&mut self, image: &RgbaImage) -> Result<(Sources, SeamBlender), Interrupt> {
        let params = self.params;
        let transforms = self.services.transforms.clone();
        let padding = self.geometry.padding;

        self.timer.push("convert");
        let (rgb, alpha) = if params.keep_alpha {
            let (mut rgb, alpha) = convert::to_rgb_alpha(image);
            convert::bleed_edges(&mut rgb, &alpha, params.alpha_threshold);
            (rgb, Some(alpha))
        } else {
            (convert::to_rgb(image, params.background), None)
        };
        let mut rgb = rgb;
        if params.linear_light {
            convert::tensor_srgb_to_linear(&mut rgb);
        }
        self.timer.pop();

        let (rgb, alpha) = match alpha {
            Some(alpha) => {
                let t = transforms.clone();
                let offset = params.offset;
                let (rgb, alpha) = self
                    .call("alpha_border_pad", move || {
                        let rgb = t.alpha_border_pad(&rgb, &alpha, offset)?;
                        Ok((rgb, alpha))
                    })
                    .await?;

                let t = transforms.clone();
                let stretched = convert::stretch_alpha(&alpha);
                let alpha = self.call("pad_alpha", move || t.pad(&stretched, padding)).await?;
                (rgb, Some(alpha))
            }
            None => (rgb, None),
        };

        let t = transforms.clone();
        let rgb = self.call("pad", move || t.pad(&rgb, padding)).await?;

        let expected = [
            1,
            3,
            self.geometry.padded_height as usize,
            self.geometry.padded_width as usize,
        ];
        expect_shape("pad", &rgb, expected)?;
        if let Some(alpha) = &alpha {
            expect_shape("pad_alpha", alpha, expected)?;
        }

        let t = transforms;
        let (scale, offset, tile_size, blend_size) =
            (params.scale, params.offset, params.tile_size, params.blend_size);
        let kernel = self
            .call("create_blend_filter", move || {
                t.create_blend_filter(scale, offset, tile_size, blend_size)
            })
            .await?;

        let channels = if alpha.is_some() { 4 } else { 3 };
        let blender = SeamBlender::new(&self.geometry, channels, kernel)?;

        Ok((Sources { rgb, alpha }, blender))
    }

    fn pick(&mut self) -> Option<TileCoord> {
        if let Some(focus) = self.live.focus() {
            return self.dispatcher.take_nearest(focus, self.params.scale);
        }
        if self.live.random() {
            return self.dispatcher.take_random();
        }
        self.dispatcher.take_next()
    }

    async fn process_tile(&mut self, sources: &Sources, tile: &TileDescriptor) -> Result<TileResult, Interrupt> {
        let r = tile.input;
        let window = s![.., .., r.y as usize..r.bottom() as usize, r.x as usize..r.right() as usize];
        let rgb = sources.rgb.slice(window).to_owned();
        let alpha = sources.alpha.as_ref().map(|a| a.slice(window).to_owned());

        let size = self.geometry.output_tile_size as usize;
        if let Some(color) = uniform::detect(rgb.view(), alpha.as_ref().map(|a| a.view())) {
            let (rgb, alpha) = color.solid_tensors(size);
            return Ok(TileResult {
                rgb,
                alpha,
                uniform: true,
            });
        }

        let params = self.params;
        let (rgb, alpha) = match alpha {
            Some(alpha) if !self.tta.level().is_enabled() && params.alpha_model() == &params.model => {
                let batch = convert::batch(&[rgb.view(), alpha.view()])?;
                let out = self.run_stream(batch, &params.model, 2).await?;
                let mut parts = convert::unbatch(&out).into_iter();
                match (parts.next(), parts.next()) {
                    (Some(rgb), Some(alpha)) => (rgb, Some(alpha)),
                    _ => {
                        return Err(Interrupt::Failed(RenderError::UnexpectedShape {
                            stage: "model",
                            expected: vec![2, 3, size, size],
                            actual: out.shape().to_vec(),
                        }))
                    }
                }
            }
            Some(alpha) => {
                let rgb = self.run_stream(rgb, &params.model, 1).await?;
                let alpha = self.run_stream(alpha, params.alpha_model(), 1).await?;
                (rgb, Some(alpha))
            }
            None => (self.run_stream(rgb, &params.model, 1).await?, None),
        };

        Ok(TileResult {
            rgb,
            alpha,
            uniform: false,
        })
    }

    /// TTA split, optional antialias, model, TTA merge for one stream.
    async fn run_stream(&mut self, x: Tensor, model: &ModelId, batch: usize) -> Result<Tensor, Interrupt> {
        let tta = self.tta.clone();
        let x = if tta.level().is_enabled() {
            let folder = tta.clone();
            self.call("tta_split", move || folder.split(x)).await?
        } else {
            x
        };

        let x = if self.params.antialias {
            let t = self.services.transforms.clone();
            self.call("antialias", move || t.antialias(&x)).await?
        } else {
            x
        };

        let engine = self.services.engine.clone();
        let id = model.clone();
        let y = self.call("model", move || engine.run_model(&id, &x)).await?;

        let y = if tta.level().is_enabled() {
            self.call("tta_merge", move || tta.merge(y)).await?
        } else {
            y
        };

        let size = self.geometry.output_tile_size as usize;
        expect_shape("model", &y, [batch, 3, size, size])?;
        Ok(y)
    }

    /// Blend the tile and copy its placement into the output image. Returns
    /// whether the uniform shortcut produced it.
    fn finish_tile(
        &mut self,
        blender: &mut SeamBlender,
        tile: &TileDescriptor,
        result: TileResult,
    ) -> Result<bool, Interrupt> {
        self.timer.push("blend");
        let combined = match &result.alpha {
            Some(alpha) => concatenate(Axis(1), &[result.rgb.view(), convert::squeeze_alpha(alpha).view()])
                .map_err(|e| RenderError::inference("blend", e.into()))?,
            None => result.rgb,
        };
        let blended = blender.blend(&combined, tile);
        self.timer.pop();
        let blended = blended?;

        self.timer.push("write");
        let p = tile.placement;
        let (ox, oy) = (tile.placement_origin.0 as usize, tile.placement_origin.1 as usize);
        let block = blended.slice(s![
            0,
            ..,
            oy..oy + p.height as usize,
            ox..ox + p.width as usize
        ]);
        convert::write_region(&mut self.output, block, (p.x, p.y), self.params.linear_light);
        self.timer.pop();

        Ok(result.uniform)
    }

    /// Run `f` on the blocking pool between two checkpoints. The result of a
    /// call that finishes after a stop is discarded.
    async fn call<T, F>(&mut self, stage: &'static str, f: F) -> Result<T, Interrupt>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.checkpoint().await?;

        self.timer.push(stage);
        let joined = tokio::task::spawn_blocking(f).await;
        self.timer.pop();

        let value = match joined {
            Ok(Ok(value)) => value,
            Ok(Err(error)) => return Err(RenderError::inference(stage, error).into()),
            Err(join_error) => {
                return Err(RenderError::inference(stage, anyhow!("{stage} task failed: {join_error}")).into())
            }
        };

        self.checkpoint().await?;
        Ok(value)
    }

    /// Return immediately while running, wait while paused, fail with
    /// `Stopped` once stopped or when the control half is gone mid-pause.
    async fn checkpoint(&mut self) -> Result<(), Interrupt> {
        let mut paused = false;
        loop {
            let state = *self.signal.rx.borrow_and_update();
            match state {
                JobState::Running => {
                    if paused {
                        debug!(job_id = %self.id, "Render job resumed");
                        self.report(JobReport::Unpaused);
                    }
                    return Ok(());
                }
                JobState::Stopped => return Err(Interrupt::Stopped),
                JobState::Paused => {
                    if !paused {
                        paused = true;
                        debug!(job_id = %self.id, "Render job paused");
                        self.report(JobReport::Paused);
                    }
                    if self.signal.rx.changed().await.is_err() {
                        return Err(Interrupt::Stopped);
                    }
                }
            }
        }
    }

    fn progress(&self) -> Progress {
        Progress {
            tiles_total: self.dispatcher.total(),
            tiles_completed: self.dispatcher.submitted(),
            pixels_total: self.geometry.output_pixels(),
            pixels_completed: self.pixels_completed,
        }
    }

    fn report(&self, report: JobReport) {
        if let Some(reporter) = &self.reporter {
            reporter(&report);
        }
    }

    fn take_output(&mut self) -> RgbaImage {
        std::mem::replace(&mut self.output, RgbaImage::blank(0, 0))
    }
}

fn expect_shape(stage: &'static str, tensor: &Tensor, expected: [usize; 4]) -> Result<(), RenderError> {
    if tensor.shape() != expected {
        return Err(RenderError::UnexpectedShape {
            stage,
            expected: expected.to_vec(),
            actual: tensor.shape().to_vec(),
        });
    }
    Ok(())
}

/// `error: cause: cause` rendering of a [`RenderError`] and its sources.
fn error_chain(error: &RenderError) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_sticky() {
        let (control, signal) = JobControl::new();
        assert_eq!(signal.state(), JobState::Running);

        control.pause();
        assert_eq!(signal.state(), JobState::Paused);
        control.stop();
        control.resume();
        assert_eq!(control.state(), JobState::Stopped);
        assert_eq!(signal.state(), JobState::Stopped);
    }

    #[tokio::test]
    async fn test_signal_wakes_on_resume() {
        let (control, signal) = JobControl::new();
        let mut rx = signal.rx.clone();
        control.pause();
        let _ = rx.borrow_and_update();

        control.resume();
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), JobState::Running);
    }

    #[test]
    fn test_live_params_are_shared() {
        let live = LiveParams::new(true);
        let handle = live.clone();
        handle.set_focus(Some((12.0, 34.0)));
        handle.set_random(false);

        assert_eq!(live.focus(), Some((12.0, 34.0)));
        assert!(!live.random());
    }

    #[test]
    fn test_render_params_validation() {
        let mut params = RenderParams::new(ModelId::new("m"), 2, 16, 64);
        assert!(params.validate().is_ok());
        assert_eq!(params.alpha_model(), &params.model);

        params.alpha_threshold = 1.5;
        assert!(params.validate().unwrap_err().is_configuration());

        params.alpha_threshold = 0.5;
        params.background = [0.0, 2.0, 0.0];
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_report_serializes_with_type_tag() {
        let report = JobReport::TileCompleted {
            coord: TileCoord { row: 1, col: 2 },
            progress: Progress::default(),
            tile_pixels: 64,
            uniform: true,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "tile_completed");
        assert_eq!(json["coord"]["row"], 1);
        assert_eq!(json["uniform"], true);
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let error = RenderError::inference("model", anyhow!("device lost"));
        let message = error_chain(&error);
        assert!(message.contains("model"), "{message}");
        assert!(message.contains("device lost"), "{message}");
    }
}
