//! Periodic webcam capture and upload.
//!
//! A [`CaptureService`] owns one repeating schedule. Every tick runs an
//! independent capture-upload cycle: grab a frame, encode it, upload it, and
//! report the outcome to a [`CaptureObserver`]. Cycle failures are reported,
//! never raised, and never stop the schedule.

pub mod camera;
pub mod encode;
pub mod upload;

pub use camera::{Camera, CameraSelector, StreamConstraints, VideoDevice, VideoStream, find_front_camera};
pub use encode::{CaptureOptions, CaptureResult, FrameFormat, capture_frame, encode_frame};
pub use upload::{HttpUploader, ImageUploader, UploadFormat, UploadOptions, UploadResponse};

use crate::error::{CaptureError, UploadError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{Instrument, debug, info, warn};

pub const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_millis(120_000);

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub interval: Duration,
    pub capture: CaptureOptions,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CAPTURE_INTERVAL,
            capture: CaptureOptions::default(),
        }
    }
}

/// Receives the outcome of every cycle.
#[async_trait]
pub trait CaptureObserver: Send + Sync {
    async fn on_success(&self, capture: &CaptureResult, response: UploadResponse);

    async fn on_error(&self, error: CaptureError);
}

struct CycleRunner {
    camera: Arc<dyn Camera>,
    uploader: Arc<dyn ImageUploader>,
    observer: Arc<dyn CaptureObserver>,
    options: CaptureOptions,
}

impl CycleRunner {
    async fn run_cycle(&self) {
        match self.capture_and_upload().await {
            Ok((capture, response)) => self.observer.on_success(&capture, response).await,
            Err(e) => {
                warn!(error = %e, "Capture cycle failed");
                self.observer.on_error(e).await;
            }
        }
    }

    async fn capture_and_upload(&self) -> Result<(CaptureResult, UploadResponse), CaptureError> {
        let capture = capture_frame(self.camera.as_ref(), &self.options).await?;
        let response = self.uploader.upload(&capture).await?;
        if !response.is_success() {
            return Err(UploadError::Status {
                status: response.status,
            }
            .into());
        }
        debug!(status = response.status, "Capture uploaded");
        Ok((capture, response))
    }
}

pub struct CaptureService {
    runner: Arc<CycleRunner>,
    interval: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureService {
    pub fn new(
        camera: Arc<dyn Camera>,
        uploader: Arc<dyn ImageUploader>,
        settings: CaptureSettings,
        observer: Arc<dyn CaptureObserver>,
    ) -> Self {
        Self {
            runner: Arc::new(CycleRunner {
                camera,
                uploader,
                observer,
                options: settings.capture,
            }),
            interval: settings.interval.max(Duration::from_millis(1)),
            ticker: Mutex::new(None),
        }
    }

    /// Runs one cycle right away, then one per interval. No-op when already
    /// running. Must be called inside a Tokio runtime.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            debug!("Capture service already running");
            return;
        }

        let runner = self.runner.clone();
        let period = self.interval;
        let schedule = async move {
            let mut interval = tokio::time::interval(period);
            // After a stall, run one late cycle and keep the period from there.
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let runner = runner.clone();
                // Cycles run detached so a slow upload never delays the next tick.
                tokio::spawn(async move { runner.run_cycle().await }.in_current_span());
            }
        };
        *ticker = Some(tokio::spawn(
            schedule.instrument(tracing::info_span!("capture_service")),
        ));
        info!(interval_ms = period.as_millis() as u64, "Capture service started");
    }

    /// Cancels the schedule. Cycles already in flight run to completion.
    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
            info!("Capture service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Runs exactly one cycle regardless of the schedule.
    pub async fn capture_now(&self) {
        self.runner.run_cycle().await;
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.get_mut().take() {
            handle.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{FakeCamera, FakeUploader, RecordingObserver};
    use super::*;
    use tokio::time::sleep;

    const PERIOD: Duration = Duration::from_millis(5_000);

    fn service(
        camera: FakeCamera,
        uploader: Arc<FakeUploader>,
        observer: Arc<RecordingObserver>,
    ) -> CaptureService {
        CaptureService::new(
            Arc::new(camera),
            uploader,
            CaptureSettings {
                interval: PERIOD,
                capture: CaptureOptions::default(),
            },
            observer,
        )
    }

    fn close_to(actual: Duration, expected_ms: u64) -> bool {
        actual.abs_diff(Duration::from_millis(expected_ms)) <= Duration::from_millis(10)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_run_immediately_then_every_period() {
        let observer = Arc::new(RecordingObserver::new());
        let uploader = Arc::new(FakeUploader::responding(200, "{}"));
        let service = service(FakeCamera::with_labels(&[]), uploader, observer.clone());

        service.start();
        assert!(service.is_running());
        sleep(Duration::from_millis(10_005)).await;

        let times = observer.success_times();
        assert_eq!(times.len(), 3);
        assert!(close_to(times[0], 0));
        assert!(close_to(times[1], 5_000));
        assert!(close_to(times[2], 10_000));
        assert!(observer.errors.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_ticks_do_not_burst() {
        let observer = Arc::new(RecordingObserver::new());
        let uploader = Arc::new(FakeUploader::responding(200, "{}"));
        let service = service(FakeCamera::with_labels(&[]), uploader.clone(), observer.clone());

        service.start();
        sleep(Duration::from_millis(5)).await;
        assert_eq!(uploader.calls(), 1);

        // Three periods go by without the schedule being polled.
        tokio::time::advance(Duration::from_millis(17_500)).await;
        sleep(Duration::from_millis(5)).await;
        assert_eq!(uploader.calls(), 2);

        sleep(Duration::from_millis(4_900)).await;
        assert_eq!(uploader.calls(), 2);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(uploader.calls(), 3);
        assert!(close_to(observer.success_times()[2], 22_505));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let observer = Arc::new(RecordingObserver::new());
        let uploader = Arc::new(FakeUploader::responding(200, "{}"));
        let service = service(FakeCamera::with_labels(&[]), uploader.clone(), observer.clone());

        service.stop();
        assert!(!service.is_running());

        service.start();
        service.start();
        sleep(Duration::from_millis(5)).await;
        assert_eq!(uploader.calls(), 1);

        service.stop();
        service.stop();
        assert!(!service.is_running());

        sleep(Duration::from_secs(20)).await;
        assert_eq!(uploader.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_is_reported_and_schedule_continues() {
        let observer = Arc::new(RecordingObserver::new());
        let uploader = Arc::new(FakeUploader::responding(500, "oops"));
        let service = service(FakeCamera::with_labels(&[]), uploader, observer.clone());

        service.start();
        sleep(Duration::from_millis(5_005)).await;

        let errors = observer.error_messages();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.contains("500")));
        assert!(observer.successes.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_failure_is_reported_and_camera_released() {
        let observer = Arc::new(RecordingObserver::new());
        let uploader = Arc::new(FakeUploader::responding(200, "{}"));
        let camera = FakeCamera {
            fail_grab: true,
            ..FakeCamera::with_labels(&[])
        };
        let stops = camera.stops.clone();
        let service = service(camera, uploader.clone(), observer.clone());

        service.start();
        sleep(Duration::from_millis(5_005)).await;

        assert_eq!(observer.error_messages(), vec!["Camera error: device busy"; 2]);
        assert_eq!(stops.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(uploader.calls(), 0);
        assert!(service.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_upload_does_not_shift_schedule() {
        let observer = Arc::new(RecordingObserver::new());
        let uploader = Arc::new(FakeUploader {
            delay: Some(Duration::from_millis(7_000)),
            ..FakeUploader::responding(200, "{}")
        });
        let service = service(FakeCamera::with_labels(&[]), uploader.clone(), observer.clone());

        service.start();
        sleep(Duration::from_millis(10_005)).await;

        assert_eq!(uploader.calls(), 3);
        let times = observer.success_times();
        assert_eq!(times.len(), 1);
        assert!(close_to(times[0], 7_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_now_runs_one_cycle_without_schedule() {
        let observer = Arc::new(RecordingObserver::new());
        let uploader = Arc::new(FakeUploader::responding(201, r#"{"text":"hi"}"#));
        let service = service(FakeCamera::with_labels(&[]), uploader.clone(), observer.clone());

        service.capture_now().await;
        assert!(!service.is_running());

        let successes = observer.successes.lock();
        assert_eq!(successes.len(), 1);
        let (_, capture, response) = &successes[0];
        assert_eq!((capture.width, capture.height), (8, 6));
        assert_eq!(response.status, 201);
    }
}
