use clap::Parser;
use fer_pipeline::camera::CameraManager;
use fer_pipeline::config::FerConfig;
use fer_pipeline::detector::{FaceDetector, HaarCascadeDetector};
use fer_pipeline::emotion::{InferenceScheduler, OffloadedClassifier};
use fer_pipeline::error::{FerError, Result};
use fer_pipeline::identity::DeviceIdentityStore;
use fer_pipeline::onnx::OnnxClassifier;
use fer_pipeline::perception::{DetectionBatch, PerceptionLoop, RenderEvent, RenderSink};
use fer_pipeline::publisher::EventPublisher;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "fer-pipeline", about = "Real-time facial emotion recognition")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "fer.json")]
    config: PathBuf,

    /// Camera index, overriding the configuration
    #[arg(long)]
    camera: Option<u32>,
}

/// Initializes the logging system (file only, no console output)
fn init_logging(path: &Path) -> Result<()> {
    let log_file = std::fs::File::create(path)?;

    let file_layer = fmt::layer()
        .with_writer(Arc::new(log_file))
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(file_layer)
        .init();

    Ok(())
}

/// Draws into the log; a GUI would paint these over the video instead
struct LogRenderer;

impl RenderSink for LogRenderer {
    fn render(&self, event: RenderEvent) {
        match event {
            RenderEvent::NoFace => debug!("No faces detected"),
            RenderEvent::Faces(faces) => debug!("{} face(s) detected", faces.len()),
            RenderEvent::Emotion(overlay) => info!("{} at {:?}", overlay.score, overlay.region),
        }
    }
}

/// Runs camera capture and face detection on a dedicated thread, since
/// neither the camera nor the cascade can move across threads. Reports
/// startup success before entering the capture loop.
fn spawn_capture(
    config: &FerConfig,
    frames: mpsc::Sender<DetectionBatch>,
    running: Arc<AtomicBool>,
) -> oneshot::Receiver<Result<()>> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let camera_config = config.camera.clone();
    let cascade_path = config.models.cascade_path.clone();

    std::thread::spawn(move || {
        let setup = CameraManager::new(&camera_config)
            .and_then(|camera| Ok((camera, HaarCascadeDetector::new(&cascade_path)?)));
        let (mut camera, mut detector) = match setup {
            Ok(parts) => {
                let _ = ready_tx.send(Ok(()));
                parts
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let (width, height) = camera.resolution();
        info!("Capturing at {}x{}", width, height);

        while running.load(Ordering::SeqCst) {
            let frame = match camera.get_current_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to capture frame: {}", e);
                    continue;
                }
            };
            let detections = match detector.detect(&frame) {
                Ok(detections) => detections,
                Err(e) => {
                    warn!("Face detection failed: {}", e);
                    continue;
                }
            };

            // Drop the frame rather than queue behind a slow consumer
            match frames.try_send(DetectionBatch { frame, detections }) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        info!("Capture thread finished");
    });

    ready_rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = FerConfig::load(&args.config)?;
    if let Some(index) = args.camera {
        config.camera.index = index;
    }
    init_logging(&config.log_file)?;

    let identity = DeviceIdentityStore::on_disk(
        config.mqtt.as_ref().and_then(|m| m.client_id.clone()),
        &config.identity.data_dir,
        &config.identity.cookie_jar,
        config.identity.cookie_max_age_days,
    );
    let client_id = identity.get_or_create_id();
    info!("Client id: {}", client_id);

    let publisher = Arc::new(EventPublisher::from_config(config.mqtt.as_ref(), &client_id)?);
    publisher.connect();

    let classifier = OffloadedClassifier::new(OnnxClassifier::new(
        &config.models.emotion_model_path,
        config.models.input_layout,
    )?);
    let scheduler = InferenceScheduler::with_interval(classifier, config.prediction_interval());
    let device_id = publisher.is_enabled().then(|| client_id.clone());
    let perception = PerceptionLoop::new(
        scheduler,
        Arc::new(LogRenderer),
        publisher.clone(),
        device_id,
    );
    perception.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let (frame_tx, frame_rx) = mpsc::channel(2);
    spawn_capture(&config, frame_tx, running.clone())
        .await
        .map_err(|_| FerError::CameraInit("Capture thread exited during setup".to_string()))??;

    tokio::select! {
        _ = perception.run(frame_rx) => warn!("Capture stopped unexpectedly"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        }
    }

    running.store(false, Ordering::SeqCst);
    perception.stop();
    publisher.shutdown().await;

    let stats = publisher.stats();
    info!(
        "Published {} events ({} dropped, {} failed)",
        stats.published, stats.dropped, stats.failed
    );
    Ok(())
}
