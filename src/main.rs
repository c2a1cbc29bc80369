use anyhow::{Context, Result};
use edge_camera_agent::cloud::{CredentialCache, HttpCredentialProvider};
use edge_camera_agent::config::{self, AgentConfig, Config, DeviceKind};
use edge_camera_agent::recorder::{CameraController, CaptureDevice, SimulatedDevice};
use edge_camera_agent::services::{DeviceHealth, EventOutput, FileWatcher, VideoCombiner, WatchKind};
use edge_camera_agent::{EventDispatcher, EventType, ShadowReconciler};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

fn build_device(agent: &AgentConfig) -> Result<Box<dyn CaptureDevice>> {
    match agent.device {
        DeviceKind::Simulated => {
            info!("Using the simulated capture device");
            Ok(Box::new(SimulatedDevice::new()))
        }
        #[cfg(feature = "gst")]
        DeviceKind::Gstreamer => {
            info!("Using GStreamer capture on {}", agent.source);
            Ok(Box::new(
                edge_camera_agent::recorder::GstCaptureDevice::new(&agent.source)?,
            ))
        }
        #[cfg(not(feature = "gst"))]
        DeviceKind::Gstreamer => Err(edge_camera_agent::Error::Config(
            "GStreamer capture requested but this build lacks the gst feature".to_string(),
        )
        .into()),
    }
}

async fn run_app(config: Config) -> Result<()> {
    info!("Starting edge camera agent {}", env!("CARGO_PKG_VERSION"));

    let events = EventDispatcher::new();
    let device = build_device(&config.agent)?;
    let camera = CameraController::new(
        events.clone(),
        config.camera.clone(),
        device,
        &config.agent.capture_dir,
    )
    .context("Failed to initialize the camera")?;
    info!("Camera initialized");

    let credentials = Arc::new(CredentialCache::new(
        Arc::new(HttpCredentialProvider::default()),
        config.cloud_connection.clone(),
    ));
    let health = Arc::new(DeviceHealth::new(
        events.clone(),
        Duration::from_secs(config.health.interval_secs),
    ));
    let combiner = Arc::new(VideoCombiner::new(
        events.clone(),
        &config.agent.capture_dir,
        &config.combiner.combine_dir,
    ));

    events.on(camera.clone());
    events.on(health.clone());
    events.register(EventType::Custom("health".to_string()), health.clone());
    events.on(credentials.clone());
    events.on(combiner);
    events.on(Arc::new(EventOutput::new(&config.events.output_file)));

    let mut shadow = ShadowReconciler::new(
        events.clone(),
        &config.shadow.desired_document,
        &config.shadow.reported_document,
    );
    shadow.add_handler(camera.clone());
    shadow.add_handler(health.clone());
    shadow.add_handler(credentials.clone());

    let consumer = events.start()?;
    info!("Event dispatcher started");

    if let Err(e) = shadow.reset_from_document().await {
        warn!("Failed to replay the desired configuration: {:#}", e);
    }

    let camera_task = camera.start();
    let health_task = health.start();
    let watcher = FileWatcher::start(
        events.clone(),
        &[
            (config.shadow.desired_document.clone(), WatchKind::Configuration),
            (config.events.input_file.clone(), WatchKind::EventInput),
        ],
    )?;

    if config.cloud_connection.is_some() {
        let credentials = credentials.clone();
        tokio::spawn(async move {
            if credentials.login(false).await.is_none() {
                warn!("No cloud credentials available yet");
            }
        });
    }

    // Apply the replayed configuration before reporting it
    events.drained().await;
    match shadow.update_document(config.shadow.update_policy).await {
        Ok(true) => info!("Reported configuration written"),
        Ok(false) => {}
        Err(e) => error!("Failed to write reported configuration: {:#}", e),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    watcher.stop().await;
    health.stop();
    if let Err(e) = camera.stop().await {
        error!("Failed to stop camera: {:#}", e);
    }
    let _ = camera_task.await;
    let _ = health_task.await;
    info!("Camera stopped");

    if tokio::time::timeout(Duration::from_secs(5), events.drained())
        .await
        .is_err()
    {
        warn!("Dropping {} undelivered events", events.pending());
    }
    events.stop();
    let _ = consumer.await;
    info!("Event dispatcher stopped");

    Ok(())
}

fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match config::load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // RUST_LOG takes precedence over the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.agent.log_level.as_str()),
    )
    .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_app(config)) {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
