use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use stickbridge::bindings::{self, AllocationPolicy};
use stickbridge::config::{Backend, Config};
use stickbridge::console::Console;
use stickbridge::devices::dispatch::DispatchHandle;
use stickbridge::devices::registry::DeviceRegistry;
use stickbridge::devices::table::SharedDevices;
use stickbridge::engine::Engine;
use stickbridge::feedback::{FlagBank, TelemetrySender};
use stickbridge::platform::loopback::LoopbackHub;
use stickbridge::platform::SourceFactory;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())
        .await
        .map_err(|e| eyre!("Failed to load configuration: {}", e))?;

    let mut layout = config.platform.loopback.clone();
    if config.platform.backend == Backend::Gilrs {
        layout.physical.clear();
    }
    let hub = LoopbackHub::new(&layout);
    let factory = source_factory(&config, &hub)?;

    let table = SharedDevices::new();
    let (events_tx, mut events_rx) = mpsc::channel(config.engine.queue_capacity.max(1));
    let (dispatch, devices) = DispatchHandle::spawn(
        factory,
        table.clone(),
        events_tx,
        config.engine.dispatch_settings(),
    )
    .await
    .map_err(|e| eyre!("Failed to start dispatch thread: {}", e))?;
    info!("{} device(s) available", devices.len());

    let registry = DeviceRegistry::new(
        devices,
        table,
        Box::new(hub.driver()),
        config.engine.axis_encoding,
    );
    let mut engine = Engine::new(registry, config.engine.pulse_duration());

    let policy = AllocationPolicy {
        ignored_slots: config.engine.ignored_slots.clone(),
        feedback_button_ceiling: config.engine.feedback_button_ceiling,
    };
    let bindings = bindings::build(&mut engine, &config.controls, &config.routes, &policy)
        .map_err(|e| eyre!("Failed to build bindings: {}", e))?;

    if let Some(path) = &config.manifest_path {
        bindings
            .manifest
            .save(path)
            .await
            .map_err(|e| eyre!("Failed to save binding manifest: {}", e))?;
    }

    let flags = FlagBank::new(&config.telemetry.flags);
    for switch in engine.feedback_switches() {
        if !flags.contains(switch.flag()) {
            warn!(
                "Feedback switch '{}' follows unknown flag '{}', it will never converge",
                switch.name(),
                switch.flag()
            );
        }
    }

    let (telemetry, mut telemetry_rx) = TelemetrySender::channel(config.engine.queue_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let console = Console::new(flags, telemetry, hub.injector());
    let _console_handle = tokio::spawn(console.run(shutdown_rx.clone()));

    let _signal_handle = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        if shutdown_tx.send(true).is_err() {
            warn!("Engine already stopped, shutdown request dropped");
        }
    });

    let result = engine
        .run(&mut events_rx, &mut telemetry_rx, shutdown_rx)
        .await;

    dispatch.shutdown().await;
    engine.drain(&mut events_rx);
    engine.close();

    match result {
        Ok(()) => {
            info!("Stopped");
            Ok(())
        }
        Err(e) => Err(eyre!("Engine stopped with error: {}", e)),
    }
}

fn source_factory(config: &Config, hub: &LoopbackHub) -> Result<SourceFactory> {
    match config.platform.backend {
        Backend::Loopback => Ok(hub.source_factory()),
        #[cfg(feature = "gilrs")]
        Backend::Gilrs => Ok(stickbridge::platform::gilrs_backend::source_factory(
            config.platform.virtual_device_name.clone(),
            hub,
        )),
        #[cfg(not(feature = "gilrs"))]
        Backend::Gilrs => Err(eyre!("Built without the gilrs feature")),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
