use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::time::{sleep, timeout};

use navlink::bluetooth::{normalize_peripheral_id, BtleplugRadio, ConnectionState, DiscoveryCandidate};
use navlink::config::AppConfig;
use navlink::logging::{configure_logging, set_debug_flags};
use navlink::{AppController, AppLifecycle, DesktopPermissions, EventFilter, PeripheralIdentity};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load settings, using defaults: {}", e);
            AppConfig::default()
        }
    };
    if let Err(e) = configure_logging(config.log_level, config.log_file.clone(), true) {
        eprintln!("Failed to configure logging: {}", e);
        navlink::init_logger();
    }
    if let Some(flags) = config.debug_flags.clone() {
        set_debug_flags(flags);
    }

    let command = args.get(1).map(String::as_str).unwrap_or("");
    let argument = args.get(2).map(String::as_str);

    let result = match (command, argument) {
        ("devices", _) => list_devices(&config).await,
        ("scan", _) => with_controller(&config, scan).await,
        ("connect", Some(id)) => {
            let id = normalize_peripheral_id(id);
            with_controller(&config, move |controller| async move {
                connect(&controller, &id).await?;
                controller.connection().disconnect().await?;
                Ok(())
            })
            .await
        }
        ("listen", Some(id)) => {
            let id = normalize_peripheral_id(id);
            with_controller(&config, move |controller| async move { listen(&controller, &id).await }).await
        }
        ("forget", Some(id)) => {
            let id = normalize_peripheral_id(id);
            with_controller(&config, move |controller| async move { forget(&controller, &id).await }).await
        }
        ("monitor", _) => with_controller(&config, monitor).await,
        _ => {
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("navlink - wearable navigation link");
    println!("\nUsage:");
    println!("  navlink scan          - Scan for supported devices (known devices reconnect)");
    println!("  navlink connect <id>  - Connect to a device once and record it");
    println!("  navlink listen <id>   - Connect and print inbound messages until Ctrl-C");
    println!("  navlink devices       - List known devices");
    println!("  navlink forget <id>   - Forget a known device");
    println!("  navlink monitor       - Run the background monitor until Ctrl-C");
}

/// Build the core on the btleplug radio, run `body`, then shut down
async fn with_controller<F, Fut>(config: &AppConfig, body: F) -> anyhow::Result<()>
where
    F: FnOnce(Arc<AppController>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let radio = BtleplugRadio::new().await.context("opening Bluetooth adapter")?;
    let controller = Arc::new(AppController::new(config, Arc::new(radio), Box::new(DesktopPermissions)));

    let (_, mut events) = controller.events().subscribe(EventFilter::all());
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("  [{}]", event);
        }
    });

    let result = body(Arc::clone(&controller)).await;
    controller.shutdown().await;
    printer.abort();
    result
}

async fn list_devices(config: &AppConfig) -> anyhow::Result<()> {
    let registry = navlink::DeviceRegistry::open(config.registry.path.clone());
    let records = registry.list_records().await?;
    if records.is_empty() {
        println!("No known devices");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  last connected {}  connections {}",
            record.peripheral,
            record.last_connected_at.format("%Y-%m-%d %H:%M"),
            record.connection_count
        );
    }
    Ok(())
}

async fn scan(controller: Arc<AppController>) -> anyhow::Result<()> {
    let connection = controller.connection();
    connection.scan().await?;
    println!("Scanning...");

    let mut printed: Vec<DiscoveryCandidate> = Vec::new();
    while connection.state() == ConnectionState::Scanning {
        for candidate in connection.candidates().await? {
            if !printed.contains(&candidate) {
                println!("  found {}", candidate.peripheral);
                printed.push(candidate);
            }
        }
        sleep(POLL_INTERVAL).await;
    }

    // A known device may have been picked up automatically
    let snapshot = connection
        .wait_for(|s| !matches!(s.state, ConnectionState::Connecting))
        .await?;
    match snapshot.connected_peripheral() {
        Some(peripheral) => println!("Reconnected to {}", peripheral),
        None => println!("Scan finished, {} device(s) found", printed.len()),
    }
    Ok(())
}

/// Scan until `id` shows up, then connect to it
async fn connect(controller: &AppController, id: &str) -> anyhow::Result<()> {
    let connection = controller.connection();
    connection.scan().await?;
    println!("Looking for {}...", id);

    loop {
        let snapshot = connection.snapshot();
        match snapshot.state {
            ConnectionState::Scanning => {
                let candidates = connection.candidates().await?;
                if let Some(candidate) = candidates.into_iter().find(|c| c.peripheral.id == id) {
                    connection.connect(candidate.peripheral).await?;
                    break;
                }
            }
            // Known device: the manager already took over
            ConnectionState::Connecting | ConnectionState::Connected
                if snapshot.peripheral.as_ref().map(|p| p.id.as_str()) == Some(id) =>
            {
                connection.connect(PeripheralIdentity::new(id, None)).await?;
                break;
            }
            _ => return Err(anyhow!("{} was not found", id)),
        }
        sleep(POLL_INTERVAL).await;
    }

    let snapshot = connection.snapshot();
    println!(
        "Connected to {} (MTU {})",
        snapshot.peripheral.map(|p| p.to_string()).unwrap_or_else(|| id.to_string()),
        snapshot.negotiated_mtu.unwrap_or_default()
    );
    Ok(())
}

async fn listen(controller: &AppController, id: &str) -> anyhow::Result<()> {
    connect(controller, id).await?;
    let connection = controller.connection();
    println!("Listening, Ctrl-C to stop");

    let mut offset = 0;
    loop {
        let stop = timeout(POLL_INTERVAL, tokio::signal::ctrl_c()).await;
        for message in connection.messages().since(offset) {
            println!("{} > {}", message.received_at.format("%H:%M:%S"), message.text);
            offset += 1;
        }
        if stop.is_ok() {
            break;
        }
        if connection.state() != ConnectionState::Connected {
            println!("Link closed");
            return Ok(());
        }
    }
    connection.disconnect().await?;
    Ok(())
}

async fn forget(controller: &AppController, id: &str) -> anyhow::Result<()> {
    if controller.connection().forget(id).await? {
        println!("Forgot {}", id);
    } else {
        println!("{} was not a known device", id);
    }
    Ok(())
}

async fn monitor(controller: Arc<AppController>) -> anyhow::Result<()> {
    controller.set_app_state(AppLifecycle::Background).await;
    controller.monitor().start();
    println!("Background monitor running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    controller.set_app_state(AppLifecycle::Foreground).await;
    Ok(())
}
