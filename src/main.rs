use energy_counters::{Config, ModbusManager, Transmission};
use tokio::sync::{mpsc, watch};
use log::{error, info};


#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("COUNTERS_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    // the meters send their data and link events through this channel
    let (tx, mut rx) = mpsc::channel::<Transmission>(100);
    let (stop_tx, stop_rx) = watch::channel(false);

    let printer = tokio::spawn(async move {
        while let Some(transmission) = rx.recv().await {
            match serde_json::to_string(&transmission) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Unable to serialize transmission: {:?}", e),
            }
        }
    });

    let mut modbus = ModbusManager::new(tx, config.meters, stop_rx);
    let pollers = tokio::spawn(async move {
        modbus.start_thread().await;
    });

    info!("All meters started, now waiting for a signal to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for the exit signal: {:?}", e);
    }

    info!("Stopping, disconnecting all meters");
    let _ = stop_tx.send(true);
    let _ = pollers.await;
    let _ = printer.await;
}
