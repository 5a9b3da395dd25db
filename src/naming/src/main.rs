use log::{error, info};
use naming::{NamingServer, NamingServerConfig};
use std::env;

fn usage() -> String {
    let defaults = NamingServerConfig::default();
    format!(
        "usage: naming_server [--service-port <port>] [--registration-port <port>]\n\
         \x20                      [--replication-threshold <n>] [--config <path>]\n\
         defaults:\n\
         --service-port {}\n\
         --registration-port {}\n\
         --replication-threshold {}",
        defaults.service_port, defaults.registration_port, defaults.replication_threshold
    )
}

fn parse_args() -> Result<NamingServerConfig, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.first().map(|a| a == "-h" || a == "--help").unwrap_or(false) {
        return Err(usage());
    }

    let mut config = NamingServerConfig::default();
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                let text = std::fs::read_to_string(value)
                    .map_err(|e| format!("read config {} failed: {}", value, e))?;
                config = serde_json::from_str(&text)
                    .map_err(|e| format!("parse config {} failed: {}", value, e))?;
            }
            "--service-port" => {
                i += 1;
                config.service_port = args
                    .get(i)
                    .ok_or_else(|| "missing value for --service-port".to_string())?
                    .parse()
                    .map_err(|e| format!("bad --service-port: {}", e))?;
            }
            "--registration-port" => {
                i += 1;
                config.registration_port = args
                    .get(i)
                    .ok_or_else(|| "missing value for --registration-port".to_string())?
                    .parse()
                    .map_err(|e| format!("bad --registration-port: {}", e))?;
            }
            "--replication-threshold" => {
                i += 1;
                config.replication_threshold = args
                    .get(i)
                    .ok_or_else(|| "missing value for --replication-threshold".to_string())?
                    .parse()
                    .map_err(|e| format!("bad --replication-threshold: {}", e))?;
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(config)
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = match parse_args() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    let mut server = NamingServer::new(config);
    if let Err(e) = server.start().await {
        error!("naming server start failed: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("wait for shutdown signal failed: {}", e);
    }
    info!("shutting down");
    server.stop();
}
