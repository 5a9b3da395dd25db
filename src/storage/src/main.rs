use log::{error, info};
use std::env;
use std::path::PathBuf;
use storage::{StorageServer, StorageServerConfig};

const DEFAULT_NAMING_ADDR: &str = "127.0.0.1:6001";
const DEFAULT_HOSTNAME: &str = "127.0.0.1";

fn usage() -> String {
    format!(
        "usage: storage_server <root> [--naming <addr>] [--hostname <host>]\n\
         \x20                        [--client-port <port>] [--command-port <port>] [--config <path>]\n\
         defaults:\n\
         --naming {}\n\
         --hostname {}\n\
         ports default to 0 (ephemeral)",
        DEFAULT_NAMING_ADDR, DEFAULT_HOSTNAME
    )
}

fn parse_args() -> Result<StorageServerConfig, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mut config = StorageServerConfig {
        root: PathBuf::from(args[0].clone()),
        naming_addr: DEFAULT_NAMING_ADDR.to_string(),
        hostname: DEFAULT_HOSTNAME.to_string(),
        client_port: 0,
        command_port: 0,
    };

    let mut i = 1usize;
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
            "--naming" => {
                i += 1;
                config.naming_addr = args
                    .get(i)
                    .ok_or_else(|| "missing value for --naming".to_string())?
                    .clone();
            }
            "--hostname" => {
                i += 1;
                config.hostname = args
                    .get(i)
                    .ok_or_else(|| "missing value for --hostname".to_string())?
                    .clone();
            }
            "--client-port" => {
                i += 1;
                config.client_port = args
                    .get(i)
                    .ok_or_else(|| "missing value for --client-port".to_string())?
                    .parse()
                    .map_err(|e| format!("bad --client-port: {}", e))?;
            }
            "--command-port" => {
                i += 1;
                config.command_port = args
                    .get(i)
                    .ok_or_else(|| "missing value for --command-port".to_string())?
                    .parse()
                    .map_err(|e| format!("bad --command-port: {}", e))?;
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

    let mut server = match StorageServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("storage server setup failed: {}", e);
            std::process::exit(1);
        }
    };
    let local_ref = match server.start().await {
        Ok(local_ref) => local_ref,
        Err(e) => {
            error!("storage server start failed: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "storage server up: read {} command {}",
        local_ref.read_addr, local_ref.command_addr
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("wait for shutdown signal failed: {}", e);
    }
    info!("shutting down");
    server.stop();
}
