//! sstunnel Client Binary
//!
//! A command-line tool that parses Shadowsocks access keys and resolves them
//! into the tunnel configuration a backend would be started with.

use log::{debug, info};
use sstunnel::{
    access_key::{ConfigResolver, HttpConfigFetcher, ServiceConfig, ShadowsocksConfigParser},
    config::Config,
    error::Result,
};
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;

enum Command {
    Parse(String),
    Resolve(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let mut config_path = "sstunnel.toml".to_string();
    let mut positional = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => match iter.next() {
                Some(path) => config_path = path.clone(),
                None => {
                    print_usage();
                    process::exit(2);
                }
            },
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => positional.push(other.to_string()),
        }
    }

    let command = match positional.as_slice() {
        [cmd, key] if cmd == "parse" => Command::Parse(key.clone()),
        [cmd, key] if cmd == "resolve" => Command::Resolve(key.clone()),
        _ => {
            print_usage();
            process::exit(2);
        }
    };

    let config = load_config(&config_path)?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    info!("Starting sstunnel client v{}", sstunnel::VERSION);
    debug!("Loaded configuration from: {}", config_path);

    let fetcher = HttpConfigFetcher::new(&config.fetch, config.timeouts.fetch())?;
    let resolver = ConfigResolver::new(Arc::new(ShadowsocksConfigParser), Arc::new(fetcher));

    let result = match command {
        Command::Parse(key) => resolver
            .parse_access_key(&key)
            .map(|service| print_service(&service)),
        Command::Resolve(key) => resolve(&resolver, &key).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
    Ok(())
}

async fn resolve(resolver: &ConfigResolver, access_key: &str) -> Result<()> {
    let service = resolver.parse_access_key(access_key)?;
    print_service(&service);

    if service.is_dynamic() {
        info!("Fetching dynamic transport config...");
    }
    let tunnel_config = resolver.resolve(&service).await?;
    println!("first hop:    {}", tunnel_config.first_hop);
    println!("client:       {}", tunnel_config.client);
    Ok(())
}

fn print_service(service: &ServiceConfig) {
    println!("name:         {}", service.name().unwrap_or("(none)"));
    match service {
        ServiceConfig::Static(config) => {
            println!("type:         static");
            println!("first hop:    {}", config.first_hop);
        }
        ServiceConfig::Dynamic(config) => {
            println!("type:         dynamic");
            println!("location:     {}", config.transport_config_location);
        }
    }
}

/// Load the config file, writing a default one if none exists
fn load_config(config_path: &str) -> Result<Config> {
    if Path::new(config_path).exists() {
        return Config::from_file(config_path);
    }

    let config = Config::default();
    let config_toml = config.to_toml()?;
    match fs::write(config_path, config_toml) {
        Ok(()) => eprintln!("Created default config file: {config_path}"),
        Err(e) => eprintln!("Failed to write default config file: {e}"),
    }
    Ok(config)
}

/// Print usage information
fn print_usage() {
    println!("sstunnel client v{}", sstunnel::VERSION);
    println!("Inspect Shadowsocks access keys");
    println!();
    println!("USAGE:");
    println!("    sstunnel-client [--config FILE] parse <ACCESS_KEY>");
    println!("    sstunnel-client [--config FILE] resolve <ACCESS_KEY>");
    println!();
    println!("COMMANDS:");
    println!("    parse      Parse the key offline and print the service config");
    println!("    resolve    Also fetch dynamic keys and print the tunnel config");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config FILE    Configuration file (default: sstunnel.toml)");
    println!("                         A default config will be created if none exists.");
    println!();
    println!("EXAMPLES:");
    println!(
        "    sstunnel-client parse '{}'",
        "ss://Y2hhY2hhMjAtaWV0Zi1wb2x5MTMwNTpwYXNzd29yZA@example.com:8388#Home"
    );
    println!("    sstunnel-client resolve 'ssconf://example.com/key#Office'");
}
