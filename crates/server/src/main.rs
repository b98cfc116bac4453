use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use netcode_core::config::ServerConfig;
use netcode_core::prediction::PredictionProfile;
use netcode_core::server::ServerSession;
use netcode_core::transport::UdpTransport;

#[derive(Parser)]
#[command(name = "arena-server")]
#[command(about = "Authoritative tick-based arena server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = 27015)]
    port: u16,

    #[arg(short, long, default_value_t = 128.0)]
    tick_rate: f64,

    #[arg(short, long, default_value_t = netcode_core::config::MAX_CLIENTS_LIMIT)]
    max_clients: usize,

    #[arg(long, default_value = "competitive")]
    prediction_profile: String,

    #[arg(long, default_value = "arena_01")]
    map: String,
}

fn parse_profile(name: &str) -> PredictionProfile {
    match name {
        "lenient" => PredictionProfile::LENIENT,
        "lan" => PredictionProfile::LAN,
        _ => PredictionProfile::COMPETITIVE,
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("invalid bind address")?;

    let config = ServerConfig {
        bind_addr,
        max_clients: args.max_clients,
        tick_rate_hz: args.tick_rate,
        prediction_profile: parse_profile(&args.prediction_profile),
        ..ServerConfig::default()
    };

    let transport = UdpTransport::bind(bind_addr)?;
    let mut server = ServerSession::new(config, transport)?;
    server.set_map(&args.map);

    log::info!("server listening on {bind_addr}, map {}", args.map);

    let mut last_tick = Instant::now();
    loop {
        let now = Instant::now();
        let delta = now.duration_since(last_tick);
        last_tick = now;

        server.server_tick(delta, |_session, tick, inputs| {
            log::trace!("tick {tick}: {} active inputs", inputs.len());
        });

        std::thread::sleep(Duration::from_millis(1));
    }
}
