use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use netcode_core::client::{ClientSession, ClientState};
use netcode_core::config::ClientConfig;
use netcode_core::protocol::{Buttons, UserCmd};
use netcode_core::transport::UdpTransport;

#[derive(Parser)]
#[command(name = "arena-client")]
#[command(about = "Headless arena client: connects, drives input, logs server state")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    #[arg(short, long, default_value_t = 27015)]
    port: u16,

    #[arg(long, default_value_t = 2)]
    interpolation_delay_ticks: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server_addr = format!("{}:{}", args.server, args.port)
        .parse()
        .context("invalid server address")?;
    let interpolation_delay_ticks = args.interpolation_delay_ticks;

    let config = ClientConfig {
        server_addr,
        interpolation_delay_ticks,
        ..ClientConfig::default()
    };

    let local_transport = UdpTransport::bind("0.0.0.0:0".parse().unwrap())?;
    let mut client = ClientSession::new(config, local_transport)?;
    client.connect(0xC0FF_EE42);
    log::info!("connecting to {server_addr}");

    let mut tick: u32 = 0;
    let start = Instant::now();
    let mut map_loaded = false;

    loop {
        let now_secs = start.elapsed().as_secs_f64();
        client.client_tick(now_secs);

        if client.state() == ClientState::MapLoading && !map_loaded {
            if let Some(map_name) = client.server_map_name().map(str::to_string) {
                log::info!("loaded map {map_name}");
                client.notify_map_loaded(&map_name);
                map_loaded = true;
            }
        }

        if client.state() == ClientState::MapReady {
            tick += 1;
            client.send_input(UserCmd {
                tick,
                forward: 1.0,
                buttons: Buttons::empty(),
                ..Default::default()
            });

            client.interpolate(tick as f64 - interpolation_delay_ticks as f64);
            if let Some(pose) = client.server_player_state() {
                log::debug!(
                    "player at {:?}, rtt {:.1}ms",
                    pose.position,
                    client.rtt_ms()
                );
            }
        }

        std::thread::sleep(Duration::from_millis(8));
    }
}
