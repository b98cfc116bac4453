//! Typed runtime configuration for server and client sessions (§4.13). Bin
//! crates parse CLI flags with `clap` and build one of these; the library
//! itself stays free of CLI concerns.

use std::net::SocketAddr;

use crate::error::{NetError, NetResult};
use crate::prediction::PredictionProfile;
use crate::protocol::TICK_RATE_HZ;

/// Upper bound on `ServerConfig::max_clients` (§6.3).
pub const MAX_CLIENTS_LIMIT: usize = 16;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_clients: usize,
    pub tick_rate_hz: f64,
    pub prediction_profile: PredictionProfile,
    /// Send a snapshot every `Nth` tick; `1` means every tick.
    pub snapshot_rate_divisor: u32,
}

impl ServerConfig {
    pub fn validate(&self) -> NetResult<()> {
        if self.max_clients == 0 {
            return Err(NetError::InvalidParam("max_clients must be > 0".into()));
        }
        if self.max_clients > MAX_CLIENTS_LIMIT {
            return Err(NetError::InvalidParam(format!(
                "max_clients must be <= {MAX_CLIENTS_LIMIT}"
            )));
        }
        if self.tick_rate_hz <= 0.0 {
            return Err(NetError::InvalidParam("tick_rate_hz must be > 0".into()));
        }
        if self.snapshot_rate_divisor == 0 {
            return Err(NetError::InvalidParam(
                "snapshot_rate_divisor must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:27015".parse().expect("valid default addr"),
            max_clients: MAX_CLIENTS_LIMIT,
            tick_rate_hz: TICK_RATE_HZ,
            prediction_profile: PredictionProfile::COMPETITIVE,
            snapshot_rate_divisor: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    /// How many ticks of interpolation delay to hold, trading latency for
    /// smoothness against server-to-client jitter (§4.9).
    pub interpolation_delay_ticks: u32,
    pub max_extrapolation_ticks: u32,
}

impl ClientConfig {
    pub fn validate(&self) -> NetResult<()> {
        if self.interpolation_delay_ticks == 0 {
            return Err(NetError::InvalidParam(
                "interpolation_delay_ticks must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:27015".parse().expect("valid default addr"),
            interpolation_delay_ticks: 2,
            max_extrapolation_ticks: 4,
        }
    }
}
