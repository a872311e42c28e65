use rand::rngs::StdRng;
pub use rand::Rng;
use rand::SeedableRng;
use tokio::time::{Duration, Instant};

#[cfg(test)]
pub mod assert;
mod path;

pub use path::*;

pub fn rng_seed_now() -> StdRng {
    use std::time::SystemTime;
    StdRng::seed_from_u64(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64, // max 584 years
    )
}

// Sleeps a random fraction of `timeout`, but never past `deadline`.
pub async fn sleep_until(deadline: Instant, timeout: Duration, rng: Option<&mut StdRng>) {
    let rand = rng.map_or_else(|| rng_seed_now().gen::<f64>(), |rng| rng.gen::<f64>());
    let sleep_deadline = Instant::now() + timeout.mul_f64(rand);
    tokio::time::sleep_until(sleep_deadline.min(deadline)).await;
}

pub fn parse_bool(s: &str) -> anyhow::Result<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(anyhow::anyhow!("provided string was not a boolean string")),
    }
}

pub fn parse_bool_ext(s: &str) -> anyhow::Result<bool> {
    match s {
        "on" | "ON" | "On" | "enabled" | "ENABLED" | "Enabled" => Ok(true),
        "off" | "OFF" | "Off" | "disabled" | "DISABLED" | "Disabled" => Ok(false),
        _ => parse_bool(s),
    }
}
