use clap::Parser;
use client::SyncClient;
use log::{info, warn};
use rand::Rng;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Number of moves to report before disconnecting
    #[arg(short = 'm', long, default_value = "50")]
    moves: u32,

    /// Milliseconds between moves
    #[arg(short = 'i', long, default_value = "100")]
    interval_ms: u64,

    /// Largest distance covered on either axis in one move
    #[arg(long, default_value = "5.0", value_parser = parse_step)]
    step: f64,
}

fn parse_step(raw: &str) -> Result<f64, String> {
    let step: f64 = raw.parse().map_err(|e| format!("{}", e))?;
    // The walk samples from [-step, step], whose width must stay finite.
    if (2.0 * step).is_finite() {
        Ok(step.abs())
    } else {
        Err(format!("step must be finite and at most f64::MAX / 2, got {}", raw))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Connecting to: {}", args.server);
    let mut client = SyncClient::connect(&args.server).await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut rng = rand::thread_rng();

    for n in 0..args.moves {
        ticker.tick().await;

        let (x, y) = client.position();
        let step = args.step;
        let (dx, dy) = if step > 0.0 {
            (rng.gen_range(-step..=step), rng.gen_range(-step..=step))
        } else {
            (0.0, 0.0)
        };
        client.move_to(x + dx, y + dy).await?;

        match client.next_snapshot().await {
            Ok(snapshot) => info!(
                "Move {}: at ({:.2}, {:.2}), {} clients live",
                n + 1,
                x + dx,
                y + dy,
                snapshot.len()
            ),
            Err(e) => {
                warn!("Lost server: {}", e);
                return Err(e.into());
            }
        }
    }

    info!("Client {} done after {} moves", client.id(), args.moves);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_defaults_and_parses() {
        let args = Args::try_parse_from(["client"]).unwrap();
        assert_eq!(args.step, 5.0);

        let args = Args::try_parse_from(["client", "--step=-2.5"]).unwrap();
        assert_eq!(args.step, 2.5);
    }

    #[test]
    fn test_step_rejects_non_finite_values() {
        for raw in ["inf", "-inf", "NaN", "far", "1e308"] {
            let flag = format!("--step={}", raw);
            assert!(
                Args::try_parse_from(["client", flag.as_str()]).is_err(),
                "accepted {}",
                flag
            );
        }
    }
}
