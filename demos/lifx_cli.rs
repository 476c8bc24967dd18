//! CLI application for controlling LIFX bulbs.
//!
//! `discover` and `scan` use the stateless helpers; every other command opens
//! a full session, runs the handshake and issues a blocking command.
//!
//! Run with: cargo run --example lifx_cli -- --help

use clap::{Parser, Subcommand};
use lifx_lights_rs::{Config, Lifx, Mac, find_bulbs, refresh};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lifx-cli")]
#[command(about = "Control LIFX bulbs on the local network", long_about = None)]
struct Cli {
    /// Number of bulbs behind the gateway
    #[arg(short, long, global = true, default_value = "1")]
    bulbs: usize,

    /// Hardware address of a single bulb (default: every bulb)
    #[arg(short, long, global = true)]
    target: Option<Mac>,

    /// Seconds to wait for replies
    #[arg(long, global = true, default_value = "2")]
    timeout: u64,

    /// Optional JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover bulbs without opening a session
    Discover,

    /// Discover bulbs and print their light state without opening a session
    Scan,

    /// Print the light state of every bulb
    Status,

    /// Turn bulbs on
    On,

    /// Turn bulbs off
    Off,

    /// Set color
    Color {
        /// Hue in degrees (0-360)
        hue: f64,
        /// Saturation (0.0-1.0)
        saturation: f64,
        /// Brightness (0.0-1.0)
        brightness: f64,
        /// Color temperature; non-zero selects the white spectrum
        #[arg(short, long, default_value = "0")]
        kelvin: u16,
        /// Transition time in milliseconds
        #[arg(short, long, default_value = "0")]
        fade: u64,
    },

    /// Print session diagnostics as JSON
    Diagnostics,

    /// Print every state report until Ctrl+C
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    config.num_bulbs = cli.bulbs;
    let timeout = Duration::from_secs(cli.timeout);
    let target = cli.target.unwrap_or(Mac::ALL);

    match cli.command {
        Commands::Discover => {
            println!("Discovering LIFX bulbs (timeout: {}s)...", cli.timeout);
            let bulbs = find_bulbs(&config, Some(cli.bulbs), config.retry_delay, timeout).await?;
            if bulbs.is_empty() {
                println!("No bulbs found on the network.");
            } else {
                println!("\nFound {} bulb(s):", bulbs.len());
                for bulb in bulbs {
                    println!("  MAC: {}  gateway: {}  at {}", bulb.mac, bulb.gateway, bulb.addr);
                }
            }
        }

        Commands::Scan => {
            for found in refresh(&config, Some(cli.bulbs), timeout).await? {
                let state = found.state;
                println!(
                    "  {:20} {}  hue {:6.1}  sat {:.2}  bri {:.2}  {}K  {}",
                    state.label,
                    found.bulb.mac,
                    state.hue,
                    state.saturation,
                    state.brightness,
                    state.kelvin,
                    if state.is_on { "ON" } else { "OFF" }
                );
            }
        }

        command => {
            // Session commands block, so keep them off the async executor.
            tokio::task::spawn_blocking(move || run_session(config, command, target, timeout))
                .await??;
        }
    }

    Ok(())
}

fn run_session(
    mut config: Config,
    command: Commands,
    target: Mac,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Commands::Color { fade, .. } = command {
        config = config.with_fade(Duration::from_millis(fade));
    }

    let lifx = Lifx::new(config);
    lifx.on_connected(|gateway| {
        println!("Connected to gateway {} at {}", gateway.mac, gateway.socket_addr())
    });

    match command {
        Commands::Status => {
            let states = lifx.run_session(|lifx| lifx.light_states())?;
            let mut states: Vec<_> = states.into_iter().collect();
            states.sort_by_key(|(mac, _)| *mac);
            println!("\nBulb Status:");
            for (mac, state) in states {
                println!(
                    "  {:20} {}  hue {:6.1}  sat {:.2}  bri {:.2}  {}K  {}",
                    state.label,
                    mac,
                    state.hue,
                    state.saturation,
                    state.brightness,
                    state.kelvin,
                    if state.is_on { "ON" } else { "OFF" }
                );
            }
        }

        Commands::On | Commands::Off => {
            let is_on = matches!(command, Commands::On);
            let states = lifx.run_session(|lifx| lifx.set_power_state(is_on, target, timeout))??;
            for (mac, on) in states {
                println!("  {:20} {}", lifx.get_bulb(mac).label, if on { "ON" } else { "OFF" });
            }
        }

        Commands::Color {
            hue,
            saturation,
            brightness,
            kelvin,
            ..
        } => {
            let states = lifx.run_session(|lifx| {
                lifx.set_light_state(hue, saturation, brightness, kelvin, target, timeout)
            })??;
            for (mac, state) in states {
                println!(
                    "  {:20} {}  hue {:.1}  sat {:.2}  bri {:.2}",
                    state.label, mac, state.hue, state.saturation, state.brightness
                );
            }
        }

        Commands::Diagnostics => {
            let diag = lifx.run_session(|lifx| lifx.diagnostics())?;
            println!("\nDiagnostics:\n{}", serde_json::to_string_pretty(&diag)?);
        }

        Commands::Watch => {
            lifx.on_power_state(|bulb, is_on| {
                println!("[{}] power {}", bulb.label, if is_on { "ON" } else { "OFF" })
            });
            lifx.on_light_state(|bulb, state| {
                println!(
                    "[{}] hue {:.1} sat {:.2} bri {:.2} {}K",
                    bulb.label, state.hue, state.saturation, state.brightness, state.kelvin
                )
            });
            println!("Watching for state reports... (Press Ctrl+C to stop)\n");
            lifx.run_forever()?;
        }

        Commands::Discover | Commands::Scan => unreachable!(),
    }

    Ok(())
}
