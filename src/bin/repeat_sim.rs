//! Repeat simulator - replays a teach run against synthetic scans.
//!
//! Loads the teach records from a working directory and runs the repeat core
//! with a simulated registration backend. Operator input comes from stdin.
//!
//! Usage:
//!   repeat-sim <working-dir> [OPTIONS]
//!
//! Options:
//!   --config <file>        JSON config file (missing keys use defaults)
//!   --rate <hz>            Main loop rate (default: 100)
//!   --lookahead <secs>     Command lookahead (default: 0)
//!   --scan-rate <hz>       Synthetic scan rate (default: 10)
//!   --match-delay <ms>     Simulated registration time (default: 150)
//!   --fail-matching        Make every registration fail
//!
//! Stdin commands:
//!   r  resume    p  pause    a  acknowledge    q  quit

use anyhow::{Context, Result};
use nalgebra::Point3;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use teach_repeat::{
    MatchError, OperatorInput, PlaybackEvent, PointCloud, Pose, Registration, Repeat,
    RepeatConfig, RepeatInputs, RepeatOutputStreams,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Args {
    working_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    rate: Option<f64>,
    lookahead: Option<f64>,
    scan_rate: f64,
    match_delay_ms: u64,
    fail_matching: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        working_dir: None,
        config: None,
        rate: None,
        lookahead: None,
        scan_rate: 10.0,
        match_delay_ms: 150,
        fail_matching: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                result.config = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--rate" if i + 1 < args.len() => {
                result.rate = args[i + 1].parse().ok();
                i += 2;
            }
            "--lookahead" if i + 1 < args.len() => {
                result.lookahead = args[i + 1].parse().ok();
                i += 2;
            }
            "--scan-rate" if i + 1 < args.len() => {
                result.scan_rate = args[i + 1].parse().unwrap_or(10.0);
                i += 2;
            }
            "--match-delay" if i + 1 < args.len() => {
                result.match_delay_ms = args[i + 1].parse().unwrap_or(150);
                i += 2;
            }
            "--fail-matching" => {
                result.fail_matching = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg if !arg.starts_with("--") && result.working_dir.is_none() => {
                result.working_dir = Some(PathBuf::from(arg));
                i += 1;
            }
            _ => {
                i += 1;
            }
        }
    }

    result
}

fn print_usage() {
    println!("Repeat Simulator - replays a teach run against synthetic scans");
    println!();
    println!("Usage: repeat-sim <working-dir> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <file>        JSON config file (missing keys use defaults)");
    println!("  --rate <hz>            Main loop rate (default: 100)");
    println!("  --lookahead <secs>     Command lookahead (default: 0)");
    println!("  --scan-rate <hz>       Synthetic scan rate (default: 10)");
    println!("  --match-delay <ms>     Simulated registration time (default: 150)");
    println!("  --fail-matching        Make every registration fail");
    println!();
    println!("Stdin commands: r = resume, p = pause, a = acknowledge, q = quit");
}

/// A ring of noisy points around the sensor.
fn synthetic_scan(stamp: f64) -> PointCloud {
    let mut rng = rand::rng();
    let points = (0..360)
        .map(|deg| {
            let angle = (deg as f64).to_radians();
            let range = 5.0 + rng.random_range(-0.05..0.05);
            Point3::new(
                range * angle.cos(),
                range * angle.sin(),
                rng.random_range(-0.5..0.5),
            )
        })
        .collect();
    PointCloud::new(stamp, points)
}

async fn produce_scans(scans: mpsc::Sender<PointCloud>, rate: f64, cancel: CancellationToken) {
    let start = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / rate.max(0.1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let scan = synthetic_scan(start.elapsed().as_secs_f64());
                match scans.try_send(scan) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!("Scan queue full, skipping scan");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
}

async fn read_operator(operator: mpsc::Sender<OperatorInput>, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let event = match line {
            Ok(Some(line)) => match line.trim() {
                "r" => PlaybackEvent::Resume,
                "p" => PlaybackEvent::Pause,
                "a" => PlaybackEvent::Acknowledge,
                "q" => {
                    cancel.cancel();
                    break;
                }
                "" => continue,
                other => {
                    println!("Unknown command '{}' (r, p, a, q)", other);
                    continue;
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Stdin error: {}", e);
                break;
            }
        };
        if operator.send(OperatorInput::Event(event)).await.is_err() {
            break;
        }
    }
}

async fn log_outputs(mut streams: RepeatOutputStreams) {
    let mut commands = 0u64;
    loop {
        tokio::select! {
            cmd = streams.commands.recv() => match cmd {
                Ok(cmd) if cmd.is_idle() => tracing::info!("Idle command sent"),
                Ok(cmd) => {
                    commands += 1;
                    if commands % 100 == 0 {
                        tracing::info!(
                            "Command #{}: v {:.3} m/s, w {:.3} rad/s",
                            commands,
                            cmd.linear.x,
                            cmd.angular.z
                        );
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Command log lagged, {} commands skipped", missed);
                }
                Err(RecvError::Closed) => break,
            },
            Ok(switch) = streams.anchor_switches.recv() => {
                tracing::info!(
                    "Anchor point {} at {:.3}s",
                    switch.anchor,
                    switch.sim_time
                );
            }
            Ok(report) = streams.errors.recv() => {
                tracing::debug!(
                    "Error vs {}: x {:.3} y {:.3} heading {:.3}",
                    report.anchor,
                    report.error.x,
                    report.error.y,
                    report.error.heading
                );
            }
            Ok(_) = streams.reference_poses.recv() => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("teach_repeat=info".parse()?)
                .add_directive("repeat_sim=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = parse_args();
    let Some(working_dir) = args.working_dir.clone() else {
        print_usage();
        std::process::exit(1);
    };

    let mut config = match &args.config {
        Some(path) => RepeatConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RepeatConfig::default(),
    }
    .with_working_directory(&working_dir);
    if let Some(rate) = args.rate {
        config.loop_rate_hz = rate;
    }
    if let Some(lookahead) = args.lookahead {
        config.params.lookahead = lookahead;
    }

    println!();
    println!("========================================");
    println!("Repeat Simulator");
    println!("========================================");
    println!("Records:   {}", working_dir.display());
    println!("Loop rate: {} Hz", config.loop_rate_hz);
    println!(
        "Scans:     {} Hz, {} ms registration",
        args.scan_rate, args.match_delay_ms
    );
    if args.fail_matching {
        println!("Matching:  always fails");
    }
    println!("========================================");
    println!("Type r + Enter to start playback.");
    println!();

    let delay = Duration::from_millis(args.match_delay_ms);
    let fail_matching = args.fail_matching;
    let matcher = move |_reading: &PointCloud, _reference: &PointCloud| {
        std::thread::sleep(delay);
        if fail_matching {
            Err(MatchError::Failed("simulated failure".to_string()))
        } else {
            Ok(Registration::converged(Pose::identity()))
        }
    };

    let (repeat, streams) = Repeat::builder(config.clone())
        .matcher(matcher)
        .build()
        .await?;
    let (inputs, handles) = RepeatInputs::channels(&config);

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received, stopping...");
        cancel_clone.cancel();
    });

    let scans = tokio::spawn(produce_scans(
        handles.scans.clone(),
        args.scan_rate,
        cancel.clone(),
    ));
    let operator = tokio::spawn(read_operator(handles.operator.clone(), cancel.clone()));
    let outputs = tokio::spawn(log_outputs(streams));
    drop(handles);

    let summary = repeat.run(inputs, cancel.clone()).await;
    cancel.cancel();
    scans.await.ok();
    operator.abort();
    outputs.await.ok();

    println!();
    println!("Finished in {} at {:.3}s", summary.final_state, summary.sim_time);
    println!(
        "  {} cycles, {} commands, {} anchor switches",
        summary.cycles, summary.commands_published, summary.anchor_switches
    );
    println!(
        "  {} scans matched, {} dropped while busy",
        summary.scans_accepted, summary.scans_dropped
    );

    // The blocking stdin read would otherwise hold the runtime open.
    std::process::exit(0)
}
