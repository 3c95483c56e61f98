use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use canopen_diffdrive::drive::Buttons;
use canopen_diffdrive::{Config, ControllerSnapshot, Result, Robot, SocketCanInterface};

/// Drives a two-wheel CiA 402 robot from controller snapshots read as JSON
/// lines on stdin, e.g. `{"left_stick":{"y":0},"buttons":{"r1":true}}`.
#[derive(Parser, Debug)]
struct Args {
    /// TOML configuration file
    #[clap(long, short)]
    config: Option<PathBuf>,
    /// CAN interface, overrides the configuration file
    #[clap(long, short)]
    interface: Option<String>,
    #[clap(long)]
    left_node: Option<u8>,
    #[clap(long)]
    right_node: Option<u8>,
    /// Keep using SDO for velocity and status instead of mapping PDOs
    #[clap(long)]
    no_pdo: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if let Some(interface) = args.interface {
        config.can.interface = interface;
    }
    if let Some(node) = args.left_node {
        config.motors.left_node = node;
    }
    if let Some(node) = args.right_node {
        config.motors.right_node = node;
    }
    if args.no_pdo {
        config.motors.use_pdo = false;
    }
    config.validate()?;
    log::info!(
        "interface {} ({} bit/s), left node {}, right node {}",
        config.can.interface,
        config.can.bitrate,
        config.motors.left_node,
        config.motors.right_node
    );

    let interface = SocketCanInterface::open(&config.can.interface)?;
    let robot = Robot::new(interface, config)?;
    robot.bring_up().await?;

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(read_snapshots(tx));
    log::info!("ready: hold R1 to drive, PS to exit");
    robot.run(rx).await
}

/// Forwards snapshots until stdin closes. Ctrl-C is turned into an exit press.
async fn read_snapshots(tx: mpsc::Sender<ControllerSnapshot>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<ControllerSnapshot>(&line) {
                    Ok(snapshot) => {
                        if tx.send(snapshot).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => log::warn!("ignored malformed snapshot: {}", err),
                },
                Ok(None) => break,
                Err(err) => {
                    log::error!("failed to read stdin: {}", err);
                    break;
                }
            },
            _ = &mut ctrl_c => {
                log::info!("interrupted");
                let exit = ControllerSnapshot {
                    buttons: Buttons {
                        ps: true,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                tx.send(exit).await.ok();
                break;
            }
        }
    }
}
