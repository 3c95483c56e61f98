use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bus::{CanInterface, FrameBus};
use crate::cia402::{counts_to_rpm, Cia402Device};
use crate::config::Config;
use crate::drive::{ControllerSnapshot, DifferentialDrive, DriveStatus, TickOutcome};
use crate::error::Result;
use crate::frame::{NmtCommand, NmtNodeControlAddress};
use crate::id::NodeId;
use crate::pdo_store::{PdoStore, TelemetryEvent};
use crate::sdo_client::SdoClient;

const NMT_RESET_SETTLE: Duration = Duration::from_millis(1000);
const NMT_START_SETTLE: Duration = Duration::from_millis(500);
const STOP_SETTLE: Duration = Duration::from_millis(500);
const TELEMETRY_LOG_EVERY: u64 = 100;

/// Two CiA 402 wheel drives sharing one bus, plus the tasks around them.
pub struct Robot<I> {
    config: Config,
    pdo: Arc<PdoStore>,
    bus: FrameBus<I>,
    left: Arc<Cia402Device<I>>,
    right: Arc<Cia402Device<I>>,
    running: Arc<AtomicBool>,
    receiver: JoinHandle<()>,
}

impl<I> Robot<I>
where
    I: Send + Sync + CanInterface + 'static,
{
    /// Wires the protocol stack on top of `interface` and starts the frame
    /// receiver. Must be called from within a tokio runtime.
    pub fn new(interface: I, config: Config) -> Result<Self> {
        config.validate()?;
        let (left_node, right_node) = config.node_ids()?;

        let bus = FrameBus::new(interface);
        let pdo = Arc::new(PdoStore::new());
        pdo.attach(&bus);
        let sdo = Arc::new(SdoClient::with_timing(
            bus.clone(),
            config.sdo_timeout(),
            config.sdo_poll_interval(),
            config.can.tap_capacity,
        ));
        let device = |node_id| {
            Arc::new(Cia402Device::new(
                node_id,
                bus.clone(),
                Arc::clone(&sdo),
                Arc::clone(&pdo),
                config.motors.encoder_resolution,
            ))
        };
        let left = device(left_node);
        let right = device(right_node);

        let running = Arc::new(AtomicBool::new(true));
        let receiver = bus.spawn_receiver(Arc::clone(&running));

        Ok(Self {
            config,
            pdo,
            bus,
            left,
            right,
            running,
            receiver,
        })
    }

    pub fn left(&self) -> &Arc<Cia402Device<I>> {
        &self.left
    }

    pub fn right(&self) -> &Arc<Cia402Device<I>> {
        &self.right
    }

    /// Cleared once the robot has shut down.
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Resets and starts both nodes, then initializes each drive in turn.
    /// Either drive failing aborts bring-up.
    pub async fn bring_up(&self) -> Result<()> {
        let nodes = [self.left.node_id(), self.right.node_id()];
        self.nmt_all(NmtCommand::ResetNode, &nodes).await;
        tokio::time::sleep(NMT_RESET_SETTLE).await;
        self.nmt_all(NmtCommand::Operational, &nodes).await;
        tokio::time::sleep(NMT_START_SETTLE).await;

        for device in [&self.left, &self.right] {
            device.initialize().await?;
            if self.config.motors.use_pdo {
                device.configure_pdo().await?;
            }
        }
        self.install_telemetry_logging();
        log::info!(
            "both drives ready ({} mode)",
            if self.config.motors.use_pdo { "PDO" } else { "SDO" }
        );
        Ok(())
    }

    async fn nmt_all(&self, command: NmtCommand, nodes: &[NodeId]) {
        for node_id in nodes {
            // a lost NMT frame surfaces as a failed enable later on
            self.bus
                .nmt_node_control(command, NmtNodeControlAddress::Node(*node_id))
                .await
                .ok();
        }
    }

    fn install_telemetry_logging(&self) {
        let encoder_resolution = self.config.motors.encoder_resolution;
        let count = AtomicU64::new(0);
        self.pdo.observe(move |event| {
            if count.fetch_add(1, Ordering::Relaxed) % TELEMETRY_LOG_EVERY != 0 {
                return;
            }
            match event {
                TelemetryEvent::Tpdo1 { node_id, snapshot } => log::debug!(
                    "node {} TPDO1: status=0x{:04X} position={}",
                    node_id,
                    snapshot.status_word,
                    snapshot.actual_position
                ),
                TelemetryEvent::Tpdo2 { node_id, snapshot } => log::debug!(
                    "node {} TPDO2: velocity={} ({:.1} RPM) mode={}",
                    node_id,
                    snapshot.actual_velocity,
                    counts_to_rpm(snapshot.actual_velocity, encoder_resolution),
                    snapshot.mode_display
                ),
            }
        });
    }

    /// Drives the wheels from `snapshots` until the exit button is pressed or
    /// the stream ends, then stops and disables both drives.
    pub async fn run(self, mut snapshots: mpsc::Receiver<ControllerSnapshot>) -> Result<()> {
        let mut drive = DifferentialDrive::new(
            Arc::clone(&self.left),
            Arc::clone(&self.right),
            self.config.drive_params(),
        );
        drive.start();
        let reporter = self.spawn_status_reporter(drive.status());

        while let Some(snapshot) = snapshots.recv().await {
            if let TickOutcome::Dispatched(setpoint) = drive.update(&snapshot).await {
                log::trace!("setpoint {:?}", setpoint);
            }
            if snapshot.buttons.exit() {
                log::info!("exit requested");
                break;
            }
        }

        self.shutdown(&mut drive).await;
        reporter.await.ok();
        self.receiver.await.ok();
        Ok(())
    }

    async fn shutdown(&self, drive: &mut DifferentialDrive<Cia402Device<I>>) {
        drive.stop().await;
        tokio::time::sleep(STOP_SETTLE).await;
        for device in [&self.left, &self.right] {
            if let Err(err) = device.disable().await {
                log::error!("failed to disable node {}: {}", device.node_id(), err);
            }
        }
        self.running.store(false, Ordering::Release);
        log::info!("shut down");
    }

    fn spawn_status_reporter(&self, status: DriveStatus<Cia402Device<I>>) -> JoinHandle<()> {
        let running = Arc::clone(&self.running);
        let pdo = Arc::clone(&self.pdo);
        let nodes = [self.left.node_id(), self.right.node_id()];
        let period = self.config.status_interval();
        let detail_every = self.config.status.detail_every.max(1) as u64;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reports: u64 = 0;
            loop {
                interval.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }
                if reports % detail_every == 0 {
                    for node_id in nodes {
                        let tpdo1 = pdo.tpdo1(node_id);
                        log::info!(
                            "node {}: status=0x{:04X} position={}",
                            node_id,
                            tpdo1.status_word,
                            tpdo1.actual_position
                        );
                    }
                }
                log::info!("{}", status.snapshot().await);
                reports += 1;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cia402::Cia402State;
    use crate::drive::{Buttons, StickAxes};
    use crate::error::Error;
    use crate::frame::ObjectSize;
    use crate::testing::{LoopbackInterface, SimulatedDrive, STATUS_OPERATION_ENABLED};

    fn forward(enable: bool, exit: bool) -> ControllerSnapshot {
        ControllerSnapshot {
            left_stick: StickAxes { x: 128, y: 0 },
            buttons: Buttons {
                r1: enable,
                ps: exit,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn config(use_pdo: bool) -> Config {
        let mut config = Config::default();
        config.motors.use_pdo = use_pdo;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_bring_up_over_pdo() {
        let left = SimulatedDrive::new(1);
        let right = SimulatedDrive::new(2);
        let interface =
            LoopbackInterface::with_drives(vec![Arc::clone(&left), Arc::clone(&right)]);
        let sent = interface.sent_frames();
        let robot = Robot::new(interface, config(true)).unwrap();

        robot.bring_up().await.unwrap();

        let nmt: Vec<Vec<u8>> = sent
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.cob_id() == 0x000)
            .map(|frame| frame.data().to_vec())
            .collect();
        assert_eq!(
            nmt,
            vec![vec![0x81, 1], vec![0x81, 2], vec![0x01, 1], vec![0x01, 2]]
        );
        for drive in [&left, &right] {
            assert_eq!(drive.status_word(), STATUS_OPERATION_ENABLED);
            assert_eq!(drive.object(0x6061, 0), Some(9));
        }
        assert_eq!(right.object(0x1801, 1), Some(0x282));
        assert!(robot.left().is_pdo_mode());
        assert!(robot.right().is_pdo_mode());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bring_up_aborts_when_a_drive_cannot_enable() {
        let left = SimulatedDrive::new(1);
        let right = SimulatedDrive::new(2);
        right.freeze();
        let robot = Robot::new(
            LoopbackInterface::with_drives(vec![Arc::clone(&left), right]),
            config(true),
        )
        .unwrap();

        assert_eq!(
            robot.bring_up().await,
            Err(Error::EnableFailed {
                node_id: 2,
                last_state: Cia402State::SwitchOnDisabled
            })
        );
        // left finished before right was attempted
        assert_eq!(left.status_word(), STATUS_OPERATION_ENABLED);
    }

    #[test]
    fn test_rejects_shared_node_ids() {
        let mut config = Config::default();
        config.motors.right_node = 1;
        assert!(matches!(
            Robot::new(LoopbackInterface::silent(), config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drives_then_shuts_down_on_exit() {
        let left = SimulatedDrive::new(1);
        let right = SimulatedDrive::new(2);
        let robot = Robot::new(
            LoopbackInterface::with_drives(vec![Arc::clone(&left), Arc::clone(&right)]),
            config(true),
        )
        .unwrap();
        robot.bring_up().await.unwrap();
        let running = robot.running();

        let (tx, rx) = mpsc::channel(8);
        tx.send(forward(true, false)).await.unwrap();
        tx.send(forward(false, true)).await.unwrap();
        robot.run(rx).await.unwrap();

        for drive in [&left, &right] {
            // drive, release, then zero again on disable
            assert_eq!(
                drive.rpdo_velocities(),
                vec![(250_000, 9), (0, 9), (0, 9)]
            );
            assert_eq!(drive.control_words().last(), Some(&0x07));
        }
        assert!(!running.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_over_sdo_until_stream_ends() {
        let left = SimulatedDrive::new(1);
        let right = SimulatedDrive::new(2);
        let robot = Robot::new(
            LoopbackInterface::with_drives(vec![Arc::clone(&left), Arc::clone(&right)]),
            config(false),
        )
        .unwrap();
        robot.bring_up().await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.send(forward(true, false)).await.unwrap();
        drop(tx);
        robot.run(rx).await.unwrap();

        let writes = left.writes();
        assert_eq!(
            &writes[writes.len() - 7..],
            &[
                (0x60FF, 0, 250_000, ObjectSize::U32),
                (0x6040, 0, 0x0F, ObjectSize::U16),
                // stop
                (0x60FF, 0, 0, ObjectSize::U32),
                (0x6040, 0, 0x0F, ObjectSize::U16),
                // disable
                (0x60FF, 0, 0, ObjectSize::U32),
                (0x6040, 0, 0x0F, ObjectSize::U16),
                (0x6040, 0, 0x07, ObjectSize::U16),
            ]
        );
        assert!(left.rpdo_velocities().is_empty());
        assert_eq!(left.object(0x60FF, 0), Some(0));
    }
}
