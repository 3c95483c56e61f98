use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bus::{CanInterface, FrameBus};
use crate::drive::Wheel;
use crate::error::{Error, Result};
use crate::frame::ObjectSize;
use crate::id::NodeId;
use crate::pdo_store::{PdoStore, DRIVE_MAPPINGS};
use crate::sdo_client::SdoClient;

pub const CONTROL_WORD: u16 = 0x6040;
pub const STATUS_WORD: u16 = 0x6041;
pub const MODES_OF_OPERATION: u16 = 0x6060;
pub const TARGET_VELOCITY: u16 = 0x60FF;
pub const VELOCITY_ACTUAL: u16 = 0x606C;

pub const CONTROL_SHUTDOWN: u16 = 0x06;
pub const CONTROL_SWITCH_ON: u16 = 0x07;
pub const CONTROL_ENABLE_OPERATION: u16 = 0x0F;
pub const CONTROL_FAULT_RESET: u16 = 0x80;
/// Same bit pattern as "switch on". Drives used with this crate treat it as
/// leaving OperationEnabled.
pub const CONTROL_DISABLE: u16 = 0x07;

pub const DEFAULT_ENCODER_RESOLUTION: f64 = 10000.0;

const ENABLE_ATTEMPTS: usize = 10;
const PDO_CONFIG_ATTEMPTS: usize = 3;
const TRANSITION_SETTLE: Duration = Duration::from_millis(200);
const FAULT_RESET_SETTLE: Duration = Duration::from_millis(500);
const MODE_SETTLE: Duration = Duration::from_millis(100);
const PDO_CONFIG_SETTLE: Duration = Duration::from_millis(500);
const DISABLE_SETTLE: Duration = Duration::from_millis(100);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cia402State {
    NotReadyToSwitchOn,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
    QuickStopActive,
    FaultReactionActive,
    Fault,
}

impl Cia402State {
    /// Total over every status word; unknown patterns decode as `NotReadyToSwitchOn`.
    pub fn from_status_word(status_word: u16) -> Self {
        match status_word & 0x4F {
            0x00 => Self::NotReadyToSwitchOn,
            0x40 => Self::SwitchOnDisabled,
            0x08 => Self::Fault,
            0x0F => Self::FaultReactionActive,
            _ => match status_word & 0x6F {
                0x21 => Self::ReadyToSwitchOn,
                0x23 => Self::SwitchedOn,
                0x27 => Self::OperationEnabled,
                0x07 => Self::QuickStopActive,
                _ => Self::NotReadyToSwitchOn,
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum OperationMode {
    ProfilePosition = 1,
    Velocity = 2,
    ProfileVelocity = 3,
    Homing = 6,
    CyclicSynchronousPosition = 8,
    CyclicSynchronousVelocity = 9,
    CyclicSynchronousTorque = 10,
}

impl OperationMode {
    pub fn as_raw(self) -> i8 {
        self as i8
    }
}

/// What the enable sequence does from a given state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EnableStep {
    Done,
    Command { control_word: u16, settle: Duration },
    Wait(Duration),
}

pub fn enable_step(state: Cia402State) -> EnableStep {
    let command = |control_word, settle| EnableStep::Command {
        control_word,
        settle,
    };
    match state {
        Cia402State::SwitchOnDisabled => command(CONTROL_SHUTDOWN, TRANSITION_SETTLE),
        Cia402State::ReadyToSwitchOn => command(CONTROL_SWITCH_ON, TRANSITION_SETTLE),
        Cia402State::SwitchedOn => command(CONTROL_ENABLE_OPERATION, TRANSITION_SETTLE),
        Cia402State::OperationEnabled => EnableStep::Done,
        Cia402State::Fault => command(CONTROL_FAULT_RESET, FAULT_RESET_SETTLE),
        Cia402State::NotReadyToSwitchOn
        | Cia402State::QuickStopActive
        | Cia402State::FaultReactionActive => EnableStep::Wait(TRANSITION_SETTLE),
    }
}

/// Truncates toward zero.
pub fn rpm_to_counts(rpm: f64, encoder_resolution: f64) -> i32 {
    (rpm * encoder_resolution / 60.0) as i32
}

pub fn counts_to_rpm(counts: i32, encoder_resolution: f64) -> f64 {
    counts as f64 * 60.0 / encoder_resolution
}

/// One CiA 402 servo drive on the shared bus.
///
/// Until [`Cia402Device::configure_pdo`] succeeds every access goes through
/// SDO. Afterwards status and actual velocity come from the [`PdoStore`] and
/// target velocity is sent as RPDO2.
pub struct Cia402Device<I> {
    node_id: NodeId,
    bus: FrameBus<I>,
    sdo: Arc<SdoClient<I>>,
    pdo: Arc<PdoStore>,
    use_pdo: AtomicBool,
    encoder_resolution: f64,
}

impl<I> Cia402Device<I>
where
    I: Send + Sync + CanInterface + 'static,
{
    pub fn new(
        node_id: NodeId,
        bus: FrameBus<I>,
        sdo: Arc<SdoClient<I>>,
        pdo: Arc<PdoStore>,
        encoder_resolution: f64,
    ) -> Self {
        Self {
            node_id,
            bus,
            sdo,
            pdo,
            use_pdo: AtomicBool::new(false),
            encoder_resolution,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_pdo_mode(&self) -> bool {
        self.use_pdo.load(Ordering::Acquire)
    }

    pub fn set_pdo_mode(&self, enable: bool) {
        self.use_pdo.store(enable, Ordering::Release);
    }

    /// Latest status word. A failed SDO read yields 0 (already logged by the client).
    pub async fn status_word(&self) -> u16 {
        if self.is_pdo_mode() {
            return self.pdo.tpdo1(self.node_id).status_word;
        }
        self.sdo
            .read(self.node_id, STATUS_WORD, 0)
            .await
            .map(|raw| raw as u16)
            .unwrap_or(0)
    }

    pub async fn state(&self) -> Cia402State {
        Cia402State::from_status_word(self.status_word().await)
    }

    /// Recovers from an initial fault, enables operation, selects CSV mode
    /// and zeroes the target velocity.
    pub async fn initialize(&self) -> Result<()> {
        log::info!("initializing node {}", self.node_id);
        if self.state().await == Cia402State::Fault {
            log::warn!("node {} is faulted, resetting", self.node_id);
            self.write_control_word(CONTROL_FAULT_RESET).await.ok();
            tokio::time::sleep(FAULT_RESET_SETTLE).await;
        }

        self.enable_operation().await?;

        self.sdo
            .write(
                self.node_id,
                MODES_OF_OPERATION,
                0,
                OperationMode::CyclicSynchronousVelocity.as_raw() as u8 as u32,
                ObjectSize::U8,
            )
            .await?;
        tokio::time::sleep(MODE_SETTLE).await;

        self.sdo
            .write(self.node_id, TARGET_VELOCITY, 0, 0, ObjectSize::U32)
            .await?;
        tokio::time::sleep(MODE_SETTLE).await;

        log::info!("node {} ready", self.node_id);
        Ok(())
    }

    /// Walks the power state machine to OperationEnabled, re-reading the state
    /// before every step.
    pub async fn enable_operation(&self) -> Result<()> {
        let mut last_state = Cia402State::NotReadyToSwitchOn;
        for _ in 0..ENABLE_ATTEMPTS {
            last_state = self.state().await;
            match enable_step(last_state) {
                EnableStep::Done => return Ok(()),
                EnableStep::Command {
                    control_word,
                    settle,
                } => {
                    log::debug!(
                        "node {}: {:?}, control word 0x{:02X}",
                        self.node_id,
                        last_state,
                        control_word
                    );
                    // a failed write shows up as an unchanged state on the next pass
                    self.write_control_word(control_word).await.ok();
                    tokio::time::sleep(settle).await;
                }
                EnableStep::Wait(settle) => tokio::time::sleep(settle).await,
            }
        }
        log::error!(
            "node {} did not reach OperationEnabled (last state {:?})",
            self.node_id,
            last_state
        );
        Err(Error::EnableFailed {
            node_id: self.node_id.as_raw(),
            last_state,
        })
    }

    /// Installs RPDO2/TPDO1/TPDO2 mappings and switches to PDO mode.
    pub async fn configure_pdo(&self) -> Result<()> {
        log::info!("configuring PDOs on node {}", self.node_id);
        for mapping in DRIVE_MAPPINGS.iter() {
            let mut attempt = 1;
            loop {
                match mapping.apply(&self.sdo, self.node_id).await {
                    Ok(()) => break,
                    Err(err) if attempt < PDO_CONFIG_ATTEMPTS => {
                        log::warn!(
                            "{} on node {} failed (attempt {}): {}",
                            mapping.name,
                            self.node_id,
                            attempt,
                            err
                        );
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        tokio::time::sleep(PDO_CONFIG_SETTLE).await;
        self.set_pdo_mode(true);
        Ok(())
    }

    pub async fn set_velocity_rpm(&self, rpm: f64) -> Result<()> {
        self.set_velocity(rpm_to_counts(rpm, self.encoder_resolution))
            .await
    }

    pub async fn actual_velocity_rpm(&self) -> Result<f64> {
        let counts = if self.is_pdo_mode() {
            self.pdo.tpdo2(self.node_id).actual_velocity
        } else {
            self.sdo.read(self.node_id, VELOCITY_ACTUAL, 0).await? as i32
        };
        Ok(counts_to_rpm(counts, self.encoder_resolution))
    }

    /// Zeroes velocity, then writes [`CONTROL_DISABLE`].
    pub async fn disable(&self) -> Result<()> {
        log::info!("disabling node {}", self.node_id);
        if let Err(err) = self.set_velocity(0).await {
            log::warn!("failed to zero node {} before disabling: {}", self.node_id, err);
        }
        tokio::time::sleep(DISABLE_SETTLE).await;
        self.write_control_word(CONTROL_DISABLE).await
    }

    async fn set_velocity(&self, counts: i32) -> Result<()> {
        if self.is_pdo_mode() {
            return self
                .bus
                .send(PdoStore::build_rpdo2(
                    self.node_id,
                    counts,
                    OperationMode::CyclicSynchronousVelocity.as_raw(),
                ))
                .await;
        }
        self.sdo
            .write(
                self.node_id,
                TARGET_VELOCITY,
                0,
                counts as u32,
                ObjectSize::U32,
            )
            .await?;
        // the drive only latches a new target once enable operation is re-asserted
        self.write_control_word(CONTROL_ENABLE_OPERATION).await
    }

    async fn write_control_word(&self, control_word: u16) -> Result<()> {
        self.sdo
            .write(
                self.node_id,
                CONTROL_WORD,
                0,
                control_word as u32,
                ObjectSize::U16,
            )
            .await
    }
}

#[async_trait]
impl<I> Wheel for Cia402Device<I>
where
    I: Send + Sync + CanInterface + 'static,
{
    async fn set_velocity_rpm(&self, rpm: f64) -> Result<()> {
        Cia402Device::set_velocity_rpm(self, rpm).await
    }

    async fn actual_velocity_rpm(&self) -> Result<f64> {
        Cia402Device::actual_velocity_rpm(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CanFrame;
    use crate::testing::{
        LoopbackInterface, SimulatedDrive, STATUS_FAULT, STATUS_OPERATION_ENABLED,
        STATUS_SWITCHED_ON,
    };

    fn device(
        drive: &Arc<SimulatedDrive>,
    ) -> (Cia402Device<LoopbackInterface>, FrameBus<LoopbackInterface>) {
        let bus = FrameBus::new(LoopbackInterface::with_drives(vec![Arc::clone(drive)]));
        bus.spawn_receiver(Arc::new(AtomicBool::new(true)));
        let pdo = Arc::new(PdoStore::new());
        pdo.attach(&bus);
        let sdo = Arc::new(SdoClient::new(bus.clone()));
        let device = Cia402Device::new(
            1.try_into().unwrap(),
            bus.clone(),
            sdo,
            pdo,
            DEFAULT_ENCODER_RESOLUTION,
        );
        (device, bus)
    }

    #[test]
    fn test_state_decoding() {
        use Cia402State::*;
        let cases = [
            (0x0000, NotReadyToSwitchOn),
            (0x0240, SwitchOnDisabled),
            (0x0250, SwitchOnDisabled),
            (0x0221, ReadyToSwitchOn),
            (0x0223, SwitchedOn),
            (0x0627, OperationEnabled),
            (0x0237, OperationEnabled),
            (0x0607, QuickStopActive),
            (0x020F, FaultReactionActive),
            (0x0208, Fault),
            (0x0218, Fault),
            (0x0001, NotReadyToSwitchOn),
            (0x0061, NotReadyToSwitchOn),
        ];
        for (status_word, state) in cases {
            assert_eq!(
                Cia402State::from_status_word(status_word),
                state,
                "status word 0x{:04X}",
                status_word
            );
        }
    }

    #[test]
    fn test_state_decoding_ignores_unmasked_bits() {
        for status_word in 0..=u16::MAX {
            assert_eq!(
                Cia402State::from_status_word(status_word),
                Cia402State::from_status_word(status_word & 0x6F)
            );
        }
    }

    #[test]
    fn test_enable_transition_table() {
        assert_eq!(
            enable_step(Cia402State::SwitchOnDisabled),
            EnableStep::Command {
                control_word: 0x06,
                settle: Duration::from_millis(200)
            }
        );
        assert_eq!(
            enable_step(Cia402State::ReadyToSwitchOn),
            EnableStep::Command {
                control_word: 0x07,
                settle: Duration::from_millis(200)
            }
        );
        assert_eq!(
            enable_step(Cia402State::SwitchedOn),
            EnableStep::Command {
                control_word: 0x0F,
                settle: Duration::from_millis(200)
            }
        );
        assert_eq!(
            enable_step(Cia402State::Fault),
            EnableStep::Command {
                control_word: 0x80,
                settle: Duration::from_millis(500)
            }
        );
        assert_eq!(enable_step(Cia402State::OperationEnabled), EnableStep::Done);
        for state in [
            Cia402State::NotReadyToSwitchOn,
            Cia402State::QuickStopActive,
            Cia402State::FaultReactionActive,
        ] {
            assert_eq!(
                enable_step(state),
                EnableStep::Wait(Duration::from_millis(200))
            );
        }
    }

    #[test]
    fn test_rpm_counts_conversion() {
        assert_eq!(rpm_to_counts(150.0, 10000.0), 25_000);
        assert_eq!(rpm_to_counts(-1500.0, 10000.0), -250_000);
        // truncates toward zero
        assert_eq!(rpm_to_counts(0.01, 10000.0), 1);
        assert_eq!(rpm_to_counts(-0.01, 10000.0), -1);
        assert_eq!(counts_to_rpm(-1000, 10000.0), -6.0);
        for counts in [-250_000, -1000, 0, 500, 25_000, 250_000] {
            assert_eq!(
                rpm_to_counts(counts_to_rpm(counts, 10000.0), 10000.0),
                counts
            );
        }
    }

    #[test]
    fn test_rpm_counts_round_trip_within_one_count() {
        // truncation can land one count short, e.g. at -249_959
        assert_eq!(
            rpm_to_counts(counts_to_rpm(-249_959, 10000.0), 10000.0),
            -249_958
        );
        for counts in -250_000..=250_000 {
            let back = rpm_to_counts(counts_to_rpm(counts, 10000.0), 10000.0);
            assert!(
                (back - counts).abs() <= 1,
                "{} came back as {}",
                counts,
                back
            );
        }
    }

    #[test]
    fn test_disable_control_word_matches_quick_stop_pattern() {
        // 0x07 is written on disable even though a status word with the same
        // low bits decodes as QuickStopActive
        assert_eq!(CONTROL_DISABLE, 0x07);
        assert_eq!(CONTROL_DISABLE, CONTROL_SWITCH_ON);
        assert_eq!(
            Cia402State::from_status_word(CONTROL_DISABLE),
            Cia402State::QuickStopActive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_walks_to_operation_enabled() {
        let drive = SimulatedDrive::new(1);
        let (device, _bus) = device(&drive);

        device.initialize().await.unwrap();

        assert_eq!(drive.status_word(), STATUS_OPERATION_ENABLED);
        assert_eq!(drive.control_words(), vec![0x06, 0x07, 0x0F]);
        let writes = drive.writes();
        assert_eq!(
            &writes[writes.len() - 2..],
            &[
                (0x6060, 0, 9, ObjectSize::U8),
                (0x60FF, 0, 0, ObjectSize::U32)
            ]
        );
        assert_eq!(device.state().await, Cia402State::OperationEnabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_resets_an_initial_fault() {
        let drive = SimulatedDrive::new(1);
        drive.set_status_word(STATUS_FAULT);
        let (device, _bus) = device(&drive);

        device.initialize().await.unwrap();
        assert_eq!(drive.control_words(), vec![0x80, 0x06, 0x07, 0x0F]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_resets_fault_then_walks_up() {
        let drive = SimulatedDrive::new(1);
        drive.set_status_word(STATUS_FAULT);
        let (device, _bus) = device(&drive);

        device.enable_operation().await.unwrap();
        assert_eq!(drive.control_words(), vec![0x80, 0x06, 0x07, 0x0F]);
        assert_eq!(drive.status_word(), STATUS_OPERATION_ENABLED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_resumes_from_intermediate_state() {
        let drive = SimulatedDrive::new(1);
        drive.set_status_word(STATUS_SWITCHED_ON);
        let (device, _bus) = device(&drive);

        device.enable_operation().await.unwrap();
        assert_eq!(drive.control_words(), vec![0x0F]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_gives_up_after_ten_attempts() {
        let drive = SimulatedDrive::new(1);
        drive.freeze();
        let (device, _bus) = device(&drive);

        assert_eq!(
            device.initialize().await,
            Err(Error::EnableFailed {
                node_id: 1,
                last_state: Cia402State::SwitchOnDisabled
            })
        );
        assert_eq!(drive.control_words(), vec![0x06; 10]);
        // never reached the mode write
        assert!(drive.object(0x6060, 0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_node_reads_as_not_ready() {
        let drive = SimulatedDrive::new(1);
        drive.mute();
        let (device, _bus) = device(&drive);

        assert_eq!(device.status_word().await, 0);
        assert_eq!(
            device.enable_operation().await,
            Err(Error::EnableFailed {
                node_id: 1,
                last_state: Cia402State::NotReadyToSwitchOn
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_pdo_maps_all_three_pdos() {
        let drive = SimulatedDrive::new(1);
        let (device, _bus) = device(&drive);

        device.configure_pdo().await.unwrap();

        assert!(device.is_pdo_mode());
        assert_eq!(drive.writes().len(), 6 + 7 + 6);
        assert_eq!(drive.object(0x1401, 1), Some(0x301));
        assert_eq!(drive.object(0x1800, 1), Some(0x181));
        assert_eq!(drive.object(0x1801, 1), Some(0x281));
        assert_eq!(drive.object(0x1A00, 0), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_pdo_retries_then_fails() {
        let drive = SimulatedDrive::new(1);
        drive.abort_on(0x1A01);
        let (device, _bus) = device(&drive);

        assert!(matches!(
            device.configure_pdo().await,
            Err(Error::SdoAbort { index: 0x1A01, .. })
        ));
        assert!(!device.is_pdo_mode());
        let tpdo2_disables = drive
            .writes()
            .into_iter()
            .filter(|(index, _, _, _)| *index == 0x1801)
            .count();
        assert_eq!(tpdo2_disables, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_velocity_over_sdo_reasserts_enable_operation() {
        let drive = SimulatedDrive::new(1);
        let (device, _bus) = device(&drive);

        device.set_velocity_rpm(-150.0).await.unwrap();
        assert_eq!(
            drive.writes(),
            vec![
                (0x60FF, 0, (-25_000i32) as u32, ObjectSize::U32),
                (0x6040, 0, 0x0F, ObjectSize::U16)
            ]
        );
        assert_eq!(device.actual_velocity_rpm().await, Ok(-150.0));
        assert!(drive.rpdo_velocities().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_velocity_over_pdo() {
        let drive = SimulatedDrive::new(1);
        let (device, bus) = device(&drive);
        device.set_pdo_mode(true);

        device.set_velocity_rpm(150.0).await.unwrap();
        assert_eq!(drive.rpdo_velocities(), vec![(25_000, 9)]);
        assert!(drive.writes().is_empty());

        bus.dispatch(&CanFrame::new(0x281, &[0x18, 0xFC, 0xFF, 0xFF, 0x09]).unwrap());
        bus.dispatch(&CanFrame::new(0x181, &[0x27, 0x06, 0, 0, 0, 0, 0, 0]).unwrap());
        assert_eq!(device.actual_velocity_rpm().await, Ok(-6.0));
        assert_eq!(device.state().await, Cia402State::OperationEnabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_zeroes_then_writes_quirk_control_word() {
        let drive = SimulatedDrive::new(1);
        let (device, _bus) = device(&drive);
        device.initialize().await.unwrap();
        let before = drive.writes().len();

        device.disable().await.unwrap();

        assert_eq!(
            &drive.writes()[before..],
            &[
                (0x60FF, 0, 0, ObjectSize::U32),
                (0x6040, 0, 0x0F, ObjectSize::U16),
                (0x6040, 0, 0x07, ObjectSize::U16)
            ]
        );
        assert_eq!(drive.status_word(), STATUS_SWITCHED_ON);
    }
}
