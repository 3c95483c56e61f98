use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;

use crate::error::Result;

/// Raw value of a centred stick axis.
pub const AXIS_CENTER: f64 = 127.5;

pub const DEFAULT_MAX_RPM: f64 = 1500.0;
pub const DEFAULT_DEADZONE: f64 = 35.0;
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(20);
pub const DEFAULT_HYSTERESIS_RPM: f64 = 0.5;
pub const DEFAULT_STOP_THRESHOLD_RPM: f64 = 0.1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StickAxes {
    pub x: u8,
    pub y: u8,
}

impl Default for StickAxes {
    fn default() -> Self {
        Self { x: 128, y: 128 }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Buttons {
    pub r1: bool,
    pub l1: bool,
    pub ps: bool,
}

impl Buttons {
    /// Dead-man switch: wheels are only driven while it is held.
    pub fn enable(&self) -> bool {
        self.r1
    }

    pub fn exit(&self) -> bool {
        self.ps
    }
}

/// Already-decoded controller state. Axes are 0..=255 with y growing downwards.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ControllerSnapshot {
    pub left_stick: StickAxes,
    pub right_stick: StickAxes,
    pub l2_trigger: u8,
    pub r2_trigger: u8,
    pub buttons: Buttons,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DriveParams {
    pub max_rpm: f64,
    pub deadzone: f64,
    pub update_interval: Duration,
    pub hysteresis_rpm: f64,
    pub stop_threshold_rpm: f64,
}

impl Default for DriveParams {
    fn default() -> Self {
        Self {
            max_rpm: DEFAULT_MAX_RPM,
            deadzone: DEFAULT_DEADZONE,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            hysteresis_rpm: DEFAULT_HYSTERESIS_RPM,
            stop_threshold_rpm: DEFAULT_STOP_THRESHOLD_RPM,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct DriveSetpoint {
    pub left_rpm: f64,
    pub right_rpm: f64,
}

impl DriveSetpoint {
    pub const ZERO: Self = Self {
        left_rpm: 0.0,
        right_rpm: 0.0,
    };
}

/// Deadzone-filters a deviation from [`AXIS_CENTER`] and scales it to [-1, 1].
pub fn normalize_axis(deviation: f64, deadzone: f64) -> f64 {
    if deviation.abs() < deadzone {
        return 0.0;
    }
    (deviation / AXIS_CENTER).clamp(-1.0, 1.0)
}

/// Left stick y drives forward/back, right stick x pivots. Only the
/// dominant of the two is applied; a tie drives straight.
pub fn compute_setpoint(snapshot: &ControllerSnapshot, params: &DriveParams) -> DriveSetpoint {
    let forward = normalize_axis(
        AXIS_CENTER - snapshot.left_stick.y as f64,
        params.deadzone,
    );
    let turn = normalize_axis(
        snapshot.right_stick.x as f64 - AXIS_CENTER,
        params.deadzone,
    );

    let (left, right) = if forward.abs() >= turn.abs() {
        (forward, forward)
    } else {
        (turn, -turn)
    };

    DriveSetpoint {
        left_rpm: left.clamp(-1.0, 1.0) * params.max_rpm,
        right_rpm: right.clamp(-1.0, 1.0) * params.max_rpm,
    }
}

/// A velocity-controlled wheel motor.
#[async_trait]
pub trait Wheel: Send + Sync {
    async fn set_velocity_rpm(&self, rpm: f64) -> Result<()>;
    async fn actual_velocity_rpm(&self) -> Result<f64>;
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// The controller is stopped and ignores input.
    Stopped,
    /// Enable released with the wheels already at rest.
    Idle,
    /// Enable released while moving; zero was commanded.
    Released,
    RateLimited,
    Dispatched(DriveSetpoint),
}

/// Turns controller snapshots into left/right wheel velocities.
///
/// Owned by the control task. The last velocity commanded to each wheel is
/// published through [`DriveStatus`] for other tasks to read.
pub struct DifferentialDrive<W> {
    left: Arc<W>,
    right: Arc<W>,
    params: DriveParams,
    running: bool,
    last_update: Option<Instant>,
    targets: Arc<ArcSwap<DriveSetpoint>>,
}

impl<W: Wheel> DifferentialDrive<W> {
    pub fn new(left: Arc<W>, right: Arc<W>, params: DriveParams) -> Self {
        Self {
            left,
            right,
            params,
            running: false,
            last_update: None,
            targets: Arc::new(ArcSwap::from_pointee(DriveSetpoint::ZERO)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        self.running = true;
        log::info!("drive controller started");
    }

    /// Stops reacting to input and commands both wheels to zero.
    pub async fn stop(&mut self) {
        self.running = false;
        self.dispatch(DriveSetpoint::ZERO).await;
        log::info!("drive controller stopped");
    }

    pub fn targets(&self) -> DriveSetpoint {
        **self.targets.load()
    }

    pub fn status(&self) -> DriveStatus<W> {
        DriveStatus {
            left: Arc::clone(&self.left),
            right: Arc::clone(&self.right),
            targets: Arc::clone(&self.targets),
        }
    }

    pub async fn update(&mut self, snapshot: &ControllerSnapshot) -> TickOutcome {
        if !self.running {
            return TickOutcome::Stopped;
        }

        if !snapshot.buttons.enable() {
            let last = self.targets();
            if last.left_rpm.abs() > self.params.stop_threshold_rpm
                || last.right_rpm.abs() > self.params.stop_threshold_rpm
            {
                self.dispatch(DriveSetpoint::ZERO).await;
                return TickOutcome::Released;
            }
            return TickOutcome::Idle;
        }

        let now = Instant::now();
        if let Some(last_update) = self.last_update {
            if now.duration_since(last_update) < self.params.update_interval {
                return TickOutcome::RateLimited;
            }
        }
        self.last_update = Some(now);

        let setpoint = compute_setpoint(snapshot, &self.params);
        self.dispatch(setpoint).await;
        TickOutcome::Dispatched(setpoint)
    }

    /// Sends each wheel its new velocity unless it is within the hysteresis
    /// band of the last commanded one. A failed send is logged and still
    /// counts as commanded; it is not retried here.
    async fn dispatch(&mut self, setpoint: DriveSetpoint) {
        let last = self.targets();
        let hysteresis = self.params.hysteresis_rpm;
        let (left, right) = futures::join!(
            send_if_changed(&*self.left, "left", last.left_rpm, setpoint.left_rpm, hysteresis),
            send_if_changed(&*self.right, "right", last.right_rpm, setpoint.right_rpm, hysteresis),
        );
        self.targets.store(Arc::new(DriveSetpoint {
            left_rpm: left,
            right_rpm: right,
        }));
    }
}

async fn send_if_changed<W: Wheel>(
    wheel: &W,
    side: &str,
    last_rpm: f64,
    rpm: f64,
    hysteresis: f64,
) -> f64 {
    if (rpm - last_rpm).abs() <= hysteresis {
        return last_rpm;
    }
    if let Err(err) = wheel.set_velocity_rpm(rpm).await {
        log::warn!("failed to set {} wheel to {:.1} RPM: {}", side, rpm, err);
    }
    rpm
}

/// Read-side handle for status reporting.
pub struct DriveStatus<W> {
    left: Arc<W>,
    right: Arc<W>,
    targets: Arc<ArcSwap<DriveSetpoint>>,
}

impl<W> Clone for DriveStatus<W> {
    fn clone(&self) -> Self {
        Self {
            left: Arc::clone(&self.left),
            right: Arc::clone(&self.right),
            targets: Arc::clone(&self.targets),
        }
    }
}

impl<W: Wheel> DriveStatus<W> {
    pub fn targets(&self) -> DriveSetpoint {
        **self.targets.load()
    }

    /// Unreadable wheels report 0 RPM.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let (left, right) = futures::join!(
            self.left.actual_velocity_rpm(),
            self.right.actual_velocity_rpm()
        );
        StatusSnapshot {
            target: self.targets(),
            actual_left_rpm: left.unwrap_or(0.0),
            actual_right_rpm: right.unwrap_or(0.0),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    pub target: DriveSetpoint,
    pub actual_left_rpm: f64,
    pub actual_right_rpm: f64,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Target: L={:.1} R={:.1} | Actual: L: {:6.1} | R: {:6.1}",
            self.target.left_rpm, self.target.right_rpm, self.actual_left_rpm, self.actual_right_rpm
        )
    }
}
