/*!
 * Tokio runtime for a logic driver.
 *
 * The driver lives inside one task. Ticks come from a tokio interval,
 * inbound packets from an mpsc channel, and both are polled by the same
 * `select!`, so the two callbacks are serialized without any locking.
 */
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace};

use dropbus_core::error::Error as CoreError;

use crate::device::Result;
use crate::driver::DriverHandler;
use crate::logic::LogicDriver;
use crate::protocol::BusPacket;
use crate::registry::DeviceSnapshot;

/// Default depth of the inbound packet queue
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

/// A logic driver running on the tokio runtime
pub struct BusRuntime<H> {
    task: JoinHandle<LogicDriver<H>>,
    inbound: mpsc::Sender<BusPacket>,
    shutdown: watch::Sender<bool>,
    snapshots: watch::Receiver<Vec<DeviceSnapshot>>,
}

impl<H: DriverHandler + 'static> BusRuntime<H> {
    /// Start driving `driver`
    pub fn spawn(driver: LogicDriver<H>) -> Self {
        Self::spawn_with_capacity(driver, DEFAULT_INBOUND_CAPACITY)
    }

    /// Start driving `driver` with an inbound queue of `capacity` packets
    pub fn spawn_with_capacity(driver: LogicDriver<H>, capacity: usize) -> Self {
        let (inbound, inbound_rx) = mpsc::channel(capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (snapshot_tx, snapshots) = watch::channel(driver.snapshot());

        info!(serial = %driver.serial_number(), "starting bus runtime");
        let task = tokio::spawn(run(driver, inbound_rx, shutdown_rx, snapshot_tx));

        Self {
            task,
            inbound,
            shutdown,
            snapshots,
        }
    }

    /// Sender for packets received from the bus
    pub fn inbound(&self) -> mpsc::Sender<BusPacket> {
        self.inbound.clone()
    }

    /// Registry snapshots, refreshed after every tick
    pub fn snapshots(&self) -> watch::Receiver<Vec<DeviceSnapshot>> {
        self.snapshots.clone()
    }

    /// Stop the task and hand the driver back
    pub async fn shutdown(self) -> Result<LogicDriver<H>> {
        // the task may already be gone; joining reports why
        let _ = self.shutdown.send(true);
        let driver = self
            .task
            .await
            .map_err(|e| CoreError::runtime(format!("Bus task failed: {}", e)))?;
        info!(serial = %driver.serial_number(), "bus runtime stopped");
        Ok(driver)
    }
}

async fn run<H: DriverHandler>(
    mut driver: LogicDriver<H>,
    mut inbound: mpsc::Receiver<BusPacket>,
    mut shutdown: watch::Receiver<bool>,
    snapshots: watch::Sender<Vec<DeviceSnapshot>>,
) -> LogicDriver<H> {
    let mut interval = time::interval(driver.config().tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut inbound_open = true;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = driver.tick();
                trace!(?report, "tick");
                snapshots.send_replace(driver.snapshot());
            }
            packet = inbound.recv(), if inbound_open => match packet {
                Some(packet) => {
                    let report = driver.handle_packet(&packet);
                    trace!(?report, "packet");
                }
                None => {
                    debug!("inbound channel closed");
                    inbound_open = false;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    driver
}
