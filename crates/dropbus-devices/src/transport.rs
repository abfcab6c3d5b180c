/*!
 * Packet-send primitives.
 *
 * The logic driver only needs to hand a packet to something. Framing,
 * checksums and the physical link are the transport's business.
 */
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::device::{DeviceError, Result};
use crate::protocol::BusPacket;

/// Sends bus packets
///
/// Implementations must not block. A failed send is reported and not
/// retried by the caller.
pub trait Transport: Send {
    /// Send one packet
    fn send(&mut self, packet: BusPacket) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, packet: BusPacket) -> Result<()> {
        (**self).send(packet)
    }
}

type Queues = Arc<Mutex<Vec<VecDeque<BusPacket>>>>;

/// In-memory shared medium
///
/// Every packet sent through one tap is queued for all other taps, which
/// mirrors a multi-drop bus where a node does not hear itself.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBus {
    queues: Queues,
}

impl LoopbackBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node to the bus
    pub fn tap(&self) -> BusTap {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.push(VecDeque::new());
        BusTap {
            index: queues.len() - 1,
            queues: Arc::clone(&self.queues),
        }
    }

    /// Number of attached taps
    pub fn taps(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One node's connection to a [`LoopbackBus`]
#[derive(Debug, Clone)]
pub struct BusTap {
    index: usize,
    queues: Queues,
}

impl BusTap {
    /// Take every packet queued for this node
    pub fn drain(&self) -> Vec<BusPacket> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .get_mut(self.index)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of packets waiting for this node
    pub fn pending(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(self.index)
            .map_or(0, VecDeque::len)
    }
}

impl Transport for BusTap {
    fn send(&mut self, packet: BusPacket) -> Result<()> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        for (index, queue) in queues.iter_mut().enumerate() {
            if index != self.index {
                queue.push_back(packet.clone());
            }
        }
        trace!(tap = self.index, bytes = packet.data.len(), "packet on loopback bus");
        Ok(())
    }
}

/// Sends into a bounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<BusPacket>,
}

impl ChannelTransport {
    /// Wrap a channel sender
    pub fn new(sender: mpsc::Sender<BusPacket>) -> Self {
        Self { sender }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, packet: BusPacket) -> Result<()> {
        self.sender.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => DeviceError::Transport("outbound channel full".to_string()),
            TrySendError::Closed(_) => DeviceError::Transport("outbound channel closed".to_string()),
        })
    }
}

/// Keeps every packet it is given; can be switched to fail
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<BusPacket>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingTransport {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Make later sends fail, or succeed again
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }

    /// Take the recorded packets
    pub fn take(&self) -> Vec<BusPacket> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of recorded packets
    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, packet: BusPacket) -> Result<()> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(DeviceError::Transport("recording transport set to fail".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::device::LinkRate;

    fn packet(byte: u8) -> BusPacket {
        BusPacket::announcement(1, LinkRate::Baud1M, Bytes::from(vec![byte; 4]))
    }

    #[test]
    fn test_loopback_skips_sender() {
        let bus = LoopbackBus::new();
        let mut a = bus.tap();
        let b = bus.tap();
        let c = bus.tap();
        assert_eq!(bus.taps(), 3);

        a.send(packet(1)).unwrap();
        assert_eq!(a.pending(), 0);
        assert_eq!(b.pending(), 1);
        assert_eq!(c.drain(), vec![packet(1)]);
        assert_eq!(c.pending(), 0);
    }

    #[tokio::test]
    async fn test_channel_transport_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut transport = ChannelTransport::new(tx);
        transport.send(packet(1)).unwrap();
        assert!(matches!(transport.send(packet(2)), Err(DeviceError::Transport(_))));
        assert_eq!(rx.recv().await, Some(packet(1)));
    }

    #[test]
    fn test_channel_transport_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut transport = ChannelTransport::new(tx);
        assert!(transport.send(packet(1)).is_err());
    }

    #[test]
    fn test_recording_transport() {
        let recorder = RecordingTransport::new();
        let mut sender = recorder.clone();
        sender.send(packet(1)).unwrap();
        recorder.set_failing(true);
        assert!(sender.send(packet(2)).is_err());
        assert_eq!(recorder.take(), vec![packet(1)]);
        assert!(recorder.is_empty());
    }
}
