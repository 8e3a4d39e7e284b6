//! Fixed arena of transfer buffers addressed by [`SlotId`].

use std::fmt;

use crate::decoder;
use crate::protocol::{DEFAULT_BUFFER_COUNT, DEFAULT_ISO_PACKETS, DEFAULT_PACKET_LENGTH};

/// Shape of the pool, fixed for one streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    pub transfers: u32,
    pub packets_per_transfer: u32,
    pub packet_length: u32,
}

impl Default for PoolLayout {
    fn default() -> Self {
        PoolLayout {
            transfers: DEFAULT_BUFFER_COUNT,
            packets_per_transfer: DEFAULT_ISO_PACKETS,
            packet_length: DEFAULT_PACKET_LENGTH,
        }
    }
}

impl PoolLayout {
    pub fn buffer_length(&self) -> usize {
        self.packets_per_transfer as usize * self.packet_length as usize
    }

    /// Worst-case decoded samples from one transfer.
    pub fn max_samples_per_transfer(&self) -> usize {
        self.packets_per_transfer as usize * decoder::max_samples(self.packet_length as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the engine; may be read or resubmitted.
    Available,
    /// Lent to the USB stack.
    InFlight,
    /// Lent to the USB stack with a cancellation outstanding.
    CancelRequested,
}

struct Slot {
    buffer: Box<[u8]>,
    state: SlotState,
}

pub struct TransferPool {
    layout: PoolLayout,
    slots: Vec<Slot>,
}

impl TransferPool {
    pub fn new(layout: PoolLayout) -> Self {
        let slots = (0..layout.transfers)
            .map(|_| Slot {
                buffer: vec![0u8; layout.buffer_length()].into_boxed_slice(),
                state: SlotState::Available,
            })
            .collect();
        TransferPool { layout, slots }
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, slot: SlotId) -> SlotState {
        self.slots[slot.0].state
    }

    /// Buffer to hand to the transport. Only valid for an available slot.
    pub(crate) fn buffer_mut(&mut self, slot: SlotId) -> &mut [u8] {
        debug_assert_eq!(self.slots[slot.0].state, SlotState::Available);
        &mut self.slots[slot.0].buffer
    }

    /// Received bytes of packet `index`, clamped to the packet's extent.
    pub fn packet(&self, slot: SlotId, index: usize, actual_length: usize) -> &[u8] {
        let s = &self.slots[slot.0];
        debug_assert_eq!(s.state, SlotState::Available);
        let packet_length = self.layout.packet_length as usize;
        let start = index * packet_length;
        let end = start + actual_length.min(packet_length);
        &s.buffer[start.min(s.buffer.len())..end.min(s.buffer.len())]
    }

    pub(crate) fn mark_in_flight(&mut self, slot: SlotId) {
        self.slots[slot.0].state = SlotState::InFlight;
    }

    pub(crate) fn mark_cancel_requested(&mut self, slot: SlotId) {
        if self.slots[slot.0].state == SlotState::InFlight {
            self.slots[slot.0].state = SlotState::CancelRequested;
        }
    }

    pub(crate) fn mark_returned(&mut self, slot: SlotId) {
        self.slots[slot.0].state = SlotState::Available;
    }

    /// Slots lent out with no cancellation requested yet.
    pub fn in_flight(&self) -> Vec<SlotId> {
        self.ids_in(|s| s == SlotState::InFlight)
    }

    /// Any slot still held by the USB stack.
    pub fn has_busy(&self) -> bool {
        self.slots.iter().any(|s| s.state != SlotState::Available)
    }

    pub fn busy_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != SlotState::Available)
            .count()
    }

    /// Give up on slots the USB stack never returned.
    ///
    /// Their buffers are leaked so the stack can never write into freed memory.
    pub(crate) fn leak_busy(&mut self) -> usize {
        let mut leaked = 0;
        for slot in self.slots.iter_mut().filter(|s| s.state != SlotState::Available) {
            let buffer = std::mem::take(&mut slot.buffer);
            let _ = Box::leak(buffer);
            slot.state = SlotState::Available;
            leaked += 1;
        }
        leaked
    }

    fn ids_in(&self, pred: impl Fn(SlotState) -> bool) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| pred(s.state))
            .map(|(i, _)| SlotId(i))
            .collect()
    }
}
