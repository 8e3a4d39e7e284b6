//! Scripted in-memory transport for tests.
//!
//! Every submitted transfer completes on the next poll. Packet payloads are
//! taken from [`MockStreamScript::packets`] at submit time; once the script
//! runs dry, packets complete empty.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use super::StreamError;
use super::pool::{PoolLayout, SlotId};
use super::transport::{Completion, IsoTransport, PacketCompletion, PollError, TransferStatus};

/// One scripted isochronous packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPacket {
    pub status: TransferStatus,
    pub data: Vec<u8>,
}

/// Test-controlled behaviour and counters for [`MockTransport`].
#[derive(Debug, Default)]
pub struct MockStreamScript {
    pub packets: VecDeque<MockPacket>,
    /// Returned by successive polls before any completion is delivered.
    pub poll_errors: VecDeque<PollError>,
    /// Submits beyond this count fail.
    pub max_submits: Option<usize>,
    pub submits: usize,
    pub cancels: usize,
    pub polls: usize,
    pub layout: Option<PoolLayout>,
}

impl MockStreamScript {
    pub fn push_packet(&mut self, data: Vec<u8>) {
        self.packets.push_back(MockPacket {
            status: TransferStatus::Completed,
            data,
        });
    }

    pub fn push_failed_packet(&mut self, status: TransferStatus) {
        self.packets.push_back(MockPacket {
            status,
            data: Vec::new(),
        });
    }
}

pub struct MockTransport<'a> {
    script: &'a RefCell<MockStreamScript>,
    packet_length: usize,
    packets_per_transfer: usize,
    /// Submitted, not yet completed.
    pending: VecDeque<Completion>,
    /// Completed by a poll, not yet drained.
    ready: Vec<Completion>,
}

impl<'a> MockTransport<'a> {
    pub fn new(script: &'a RefCell<MockStreamScript>) -> Self {
        MockTransport {
            script,
            packet_length: 0,
            packets_per_transfer: 0,
            pending: VecDeque::new(),
            ready: Vec::new(),
        }
    }
}

impl IsoTransport for MockTransport<'_> {
    fn prepare(&mut self, layout: &PoolLayout) -> Result<(), StreamError> {
        self.packet_length = layout.packet_length as usize;
        self.packets_per_transfer = layout.packets_per_transfer as usize;
        self.script.borrow_mut().layout = Some(*layout);
        Ok(())
    }

    unsafe fn submit(&mut self, slot: SlotId, buffer: &mut [u8]) -> Result<(), StreamError> {
        let mut script = self.script.borrow_mut();
        if script.max_submits.is_some_and(|max| script.submits >= max) {
            return Err(StreamError::Submit {
                slot: slot.0,
                reason: "mock: submit failure injected".into(),
            });
        }
        script.submits += 1;

        let mut packets = Vec::with_capacity(self.packets_per_transfer);
        for i in 0..self.packets_per_transfer {
            let Some(packet) = script.packets.pop_front() else {
                packets.push(PacketCompletion {
                    status: TransferStatus::Completed,
                    actual_length: 0,
                });
                continue;
            };
            let len = packet.data.len().min(self.packet_length);
            let start = i * self.packet_length;
            buffer[start..start + len].copy_from_slice(&packet.data[..len]);
            packets.push(PacketCompletion {
                status: packet.status,
                actual_length: len,
            });
        }

        self.pending.push_back(Completion {
            slot,
            status: TransferStatus::Completed,
            packets,
        });
        Ok(())
    }

    fn cancel(&mut self, slot: SlotId) -> Result<(), StreamError> {
        self.script.borrow_mut().cancels += 1;
        if let Some(c) = self.pending.iter_mut().find(|c| c.slot == slot) {
            c.status = TransferStatus::Cancelled;
            for p in &mut c.packets {
                p.status = TransferStatus::Cancelled;
                p.actual_length = 0;
            }
        }
        Ok(())
    }

    fn handle_events(&mut self, _timeout: Duration) -> Result<(), PollError> {
        let mut script = self.script.borrow_mut();
        script.polls += 1;
        if let Some(err) = script.poll_errors.pop_front() {
            return Err(err);
        }
        self.ready.extend(self.pending.drain(..));
        Ok(())
    }

    fn drain_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.ready)
    }
}
