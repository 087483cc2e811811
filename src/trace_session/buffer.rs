//! Size-budgeted packet buffer
//!
//! Encoded packets are staged on a lock-free queue by the hot path and moved
//! here on `flush()`. The buffer holds at most `capacity_bytes` of packets;
//! what happens at the limit depends on the [`FillPolicy`]:
//!
//! - `RingBuffer`: evict the oldest packets until the new one fits
//! - `Discard`: keep what is there and drop the new packet

use crate::config::FillPolicy;
use std::collections::VecDeque;

/// Buffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub current_packets: usize,
    pub current_bytes: usize,
    pub capacity_bytes: usize,
}

impl BufferStats {
    /// Fraction of pushed packets that were lost (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        if self.total_pushed == 0 {
            return 0.0;
        }
        self.total_dropped as f64 / self.total_pushed as f64
    }
}

#[derive(Debug)]
pub struct PacketBuffer {
    packets: VecDeque<Vec<u8>>,
    used: usize,
    capacity: usize,
    policy: FillPolicy,
    total_pushed: u64,
    total_dropped: u64,
}

impl PacketBuffer {
    pub fn new(capacity_bytes: usize, policy: FillPolicy) -> Self {
        Self {
            packets: VecDeque::new(),
            used: 0,
            capacity: capacity_bytes,
            policy,
            total_pushed: 0,
            total_dropped: 0,
        }
    }

    /// Store one packet; returns false when it was dropped
    pub fn push(&mut self, packet: Vec<u8>) -> bool {
        self.total_pushed += 1;

        if packet.len() > self.capacity {
            self.total_dropped += 1;
            return false;
        }

        if self.used + packet.len() > self.capacity {
            match self.policy {
                FillPolicy::Discard => {
                    self.total_dropped += 1;
                    return false;
                }
                FillPolicy::RingBuffer => {
                    while self.used + packet.len() > self.capacity {
                        let Some(oldest) = self.packets.pop_front() else {
                            break;
                        };
                        self.used -= oldest.len();
                        self.total_dropped += 1;
                    }
                }
            }
        }

        self.used += packet.len();
        self.packets.push_back(packet);
        true
    }

    /// Concatenation of every stored packet, oldest first
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.used);
        for packet in &self.packets {
            out.extend_from_slice(packet);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
        self.used = 0;
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            total_pushed: self.total_pushed,
            total_dropped: self.total_dropped,
            current_packets: self.packets.len(),
            current_bytes: self.used,
            capacity_bytes: self.capacity,
        }
    }
}
