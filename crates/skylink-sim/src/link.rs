//! One direction of a simulated network path.
//!
//! Unreliable packets may be dropped, delayed by latency plus jitter, and
//! swapped with the packet queued before them. Reliable packets are delayed
//! but always delivered, matching the reliable channel the lifecycle
//! messages travel on.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use skylink_config::SimulationConfig;

/// Whether the transport may lose a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Reliable,
    Unreliable,
}

#[derive(Debug)]
struct InFlight {
    deliver_at: u64,
    order: u64,
    delivery: Delivery,
    payload: Bytes,
}

/// Counters for one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub reordered: u64,
    pub delivered: u64,
}

/// A lossy, reordering, delaying one-way channel.
pub struct LossyLink {
    rng: StdRng,
    loss_rate: f64,
    reorder_rate: f64,
    latency_ms: u64,
    jitter_ms: u64,
    in_flight: Vec<InFlight>,
    next_order: u64,
    stats: LinkStats,
}

impl LossyLink {
    /// Builds a link from the simulation settings. `stream` separates the
    /// random sequences of links sharing one seed.
    pub fn new(config: &SimulationConfig, stream: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed ^ stream.rotate_left(32)),
            loss_rate: config.loss_rate.clamp(0.0, 1.0),
            reorder_rate: config.reorder_rate.clamp(0.0, 1.0),
            latency_ms: config.latency_ms,
            jitter_ms: config.jitter_ms,
            in_flight: Vec::new(),
            next_order: 0,
            stats: LinkStats::default(),
        }
    }

    /// Queues `payload` sent at `now` (milliseconds).
    pub fn send(&mut self, now: u64, payload: Bytes, delivery: Delivery) {
        self.stats.sent += 1;
        if delivery == Delivery::Unreliable && self.rng.random_bool(self.loss_rate) {
            self.stats.dropped += 1;
            return;
        }

        let jitter = if self.jitter_ms > 0 {
            self.rng.random_range(0..=self.jitter_ms)
        } else {
            0
        };
        let mut packet = InFlight {
            deliver_at: now + self.latency_ms + jitter,
            order: self.next_order,
            delivery,
            payload,
        };
        self.next_order += 1;

        // Reliable packets keep their slot; only unreliable ones trade places.
        if delivery == Delivery::Unreliable
            && self.rng.random_bool(self.reorder_rate)
            && let Some(previous) = self
                .in_flight
                .iter_mut()
                .rev()
                .find(|p| p.delivery == Delivery::Unreliable)
        {
            std::mem::swap(&mut previous.deliver_at, &mut packet.deliver_at);
            std::mem::swap(&mut previous.order, &mut packet.order);
            self.stats.reordered += 1;
        }
        self.in_flight.push(packet);
    }

    /// Removes and returns every packet due at or before `now`, in arrival
    /// order.
    pub fn poll(&mut self, now: u64) -> Vec<Bytes> {
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|p| p.deliver_at <= now);
        self.in_flight = pending;

        due.sort_by_key(|p| (p.deliver_at, p.order));
        self.stats.delivered += due.len() as u64;
        due.into_iter().map(|p| p.payload).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(loss_rate: f64, reorder_rate: f64, jitter_ms: u64) -> SimulationConfig {
        SimulationConfig {
            loss_rate,
            reorder_rate,
            latency_ms: 40,
            jitter_ms,
            seed: 11,
            ..Default::default()
        }
    }

    fn payload(n: u8) -> Bytes {
        Bytes::copy_from_slice(&[n])
    }

    #[test]
    fn test_perfect_link_delivers_in_order_after_latency() {
        let mut link = LossyLink::new(&config(0.0, 0.0, 0), 0);
        for n in 0..5 {
            link.send(u64::from(n), payload(n), Delivery::Unreliable);
        }
        assert!(link.poll(39).is_empty());
        let got: Vec<u8> = link.poll(100).iter().map(|b| b[0]).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(link.in_flight(), 0);
    }

    #[test]
    fn test_total_loss_drops_unreliable_only() {
        let mut link = LossyLink::new(&config(1.0, 0.0, 0), 0);
        link.send(0, payload(1), Delivery::Unreliable);
        link.send(0, payload(2), Delivery::Reliable);
        let got = link.poll(1000);
        assert_eq!(got, vec![payload(2)]);
        assert_eq!(link.stats().dropped, 1);
    }

    #[test]
    fn test_reorder_swaps_adjacent() {
        let mut link = LossyLink::new(&config(0.0, 1.0, 0), 0);
        link.send(0, payload(1), Delivery::Unreliable);
        link.send(10, payload(2), Delivery::Unreliable);
        let got: Vec<u8> = link.poll(1000).iter().map(|b| b[0]).collect();
        assert_eq!(got, vec![2, 1]);
        assert!(link.stats().reordered >= 1);
    }

    #[test]
    fn test_reorder_never_moves_reliable() {
        let mut link = LossyLink::new(&config(0.0, 1.0, 0), 0);
        link.send(0, payload(1), Delivery::Unreliable);
        link.send(10, payload(2), Delivery::Reliable);
        link.send(20, payload(3), Delivery::Unreliable);

        assert_eq!(link.poll(49), vec![payload(3)]);
        assert_eq!(link.poll(50), vec![payload(2)]);
        assert_eq!(link.poll(1000), vec![payload(1)]);
    }

    #[test]
    fn test_same_seed_same_run() {
        let run = || {
            let mut link = LossyLink::new(&config(0.3, 0.2, 25), 3);
            for n in 0..100u8 {
                link.send(u64::from(n) * 10, payload(n), Delivery::Unreliable);
            }
            link.poll(u64::MAX)
        };
        assert_eq!(run(), run());
    }
}
