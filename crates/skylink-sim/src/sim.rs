//! Headless loopback run: server, two lossy links, and one client session
//! stepped on a shared frame clock.

use skylink_config::Config;
use skylink_sync::{ClientSession, SyncEvent, SyncStats};
use tracing::{debug, info};

use crate::link::{Delivery, LinkStats, LossyLink};
use crate::pilot::ScriptedPilot;
use crate::server::ArenaServer;

/// Client frame rate of the simulation loop.
pub const FRAME_RATE_HZ: u64 = 60;

/// How far the server clock runs ahead of the client's.
pub const SERVER_CLOCK_OFFSET_MS: u64 = 5_000;

/// Drones alive when the client connects, by patrol phase.
const DRONE_PHASES_MS: [u64; 3] = [0, 5_000, 10_000];

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct SimReport {
    pub stats: SyncStats,
    pub uplink: LinkStats,
    pub downlink: LinkStats,
    pub inputs_applied: u64,
    pub inputs_rejected: u64,
    /// Packets still on either link when the run ended.
    pub in_flight: usize,
    /// Distance between the client's displayed ship and the server's at the
    /// end of the run. The client leads by the inputs still in flight.
    pub final_offset: Option<f32>,
}

/// Runs the scenario described by `config.simulation`.
pub fn run(config: &Config) -> SimReport {
    let mut server = ArenaServer::new(config);
    let mut session = ClientSession::new(config);
    let mut downlink = LossyLink::new(&config.simulation, 1);
    let mut uplink = LossyLink::new(&config.simulation, 2);
    let mut pilot = ScriptedPilot::default();

    for phase in DRONE_PHASES_MS {
        // Announced to the client on connect.
        server.spawn_drone(SERVER_CLOCK_OFFSET_MS, phase);
    }
    for (packet, delivery) in server.connect(SERVER_CLOCK_OFFSET_MS, "Pilot") {
        downlink.send(0, packet, delivery);
    }

    let total_frames = u64::from(config.simulation.duration_secs) * FRAME_RATE_HZ;
    let swap_frame = total_frames / 2;
    let mut previous_local = 0;

    for frame in 0..=total_frames {
        let local = frame * 1000 / FRAME_RATE_HZ;
        let server_now = local + SERVER_CLOCK_OFFSET_MS;
        let dt = (local - previous_local) as f32 / 1000.0;
        previous_local = local;

        // --- Server ---
        for packet in uplink.poll(local) {
            if let Some((reply, delivery)) = server.handle_packet(&packet, server_now) {
                downlink.send(local, reply, delivery);
            }
        }
        if frame == swap_frame {
            // Replace one drone mid-run so delete and create travel the link.
            if let Some(id) = server.drones().first().copied()
                && let Some((packet, delivery)) = server.despawn(id)
            {
                downlink.send(local, packet, delivery);
                let (packet, delivery) = server.spawn_drone(server_now, 2_500);
                downlink.send(local, packet, delivery);
            }
        }
        if let Some((packet, delivery)) = server.update(server_now) {
            downlink.send(local, packet, delivery);
        }

        // --- Client ---
        for packet in downlink.poll(local) {
            if let Ok(events) = session.handle_packet(&packet, local) {
                log_events(&events);
            }
        }
        for entry in session.directory_mut().purge_removed() {
            debug!(id = %entry.id, name = %entry.display_name, "Despawned on client");
        }
        if let Some(probe) = session.poll_time_sync(local) {
            uplink.send(local, probe, Delivery::Unreliable);
        }
        for input in session.tick(dt, local, &mut pilot) {
            uplink.send(local, input, Delivery::Unreliable);
        }
    }

    let final_offset = server.player_state().and_then(|(id, authoritative)| {
        session
            .displayed_state(id)
            .map(|displayed| displayed.position.distance(authoritative.position))
    });

    SimReport {
        stats: *session.stats(),
        uplink: uplink.stats(),
        downlink: downlink.stats(),
        inputs_applied: server.inputs_applied(),
        inputs_rejected: server.inputs_rejected(),
        in_flight: uplink.in_flight() + downlink.in_flight(),
        final_offset,
    }
}

fn log_events(events: &[SyncEvent]) {
    for event in events {
        match event {
            SyncEvent::EntityCreated {
                id,
                kind,
                display_name,
            } => debug!(%id, %kind, %display_name, "Spawned on client"),
            SyncEvent::ControlChanged { previous, current } => {
                info!(?previous, ?current, "Control changed")
            }
            SyncEvent::HistoryReset { gap } => debug!(?gap, "History reset"),
            SyncEvent::ClockUpdated(estimate) => {
                debug!(offset_ms = estimate.offset_millis, "Clock updated")
            }
            SyncEvent::EntityRemoved { .. }
            | SyncEvent::Teleported { .. }
            | SyncEvent::StatesRecovered { .. } => {}
        }
    }
}

/// Logs the end-of-run summary.
pub fn log_report(report: &SimReport) {
    let stats = &report.stats;
    info!(
        decoded = stats.packets_decoded,
        decode_errors = stats.decode_errors,
        accepted = stats.snapshots_accepted,
        stale = stats.stale_snapshots,
        resets = stats.history_resets,
        interpolated = stats.interpolated_states,
        skipped = stats.skipped_states,
        "Snapshots"
    );
    info!(
        smoothed = stats.smoothed_corrections,
        teleports = stats.teleports,
        inputs_sent = stats.inputs_sent,
        inputs_applied = report.inputs_applied,
        inputs_rejected = report.inputs_rejected,
        "Prediction"
    );
    info!(
        completed = stats.probes_completed,
        ignored = stats.probes_ignored,
        "Clock probes"
    );
    info!(
        up_sent = report.uplink.sent,
        up_delivered = report.uplink.delivered,
        down_sent = report.downlink.sent,
        down_delivered = report.downlink.delivered,
        in_flight = report.in_flight,
        "Traffic"
    );
    info!(
        up_dropped = report.uplink.dropped,
        up_reordered = report.uplink.reordered,
        down_dropped = report.downlink.dropped,
        down_reordered = report.downlink.reordered,
        loss_ratio = stats.loss_ratio(),
        "Link"
    );
    if let Some(offset) = report.final_offset {
        info!(offset, "Final client lead over server");
    }
}
