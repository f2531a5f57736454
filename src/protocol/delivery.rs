use super::message::{LoggedEvent, ServerId, SnapshotId};

/// Services a delivery engine provides to the servers it drives.
///
/// The engine owns transit: it picks receive times, drains each link in
/// FIFO order into [`super::Server::handle_packet`], and collects
/// per-server completion reports. Implementations are shared by every
/// server and called from whichever thread is handling a packet.
pub trait Delivery: Send + Sync {
    /// Future time at which a newly queued event may be delivered.
    fn receive_time(&self) -> u64;

    /// `server` has received a marker for `snapshot_id` on every inbound
    /// link. Called exactly once per (server, snapshot).
    fn notify_snapshot_complete(&self, server: &ServerId, snapshot_id: SnapshotId);

    /// Diagnostic sink. The default discards the event.
    fn record_event(&self, _server: &ServerId, _event: LoggedEvent) {}
}
