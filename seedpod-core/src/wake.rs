//! Everything that can wake the scheduler, as one closed set.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// A download attempt finished and gave back its slot.
    SlotReleased,
    /// A status refresh brought new remote bitmaps.
    StatusRefreshed,
    PackageAdded,
    PackageRemoved,
    /// The delayed retry armed when no peer had anything to offer.
    RetryTimer,
}

#[derive(Debug, Clone)]
pub struct WakeSender(mpsc::UnboundedSender<Wake>);

pub type WakeReceiver = mpsc::UnboundedReceiver<Wake>;

pub fn channel() -> (WakeSender, WakeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WakeSender(tx), rx)
}

impl WakeSender {
    /// Ignores a closed receiver: nothing is left to wake.
    pub fn wake(&self, reason: Wake) {
        let _ = self.0.send(reason);
    }
}
