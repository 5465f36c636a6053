//! Thread-safe entry points: `send_ts`, `release_msg_slot_ts`, and
//! `close_ts`.
//!
//! A single `parking_lot::Mutex`-guarded FIFO per direction, plus a
//! `tokio::sync::Notify` wake, is all that's required here — no
//! lock-free structures needed. The core task drains each queue under
//! the lock whenever it wakes on the `Notify`, and applies the
//! equivalent loop-thread primitive to each drained item, so the
//! cross-thread boundary never touches `Registry` or `Remote` state
//! directly.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::message::Message;

/// One pending command submitted from off the core task's thread.
pub(crate) enum TsCommand {
    Send(Message),
    ReleaseSlot(Message),
    Close,
}

/// The shared, cloneable handle used by `send_ts`/`release_msg_slot_ts`/
/// `close_ts`. Cheap to clone (an `Arc` around a mutex + notify).
#[derive(Clone)]
pub struct TsChannel {
    inner: Arc<TsChannelInner>,
}

struct TsChannelInner {
    queue: Mutex<Vec<TsCommand>>,
    notify: Notify,
}

impl TsChannel {
    pub(crate) fn new() -> Self {
        TsChannel {
            inner: Arc::new(TsChannelInner { queue: Mutex::new(Vec::new()), notify: Notify::new() }),
        }
    }

    fn push(&self, cmd: TsCommand) {
        self.inner.queue.lock().push(cmd);
        self.inner.notify.notify_one();
    }

    pub fn send_ts(&self, msg: Message) {
        self.push(TsCommand::Send(msg));
    }

    pub fn release_msg_slot_ts(&self, msg: Message) {
        self.push(TsCommand::ReleaseSlot(msg));
    }

    pub fn close_ts(&self) {
        self.push(TsCommand::Close);
    }

    /// Waits for at least one command to be queued, then drains and
    /// returns every command currently queued, in submission order.
    pub(crate) async fn recv_all(&self) -> Vec<TsCommand> {
        loop {
            {
                let mut q = self.inner.queue.lock();
                if !q.is_empty() {
                    return std::mem::take(&mut q);
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IpProtocol;

    #[tokio::test]
    async fn commands_are_drained_in_submission_order() {
        let chan = TsChannel::new();
        chan.send_ts(Message::new(IpProtocol::V4, [0; 16], 1));
        chan.close_ts();

        let cmds = chan.recv_all().await;
        assert_eq!(cmds.len(), 2);
        assert!(matches!(cmds[0], TsCommand::Send(_)));
        assert!(matches!(cmds[1], TsCommand::Close));
    }

    #[test]
    fn clone_shares_the_same_queue() {
        let chan = TsChannel::new();
        let clone = chan.clone();
        clone.send_ts(Message::new(IpProtocol::V4, [0; 16], 1));
        assert_eq!(chan.inner.queue.lock().len(), 1);
    }
}
