//! Outstanding-request correlation.
//!
//! A fixed pool of transaction slots; the tag carried on the wire is the
//! slot index. Replies may arrive in any order — the pool routes each one
//! to the oneshot channel its sender is waiting on.

use crate::error::{Error, ProtocolError, SessionError};
use crate::fcall::{Msg, MsgType};
use crate::utils::Result;
use log::{debug, warn};
use tokio::sync::oneshot;

/// Number of requests a client may have in flight at once
pub const TAG_CAPACITY: usize = 128;

struct Slot {
    /// Wire type of the request occupying this slot
    treq: MsgType,
    /// Reply channel; taken when a flush abandons the request while the
    /// slot stays reserved until the flush is acknowledged
    reply: Option<oneshot::Sender<Result<Msg>>>,
}

pub struct TagPool {
    slots: Vec<Option<Slot>>,
}

impl TagPool {
    pub fn new(capacity: usize) -> TagPool {
        TagPool {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Reserve the lowest free slot for a request of type `treq`.
    ///
    /// The returned receiver resolves when the matching reply arrives, or
    /// with `Cancelled` if the request is flushed or the session ends.
    pub fn allocate(&mut self, treq: MsgType) -> Result<(u16, oneshot::Receiver<Result<Msg>>)> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(SessionError::TagsExhausted)?;

        let (sender, receiver) = oneshot::channel();
        self.slots[index] = Some(Slot {
            treq,
            reply: Some(sender),
        });

        Ok((index as u16, receiver))
    }

    /// Route an incoming reply to the slot its tag names.
    ///
    /// Replies to unknown or idle tags are dropped without complaint: they
    /// are the legitimate leftovers of flushed requests. A reply whose type
    /// does not answer the stored request type surfaces a protocol error to
    /// the waiting caller.
    pub fn complete(&mut self, msg: Msg) {
        let Some(entry) = self.slots.get_mut(msg.tag as usize) else {
            debug!("dropping reply to out-of-range tag {}", msg.tag);
            return;
        };
        let Some(slot) = entry.as_mut() else {
            debug!("dropping reply to idle tag {}", msg.tag);
            return;
        };

        let rtype = MsgType::from(&msg.body);
        if !rtype.replies_to(slot.treq) {
            warn!(
                "dropping {:?} reply to a {:?} request, tag {}",
                rtype, slot.treq, msg.tag
            );
            if let Some(sender) = slot.reply.take() {
                let _ = sender.send(Err(ProtocolError::ProtocolMismatch.into()));
            }
            *entry = None;
            return;
        }

        match slot.reply.take() {
            Some(sender) => {
                *entry = None;
                let _ = sender.send(Ok(msg));
            }
            None => debug!("discarding late reply to flushed tag {}", msg.tag),
        }
    }

    /// Abandon the request in `tag`: the waiting caller observes
    /// cancellation immediately, while the slot stays reserved so a late
    /// reply cannot be misdelivered to a reused tag.
    pub fn begin_flush(&mut self, tag: u16) {
        if let Some(Some(slot)) = self.slots.get_mut(tag as usize).map(Option::as_mut) {
            slot.reply = None;
        }
    }

    /// Free a slot unconditionally.
    pub fn release(&mut self, tag: u16) {
        if let Some(entry) = self.slots.get_mut(tag as usize) {
            *entry = None;
        }
    }

    /// Fail every outstanding request; used when the transport dies.
    pub fn fail_all(&mut self) {
        for entry in &mut self.slots {
            if let Some(slot) = entry.take() {
                if let Some(sender) = slot.reply {
                    let _ = sender.send(Err(Error::Cancelled));
                }
            }
        }
    }

    /// Number of reserved slots
    pub fn busy(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
