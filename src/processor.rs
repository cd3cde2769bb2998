//! The contract between a tasklet and the user code it drives.

use std::collections::VecDeque;

use crate::edge::Outbox;
use crate::error::Result;
use crate::message::{Message, Watermark};

/// Data items handed to [`Processor::process`]. Items the processor leaves
/// behind are re-presented on the next call with the same ordinal.
#[derive(Debug, Default)]
pub struct Inbox {
    queue: VecDeque<Message>,
}

impl Inbox {
    pub fn peek(&self) -> Option<&Message> {
        self.queue.front()
    }

    pub fn poll(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn remove(&mut self) {
        self.queue.pop_front();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn push(&mut self, msg: Message) {
        self.queue.push_back(msg);
    }
}

/// Static facts about the tasklet driving the processor.
#[derive(Debug, Clone)]
pub struct Context {
    pub task_name: String,
    pub index: usize,
}

impl Context {
    pub fn new(task_name: impl Into<String>, index: usize) -> Self {
        Context {
            task_name: task_name.into(),
            index,
        }
    }
}

/// A unit of user logic driven by a tasklet.
///
/// All methods that can emit receive the outbox at the call site; a refused
/// `offer` must leave the processor in a state where the same call can be
/// repeated. Any `Err` is fatal to the tasklet and surfaces to the scheduler
/// unchanged.
///
/// # Example (echo processor)
///
/// ```
/// use lineflow::processor::{Inbox, Processor};
/// use lineflow::edge::Outbox;
/// use lineflow::message::StreamItem;
/// use lineflow::Result;
///
/// struct Echo;
///
/// impl Processor for Echo {
///     fn process(&mut self, _ordinal: usize, inbox: &mut Inbox, outbox: &mut dyn Outbox) -> Result<()> {
///         while let Some(msg) = inbox.peek() {
///             if !outbox.offer(StreamItem::Message(msg.clone())) {
///                 break;
///             }
///             inbox.remove();
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Processor {
    /// Whether the processor promises to yield quickly. The tasklet reports
    /// this to the scheduler.
    fn is_cooperative(&self) -> bool {
        true
    }

    /// Called once before any other method.
    fn init(&mut self, _context: &Context) -> Result<()> {
        Ok(())
    }

    /// Drain or partially drain one inbox.
    fn process(&mut self, ordinal: usize, inbox: &mut Inbox, outbox: &mut dyn Outbox)
        -> Result<()>;

    /// Absorb one watermark, possibly emitting items. Returning `false`
    /// means "call me again with the same watermark".
    fn try_process_watermark(
        &mut self,
        _wm: Watermark,
        _outbox: &mut dyn Outbox,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Idle hook invoked when no inbound stream had an item. The return
    /// value is advisory.
    fn try_process(&mut self, _outbox: &mut dyn Outbox) -> Result<bool> {
        Ok(true)
    }

    /// Called once all inbound streams are exhausted; return `true` when
    /// fully drained.
    fn complete(&mut self, _outbox: &mut dyn Outbox) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_order_and_accessors() {
        let mut inbox = Inbox::default();
        inbox.push(Message::from("a"));
        inbox.push(Message::from("b"));

        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.peek(), Some(&Message::from("a")));
        assert_eq!(inbox.poll(), Some(Message::from("a")));
        inbox.remove();
        assert!(inbox.is_empty());
    }
}
