//! The items that flow across edges: data messages, watermarks and the
//! end-of-stream marker, plus the progress report a tasklet hands back to
//! the scheduler after every call.

use std::fmt;

use bytes::Bytes;

/// The unit of data flow between processors.
///
/// NOTE: it is cheap to clone. The engine never inspects the payload; only
/// the user processor does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// actual payload of the message
    pub value: Bytes,
}

impl Message {
    pub fn new(value: Bytes) -> Self {
        Message { value }
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Message {
            value: Bytes::from(value),
        }
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message {
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }
}

/// A marker asserting that no item with a smaller timestamp will arrive on
/// the stream that emitted it. Ordering and equality are on the timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(i64);

impl Watermark {
    pub fn new(timestamp: i64) -> Self {
        Watermark(timestamp)
    }

    pub fn timestamp(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wm({})", self.0)
    }
}

/// One element of an inbound stream. Outboxes accept the first two variants;
/// `EndOfStream` only ever travels consumer-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Message(Message),
    Watermark(Watermark),
    EndOfStream,
}

impl From<Message> for StreamItem {
    fn from(msg: Message) -> Self {
        StreamItem::Message(msg)
    }
}

impl From<Watermark> for StreamItem {
    fn from(wm: Watermark) -> Self {
        StreamItem::Watermark(wm)
    }
}

/// What a single tasklet call achieved.
///
/// Transitions are monotonic: once `Done` is returned, every later call
/// returns `WasAlreadyDone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// The call was a pure poll with no observable effect.
    NoProgress,
    /// The call produced or consumed at least one item or changed
    /// observable state.
    MadeProgress,
    /// Terminal; reported exactly once.
    Done,
    /// Terminal state was reached on an earlier call.
    WasAlreadyDone,
}

impl ProgressState {
    pub fn made_progress(&self) -> bool {
        matches!(self, ProgressState::MadeProgress | ProgressState::Done)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ProgressState::Done | ProgressState::WasAlreadyDone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_ordering() {
        assert!(Watermark::new(1) < Watermark::new(2));
        assert_eq!(Watermark::new(5), Watermark::new(5));
        assert_eq!(Watermark::new(123).to_string(), "wm(123)");
    }

    #[test]
    fn test_message_from_str() {
        let msg = Message::from("hello");
        assert_eq!(msg.value, Bytes::from("hello"));
        assert_eq!(msg, Message::from("hello".to_string()));
    }

    #[test]
    fn test_progress_state_accessors() {
        assert!(ProgressState::MadeProgress.made_progress());
        assert!(ProgressState::Done.made_progress());
        assert!(!ProgressState::NoProgress.made_progress());
        assert!(!ProgressState::WasAlreadyDone.made_progress());

        assert!(ProgressState::Done.is_done());
        assert!(ProgressState::WasAlreadyDone.is_done());
        assert!(!ProgressState::MadeProgress.is_done());
    }
}
