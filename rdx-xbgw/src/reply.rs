//! Structured replies to remote commands, and the channel that carries them.
//!
//! A command message travels over the bus with a [`Responder`]. Each listener
//! either answers immediately with [`Responder::reply`] or calls
//! [`Responder::defer`] and answers later, from any thread, through the
//! returned [`DeferredReply`]. The invoking side holds the matching
//! [`ReplyCollector`], which knows the command is finished once every responder
//! clone has been released.

use crate::common::Payload;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// A catalog of error identifiers and their descriptions, per command context.
pub type ErrorCatalog = &'static [(&'static str, &'static str)];

/// Errors reported by the command processor itself.
pub const PROCESSOR_ERRORS: ErrorCatalog = &[
    ("command.unknown", "Command not handled"),
    (
        "command.timeout",
        "Timeout or unexpected exit waiting for response",
    ),
    (
        "command.pending",
        "Reply deferred; not awaited on the dispatcher thread",
    ),
];

const UNCLASSIFIED: &str = "Unexpected/unclassified error";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReply {
    pub id: String,
    pub desc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorReply {
    /// Builds an error reply, looking `id` up in `catalog` for its description.
    pub fn from_catalog(id: &str, catalog: ErrorCatalog, hint: Option<String>) -> Self {
        let desc = catalog
            .iter()
            .find(|(code, _)| *code == id)
            .map(|(_, desc)| *desc)
            .unwrap_or(UNCLASSIFIED);
        Self {
            id: id.to_string(),
            desc: desc.to_string(),
            hint,
        }
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.desc)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({})", hint)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Success { body: Payload },
    Error { error: ErrorReply },
}

impl Reply {
    pub fn success(body: Payload) -> Self {
        Reply::Success { body }
    }

    /// A success reply with an empty body.
    pub fn ack() -> Self {
        Reply::Success {
            body: Payload::new(),
        }
    }

    pub fn error(id: &str, catalog: ErrorCatalog, hint: Option<String>) -> Self {
        Reply::Error {
            error: ErrorReply::from_catalog(id, catalog, hint),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }
}

#[derive(Debug)]
enum ReplyEvent {
    Immediate(Reply),
    Pending,
    Deferred(Reply),
}

/// The sending side of a command's reply channel.
#[derive(Clone)]
pub struct Responder {
    tx: Sender<ReplyEvent>,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}

impl Responder {
    pub fn reply(&self, reply: Reply) {
        // The invoker may have given up already.
        self.tx.send(ReplyEvent::Immediate(reply)).ok();
    }

    pub fn error(&self, id: &str, catalog: ErrorCatalog, hint: Option<String>) {
        self.reply(Reply::error(id, catalog, hint));
    }

    /// Announces that a reply will follow later.
    ///
    /// The invoker keeps waiting, up to its command timeout, until the
    /// returned handle completes or is dropped.
    pub fn defer(&self) -> DeferredReply {
        self.tx.send(ReplyEvent::Pending).ok();
        DeferredReply {
            tx: Some(self.tx.clone()),
        }
    }
}

/// A promise to answer a command later, possibly from another thread.
///
/// Dropping it without completing reports a timeout error to the invoker.
#[derive(Debug)]
pub struct DeferredReply {
    tx: Option<Sender<ReplyEvent>>,
}

impl DeferredReply {
    pub fn complete(mut self, reply: Reply) {
        if let Some(tx) = self.tx.take() {
            tx.send(ReplyEvent::Deferred(reply)).ok();
        }
    }
}

impl Drop for DeferredReply {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.send(ReplyEvent::Deferred(Reply::error(
                "command.timeout",
                PROCESSOR_ERRORS,
                Some("deferred reply abandoned".to_string()),
            )))
            .ok();
        }
    }
}

/// The receiving side of a command's reply channel.
#[derive(Debug)]
pub struct ReplyCollector {
    rx: Receiver<ReplyEvent>,
}

/// Everything a command's listeners said before the channel closed or the
/// time limit passed.
#[derive(Debug, Default)]
pub struct Collected {
    pub replies: Vec<Reply>,
    /// Deferred replies still outstanding when collection stopped.
    pub outstanding: usize,
    /// True if no listener acknowledged the command in any way.
    pub unanswered: bool,
}

pub fn channel() -> (Responder, ReplyCollector) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (Responder { tx }, ReplyCollector { rx })
}

impl ReplyCollector {
    /// Collects replies until every responder is gone or `limit` elapses.
    pub fn collect(self, limit: Duration) -> Collected {
        let deadline = Instant::now() + limit;
        let mut collected = Collected {
            unanswered: true,
            ..Collected::default()
        };
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(event) => {
                    collected.unanswered = false;
                    match event {
                        ReplyEvent::Immediate(reply) => collected.replies.push(reply),
                        ReplyEvent::Pending => collected.outstanding += 1,
                        ReplyEvent::Deferred(reply) => {
                            collected.outstanding = collected.outstanding.saturating_sub(1);
                            collected.replies.push(reply);
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        outstanding = collected.outstanding,
                        "Gave up waiting for command replies"
                    );
                    break;
                }
            }
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn collection_ends_when_all_responders_are_released() {
        let (responder, collector) = channel();
        responder.reply(Reply::ack());
        drop(responder);

        let collected = collector.collect(Duration::from_secs(5));
        assert_eq!(collected.replies, vec![Reply::ack()]);
        assert_eq!(collected.outstanding, 0);
        assert!(!collected.unanswered);
    }

    #[test]
    fn silence_is_reported_as_unanswered() {
        let (responder, collector) = channel();
        drop(responder);
        assert!(collector.collect(Duration::from_secs(5)).unanswered);
    }

    #[test]
    fn deferred_reply_completes_from_another_thread() {
        let (responder, collector) = channel();
        let deferred = responder.defer();
        drop(responder);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            deferred.complete(Reply::success(Payload::new().with("text", "hi")));
        });

        let collected = collector.collect(Duration::from_secs(5));
        worker.join().unwrap();
        assert_eq!(collected.outstanding, 0);
        assert_eq!(collected.replies.len(), 1);
        assert!(!collected.replies[0].is_error());
    }

    #[test]
    fn outstanding_deferrals_are_counted_on_timeout() {
        let (responder, collector) = channel();
        let _held = responder.defer();
        let collected = collector.collect(Duration::from_millis(20));
        assert_eq!(collected.outstanding, 1);
        assert!(collected.replies.is_empty());
    }

    #[test]
    fn abandoned_deferral_becomes_a_timeout_error() {
        let (responder, collector) = channel();
        drop(responder.defer());
        drop(responder);
        let collected = collector.collect(Duration::from_secs(5));
        assert_eq!(collected.outstanding, 0);
        match &collected.replies[0] {
            Reply::Error { error } => assert_eq!(error.id, "command.timeout"),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn unknown_catalog_ids_are_unclassified() {
        let reply = ErrorReply::from_catalog("nope", PROCESSOR_ERRORS, None);
        assert_eq!(reply.desc, UNCLASSIFIED);
    }
}
