use crate::forecast::{ReplyKind, RetrieverId, Serial};

/// Payload of a reply: data, or an error message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyBody<R> {
    Data(R),
    Error(String),
}

/// One concrete reply produced for one serial number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyUpdater<R> {
    pub serial: Serial,
    /// Producer of the reply; `None` for replies the dashboard synthesized.
    pub retriever: Option<RetrieverId>,
    pub kind: ReplyKind,
    pub body: ReplyBody<R>,
}

impl<R> ReplyUpdater<R> {
    fn data(serial: Serial, kind: ReplyKind, payload: R) -> Self {
        Self {
            serial,
            retriever: None,
            kind,
            body: ReplyBody::Data(payload),
        }
    }

    /// An authoritative answer.
    pub fn strong(serial: Serial, payload: R) -> Self {
        Self::data(serial, ReplyKind::StrongBaseline, payload)
    }

    /// An answer a strong baseline from another retriever may replace.
    pub fn weak(serial: Serial, payload: R) -> Self {
        Self::data(serial, ReplyKind::WeakBaseline, payload)
    }

    pub fn supplementary(serial: Serial, payload: R) -> Self {
        Self::data(serial, ReplyKind::Supplementary, payload)
    }

    pub fn synonym_update(serial: Serial, payload: R) -> Self {
        Self::data(serial, ReplyKind::SynonymUpdate, payload)
    }

    pub fn error(serial: Serial, message: impl Into<String>) -> Self {
        Self {
            serial,
            retriever: None,
            kind: ReplyKind::Error,
            body: ReplyBody::Error(message.into()),
        }
    }

    pub fn payload(&self) -> Option<&R> {
        match &self.body {
            ReplyBody::Data(payload) => Some(payload),
            ReplyBody::Error(_) => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.body {
            ReplyBody::Data(_) => None,
            ReplyBody::Error(message) => Some(message),
        }
    }
}

/// A completed request, handed to the caller in serial-number order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply<R> {
    pub serial: Serial,
    /// The accepted baseline or error reply.
    pub main: ReplyUpdater<R>,
    /// Supplementary and synonym updates, in arrival order.
    pub supplementary: Vec<ReplyUpdater<R>>,
    pub synonym_seen: bool,
    /// `true` if `main` was made up by the dashboard rather than received.
    pub synthesized: bool,
}

impl<R> Reply<R> {
    pub fn is_error(&self) -> bool {
        self.main.kind == ReplyKind::Error
    }
}
