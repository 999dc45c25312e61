use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::transport::{InboundReply, OutboundRequest, Transport, TransportError};

/// Replays canned replies in order and records every outbound request.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<InboundReply, TransportError>>>,
    sent: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(replies: Vec<Result<InboundReply, TransportError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn json(replies: Vec<(u16, Value)>) -> Self {
        Self::new(
            replies
                .into_iter()
                .map(|(status, body)| Ok(InboundReply::json(status, &body)))
                .collect(),
        )
    }

    pub(crate) fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: OutboundRequest) -> Result<InboundReply, TransportError> {
        self.sent.lock().expect("sent lock").push(request);
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Other("script exhausted".to_string())))
    }
}
