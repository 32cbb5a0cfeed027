//! Shared test doubles: a scripted websocket transport that counts open
//! sessions, and a canned HTTP transport that counts requests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use price_feed_aggregator::domain::FeedError;
use price_feed_aggregator::ports::{HttpResponse, HttpTransport, StreamSession, StreamTransport};

/// Inbound behavior of one scripted session.
pub enum Inbound {
    Text(String),
    /// Peer closes the stream.
    Close,
}

/// Outcome of one connect attempt.
pub enum Connect {
    Refuse(FeedError),
    /// Deliver these frames, then stay silent until closed.
    Open(Vec<Inbound>),
}

pub fn text(frame: &str) -> Inbound {
    Inbound::Text(frame.to_string())
}

/// Websocket double. Connects beyond the script open silent sessions.
#[derive(Default)]
pub struct ScriptedStream {
    script: Mutex<VecDeque<Connect>>,
    connects: AtomicUsize,
    open_sessions: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedStream {
    pub fn new(script: Vec<Connect>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Every frame the connector sent, across sessions.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamTransport for ScriptedStream {
    async fn connect(&self, _url: &str) -> Result<Box<dyn StreamSession>, FeedError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let inbound = match next {
            Some(Connect::Refuse(e)) => return Err(e),
            Some(Connect::Open(frames)) => frames.into(),
            None => VecDeque::new(),
        };

        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            inbound,
            open_sessions: Arc::clone(&self.open_sessions),
            sent: Arc::clone(&self.sent),
            closed: false,
        }))
    }
}

struct ScriptedSession {
    inbound: VecDeque<Inbound>,
    open_sessions: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: bool,
}

impl ScriptedSession {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl StreamSession for ScriptedSession {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, FeedError>> {
        match self.inbound.pop_front() {
            Some(Inbound::Text(text)) => Some(Ok(text)),
            Some(Inbound::Close) => None,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// HTTP double answering every GET with the same response.
pub struct CannedHttp {
    status: u16,
    body: String,
    calls: AtomicUsize,
}

impl CannedHttp {
    pub fn ok(body: &str) -> Arc<Self> {
        Arc::new(Self {
            status: 200,
            body: body.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn status(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status,
            body: String::new(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for CannedHttp {
    async fn get(&self, _url: &str, _timeout: Duration) -> Result<HttpResponse, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HttpResponse {
            status: self.status,
            body: self.body.clone(),
        })
    }
}
