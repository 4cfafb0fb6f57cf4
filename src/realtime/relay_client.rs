//! Outbound websocket link to the relay process.
//!
//! A [`RelayConnection`] owns one background task that keeps a socket open,
//! reconnecting with exponential backoff and jitter. Emitting never waits for
//! the link: while disconnected it fails immediately with
//! [`RelayError::NotConnected`].

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, error::TrySendError},
        watch, Mutex,
    },
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{
    events::{Frame, RealtimeEvent, Room},
    notifier::{Notifier, RelayError},
};
use crate::config::RelayClientConfig;

/// Connection lifecycle and inbound traffic, for links that listen.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Frame(Frame),
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based): half of the capped
    /// exponential step plus a random share of the other half.
    pub fn delay(&self, attempt: u32) -> Duration {
        let step = self
            .base
            .saturating_mul(1u32 << attempt.min(20))
            .min(self.max);
        let half = step / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

pub struct RelayConnection {
    outbound: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Starts a send-only link, as used by the application server.
    pub fn start(config: &RelayClientConfig) -> Self {
        Self::spawn(config, None)
    }

    /// Starts a link that also reports connection changes and inbound frames.
    pub fn start_listening(config: &RelayClientConfig) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        (Self::spawn(config, Some(tx)), rx)
    }

    fn spawn(config: &RelayClientConfig, inbound: Option<mpsc::Sender<LinkEvent>>) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            url: config.url.clone(),
            backoff: Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay),
            outbound: outbound_rx,
            inbound,
            connected: connected.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());

        Self {
            outbound,
            connected,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), RelayError> {
        if *self.shutdown.borrow() {
            return Err(RelayError::Closed);
        }
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let text = frame.to_text()?;
        self.outbound.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::Backpressure,
            TrySendError::Closed(_) => RelayError::Closed,
        })
    }

    /// Flushes queued frames, closes the socket and waits for the worker.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Relay worker ended abnormally: {}", e);
            }
        }
    }
}

#[async_trait]
impl Notifier for RelayConnection {
    async fn emit(&self, room: &Room, event: &RealtimeEvent) -> Result<(), RelayError> {
        let frame = event.to_frame(Some(room))?;
        self.send_frame(&frame)
    }
}

struct Worker {
    url: String,
    backoff: Backoff,
    outbound: mpsc::Receiver<String>,
    inbound: Option<mpsc::Sender<LinkEvent>>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

enum SessionEnd {
    Lost,
    Shutdown,
}

impl Worker {
    async fn run(mut self) {
        let mut attempt = 0u32;
        while !*self.shutdown.borrow() {
            let connecting = connect_async(self.url.as_str());
            let result = tokio::select! {
                result = connecting => result,
                _ = self.shutdown.changed() => break,
            };

            match result {
                Ok((socket, _)) => {
                    tracing::info!("Connected to relay at {}", self.url);
                    attempt = 0;
                    self.connected.store(true, Ordering::Release);
                    self.notify(LinkEvent::Connected).await;

                    let end = self.pump(socket).await;

                    self.connected.store(false, Ordering::Release);
                    self.notify(LinkEvent::Disconnected).await;
                    if let SessionEnd::Shutdown = end {
                        break;
                    }
                    tracing::warn!("Lost connection to relay at {}", self.url);
                    let dropped = self.discard_queued();
                    if dropped > 0 {
                        tracing::warn!("Dropped {} queued relay frames", dropped);
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to relay at {}: {}", self.url, e);
                }
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tracing::debug!("Reconnecting to relay in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        self.connected.store(false, Ordering::Release);
        tracing::info!("Relay link to {} closed", self.url);
    }

    async fn pump(&mut self, socket: WebSocketStream<MaybeTlsStream<TcpStream>>) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                queued = self.outbound.recv() => match queued {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            tracing::warn!("Relay write failed: {}", e);
                            return SessionEnd::Lost;
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match Frame::parse(&text) {
                        Ok(frame) => self.notify(LinkEvent::Frame(frame)).await,
                        Err(e) => tracing::debug!("Ignoring relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Relay read failed: {}", e);
                        return SessionEnd::Lost;
                    }
                },
                _ = self.shutdown.changed() => {
                    while let Ok(text) = self.outbound.try_recv() {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Frames queued for a lost link are stale by the time a new one opens.
    fn discard_queued(&mut self) -> usize {
        let mut dropped = 0;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    async fn notify(&self, event: LinkEvent) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(event).await;
        }
    }
}
