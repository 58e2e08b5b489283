use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};

use crate::config::ReconnectPolicy;
use crate::errors::{Result, SessionError};
use crate::framer::{encode_frame, FrameDecoder};
use crate::messages::OutboundMessage;
use crate::types::CorrelationId;

/// Lower bound for any reconnect delay.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 16 * 1024;
const INBOUND_QUEUE: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Ready,
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Dials the broker. TLS, proxies and in-memory fakes plug in here.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> io::Result<Box<dyn AsyncStream>>;
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    pub host: String,
    pub port: u16,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> io::Result<Box<dyn AsyncStream>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Exponential backoff with multiplicative jitter. Successive delays never
/// decrease and never exceed `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter_ratio: f64,
    attempt: u32,
    last: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(60), 2.0, 0.15)
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter_ratio: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter_ratio,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let ratio = self.jitter_ratio.abs();
        let factor = if ratio > 0.0 {
            rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio))
        } else {
            1.0
        };
        self.next_delay_with(factor)
    }

    /// Deterministic variant used by `next_delay`; `factor` is the jitter multiplier.
    pub fn next_delay_with(&mut self, factor: f64) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let exponent = self.attempt.saturating_sub(1).min(32) as i32;
        let base = self
            .initial
            .mul_f64(self.multiplier.powi(exponent))
            .min(self.max);
        let jittered = base.mul_f64(factor.max(0.0)).min(self.max);
        let delay = jittered.max(MIN_RECONNECT_DELAY.min(self.max)).max(self.last);
        self.last = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug)]
pub enum LinkEvent {
    Frame(Vec<u8>),
    Closed,
    Failed(SessionError),
}

/// Outbound half of the ordered send queue.
pub trait MessageSender {
    fn send_message(&self, message: &OutboundMessage, id: Option<CorrelationId>) -> Result<()>;
}

/// One live physical connection: a single writer task drains the outbound
/// queue in order, a reader task turns bytes into frames.
pub struct Link {
    pub generation: u64,
    max_frame_len: usize,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::Receiver<LinkEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn spawn(stream: Box<dyn AsyncStream>, generation: u64, max_frame_len: usize) -> Self {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (event_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let reader_tx = event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(max_frame_len);
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                let read = match read_half.read(&mut chunk).await {
                    Ok(0) => {
                        let _ = reader_tx.send(LinkEvent::Closed).await;
                        return;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        let _ = reader_tx
                            .send(LinkEvent::Failed(SessionError::Transport(err.to_string())))
                            .await;
                        return;
                    }
                };
                decoder.extend(&chunk[..read]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => {
                            if reader_tx.send(LinkEvent::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = reader_tx.send(LinkEvent::Failed(err)).await;
                            return;
                        }
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let written = async {
                    write_half.write_all(&frame).await?;
                    write_half.flush().await
                }
                .await;
                if let Err(err) = written {
                    let _ = event_tx
                        .send(LinkEvent::Failed(SessionError::Transport(err.to_string())))
                        .await;
                    return;
                }
            }
            let _ = write_half.shutdown().await;
        });

        Self {
            generation,
            max_frame_len,
            outbound,
            inbound,
            reader,
            writer,
        }
    }

    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.inbound.recv().await
    }

    pub fn close(self) {
        drop(self);
    }
}

impl MessageSender for Link {
    fn send_message(&self, message: &OutboundMessage, id: Option<CorrelationId>) -> Result<()> {
        let payload = message.to_envelope(id)?.encode()?;
        let frame = encode_frame(&payload, self.max_frame_len)?;
        self.outbound
            .send(frame)
            .map_err(|_| SessionError::Transport("outbound queue closed".into()))
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAfter(Duration),
    GiveUp { attempts: u32 },
}

/// Tracks connection lifecycle, dial attempts and backoff for one session.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    backoff: ExponentialBackoff,
    state: ConnectionState,
    failures: u32,
    generation: u64,
    max_frame_len: usize,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy, max_frame_len: usize) -> Self {
        let backoff =
            ExponentialBackoff::new(policy.initial, policy.max, policy.multiplier, policy.jitter_ratio);
        Self {
            transport,
            policy,
            backoff,
            state: ConnectionState::Disconnected,
            failures: 0,
            generation: 0,
            max_frame_len,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn open(&mut self) -> Result<Link> {
        self.state = ConnectionState::Connecting;
        let started = tokio::time::Instant::now();
        match self.transport.connect().await {
            Ok(stream) => {
                self.generation = self.generation.wrapping_add(1);
                self.state = ConnectionState::Connected;
                let dial_elapsed = started.elapsed();
                tracing::info!(
                    generation = self.generation,
                    failures = self.failures,
                    ?dial_elapsed,
                    "connection_opened"
                );
                Ok(Link::spawn(stream, self.generation, self.max_frame_len))
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                Err(SessionError::Transport(err.to_string()))
            }
        }
    }

    pub fn mark_authenticating(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Authenticating;
        }
    }

    /// Returns true when this `Ready` follows an earlier connection.
    pub fn mark_ready(&mut self) -> bool {
        self.state = ConnectionState::Ready;
        self.failures = 0;
        self.backoff.reset();
        self.generation > 1
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Records a failed dial or a lost link and decides what to do next.
    pub fn on_disconnected(&mut self) -> ReconnectDecision {
        self.state = ConnectionState::Disconnected;
        self.failures = self.failures.saturating_add(1);
        if !self.policy.enabled || self.failures > self.policy.max_attempts {
            return ReconnectDecision::GiveUp {
                attempts: self.failures,
            };
        }
        let delay = self.backoff.next_delay();
        tracing::warn!(
            attempt = self.failures,
            max_attempts = self.policy.max_attempts,
            ?delay,
            "reconnect_scheduled"
        );
        ReconnectDecision::RetryAfter(delay)
    }

    /// Explicit operator reconnect clears the failure budget.
    pub fn reset_failures(&mut self) {
        self.failures = 0;
        self.backoff.reset();
    }
}
