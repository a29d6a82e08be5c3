//! Pump: one direction's read, rectify, route and write loop.
//!
//! Every frame is written to exactly one side: onward to the destination, or back to the
//! connection it came from when a rule asks for a synthesized reply. Both write sides are shared
//! with the reverse pump, so each frame is written under the writer's lock.

use crate::framing::{Frame, FrameError, FrameReader};
use crate::hexdump::HexDump;
use crate::metrics::Metrics;
use crate::rectifier::Rectifier;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace};

/// Write side shared by the forwarding pump of one direction and the sendback path of the other.
pub type SharedWriter<W> = Arc<Mutex<W>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Onward to the other peer.
    Forward,
    /// Back to the connection the frame was read from.
    SendBack,
}

/// Bytes to write for one frame and where they go.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub bytes: Bytes,
    pub route: Route,
    pub rectified: bool,
    pub matched_rules: Vec<String>,
}

/// Decide what to write for `frame`. Without a rectifier the frame passes through untouched.
pub fn route_frame(frame: &Frame, rectifier: Option<&Rectifier>) -> Result<Outgoing, FrameError> {
    let rectifier = match rectifier {
        Some(r) => r,
        None => {
            return Ok(Outgoing {
                bytes: frame.raw().clone(),
                route: Route::Forward,
                rectified: false,
                matched_rules: Vec::new(),
            })
        }
    };

    let result = rectifier.rectify_frame(frame)?;
    let route = if result.send_back() {
        Route::SendBack
    } else {
        Route::Forward
    };
    Ok(Outgoing {
        bytes: result.bytes,
        route,
        rectified: result.rectified,
        matched_rules: result.matched_rules,
    })
}

/// How a pump stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Source closed between frames.
    EndOfStream,
    /// The session asked the pump to stop.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpState {
    Running,
    Closing,
    Terminated,
}

enum Step {
    Continue,
    Exit(PumpExit),
}

pub struct Pump<R, D, B> {
    direction: Direction,
    source: FrameReader<R>,
    destination: SharedWriter<D>,
    reply: SharedWriter<B>,
    rectifier: Option<Rectifier>,
    metrics: Arc<Metrics>,
    state: PumpState,
}

impl<R, D, B> Pump<R, D, B>
where
    R: AsyncRead + Unpin,
    D: AsyncWrite + Unpin,
    B: AsyncWrite + Unpin,
{
    /// `reply` is the write side of the connection `source` reads from. `rectifier` is `None` when
    /// rectification is off for this direction.
    pub fn new(
        direction: Direction,
        source: R,
        destination: SharedWriter<D>,
        reply: SharedWriter<B>,
        rectifier: Option<Rectifier>,
        max_frame_bytes: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            direction,
            source: FrameReader::new(source, max_frame_bytes),
            destination,
            reply,
            rectifier,
            metrics,
            state: PumpState::Running,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Pump frames until the source ends, a fatal error occurs or `shutdown` fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<PumpExit> {
        debug!(
            "{} pump running (rectification {})",
            self.direction,
            if self.rectifier.is_some() { "on" } else { "off" }
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(PumpExit::Shutdown);
            }
            let step = tokio::select! {
                _ = shutdown.changed() => Ok(Step::Exit(PumpExit::Shutdown)),
                step = self.step() => step,
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Exit(exit)) => break Ok(exit),
                Err(e) => break Err(e),
            }
        };

        self.set_state(PumpState::Closing);
        match &result {
            Ok(PumpExit::EndOfStream) => info!("{}: peer closed the connection", self.direction),
            Ok(PumpExit::Shutdown) => debug!("{}: stopped by session shutdown", self.direction),
            Err(e) => info!("{}: {:#}", self.direction, e),
        }
        self.set_state(PumpState::Terminated);
        result
    }

    fn set_state(&mut self, state: PumpState) {
        trace!("{} pump {:?} -> {:?}", self.direction, self.state, state);
        self.state = state;
    }

    async fn step(&mut self) -> Result<Step> {
        let frame = match self.source.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Step::Exit(PumpExit::EndOfStream)),
            Err(e) if e.is_recoverable() => {
                info!("{}: skipping frame: {}", self.direction, e);
                self.metrics.inc_skipped(self.direction);
                return Ok(Step::Continue);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("{}: read failed", self.direction));
            }
        };
        self.handle_frame(frame).await?;
        Ok(Step::Continue)
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let started = Instant::now();
        let direction = self.direction;
        self.metrics.observe_frame(direction, frame.len());
        info!("{}: received {} bytes", direction, frame.len());
        debug!(
            "{}: message id {}, {} body records",
            direction,
            frame.message_id(),
            frame.body_len()
        );
        trace!("{} frame:\n{}", direction, HexDump(frame.raw()));

        let outgoing = route_frame(&frame, self.rectifier.as_ref()).with_context(|| {
            format!("{}: failed to process message id {}", direction, frame.message_id())
        })?;

        if outgoing.rectified {
            self.metrics.inc_rectified(direction);
            for label in &outgoing.matched_rules {
                self.metrics.inc_rule_match(label);
            }
        }

        match outgoing.route {
            Route::SendBack => {
                info!(
                    "{}: rectified message id {} sent back to sender ({} bytes)",
                    direction,
                    frame.message_id(),
                    outgoing.bytes.len()
                );
                self.metrics.inc_sent_back(direction);
                write_frame(&self.reply, &outgoing.bytes)
                    .await
                    .with_context(|| format!("{}: write back to sender failed", direction))?;
            }
            Route::Forward => {
                if outgoing.rectified {
                    info!(
                        "{}: rectified message id {} forwarded ({} bytes)",
                        direction,
                        frame.message_id(),
                        outgoing.bytes.len()
                    );
                }
                write_frame(&self.destination, &outgoing.bytes)
                    .await
                    .with_context(|| format!("{}: write failed", direction))?;
            }
        }
        if outgoing.rectified {
            trace!("{} rectified frame:\n{}", direction, HexDump(&outgoing.bytes));
        }

        let elapsed = started.elapsed();
        self.metrics.observe_duration(direction, elapsed);
        debug!("{}: frame done in {:?}", direction, elapsed);
        Ok(())
    }
}

/// Write one frame under the writer's lock so frames from two pumps never interleave.
async fn write_frame<W: AsyncWrite + Unpin>(writer: &Mutex<W>, bytes: &[u8]) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(bytes).await?;
    w.flush().await
}
