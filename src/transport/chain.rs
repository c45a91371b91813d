//! Transport Chain
//!
//! An ordered list of typed transform stages between the application and
//! the socket:
//!
//! ```text
//!   application ──> [0] Throttle ──> [1] Secure ──> socket (dispatcher)
//!   application <── [0] Throttle <── [1] Secure <── socket (dispatcher)
//! ```
//!
//! Outgoing bytes cascade from index 0 toward the end of the list and come
//! out as wire bytes for the dispatcher; incoming bytes travel the other
//! way. The socket itself is the terminal and is owned by the dispatcher
//! task, so every stage sits between application and terminal.
//!
//! Stages are looked up by [`StageKind`], and each kind appears at most
//! once. Replacing or removing a stage at runtime hands its buffered bytes
//! to whoever takes its place.

use super::secure::SecureStage;
use super::throttle::ThrottledWrite;
use crate::error::Result;
use bytes::Bytes;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Throttle,
    Secure,
}

/// The contract shared by every stage.
pub trait Transform {
    fn kind(&self) -> StageKind;

    /// Accepts bytes travelling toward the wire.
    fn write_outgoing(&mut self, data: Vec<Bytes>, now: Instant) -> Result<()>;

    /// Bytes ready for the successor at `now`.
    fn take_outgoing(&mut self, now: Instant) -> Vec<Bytes>;

    /// Every byte the stage is able to release, ignoring pacing.
    fn flush_outgoing(&mut self) -> Vec<Bytes>;

    /// Accepts bytes travelling toward the application.
    fn receive_incoming(&mut self, data: Vec<Bytes>) -> Result<()>;

    /// Bytes already produced for the application side.
    fn drain_incoming(&mut self) -> Vec<Bytes>;

    /// Number of outgoing bytes buffered inside the stage.
    fn pending_outgoing(&self) -> usize;

    /// When the stage next wants to be pumped.
    fn next_release(&self) -> Option<Instant> {
        None
    }

    /// False while the stage holds application data back (handshake).
    fn is_established(&self) -> bool {
        true
    }

    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[derive(Debug)]
pub enum Stage {
    Throttle(ThrottledWrite),
    Secure(SecureStage),
}

macro_rules! delegate {
    ($self:ident, $stage:ident => $call:expr) => {
        match $self {
            Stage::Throttle($stage) => $call,
            Stage::Secure($stage) => $call,
        }
    };
}

impl Transform for Stage {
    fn kind(&self) -> StageKind {
        delegate!(self, s => s.kind())
    }

    fn write_outgoing(&mut self, data: Vec<Bytes>, now: Instant) -> Result<()> {
        delegate!(self, s => s.write_outgoing(data, now))
    }

    fn take_outgoing(&mut self, now: Instant) -> Vec<Bytes> {
        delegate!(self, s => s.take_outgoing(now))
    }

    fn flush_outgoing(&mut self) -> Vec<Bytes> {
        delegate!(self, s => s.flush_outgoing())
    }

    fn receive_incoming(&mut self, data: Vec<Bytes>) -> Result<()> {
        delegate!(self, s => s.receive_incoming(data))
    }

    fn drain_incoming(&mut self) -> Vec<Bytes> {
        delegate!(self, s => s.drain_incoming())
    }

    fn pending_outgoing(&self) -> usize {
        delegate!(self, s => s.pending_outgoing())
    }

    fn next_release(&self) -> Option<Instant> {
        delegate!(self, s => s.next_release())
    }

    fn is_established(&self) -> bool {
        delegate!(self, s => s.is_established())
    }

    fn close(&mut self) -> Result<()> {
        delegate!(self, s => s.close())
    }

    fn is_open(&self) -> bool {
        delegate!(self, s => s.is_open())
    }
}

/// The stages of one connection, application end first.
#[derive(Debug, Default)]
pub struct TransportChain {
    stages: Vec<Stage>,
}

impl TransportChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(Stage::kind).collect()
    }

    fn position(&self, kind: StageKind) -> Option<usize> {
        self.stages.iter().position(|stage| stage.kind() == kind)
    }

    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.kind() == kind)
    }

    pub fn stage_mut(&mut self, kind: StageKind) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|stage| stage.kind() == kind)
    }

    pub fn throttle_mut(&mut self) -> Option<&mut ThrottledWrite> {
        match self.stage_mut(StageKind::Throttle) {
            Some(Stage::Throttle(throttle)) => Some(throttle),
            _ => None,
        }
    }

    pub fn secure_mut(&mut self) -> Option<&mut SecureStage> {
        match self.stage_mut(StageKind::Secure) {
            Some(Stage::Secure(secure)) => Some(secure),
            _ => None,
        }
    }

    /// Inserts a stage, replacing any stage of the same kind.
    ///
    /// A replaced stage's buffered outgoing bytes move into its replacement.
    /// The throttle sits at the application end, the secure stage next to
    /// the socket, so encryption always sees paced plaintext.
    pub fn insert(&mut self, mut stage: Stage, now: Instant) -> Result<()> {
        if let Some(index) = self.position(stage.kind()) {
            let pending = self.stages[index].flush_outgoing();
            stage.write_outgoing(pending, now)?;
            self.stages[index] = stage;
            return Ok(());
        }

        match stage.kind() {
            StageKind::Throttle => self.stages.insert(0, stage),
            StageKind::Secure => self.stages.push(stage),
        }
        Ok(())
    }

    /// Removes a stage, pushing its buffered bytes through its successors.
    ///
    /// Returns the wire bytes that resulted.
    pub fn remove(&mut self, kind: StageKind, now: Instant) -> Result<Vec<Bytes>> {
        let Some(index) = self.position(kind) else {
            return Ok(Vec::new());
        };
        let mut removed = self.stages.remove(index);
        let batch = removed.flush_outgoing();
        Self::cascade(&mut self.stages[index..], batch, now)
    }

    fn cascade(stages: &mut [Stage], mut batch: Vec<Bytes>, now: Instant) -> Result<Vec<Bytes>> {
        for stage in stages {
            stage.write_outgoing(batch, now)?;
            batch = stage.take_outgoing(now);
        }
        Ok(batch)
    }

    /// Sends application bytes down the chain and returns the wire bytes
    /// that are ready now.
    pub fn write(&mut self, data: Vec<Bytes>, now: Instant) -> Result<Vec<Bytes>> {
        Self::cascade(&mut self.stages, data, now)
    }

    /// Lets every stage release what it has become ready to send.
    pub fn pump(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        self.write(Vec::new(), now)
    }

    /// Forces every buffered byte to the wire, ignoring pacing.
    pub fn flush(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        let mut batch = Vec::new();
        for stage in &mut self.stages {
            stage.write_outgoing(batch, now)?;
            batch = stage.flush_outgoing();
        }
        Ok(batch)
    }

    /// Passes wire bytes up the chain and returns application bytes.
    pub fn receive(&mut self, data: Vec<Bytes>) -> Result<Vec<Bytes>> {
        let mut batch = data;
        for stage in self.stages.iter_mut().rev() {
            stage.receive_incoming(batch)?;
            batch = stage.drain_incoming();
        }
        Ok(batch)
    }

    /// Closes every stage and returns the final wire bytes.
    pub fn close(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        let mut batch = Vec::new();
        for stage in &mut self.stages {
            stage.write_outgoing(batch, now)?;
            stage.close()?;
            batch = stage.flush_outgoing();
        }
        Ok(batch)
    }

    pub fn is_established(&self) -> bool {
        self.stages.iter().all(Stage::is_established)
    }

    pub fn pending_outgoing(&self) -> usize {
        self.stages.iter().map(Stage::pending_outgoing).sum()
    }

    pub fn next_release(&self) -> Option<Instant> {
        self.stages.iter().filter_map(Stage::next_release).min()
    }
}
