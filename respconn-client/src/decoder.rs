//! Decoder pool.
//!
//! A fixed set of worker tasks, each with its own FIFO inbox. Every unit
//! carries the requests its frames answer, so workers resolve outcomes
//! directly and no reordering is needed across workers.

use crate::error::ClientError;
use crate::request::{Request, RequestResult};
use crate::subscription::Subscription;
use bytes::Bytes;
use respconn_protocol::{decode_one, scan_frames, RespValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a unit's frames are matched against.
#[derive(Debug)]
pub enum UnitKind {
    /// Replies to the unit's requests, in order.
    Matched,
    /// Unsolicited frames for the subscription sink.
    Push(Subscription),
}

/// Bytes holding exactly `frames` complete frames, plus what they answer.
#[derive(Debug)]
pub struct FrameUnit {
    pub bytes: Bytes,
    pub frames: usize,
    /// Leading frames to discard without resolving anything.
    pub skip: usize,
    pub requests: Vec<Request>,
    pub kind: UnitKind,
}

impl FrameUnit {
    pub fn matched(bytes: Bytes, frames: usize, skip: usize, requests: Vec<Request>) -> Self {
        Self {
            bytes,
            frames,
            skip,
            requests,
            kind: UnitKind::Matched,
        }
    }

    pub fn push(bytes: Bytes, frames: usize, skip: usize, sink: Subscription) -> Self {
        Self {
            bytes,
            frames,
            skip,
            requests: Vec::new(),
            kind: UnitKind::Push(sink),
        }
    }

    pub fn is_push(&self) -> bool {
        matches!(self.kind, UnitKind::Push(_))
    }
}

struct Worker {
    tx: mpsc::UnboundedSender<FrameUnit>,
    load: Arc<AtomicUsize>,
}

/// Fixed-size pool of decoding workers.
pub struct DecoderPool {
    workers: Vec<Worker>,
}

impl DecoderPool {
    /// Spawns `size` workers (at least one) on the current runtime.
    pub fn new(size: usize) -> Self {
        let workers = (0..size.max(1))
            .map(|index| {
                let (tx, rx) = mpsc::unbounded_channel();
                let load = Arc::new(AtomicUsize::new(0));
                tokio::spawn(run_worker(index, rx, load.clone()));
                Worker { tx, load }
            })
            .collect();
        Self { workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Hands a unit to a worker.
    ///
    /// Push units always go to worker 0 so the sink sees wire order. Matched
    /// units go to the least-loaded worker, lowest index on ties.
    pub fn dispatch(&self, unit: FrameUnit) {
        let index = if unit.is_push() { 0 } else { self.least_loaded() };
        let worker = &self.workers[index];
        worker.load.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(unit)) = worker.tx.send(unit) {
            worker.load.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!("Decoder worker {} is gone, decoding inline", index);
            process_unit(unit);
        }
    }

    fn least_loaded(&self) -> usize {
        let mut best = 0;
        let mut best_load = usize::MAX;
        for (index, worker) in self.workers.iter().enumerate() {
            let load = worker.load.load(Ordering::Acquire);
            if load < best_load {
                best = index;
                best_load = load;
            }
        }
        best
    }
}

async fn run_worker(index: usize, mut rx: mpsc::UnboundedReceiver<FrameUnit>, load: Arc<AtomicUsize>) {
    while let Some(unit) = rx.recv().await {
        process_unit(unit);
        load.fetch_sub(1, Ordering::AcqRel);
    }
    tracing::trace!("Decoder worker {} stopped", index);
}

/// Decodes a unit's frames in order and resolves or delivers each one.
pub(crate) fn process_unit(unit: FrameUnit) {
    let FrameUnit {
        bytes,
        frames,
        skip,
        requests,
        kind,
    } = unit;
    let mut requests = requests.into_iter();
    let mut cursor = 0;

    for index in 0..frames {
        let decoded = match decode_one(&bytes, cursor) {
            Ok((value, next)) => {
                cursor = next;
                Ok(value)
            }
            Err(e) => match scan_frames(&bytes[cursor..], 1) {
                // Frame boundary still known, so only this frame is lost.
                Ok(scan) if scan.count == 1 => {
                    cursor += scan.end;
                    Err(e)
                }
                _ => {
                    tracing::warn!("Undecodable frame {} at offset {}: {}", index, cursor, e);
                    for request in requests {
                        request.fail(ClientError::Decode(e.clone()));
                    }
                    return;
                }
            },
        };

        if index < skip {
            if let Ok(RespValue::Error(msg)) = &decoded {
                tracing::warn!(
                    "Discarded error reply: {}",
                    String::from_utf8_lossy(msg)
                );
            }
            continue;
        }

        match &kind {
            UnitKind::Matched => match requests.next() {
                Some(request) => {
                    request.resolve(into_outcome(decoded));
                }
                None => tracing::warn!("Reply frame {} has no matching request, dropping", index),
            },
            UnitKind::Push(sink) => match decoded {
                Ok(value) => {
                    if !sink.deliver(value) {
                        tracing::debug!("Subscriber gone, dropping push frame");
                    }
                }
                Err(e) => tracing::warn!("Dropping undecodable push frame: {}", e),
            },
        }
    }

    for request in requests {
        tracing::warn!("No reply frame for request {}", request.id());
        request.fail(ClientError::ConnectionClosed);
    }
}

fn into_outcome(decoded: Result<RespValue, respconn_protocol::ProtocolError>) -> RequestResult {
    match decoded {
        Ok(RespValue::Error(msg)) => Err(ClientError::Server(
            String::from_utf8_lossy(&msg).into_owned(),
        )),
        Ok(value) => Ok(value),
        Err(e) => Err(ClientError::Decode(e)),
    }
}
