//! Inbound framing and reply matching.
//!
//! The partitioner owns the shadow queue: one entry per request that expects a
//! reply, in submission order. Each inbound chunk is appended to the retained
//! partial frame, complete frames are counted, and exactly those bytes are
//! dispatched to the decoder pool together with the requests they answer.
//! Scan progress inside the partial frame survives between chunks.

use crate::decoder::{DecoderPool, FrameUnit};
use crate::error::ClientError;
use crate::manager::ManagerMsg;
use crate::queue::PendingQueue;
use crate::request::Request;
use crate::subscription::Subscription;
use bytes::{Bytes, BytesMut};
use respconn_protocol::{FrameScan, FrameScanner, ProtocolError};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Shadow-queue adjustments mirrored from the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Re-insert the most recently popped request at the head.
    Push,
    /// Drop this many requests from the head without resolving them.
    Remove(usize),
    /// Discard this many upcoming frames that answer no request.
    Skip(usize),
}

/// Messages accepted by the partitioner task.
#[derive(Debug)]
pub enum PartitionerMsg {
    Submit(Vec<Request>),
    Control(Control),
    Subscribe(Subscription),
    Data(Bytes),
    Closed(ClientError),
}

pub(crate) struct Partitioner {
    conn_id: Uuid,
    shadow: PendingQueue,
    last_popped: Vec<Request>,
    pending_skip: usize,
    remainder: BytesMut,
    scanner: FrameScanner,
    subscription: Option<Subscription>,
    closed: Option<ClientError>,
    decoders: DecoderPool,
    manager: mpsc::UnboundedSender<ManagerMsg>,
}

impl Partitioner {
    pub(crate) fn new(
        conn_id: Uuid,
        decoders: DecoderPool,
        manager: mpsc::UnboundedSender<ManagerMsg>,
    ) -> Self {
        Self {
            conn_id,
            shadow: PendingQueue::new(),
            last_popped: Vec::new(),
            pending_skip: 0,
            remainder: BytesMut::new(),
            scanner: FrameScanner::new(),
            subscription: None,
            closed: None,
            decoders,
            manager,
        }
    }

    /// Spawns the partitioner task and returns its inbox.
    pub(crate) fn spawn(self) -> mpsc::UnboundedSender<PartitionerMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx));
        tx
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<PartitionerMsg>) {
        while let Some(msg) = inbox.recv().await {
            self.handle(msg);
        }
        let removed = self.shadow.fail_all(&ClientError::ConnectionClosed);
        tracing::debug!(conn = %self.conn_id, removed, "Partitioner stopped");
    }

    pub(crate) fn handle(&mut self, msg: PartitionerMsg) {
        match msg {
            PartitionerMsg::Submit(requests) => self.on_submit(requests),
            PartitionerMsg::Control(control) => self.on_control(control),
            PartitionerMsg::Subscribe(sink) => self.on_subscribe(sink),
            PartitionerMsg::Data(chunk) => self.on_data(&chunk),
            PartitionerMsg::Closed(reason) => self.on_closed(reason),
        }
    }

    fn on_submit(&mut self, requests: Vec<Request>) {
        if let Some(reason) = &self.closed {
            for request in requests {
                request.fail(reason.clone());
            }
            return;
        }

        let mut forward = Vec::with_capacity(requests.len());
        for request in requests {
            match (request.expects_reply(), self.subscription.is_some()) {
                (true, true) => {
                    request.fail(ClientError::PushMode);
                }
                (false, false) => {
                    request.fail(ClientError::NotSubscribed);
                }
                (true, false) => {
                    self.shadow.push_back(request.clone());
                    forward.push(request);
                }
                (false, true) => forward.push(request),
            }
        }
        if forward.is_empty() {
            return;
        }

        if let Err(mpsc::error::SendError(ManagerMsg::Submit(lost))) =
            self.manager.send(ManagerMsg::Submit(forward))
        {
            tracing::debug!(conn = %self.conn_id, "Manager gone, failing {} requests", lost.len());
            for request in lost {
                request.fail(ClientError::ConnectionClosed);
            }
        }
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::Push => match self.last_popped.pop() {
                Some(request) => self.shadow.push_front(request),
                None => tracing::warn!(conn = %self.conn_id, "Push with no popped request"),
            },
            Control::Remove(count) => {
                let removed = self.shadow.pop_n(count);
                if removed.len() < count {
                    tracing::warn!(
                        conn = %self.conn_id,
                        "Remove({}) on a shadow queue of {}",
                        count,
                        removed.len()
                    );
                }
            }
            Control::Skip(count) => self.pending_skip += count,
        }
    }

    fn on_subscribe(&mut self, sink: Subscription) {
        if self.closed.is_some() {
            return;
        }
        if self.subscription.is_some() {
            tracing::warn!(conn = %self.conn_id, "Subscription already registered, ignoring");
            return;
        }
        tracing::debug!(
            conn = %self.conn_id,
            owed = self.shadow.len(),
            "Switching to push mode"
        );
        self.subscription = Some(sink);
    }

    fn on_data(&mut self, chunk: &[u8]) {
        if self.closed.is_some() {
            return;
        }
        self.remainder.extend_from_slice(chunk);

        // Frames still owed to queued requests are matched before any push frame.
        let owed = match self.subscription {
            Some(_) => self.pending_skip + self.shadow.len(),
            None => usize::MAX,
        };
        if owed > 0 && !self.dispatch_matched(owed) {
            return;
        }
        if let Some(sink) = self.subscription.clone() {
            self.dispatch_push(sink);
        }
    }

    /// Dispatches up to `max` complete frames against the shadow queue.
    /// Returns `false` if the stream turned out to be malformed.
    fn dispatch_matched(&mut self, max: usize) -> bool {
        let Some(scan) = self.scan(max) else {
            return false;
        };
        if scan.count == 0 {
            return true;
        }

        let skip = self.pending_skip.min(scan.count);
        self.pending_skip -= skip;

        let bytes = self.take_frames(scan);
        let wanted = scan.count - skip;
        let requests = self.shadow.pop_n(wanted);
        if requests.len() < wanted {
            tracing::warn!(
                conn = %self.conn_id,
                "{} reply frames without a pending request",
                wanted - requests.len()
            );
        }
        tracing::trace!(
            conn = %self.conn_id,
            frames = scan.count,
            skip,
            bytes = bytes.len(),
            "Dispatching matched unit"
        );

        self.last_popped = requests.clone();
        self.decoders
            .dispatch(FrameUnit::matched(bytes, scan.count, skip, requests));
        true
    }

    fn dispatch_push(&mut self, sink: Subscription) {
        let Some(scan) = self.scan(usize::MAX) else {
            return;
        };
        if scan.count == 0 {
            return;
        }
        let bytes = self.take_frames(scan);
        self.decoders
            .dispatch(FrameUnit::push(bytes, scan.count, 0, sink));
    }

    fn take_frames(&mut self, scan: FrameScan) -> Bytes {
        self.scanner.consume(scan.count);
        self.remainder.split_to(scan.end).freeze()
    }

    fn scan(&mut self, max: usize) -> Option<FrameScan> {
        match self.scanner.scan(&self.remainder, max) {
            Ok(scan) => Some(scan),
            Err(e) => {
                self.fail_stream(e);
                None
            }
        }
    }

    /// The byte stream cannot be resynchronised once a frame is malformed.
    fn fail_stream(&mut self, error: ProtocolError) {
        tracing::warn!(conn = %self.conn_id, "Malformed reply stream: {}", error);
        let reason = ClientError::Protocol(error);
        self.shutdown_with(reason);
        // Manager may already be gone.
        let _ = self.manager.send(ManagerMsg::Shutdown);
    }

    fn on_closed(&mut self, reason: ClientError) {
        if self.closed.is_some() {
            return;
        }
        tracing::debug!(conn = %self.conn_id, "Partitioner closed: {}", reason);
        self.shutdown_with(reason);
    }

    fn shutdown_with(&mut self, reason: ClientError) {
        let removed = self.shadow.fail_all(&reason);
        if removed > 0 {
            tracing::debug!(conn = %self.conn_id, removed, "Failed pending replies");
        }
        self.remainder.clear();
        self.scanner.reset();
        self.last_popped.clear();
        self.subscription = None;
        self.closed = Some(reason);
    }

    #[cfg(test)]
    fn shadow_ids(&self) -> Vec<u64> {
        self.shadow.ids()
    }
}
