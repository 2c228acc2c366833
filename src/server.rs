//! RPC adapter between the wire and the work queue, plus the embedded
//! server used when no external target is supplied.
//!
//! The handler never blocks an I/O thread on the queue: enqueue is
//! non-blocking and the wait for completion suspends on the handler's own
//! future. Client abandonment is propagated by a drop guard, since tonic
//! drops the handler future when the peer resets the stream; the guard flags
//! the queued item so the worker skips it at dequeue. A cancelled item
//! terminates the RPC with `CANCELLED`; the server never emits
//! deadline-exceeded, because the deadline is purely a client-side concept.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use typed_builder::TypedBuilder;

use crate::HarnessError;
use crate::clock;
use crate::pb::v1::processor_server::{Processor, ProcessorServer};
use crate::pb::v1::{ProcessRequest, ProcessResponse, Timeline as WireTimeline};
use crate::queue::{CancelHandle, ItemOutcome, Timeline, WorkItem, WorkQueue};

impl From<Timeline> for WireTimeline {
    fn from(t: Timeline) -> Self {
        Self {
            arrival_time: t.arrival,
            enqueue_time: t.enqueue,
            dequeue_time: t.dequeue,
            complete_time: t.complete,
        }
    }
}

/// Flags the queued item if the handler future dies before `disarm`.
struct CancelOnDrop {
    handle: CancelHandle,
    armed: bool,
}

impl CancelOnDrop {
    fn new(handle: CancelHandle) -> Self {
        Self { handle, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.handle.cancel();
        }
    }
}

/// The unary `Process` implementation backed by one [`WorkQueue`].
pub struct ProcessorService {
    queue: Arc<WorkQueue>,
}

impl ProcessorService {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }
}

#[tonic::async_trait]
impl Processor for ProcessorService {
    async fn process(
        &self,
        request: Request<ProcessRequest>,
    ) -> Result<Response<ProcessResponse>, Status> {
        let arrival = clock::ticks_now();
        let req = request.into_inner();
        let (item, cancel, done) =
            WorkItem::new(req.request_id.clone(), req.client_send_time, arrival);
        // armed before enqueue so no drop window leaves a live queued item
        let guard = CancelOnDrop::new(cancel);
        let depth = self
            .queue
            .enqueue(item)
            .map_err(|_| Status::unavailable("work queue is shut down"))?;

        match done.await {
            Ok(ItemOutcome::Completed(timeline)) => {
                guard.disarm();
                Ok(Response::new(ProcessResponse {
                    request_id: req.request_id,
                    success: true,
                    queue_depth_at_enqueue: depth as i32,
                    timeline: Some(timeline.into()),
                }))
            }
            Ok(ItemOutcome::CancelledInQueue) => {
                guard.disarm();
                Err(Status::cancelled("request cancelled while queued"))
            }
            Err(_) => {
                guard.disarm();
                Err(Status::internal("worker dropped the completion signal"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct ServerSettings {
    /// Listen port on loopback; 0 picks an ephemeral one.
    #[builder(default = 0)]
    pub port: u16,
    /// Per-connection concurrent-stream cap, generous so concurrency spikes
    /// pile up in the work queue instead of the transport.
    #[builder(default = 500)]
    pub max_concurrent_streams: u32,
}

/// Loopback HTTP/2 listener wrapping one [`ProcessorService`].
pub struct EmbeddedServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    queue: Arc<WorkQueue>,
    settings: ServerSettings,
}

impl EmbeddedServer {
    /// Bind the listener up front so the caller learns the real port before
    /// the serve loop starts. A taken port is a harness error, fatal before
    /// any probe begins.
    pub async fn bind(settings: ServerSettings, queue: Arc<WorkQueue>) -> Result<Self, HarnessError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], settings.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HarnessError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| HarnessError::Bind { addr, source })?;
        Ok(Self {
            listener,
            local_addr,
            queue,
            settings,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Target URI for a client pool pointed at this server.
    pub fn target_uri(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Serve until `shutdown` flips. Consumes the server.
    pub async fn serve(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), tonic::transport::Error> {
        Server::builder()
            .max_concurrent_streams(self.settings.max_concurrent_streams)
            .tcp_nodelay(true)
            .add_service(ProcessorServer::new(ProcessorService::new(self.queue)))
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), async move {
                let _ = shutdown.wait_for(|s| *s).await;
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_timeline_round_trips() {
        let t = Timeline {
            arrival: 1,
            enqueue: 2,
            dequeue: 3,
            complete: 4,
        };
        let wire = WireTimeline::from(t);
        assert_eq!(Timeline::from(wire), t);
    }

    #[test]
    fn dropped_guard_cancels_the_item() {
        let (_item, cancel, _done) = WorkItem::new("g".into(), 1, 2);
        {
            let _guard = CancelOnDrop::new(cancel.clone());
        }
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn disarmed_guard_leaves_the_item_alone() {
        let (_item, cancel, _done) = WorkItem::new("g".into(), 1, 2);
        let guard = CancelOnDrop::new(cancel.clone());
        guard.disarm();
        assert!(!cancel.is_cancelled());
    }
}
