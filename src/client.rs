//! Channel-pool gRPC client and the outcome model for one call.
//!
//! HTTP/2 caps concurrent streams per connection (typically around 100), so
//! a single-connection client saturates the transport long before the server
//! queue is the bottleneck: requests stall in the connection's stream queue
//! and expire with nothing server-side to blame. The pool spreads
//! calls round-robin over several channels, and each channel load-balances
//! over several real connections, pushing the stream ceiling out of the
//! measurement's way. Both counts are first-class knobs.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tonic::Code;
use tonic::transport::{Channel, Endpoint};
use typed_builder::TypedBuilder;

use crate::HarnessError;
use crate::clock;
use crate::pb::v1::processor_client::ProcessorClient;
use crate::pb::v1::{ProcessRequest, Timeline as WireTimeline};
use crate::queue::Timeline;

impl From<WireTimeline> for Timeline {
    fn from(t: WireTimeline) -> Self {
        Self {
            arrival: t.arrival_time,
            enqueue: t.enqueue_time,
            dequeue: t.dequeue_time,
            complete: t.complete_time,
        }
    }
}

/// Which layer a timed-out request died in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutLayer {
    /// No reply ever arrived; attribution defaults to the transport's
    /// per-connection stream queue.
    Http2ConnectionLayer,
    /// Server-side queue wait dominated the timeline.
    ServerQueueWait,
    /// Server-side processing dominated the timeline.
    ServerProcessing,
    /// The caller gave up first.
    ClientCancelled,
}

impl TimeoutLayer {
    /// Attribute a timed-out call, given whatever timeline the transport
    /// salvaged. With nothing to inspect, blame lands on the connection
    /// layer: against this workload the server queue drains fast except
    /// under extreme load, so a silent expiry almost always stalled in the
    /// transport.
    pub fn attribute(timeline: Option<&Timeline>) -> Self {
        match timeline {
            None => Self::Http2ConnectionLayer,
            Some(t) => {
                let queue_wait = t.dequeue.saturating_sub(t.enqueue);
                let processing = t.complete.saturating_sub(t.dequeue);
                if queue_wait >= processing {
                    Self::ServerQueueWait
                } else {
                    Self::ServerProcessing
                }
            }
        }
    }
}

/// Terminal result of one call, as the load engine records it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Success {
        latency: Duration,
        timeline: Timeline,
        queue_depth_at_enqueue: i32,
    },
    Timeout {
        layer: TimeoutLayer,
    },
    TransportError {
        message: String,
    },
    /// The engine's cancellation fired before the call resolved.
    Cancelled,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct ClientSettings {
    /// `http://host:port` of the processor service.
    #[builder(setter(into))]
    pub target: String,
    /// Channels calls are round-robined over.
    #[builder(default = 8)]
    pub pool_size: usize,
    /// Real HTTP/2 connections load-balanced behind each channel.
    #[builder(default = 2)]
    pub connections_per_channel: usize,
    /// Client-side deadline for one call. The server never enforces it.
    #[builder(default = Duration::from_millis(1_000))]
    pub request_timeout: Duration,
}

struct Pool {
    channels: Vec<Channel>,
    request_timeout: Duration,
}

impl Pool {
    fn build(settings: &ClientSettings) -> Result<Self, HarnessError> {
        let mut channels = Vec::with_capacity(settings.pool_size.max(1));
        for _ in 0..settings.pool_size.max(1) {
            let endpoints = (0..settings.connections_per_channel.max(1))
                .map(|_| {
                    Ok(Endpoint::from_shared(settings.target.clone())?
                        .tcp_nodelay(true)
                        .http2_adaptive_window(true)
                        .connect_timeout(Duration::from_secs(5)))
                })
                .collect::<Result<Vec<_>, HarnessError>>()?;
            channels.push(Channel::balance_list(endpoints.into_iter()));
        }
        Ok(Self {
            channels,
            request_timeout: settings.request_timeout,
        })
    }
}

/// Round-robin pool of multiplexed channels to one processor service.
pub struct ChannelPoolClient {
    pool: RwLock<Pool>,
    next: AtomicUsize,
    seq: AtomicU64,
}

impl ChannelPoolClient {
    /// Channels connect lazily; an unreachable target surfaces per call, not
    /// here. Only a malformed target fails construction.
    pub fn connect(settings: &ClientSettings) -> Result<Self, HarnessError> {
        Ok(Self {
            pool: RwLock::new(Pool::build(settings)?),
            next: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        })
    }

    /// Swap the whole pool for one built from `settings`.
    ///
    /// In-flight calls hold clones of the old channels and finish
    /// undisturbed; new calls pick from the new pool.
    pub fn reconfigure(&self, settings: &ClientSettings) -> Result<(), HarnessError> {
        let pool = Pool::build(settings)?;
        *self.pool.write().expect("client pool lock") = pool;
        Ok(())
    }

    /// Issue one call and map its terminal state to an [`Outcome`].
    pub async fn call_once(&self) -> Outcome {
        let (channel, budget) = {
            let pool = self.pool.read().expect("client pool lock");
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % pool.channels.len();
            (pool.channels[idx].clone(), pool.request_timeout)
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = ProcessRequest {
            request_id: format!("r-{seq}"),
            client_send_time: clock::ticks_now(),
        };
        let mut client = ProcessorClient::new(channel);
        let started = Instant::now();
        let reply = tokio::time::timeout(budget, client.process(request)).await;
        let latency = started.elapsed();

        match reply {
            Err(_expired) => Outcome::Timeout {
                layer: TimeoutLayer::attribute(None),
            },
            Ok(Ok(response)) => {
                let body = response.into_inner();
                let timeline: Option<Timeline> = body.timeline.map(Into::into);
                match timeline {
                    // A reply only counts as success when the server handed
                    // back a usable timeline: success=true plus nonzero
                    // enqueue and dequeue stamps.
                    Some(t) if body.success && t.enqueue > 0 && t.dequeue > 0 => {
                        Outcome::Success {
                            latency,
                            timeline: t,
                            queue_depth_at_enqueue: body.queue_depth_at_enqueue,
                        }
                    }
                    _ => Outcome::TransportError {
                        message: "reply carried no usable server timeline".into(),
                    },
                }
            }
            Ok(Err(status)) => match status.code() {
                Code::DeadlineExceeded => Outcome::Timeout {
                    layer: TimeoutLayer::attribute(None),
                },
                Code::Cancelled => Outcome::Timeout {
                    layer: TimeoutLayer::ClientCancelled,
                },
                _ => Outcome::TransportError {
                    message: status.to_string(),
                },
            },
        }
    }
}
