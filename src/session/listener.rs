//! Background listener on the tunnel's data endpoint.
//!
//! One thread owns a clone of the data socket and handles datagrams in
//! arrival order: it decodes each `TUNNELING_REQUEST`, records written or
//! reported values in the cache, wakes reads waiting on a response and
//! acknowledges the request to its sender. A short socket read timeout
//! lets the thread notice the stop flag.

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cache::ValueCache;
use crate::error::{KnxError, Result};
use crate::protocol::cemi::{CemiCommand, CemiMessage};
use crate::protocol::constants::{CEMIMessageCode, ServiceType, E_NO_ERROR, MAX_PACKET_SIZE};
use crate::protocol::frame::Frame;
use crate::protocol::services::{TunnelingAck, TunnelingRequest};
use crate::session::pending::PendingReads;
use crate::session::SharedState;

/// How often the receive loop checks the stop flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State the listener shares with its session
#[derive(Debug, Clone)]
pub(crate) struct ListenerContext {
    pub(crate) cache: Arc<ValueCache>,
    pub(crate) pending: Arc<PendingReads>,
    pub(crate) shared: Arc<SharedState>,
}

/// Handle to the listener thread; dropping it stops the thread.
#[derive(Debug)]
pub(crate) struct DataChannelListener {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl DataChannelListener {
    /// Start listening on `socket`, which the thread takes ownership of.
    pub(crate) fn spawn(socket: UdpSocket, ctx: ListenerContext) -> Result<Self> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new().name("knx-data-channel".into()).spawn({
            let stop = Arc::clone(&stop);
            move || run(&socket, &ctx, &stop)
        })?;

        Ok(Self {
            handle: Some(handle),
            stop,
        })
    }

    /// Signal the thread and wait for it to exit.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                knx_log!(error, "Data channel listener panicked");
            }
        }
    }
}

impl Drop for DataChannelListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(socket: &UdpSocket, ctx: &ListenerContext, stop: &AtomicBool) {
    let mut buf = [0u8; MAX_PACKET_SIZE];

    if let Ok(addr) = socket.local_addr() {
        knx_log!(debug, "Data channel listening on {}", addr);
    }

    while !stop.load(Ordering::Acquire) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) if is_transient(&err) => continue,
            Err(err) => {
                if !stop.load(Ordering::Acquire) {
                    knx_log!(error, "Data channel socket failed, tunnel is lost: {}", err);
                    ctx.shared.mark_failed();
                    ctx.pending.clear();
                }
                break;
            }
        };

        match handle_datagram(ctx, &buf[..len]) {
            Ok(Some(ack)) => {
                if let Err(err) = socket.send_to(&ack, peer) {
                    knx_log!(error, "Failed to send TUNNELLING_ACK to {}: {}", peer, err);
                }
            }
            Ok(None) => {}
            Err(err) => knx_log!(error, "Dropping datagram from {}: {}", peer, err),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionReset
    )
}

/// Process one inbound datagram.
///
/// Returns the `TUNNELLING_ACK` frame owed to the sender, if any. Frames
/// that are not tunneling requests are dropped with `Ok(None)`.
pub(crate) fn handle_datagram(ctx: &ListenerContext, datagram: &[u8]) -> Result<Option<Vec<u8>>> {
    let frame = match Frame::parse(datagram) {
        Ok(frame) => frame,
        Err(KnxError::Frame(err)) if err.is_unsupported_service_type() => {
            knx_log!(
                warn,
                "Dropping frame with unsupported service type {:#06x}",
                err.service_type_id().unwrap_or_default()
            );
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    if frame.service_type() != ServiceType::TunnellingRequest {
        knx_log!(trace, "Ignoring {:?} on data channel", frame.service_type());
        return Ok(None);
    }

    let request = TunnelingRequest::parse(frame.body())?;
    let header = request.connection_header;

    if let Some(channel) = ctx.shared.channel() {
        if channel != header.channel_id {
            knx_log!(
                warn,
                "Dropping request for channel {} on tunnel channel {}",
                header.channel_id,
                channel
            );
            return Ok(None);
        }
    }

    let msg = CemiMessage::decode(request.cemi_data)?;
    if !msg.message_code().is_some_and(CEMIMessageCode::is_data_delivery) {
        return Err(KnxError::unsupported_message_code(msg.code()));
    }

    knx_log!(debug, "Received KNX message {}", msg);

    if matches!(msg.command(), CemiCommand::Write | CemiCommand::Response) {
        ctx.cache.set(msg.destination(), msg.payload().clone());
    }

    if msg.command() == CemiCommand::Response {
        let woken = ctx.pending.resolve(msg.destination(), msg.payload());
        if woken > 0 {
            knx_log!(debug, "Response for {} resolved {} pending read(s)", msg.destination(), woken);
        }
    }

    TunnelingAck::new(header.channel_id, header.sequence_counter, E_NO_ERROR)
        .build()
        .map(Some)
}
