//! Meshtastic radio over a serial port.
//!
//! Tower payloads travel as `Data` packets on [`TOWER_PORT`]. Acknowledged
//! sends reuse the packet id for the radio's own `want_ack` machinery and
//! surface the firmware's routing replies as [`InboundEvent::Ack`].

pub mod codec;
pub mod proto;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use self::codec::RadioFrameCodec;
use self::proto::{
    Data, FromRadio, MeshPacket, NodeInfo, Routing, ToRadio, PORT_ROUTING, PRIORITY_RELIABLE,
    ROUTING_ERROR_NONE,
};
use super::{InboundEvent, InboundSink, MeshTransport, NodeId, NodePosition, PacketId};
use crate::error::TransportError;

/// Application port number carrying tower envelopes.
pub const TOWER_PORT: i32 = 42;

/// Largest `Data.payload` the firmware accepts.
pub const MAX_PAYLOAD: usize = 233;

pub const BROADCAST_ADDR: NodeId = 0xFFFF_FFFF;

pub const SERIAL_BAUD: u32 = 115_200;

pub const DEFAULT_HOP_LIMIT: u32 = 3;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

const WRITE_QUEUE: usize = 32;

/// Byte stream a radio link can run over.
pub trait RadioIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RadioIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

type RadioFramed = Framed<Box<dyn RadioIo>, RadioFrameCodec>;
type FrameSink = SplitSink<RadioFramed, Vec<u8>>;
type FrameStream = SplitStream<RadioFramed>;

enum LinkSource {
    Serial {
        device: String,
        baud_rate: u32,
    },
    Stream(Mutex<Option<Box<dyn RadioIo>>>),
}

struct Link {
    writer: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
}

#[derive(Debug, Default, Clone)]
struct NodeEntry {
    user_id: Option<String>,
    position: Option<NodePosition>,
}

#[derive(Debug, Default)]
struct RadioInfo {
    my_node: Option<NodeId>,
    nodes: BTreeMap<NodeId, NodeEntry>,
}

impl RadioInfo {
    fn record(&mut self, info: NodeInfo) {
        let entry = self.nodes.entry(info.num).or_default();
        if let Some(user) = info.user {
            if !user.id.is_empty() {
                entry.user_id = Some(user.id);
            }
        }
        if let Some(position) = info.position {
            if let (Some(lat), Some(lon)) = (position.latitude_i, position.longitude_i) {
                entry.position = Some(NodePosition {
                    latitude: f64::from(lat) * 1e-7,
                    longitude: f64::from(lon) * 1e-7,
                    altitude: f64::from(position.altitude.unwrap_or(0)),
                    time: position.time,
                });
            }
        }
    }

    fn own(&self) -> Option<&NodeEntry> {
        self.my_node.and_then(|num| self.nodes.get(&num))
    }
}

struct Shared {
    label: String,
    sink: Mutex<Option<InboundSink>>,
    radio: Mutex<RadioInfo>,
}

impl Shared {
    fn radio(&self) -> std::sync::MutexGuard<'_, RadioInfo> {
        self.radio.lock().expect("radio info mutex poisoned")
    }

    async fn emit(&self, event: InboundEvent) {
        let sink = self
            .sink
            .lock()
            .expect("inbound sink mutex poisoned")
            .clone();
        match sink {
            Some(sink) => {
                if sink.send(event).await.is_err() {
                    log::debug!("mt({}): inbound sink closed, event dropped", self.label);
                }
            }
            None => log::debug!("mt({}): no inbound sink, event dropped", self.label),
        }
    }

    async fn handle_frame(&self, frame: &[u8]) -> Option<u32> {
        let message = match FromRadio::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                log::debug!(
                    "mt({}): undecodable frame len={} err={}",
                    self.label,
                    frame.len(),
                    err
                );
                return None;
            }
        };

        let config_complete = message.config_complete_id;
        if let Some(event) = self.apply(message) {
            self.emit(event).await;
        }
        config_complete
    }

    fn apply(&self, message: FromRadio) -> Option<InboundEvent> {
        let mut radio = self.radio();
        if let Some(info) = message.my_info {
            radio.my_node = Some(info.my_node_num);
        }
        if let Some(info) = message.node_info {
            radio.record(info);
        }
        let my_node = radio.my_node;
        drop(radio);

        message
            .packet
            .and_then(|packet| self.packet_event(packet, my_node))
    }

    fn packet_event(&self, packet: MeshPacket, my_node: Option<NodeId>) -> Option<InboundEvent> {
        let data = packet.decoded?;
        match data.portnum {
            TOWER_PORT if Some(packet.from) != my_node => Some(InboundEvent::Data {
                from: packet.from,
                payload: data.payload,
            }),
            PORT_ROUTING if data.request_id != 0 => {
                let routing = Routing::decode(data.payload.as_slice()).ok()?;
                match routing.error_reason {
                    Some(ROUTING_ERROR_NONE) => Some(InboundEvent::Ack {
                        from: packet.from,
                        packet_id: PacketId::from(data.request_id),
                    }),
                    Some(reason) => {
                        log::warn!(
                            "mt({}): packet {} not delivered, routing error {}",
                            self.label,
                            data.request_id,
                            reason
                        );
                        None
                    }
                    None => None,
                }
            }
            _ => None,
        }
    }

    async fn link_lost(&self, reason: String) {
        log::warn!("mt({}): link lost: {}", self.label, reason);
        self.emit(InboundEvent::LinkError { reason }).await;
    }
}

/// [`MeshTransport`] backed by a Meshtastic radio.
pub struct MeshtasticTransport {
    source: LinkSource,
    handshake_timeout: Duration,
    shared: Arc<Shared>,
    link: Mutex<Option<Link>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl MeshtasticTransport {
    /// Radio on a serial device such as `/dev/ttyUSB0`. The port is opened on `start`.
    pub fn serial(device: impl Into<String>) -> Self {
        let device = device.into();
        let label = device.clone();
        let source = LinkSource::Serial {
            device,
            baud_rate: SERIAL_BAUD,
        };
        Self::with_source(source, label)
    }

    /// Radio reached over an already-open byte stream. Usable for one `start`.
    pub fn from_stream<IO: RadioIo>(io: IO) -> Self {
        let io: Box<dyn RadioIo> = Box::new(io);
        let source = LinkSource::Stream(Mutex::new(Some(io)));
        Self::with_source(source, "stream".to_string())
    }

    fn with_source(source: LinkSource, label: String) -> Self {
        Self {
            source,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shared: Arc::new(Shared {
                label,
                sink: Mutex::new(None),
                radio: Mutex::new(RadioInfo::default()),
            }),
            link: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_baud_rate(mut self, baud: u32) -> Self {
        if let LinkSource::Serial { baud_rate, .. } = &mut self.source {
            *baud_rate = baud;
        }
        self
    }

    fn is_up(&self) -> bool {
        self.link
            .lock()
            .expect("radio link mutex poisoned")
            .as_ref()
            .is_some_and(|link| !link.closed.is_cancelled())
    }

    fn open(&self) -> Result<Box<dyn RadioIo>, TransportError> {
        match &self.source {
            LinkSource::Serial { device, baud_rate } => {
                tokio_serial::new(device.clone(), *baud_rate)
                    .open_native_async()
                    .map(|port| Box::new(port) as Box<dyn RadioIo>)
                    .map_err(|err| TransportError::Open {
                        device: device.clone(),
                        reason: err.to_string(),
                    })
            }
            LinkSource::Stream(slot) => slot
                .lock()
                .expect("radio stream mutex poisoned")
                .take()
                .ok_or(TransportError::LinkClosed),
        }
    }

    async fn sync_node_db(
        &self,
        frames: &mut FrameStream,
        config_id: u32,
    ) -> Result<(), TransportError> {
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            if self.shared.handle_frame(&frame).await == Some(config_id) {
                return Ok(());
            }
        }
        Err(TransportError::LinkClosed)
    }
}

/// Radio packet id for `id`. Zero would let the firmware pick its own id.
fn radio_packet_id(id: PacketId) -> Result<u32, TransportError> {
    u32::try_from(id)
        .ok()
        .filter(|radio_id| *radio_id != 0)
        .ok_or(TransportError::PacketIdOutOfRange(id))
}

fn handshake_nonce() -> u32 {
    (tower_proto::now_micros() as u32).max(1)
}

async fn write_loop(
    label: String,
    mut frames: FrameSink,
    mut queue: mpsc::Receiver<Vec<u8>>,
    closed: CancellationToken,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(err) = frames.send(frame).await {
            log::warn!("mt({}): write error: {}", label, err);
            closed.cancel();
            break;
        }
    }
    let _ = frames.close().await;
}

async fn read_loop(shared: Arc<Shared>, mut frames: FrameStream, closed: CancellationToken) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    shared.handle_frame(&frame).await;
                }
                Some(Err(err)) => {
                    closed.cancel();
                    shared.link_lost(format!("read error: {err}")).await;
                    break;
                }
                None => {
                    closed.cancel();
                    shared
                        .link_lost("radio closed the stream".to_string())
                        .await;
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl MeshTransport for MeshtasticTransport {
    fn register_inbound(&self, sink: InboundSink) {
        let mut slot = self.shared.sink.lock().expect("sink mutex poisoned");
        *slot = Some(sink);
    }

    async fn start(&self) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_up() {
            return Ok(());
        }

        let io = self.open()?;
        let (mut sink, mut frames) = Framed::new(io, RadioFrameCodec::new()).split();

        let config_id = handshake_nonce();
        let request = ToRadio {
            want_config_id: Some(config_id),
            ..Default::default()
        };
        sink.send(request.encode_to_vec()).await?;

        let synced = self.sync_node_db(&mut frames, config_id);
        match tokio::time::timeout(self.handshake_timeout, synced).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::Handshake(format!(
                    "no config_complete_id within {:?}",
                    self.handshake_timeout
                )))
            }
        }

        let closed = CancellationToken::new();
        let (writer, queue) = mpsc::channel(WRITE_QUEUE);
        let label = self.shared.label.clone();
        tokio::spawn(write_loop(label, sink, queue, closed.clone()));
        tokio::spawn(read_loop(self.shared.clone(), frames, closed.clone()));
        let link = Link { writer, closed };
        *self.link.lock().expect("radio link mutex poisoned") = Some(link);

        let (my_node, known) = {
            let radio = self.shared.radio();
            (radio.my_node, radio.nodes.len())
        };
        log::info!(
            "mt({}): radio ready node={:?} known_nodes={}",
            self.shared.label,
            my_node,
            known
        );
        Ok(())
    }

    async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let link = self.link.lock().expect("radio link mutex poisoned").take();
        if let Some(link) = link {
            if !link.closed.is_cancelled() {
                let goodbye = ToRadio {
                    disconnect: Some(true),
                    ..Default::default()
                };
                let _ = link.writer.send(goodbye.encode_to_vec()).await;
            }
            link.closed.cancel();
            log::info!("mt({}): radio link closed", self.shared.label);
        }
    }

    async fn send(
        &self,
        payload: &[u8],
        destination: Option<NodeId>,
        ack: Option<PacketId>,
    ) -> Result<(), TransportError> {
        let writer = {
            let link = self.link.lock().expect("radio link mutex poisoned");
            match link.as_ref() {
                None => return Err(TransportError::NotStarted),
                Some(link) if link.closed.is_cancelled() => return Err(TransportError::LinkClosed),
                Some(link) => link.writer.clone(),
            }
        };
        if payload.len() > MAX_PAYLOAD {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let radio_id = ack.map(radio_packet_id).transpose()?.unwrap_or(0);
        let packet = MeshPacket {
            to: destination.unwrap_or(BROADCAST_ADDR),
            decoded: Some(Data {
                portnum: TOWER_PORT,
                payload: payload.to_vec(),
                ..Default::default()
            }),
            id: radio_id,
            hop_limit: DEFAULT_HOP_LIMIT,
            want_ack: ack.is_some(),
            priority: if ack.is_some() { PRIORITY_RELIABLE } else { 0 },
            ..Default::default()
        };
        let frame = ToRadio {
            packet: Some(packet),
            ..Default::default()
        }
        .encode_to_vec();
        writer
            .send(frame)
            .await
            .map_err(|_| TransportError::LinkClosed)
    }

    fn node_id(&self) -> Option<NodeId> {
        self.shared.radio().my_node
    }

    fn user_id(&self) -> Option<String> {
        self.shared
            .radio()
            .own()
            .and_then(|node| node.user_id.clone())
    }

    fn node_user_id(&self, node: NodeId) -> Option<String> {
        self.shared
            .radio()
            .nodes
            .get(&node)
            .and_then(|entry| entry.user_id.clone())
    }

    fn neighbors(&self) -> Vec<NodeId> {
        let radio = self.shared.radio();
        radio
            .nodes
            .keys()
            .copied()
            .filter(|num| Some(*num) != radio.my_node)
            .collect()
    }

    fn position(&self) -> Option<NodePosition> {
        self.shared.radio().own().and_then(|node| node.position)
    }
}

impl Drop for MeshtasticTransport {
    fn drop(&mut self) {
        if let Ok(mut link) = self.link.lock() {
            if let Some(link) = link.take() {
                link.closed.cancel();
            }
        }
    }
}
