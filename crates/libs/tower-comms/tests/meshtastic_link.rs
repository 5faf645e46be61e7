use std::sync::{Arc, Once};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tower_comms::iface::meshtastic::codec::RadioFrameCodec;
use tower_comms::iface::meshtastic::proto::{
    Data, FromRadio, MeshPacket, MyNodeInfo, NodeInfo, Position, Routing, ToRadio, User,
    PORT_ROUTING, PRIORITY_RELIABLE,
};
use tower_comms::iface::meshtastic::{BROADCAST_ADDR, TOWER_PORT};
use tower_comms::{
    InboundEvent, MeshTransport, MeshtasticTransport, NodeConfig, TowerSession, TransportError,
};
use tower_proto::{Body, PingData};

const OWN: u32 = 0x0a0b_0c0d;
const PEER: u32 = 0x1122_3344;

static INIT: Once = Once::new();

fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

/// Radio side of the serial link.
struct Firmware {
    frames: Framed<DuplexStream, RadioFrameCodec>,
}

impl Firmware {
    async fn recv(&mut self) -> ToRadio {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.frames.next())
            .await
            .expect("timed out waiting for host frame")
            .expect("stream ended")
            .expect("frame");
        ToRadio::decode(frame).expect("ToRadio")
    }

    async fn send(&mut self, message: FromRadio) {
        self.frames
            .send(message.encode_to_vec())
            .await
            .expect("write frame");
    }

    async fn console(&mut self, text: &str) {
        self.frames
            .get_mut()
            .write_all(text.as_bytes())
            .await
            .expect("write console");
    }

    /// Answers the host's `want_config_id` with a small node database.
    async fn boot(&mut self) {
        let config_id = self.recv().await.want_config_id.expect("want_config_id");
        self.console("DEBUG | ??:??:?? 2 [Router] booting\r\n")
            .await;
        self.send(FromRadio {
            my_info: Some(MyNodeInfo { my_node_num: OWN }),
            ..Default::default()
        })
        .await;
        self.send(FromRadio {
            node_info: Some(NodeInfo {
                num: OWN,
                user: Some(User {
                    id: "!0a0b0c0d".into(),
                    long_name: "Tower 7".into(),
                    short_name: "T7".into(),
                }),
                position: Some(Position {
                    latitude_i: Some(328_800_000),
                    longitude_i: Some(-1_172_300_000),
                    altitude: Some(120),
                    time: 1_700_000_000,
                }),
            }),
            ..Default::default()
        })
        .await;
        self.send(FromRadio {
            node_info: Some(NodeInfo {
                num: PEER,
                user: Some(User {
                    id: "!11223344".into(),
                    long_name: "Ground Station".into(),
                    short_name: "GS".into(),
                }),
                position: None,
            }),
            ..Default::default()
        })
        .await;
        self.console("INFO  | ??:??:?? 2 [Router] config sent\r\n")
            .await;
        self.send(FromRadio {
            config_complete_id: Some(config_id),
            ..Default::default()
        })
        .await;
    }

    async fn routing_ack(&mut self, from: u32, request_id: u32) {
        self.send(FromRadio {
            packet: Some(MeshPacket {
                from,
                to: OWN,
                decoded: Some(Data {
                    portnum: PORT_ROUTING,
                    payload: Routing {
                        error_reason: Some(0),
                    }
                    .encode_to_vec(),
                    request_id,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await;
    }
}

fn link() -> (MeshtasticTransport, Firmware) {
    let (host, radio) = tokio::io::duplex(4096);
    let transport =
        MeshtasticTransport::from_stream(host).with_handshake_timeout(Duration::from_secs(5));
    let firmware = Firmware {
        frames: Framed::new(radio, RadioFrameCodec::new()),
    };
    (transport, firmware)
}

async fn recv_event(rx: &mut mpsc::Receiver<InboundEvent>) -> InboundEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for inbound event")
        .expect("sink closed")
}

#[tokio::test]
async fn handshake_learns_identity_and_neighbors() {
    setup();
    let (transport, mut firmware) = link();
    let transport = Arc::new(transport);
    let (tx, _rx) = mpsc::channel(16);
    transport.register_inbound(tx);

    let starter = tokio::spawn({
        let transport = transport.clone();
        async move { transport.start().await }
    });
    firmware.boot().await;
    starter.await.expect("join").expect("start");

    assert_eq!(transport.node_id(), Some(OWN));
    assert_eq!(transport.user_id().as_deref(), Some("!0a0b0c0d"));
    assert_eq!(transport.neighbors(), vec![PEER]);
    assert_eq!(transport.node_user_id(PEER).as_deref(), Some("!11223344"));
    assert_eq!(transport.node_user_id(OWN).as_deref(), Some("!0a0b0c0d"));
    assert_eq!(transport.node_user_id(0x5555_5555), None);
    let position = transport.position().expect("position");
    assert!((position.latitude - 32.88).abs() < 1e-6);
    assert!((position.longitude + 117.23).abs() < 1e-6);
    assert_eq!(position.altitude, 120.0);
}

#[tokio::test]
async fn sends_map_onto_radio_packets() {
    setup();
    let (transport, mut firmware) = link();
    let transport = Arc::new(transport);
    let (tx, _rx) = mpsc::channel(16);
    transport.register_inbound(tx);
    let starter = tokio::spawn({
        let transport = transport.clone();
        async move { transport.start().await }
    });
    firmware.boot().await;
    starter.await.expect("join").expect("start");

    transport
        .send(b"tracked", Some(PEER), Some(7))
        .await
        .expect("send");
    let packet = firmware.recv().await.packet.expect("packet");
    assert_eq!(packet.to, PEER);
    assert_eq!(packet.id, 7);
    assert!(packet.want_ack);
    assert_eq!(packet.priority, PRIORITY_RELIABLE);
    let data = packet.decoded.expect("decoded");
    assert_eq!(data.portnum, TOWER_PORT);
    assert_eq!(data.payload, b"tracked");

    transport
        .send(b"everyone", None, None)
        .await
        .expect("broadcast");
    let packet = firmware.recv().await.packet.expect("packet");
    assert_eq!(packet.to, BROADCAST_ADDR);
    assert_eq!(packet.id, 0);
    assert!(!packet.want_ack);

    let err = transport
        .send(&[0u8; 300], Some(PEER), None)
        .await
        .expect_err("too large");
    assert!(matches!(
        err,
        TransportError::PayloadTooLarge { len: 300, max: 233 }
    ));

    let err = transport
        .send(b"wide id", Some(PEER), Some(1 << 32))
        .await
        .expect_err("id range");
    assert!(matches!(
        err,
        TransportError::PacketIdOutOfRange(id) if id == 1 << 32
    ));
}

#[tokio::test]
async fn inbound_data_acks_and_link_loss_become_events() {
    setup();
    let (transport, mut firmware) = link();
    let transport = Arc::new(transport);
    let (tx, mut rx) = mpsc::channel(16);
    transport.register_inbound(tx);
    let starter = tokio::spawn({
        let transport = transport.clone();
        async move { transport.start().await }
    });
    firmware.boot().await;
    starter.await.expect("join").expect("start");

    firmware.routing_ack(PEER, 7).await;
    let ack = InboundEvent::Ack {
        from: PEER,
        packet_id: 7,
    };
    assert_eq!(recv_event(&mut rx).await, ack);

    firmware.console("WARN  | noise between packets\r\n").await;
    firmware
        .send(FromRadio {
            packet: Some(MeshPacket {
                from: PEER,
                to: OWN,
                decoded: Some(Data {
                    portnum: TOWER_PORT,
                    payload: b"hi".to_vec(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await;
    let data = InboundEvent::Data {
        from: PEER,
        payload: b"hi".to_vec(),
    };
    assert_eq!(recv_event(&mut rx).await, data);

    drop(firmware);
    let event = recv_event(&mut rx).await;
    assert!(matches!(event, InboundEvent::LinkError { .. }));
    let err = transport
        .send(b"gone", None, None)
        .await
        .expect_err("link closed");
    assert!(matches!(err, TransportError::LinkClosed));
}

#[tokio::test(start_paused = true)]
async fn silent_radio_fails_handshake() {
    setup();
    let (transport, mut firmware) = link();
    let starter = tokio::spawn(async move { transport.start().await });

    assert!(firmware.recv().await.want_config_id.is_some());
    let result = starter.await.expect("join");
    assert!(matches!(result, Err(TransportError::Handshake(_))));
    drop(firmware);
}

#[tokio::test]
async fn session_over_radio_resolves_ack_from_routing_reply() {
    setup();
    let (transport, mut firmware) = link();
    let (acked_tx, mut acked) = mpsc::unbounded_channel();
    let session = Arc::new(
        TowerSession::builder(NodeConfig::meshtastic("/dev/ttyUSB0"))
            .transport(Arc::new(transport))
            .on_ack_success(move |id| {
                let _ = acked_tx.send(id);
            })
            .build()
            .expect("build"),
    );

    let starter = tokio::spawn({
        let session = session.clone();
        async move { session.start().await }
    });
    firmware.boot().await;
    starter.await.expect("join").expect("start");
    assert_eq!(session.node_id(), Some(OWN));
    assert_eq!(session.node_user_id(PEER).as_deref(), Some("!11223344"));

    let ping = PingData {
        frequency: 173_043_000,
        amplitude: 3.5,
        latitude: 32.88,
        longitude: -117.23,
        altitude: 120.0,
    };
    let packet_id = session
        .send_ping(&ping, Some(PEER), true)
        .await
        .expect("send")
        .expect("id");

    let packet = firmware.recv().await.packet.expect("packet");
    assert_eq!(u64::from(packet.id), packet_id);
    let payload = packet.decoded.expect("decoded").payload;
    let envelope = tower_proto::decode(&payload).expect("envelope");
    assert_eq!(envelope.header.node_num(), OWN);
    assert_eq!(envelope.body, Body::Ping(ping));

    firmware.routing_ack(PEER, packet.id).await;
    let id = tokio::time::timeout(Duration::from_secs(5), acked.recv())
        .await
        .expect("ack callback");
    assert_eq!(id, Some(packet_id));
    assert_eq!(session.pending_acks(), 0);

    session.stop().await;
}
