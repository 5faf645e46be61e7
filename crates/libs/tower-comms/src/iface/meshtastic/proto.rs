//! Subset of the Meshtastic client API protobufs.
//!
//! Only the fields the tower link reads or writes are declared; prost skips
//! the rest. `oneof` groups are declared as optional fields, which share the
//! wire encoding.

/// `PortNum.ROUTING_APP`
pub const PORT_ROUTING: i32 = 5;

/// `MeshPacket.Priority.RELIABLE`
pub const PRIORITY_RELIABLE: i32 = 70;

/// `Routing.Error.NONE`
pub const ROUTING_ERROR_NONE: i32 = 0;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToRadio {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(uint32, optional, tag = "3")]
    pub want_config_id: Option<u32>,
    #[prost(bool, optional, tag = "4")]
    pub disconnect: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(message, optional, tag = "2")]
    pub packet: Option<MeshPacket>,
    #[prost(message, optional, tag = "3")]
    pub my_info: Option<MyNodeInfo>,
    #[prost(message, optional, tag = "4")]
    pub node_info: Option<NodeInfo>,
    #[prost(uint32, optional, tag = "7")]
    pub config_complete_id: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(message, optional, tag = "4")]
    pub decoded: Option<Data>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "11")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(int32, tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Routing {
    #[prost(int32, optional, tag = "3")]
    pub error_reason: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
    #[prost(message, optional, tag = "3")]
    pub position: Option<Position>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
}

/// Coordinates are degrees scaled by 1e7.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
}
