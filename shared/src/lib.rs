use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
/// Side length, in tiles, of the square area an entity can see.
pub const VIEWPORT_SIZE: i32 = 24;
pub const DEPARTURE_DELAY_MS: u64 = 250;
pub const MAX_FRAME_LEN: usize = 64 * 1024;
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Join {
        version: u32,
        connection_id: u32,
        seed: u8,
        key: Vec<u8>,
        name: String,
    },
    Walk {
        direction: Direction,
    },
    Click {
        x: u8,
        y: u8,
    },
    Say {
        text: String,
        shout: bool,
    },
    RequestExchange {
        target: u32,
    },
    Disconnect,

    MapInfo {
        map_id: u16,
        width: u8,
        height: u8,
        checksum: u16,
        name: String,
        music: u8,
    },
    Location {
        x: u8,
        y: u8,
    },
    EntityAppeared {
        entity: EntityView,
    },
    EntityDeparted {
        id: u32,
    },
    EntityWalked {
        id: u32,
        x: u8,
        y: u8,
        direction: Direction,
    },
    DoorChanged {
        x: u8,
        y: u8,
        closed: bool,
        left_right: bool,
    },
    Chat {
        from: String,
        text: String,
        shout: bool,
    },
    SignpostMessage {
        text: String,
    },
    ExchangeStarted {
        partner: u32,
    },
    ExchangeCancelled,
    Disconnected {
        reason: String,
    },
}

/// What a client is told about an entity entering its viewport.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EntityView {
    pub id: u32,
    pub name: String,
    pub class: EntityClass,
    pub x: u8,
    pub y: u8,
    pub sprite: u16,
    pub direction: Direction,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    Player,
    Merchant,
    Reactor,
    Signpost,
    Gold,
    Item,
    Door,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    Up,
    Right,
    #[default]
    Down,
    Left,
}

impl Direction {
    /// Tile delta for one step in this direction. Y grows downwards.
    pub fn offset(self) -> (i16, i16) {
        match self {
            Direction::Up => (0, -1),
            Direction::Right => (1, 0),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
        }
    }
}

impl Packet {
    /// Short label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Join { .. } => "join",
            Packet::Walk { .. } => "walk",
            Packet::Click { .. } => "click",
            Packet::Say { .. } => "say",
            Packet::RequestExchange { .. } => "request-exchange",
            Packet::Disconnect => "disconnect",
            Packet::MapInfo { .. } => "map-info",
            Packet::Location { .. } => "location",
            Packet::EntityAppeared { .. } => "entity-appeared",
            Packet::EntityDeparted { .. } => "entity-departed",
            Packet::EntityWalked { .. } => "entity-walked",
            Packet::DoorChanged { .. } => "door-changed",
            Packet::Chat { .. } => "chat",
            Packet::SignpostMessage { .. } => "signpost",
            Packet::ExchangeStarted { .. } => "exchange-started",
            Packet::ExchangeCancelled => "exchange-cancelled",
            Packet::Disconnected { .. } => "disconnected",
        }
    }
}

/// Serializes a packet into a frame: little-endian `u32` payload length, then
/// the bincode payload.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    let payload = bincode::serialize(packet)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Box::new(bincode::ErrorKind::SizeLimit));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn frame_len(header: [u8; FRAME_HEADER_LEN]) -> usize {
    u32::from_le_bytes(header) as usize
}

pub fn decode_payload(payload: &[u8]) -> Result<Packet, bincode::Error> {
    bincode::deserialize(payload)
}
