//! Server network layer: TCP accept loop and per-connection tasks
//!
//! Every connection runs two tasks. The reader decodes frames and turns them
//! into commands on the map the player is currently on; it never holds a
//! map while waiting on the socket. The writer drains the player's outbox
//! onto the socket, so a slow client only ever backs up its own queue.

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::entity::{Entity, EntityId, Outbox, Session};
use crate::geometry::Point;
use crate::handoff::HandoffRegistry;
use crate::map_actor::{MapHandle, WalkOutcome};
use crate::world::World;
use log::{debug, error, info, warn};
use shared::{decode_payload, encode_frame, frame_len, Packet, FRAME_HEADER_LEN, MAX_FRAME_LEN, PROTOCOL_VERSION};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, RwLock};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection closed")]
    Closed,

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

/// Reads one length-prefixed frame. A clean end of stream before the header
/// is reported as [`NetworkError::Closed`].
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, NetworkError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(NetworkError::Closed),
        Err(e) => return Err(e.into()),
    }

    let len = frame_len(header);
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(decode_payload(&payload)?)
}

pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), NetworkError> {
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// State shared by every connection task
struct Shared {
    config: ServerConfig,
    world: World,
    clients: Arc<RwLock<ClientManager>>,
    handoffs: Arc<RwLock<HandoffRegistry>>,
}

/// TCP front end of the world server
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    pub async fn new(config: ServerConfig, world: World) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(config.address()).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let clients = Arc::new(RwLock::new(ClientManager::new(config.max_clients)));
        Ok(Server {
            listener,
            shared: Arc::new(Shared {
                config,
                world,
                clients,
                handoffs: Arc::new(RwLock::new(HandoffRegistry::new())),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registry the login side fills with expected connections
    pub fn handoffs(&self) -> Arc<RwLock<HandoffRegistry>> {
        Arc::clone(&self.shared.handoffs)
    }

    pub fn clients(&self) -> Arc<RwLock<ClientManager>> {
        Arc::clone(&self.shared.clients)
    }

    /// Spawns task that kicks clients that went quiet
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.shared.clients);
        let timeout = self.shared.config.idle_timeout();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let clients_guard = clients.read().await;
                    clients_guard.check_timeouts(timeout)
                };

                if timed_out.is_empty() {
                    continue;
                }
                let mut clients_guard = clients.write().await;
                for client_id in timed_out {
                    clients_guard.kick(client_id, "Idle timeout");
                }
            }
        });
    }

    /// Accepts connections until the listener fails for good
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_timeout_checker();
        info!("Server started successfully");

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not disable Nagle for {}: {}", addr, e);
                    }
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        handle_connection(stream, addr, shared).await;
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

/// A joined player as seen by its connection task
struct Player {
    client_id: u32,
    entity: EntityId,
    location: watch::Receiver<Option<u16>>,
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) {
    let (mut reader, mut writer) = stream.into_split();

    let registered = {
        let mut clients = shared.clients.write().await;
        clients.add_client(addr)
    };
    let Some((client_id, mut kicked)) = registered else {
        warn!("Refusing {}: server full", addr);
        refuse(&mut writer, "Server full").await;
        return;
    };

    let (outbox, outbox_rx) = Outbox::channel(client_id, shared.config.outbound_queue);

    let first = tokio::select! {
        packet = read_packet(&mut reader) => packet,
        reason = &mut kicked => {
            refuse(&mut writer, &reason.unwrap_or_default()).await;
            shared.clients.write().await.remove_client(&client_id);
            return;
        }
    };

    let player = match first {
        Ok(packet) => join(packet, client_id, outbox.clone(), &shared).await,
        Err(e) => Err(format!("Expected join: {}", e)),
    };
    let player = match player {
        Ok(player) => player,
        Err(reason) => {
            info!("Client {} from {} refused: {}", client_id, addr, reason);
            refuse(&mut writer, &reason).await;
            shared.clients.write().await.remove_client(&client_id);
            return;
        }
    };

    let writer_task = tokio::spawn(drain_outbox(writer, outbox_rx, client_id));

    let reason = serve(&mut reader, &mut kicked, &player, &outbox, &shared).await;
    info!("Client {} leaving: {}", client_id, reason);
    if let Some(reason) = reason.strip_prefix("kick: ") {
        outbox.deliver(Packet::Disconnected {
            reason: reason.to_string(),
        });
    }

    if let Some(map) = current_map(&player, &shared.world) {
        match map.remove(player.entity).await {
            Ok(Some(entity)) => debug!("{} removed from map {}", entity.name, map.map_id()),
            Ok(None) => {}
            Err(e) => warn!("Could not remove client {} from its map: {}", client_id, e),
        }
    }
    shared.clients.write().await.remove_client(&player.client_id);

    // The writer ends once every outbox sender is gone
    drop(outbox);
    if let Err(e) = writer_task.await {
        error!("Writer task for client {} failed: {}", client_id, e);
    }
}

/// Validates a join claim and places the player on the spawn map.
async fn join(
    packet: Packet,
    client_id: u32,
    outbox: Outbox,
    shared: &Shared,
) -> Result<Player, String> {
    let kind = packet.kind();
    let Packet::Join {
        version,
        connection_id,
        seed,
        key,
        name,
    } = packet
    else {
        return Err(format!("Expected join, got {}", kind));
    };

    if version != PROTOCOL_VERSION {
        return Err(format!(
            "Unsupported protocol version {} (server speaks {})",
            version, PROTOCOL_VERSION
        ));
    }

    shared
        .handoffs
        .read()
        .await
        .verify(connection_id, &name, &key, seed)
        .map_err(|e| e.to_string())?;

    let (session, location) = Session::new(client_id, outbox);
    let entity = Entity::player(name.clone(), session);
    let entity_id = entity.id;

    shared
        .clients
        .write()
        .await
        .join(client_id, &name, entity_id)
        .map_err(|e| e.to_string())?;

    let spawn_map = shared.config.spawn_map;
    let Some(map) = shared.world.map(spawn_map) else {
        return Err(format!("Spawn map {} is not loaded", spawn_map));
    };
    map.insert(entity, shared.config.spawn_point(), true)
        .await
        .map_err(|e| e.to_string())?;

    // The token is spent only once the player is actually in the world
    let redeemed = shared
        .handoffs
        .write()
        .await
        .redeem(connection_id, &name, &key, seed);
    if let Err(e) = redeemed {
        if let Err(removal) = map.remove(entity_id).await {
            warn!("Could not withdraw {} from map {}: {}", name, spawn_map, removal);
        }
        return Err(e.to_string());
    }

    Ok(Player {
        client_id,
        entity: entity_id,
        location,
    })
}

fn current_map<'w>(player: &Player, world: &'w World) -> Option<&'w MapHandle> {
    let map_id = (*player.location.borrow())?;
    world.map(map_id)
}

/// Runs the joined session until the client leaves. Returns why it ended.
async fn serve<R: AsyncRead + Unpin>(
    reader: &mut R,
    kicked: &mut oneshot::Receiver<String>,
    player: &Player,
    outbox: &Outbox,
    shared: &Shared,
) -> String {
    loop {
        let packet = tokio::select! {
            packet = read_packet(reader) => packet,
            reason = &mut *kicked => return format!("kick: {}", reason.unwrap_or_default()),
        };

        let packet = match packet {
            Ok(packet) => packet,
            Err(NetworkError::Closed) => return "connection closed".to_string(),
            Err(e) => return e.to_string(),
        };

        shared.clients.write().await.touch(player.client_id);

        if matches!(packet, Packet::Disconnect) {
            return "disconnect requested".to_string();
        }

        let Some(map) = current_map(player, &shared.world) else {
            warn!("Client {} is not on any map", player.client_id);
            continue;
        };
        handle_packet(packet, player, map, outbox, shared).await;
    }
}

/// Turns one client frame into a command on the player's current map
async fn handle_packet(
    packet: Packet,
    player: &Player,
    map: &MapHandle,
    outbox: &Outbox,
    shared: &Shared,
) {
    let id = player.entity;
    let result = match packet {
        Packet::Walk { direction } => match map.walk(id, direction).await {
            Ok(WalkOutcome::Warped { entity, warp }) => {
                shared.world.transfer(*entity, warp, map).await.map(|_| ())
            }
            Ok(WalkOutcome::Moved) => Ok(()),
            Err(e) => Err(e),
        },
        Packet::Click { x, y } => map.click(id, Point::new(x, y)).await,
        Packet::Say { text, shout } => map.say(id, text, shout).await,
        Packet::RequestExchange { target } => map.request_exchange(id, EntityId(target)).await,
        other => {
            warn!(
                "Unexpected {} packet from client {}",
                other.kind(),
                player.client_id
            );
            outbox.deliver(Packet::Disconnected {
                reason: format!("Unexpected {} packet", other.kind()),
            });
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("Request from client {} failed: {}", player.client_id, e);
    }
}

async fn drain_outbox(mut writer: OwnedWriteHalf, mut outbox: mpsc::Receiver<Packet>, client_id: u32) {
    while let Some(packet) = outbox.recv().await {
        if let Err(e) = write_packet(&mut writer, &packet).await {
            debug!("Writing to client {} failed: {}", client_id, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn refuse(writer: &mut OwnedWriteHalf, reason: &str) {
    let packet = Packet::Disconnected {
        reason: reason.to_string(),
    };
    if let Err(e) = write_packet(writer, &packet).await {
        debug!("Could not send refusal: {}", e);
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Direction;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_packet_round_trip_over_stream() {
        let (mut client, mut server) = duplex(1024);

        write_packet(&mut client, &Packet::Walk { direction: Direction::Left })
            .await
            .unwrap();
        write_packet(&mut client, &Packet::Disconnect).await.unwrap();

        assert_eq!(
            read_packet(&mut server).await.unwrap(),
            Packet::Walk {
                direction: Direction::Left
            }
        );
        assert_eq!(read_packet(&mut server).await.unwrap(), Packet::Disconnect);
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (client, mut server) = duplex(64);
        drop(client);
        assert!(matches!(
            read_packet(&mut server).await,
            Err(NetworkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        client.write_all(&len).await.unwrap();

        assert!(matches!(
            read_packet(&mut server).await,
            Err(NetworkError::FrameTooLarge(n)) if n == MAX_FRAME_LEN + 1
        ));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_a_codec_error() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&4u32.to_le_bytes()).await.unwrap();
        client.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();

        assert!(matches!(
            read_packet(&mut server).await,
            Err(NetworkError::Codec(_))
        ));
    }
}
