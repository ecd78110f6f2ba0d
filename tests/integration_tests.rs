//! Integration tests for the world server
//!
//! These tests run a real server on a loopback port and talk to it over TCP
//! the way a game client does after being redirected by the login service.

use server::config::ServerConfig;
use server::entity::{DoorState, Entity};
use server::geometry::Point;
use server::handoff::{HandoffRegistry, Redirect};
use server::map::Map;
use server::network::{read_packet, write_packet, Server};
use server::world::World;
use shared::{Direction, EntityClass, Packet, DEPARTURE_DELAY_MS, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

struct TestServer {
    addr: SocketAddr,
    handoffs: Arc<RwLock<HandoffRegistry>>,
    world: World,
}

impl TestServer {
    async fn start(maps: Vec<Map>, max_clients: usize) -> Self {
        let config = ServerConfig {
            port: 0,
            spawn_map: 1,
            max_clients,
            ..ServerConfig::default()
        };

        let (world, _tasks) = World::spawn(maps, 64);
        let server = Server::new(config, world.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handoffs = server.handoffs();

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        TestServer {
            addr,
            handoffs,
            world,
        }
    }

    async fn issue(&self, name: &str) -> Redirect {
        self.handoffs.write().await.issue(name)
    }

    /// Connects and presents `redirect` as the join claim
    async fn connect_as(&self, redirect: &Redirect) -> TcpStream {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let join = Packet::Join {
            version: PROTOCOL_VERSION,
            connection_id: redirect.connection_id,
            seed: redirect.seed,
            key: redirect.key.clone(),
            name: redirect.name.clone(),
        };
        write_packet(&mut stream, &join).await.unwrap();
        stream
    }

    /// Issues a handoff for `name` and joins with it
    async fn join(&self, name: &str) -> TcpStream {
        let redirect = self.issue(name).await;
        let mut stream = self.connect_as(&redirect).await;
        expect(&mut stream, |p| matches!(p, Packet::Location { .. })).await;
        stream
    }
}

/// Reads packets until one matches, failing the test after a few seconds.
async fn expect<F>(stream: &mut TcpStream, wanted: F) -> Packet
where
    F: Fn(&Packet) -> bool,
{
    let result = timeout(WAIT, async {
        loop {
            let packet = read_packet(&mut *stream).await.unwrap();
            if wanted(&packet) {
                return packet;
            }
        }
    })
    .await;
    result.expect("expected packet never arrived")
}

fn mileth() -> Map {
    Map::new(1, "Mileth", 20, 20)
}

/// Reads until `name` appears and returns its entity id
async fn expect_appearance(stream: &mut TcpStream, name: &str) -> u32 {
    let packet = expect(stream, |p| {
        matches!(p, Packet::EntityAppeared { entity } if entity.name == name)
    })
    .await;
    match packet {
        Packet::EntityAppeared { entity } => {
            assert_eq!(entity.class, EntityClass::Player);
            entity.id
        }
        other => panic!("Wrong packet type: {:?}", other),
    }
}

/// CONNECTION AND HANDOFF TESTS
mod connection_tests {
    use super::*;

    /// Tests that a valid claim receives the map header and its location
    #[tokio::test]
    async fn join_receives_map_info_and_location() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let redirect = server.issue("Alpha").await;
        let mut stream = server.connect_as(&redirect).await;

        match timeout(WAIT, read_packet(&mut stream)).await.unwrap().unwrap() {
            Packet::MapInfo {
                map_id,
                width,
                height,
                name,
                ..
            } => {
                assert_eq!(map_id, 1);
                assert_eq!((width, height), (20, 20));
                assert_eq!(name, "Mileth");
            }
            other => panic!("Expected map info first, got {:?}", other),
        }
        match timeout(WAIT, read_packet(&mut stream)).await.unwrap().unwrap() {
            Packet::Location { x, y } => assert_eq!((x, y), (5, 5)),
            other => panic!("Expected location, got {:?}", other),
        }

        assert_eq!(server.handoffs.read().await.pending(), 0);
    }

    /// Tests that a claim with the wrong key is refused and stays redeemable
    #[tokio::test]
    async fn mismatched_handoff_is_refused() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let redirect = server.issue("Alpha").await;

        let mut forged = redirect.clone();
        forged.key[0] = redirect.key[0].wrapping_add(1);
        let mut stream = server.connect_as(&forged).await;

        let packet = expect(&mut stream, |p| matches!(p, Packet::Disconnected { .. })).await;
        assert!(matches!(packet, Packet::Disconnected { reason } if reason.contains("does not match")));
        assert_eq!(server.handoffs.read().await.pending(), 1);

        // The genuine client can still use it
        let mut genuine = server.connect_as(&redirect).await;
        expect(&mut genuine, |p| matches!(p, Packet::Location { .. })).await;
    }

    /// Tests that an unknown connection id is refused
    #[tokio::test]
    async fn unknown_handoff_is_refused() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let redirect = Redirect {
            connection_id: 4242,
            name: "Nobody".to_string(),
            key: b"abcdefghi".to_vec(),
            seed: 1,
        };
        let mut stream = server.connect_as(&redirect).await;

        let packet = expect(&mut stream, |p| matches!(p, Packet::Disconnected { .. })).await;
        assert!(matches!(packet, Packet::Disconnected { reason } if reason.contains("4242")));
    }

    /// Tests that a client speaking another protocol version is refused
    #[tokio::test]
    async fn protocol_version_mismatch_is_refused() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let redirect = server.issue("Alpha").await;

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let join = Packet::Join {
            version: PROTOCOL_VERSION + 1,
            connection_id: redirect.connection_id,
            seed: redirect.seed,
            key: redirect.key.clone(),
            name: redirect.name.clone(),
        };
        write_packet(&mut stream, &join).await.unwrap();

        let packet = expect(&mut stream, |p| matches!(p, Packet::Disconnected { .. })).await;
        assert!(matches!(packet, Packet::Disconnected { reason } if reason.contains("protocol version")));
    }

    /// Tests that a second session under the same name is turned away
    #[tokio::test]
    async fn duplicate_name_is_refused() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let _first = server.join("Alpha").await;

        let second = server.issue("Alpha").await;
        let mut stream = server.connect_as(&second).await;
        let packet = expect(&mut stream, |p| matches!(p, Packet::Disconnected { .. })).await;
        assert!(matches!(packet, Packet::Disconnected { reason } if reason.contains("already logged in")));
    }

    /// Tests that a join refused for its name does not spend the handoff
    #[tokio::test]
    async fn refused_join_keeps_handoff() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let first = server.join("Alpha").await;

        let second = server.issue("Alpha").await;
        let mut stream = server.connect_as(&second).await;
        expect(&mut stream, |p| matches!(p, Packet::Disconnected { .. })).await;
        assert_eq!(server.handoffs.read().await.pending(), 1);

        // Once the first session is gone the same claim goes through
        drop(first);
        let deadline = Instant::now() + WAIT;
        loop {
            let mut retry = server.connect_as(&second).await;
            let packet = expect(&mut retry, |p| {
                matches!(p, Packet::Location { .. } | Packet::Disconnected { .. })
            })
            .await;
            if matches!(packet, Packet::Location { .. }) {
                break;
            }
            assert!(Instant::now() < deadline, "name was never released");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.handoffs.read().await.pending(), 0);
    }

    /// Tests the connection limit
    #[tokio::test]
    async fn server_full_refuses_connections() {
        let server = TestServer::start(vec![mileth()], 1).await;
        let _first = server.join("Alpha").await;

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let packet = expect(&mut stream, |p| matches!(p, Packet::Disconnected { .. })).await;
        assert_eq!(
            packet,
            Packet::Disconnected {
                reason: "Server full".to_string()
            }
        );
    }
}

/// AREA OF INTEREST TESTS
mod visibility_tests {
    use super::*;

    /// Tests that two players on the same map see each other
    #[tokio::test]
    async fn players_see_each_other() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let mut alpha = server.join("Alpha").await;
        let mut bravo = server.join("Bravo").await;

        let bravo_id = expect_appearance(&mut alpha, "Bravo").await;
        let alpha_id = expect_appearance(&mut bravo, "Alpha").await;
        assert_ne!(alpha_id, bravo_id);
    }

    /// Tests that walking is reported to observers and confirmed to the walker
    #[tokio::test]
    async fn walking_is_broadcast() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let mut alpha = server.join("Alpha").await;
        let mut bravo = server.join("Bravo").await;
        let bravo_id = expect_appearance(&mut alpha, "Bravo").await;

        write_packet(
            &mut bravo,
            &Packet::Walk {
                direction: Direction::Right,
            },
        )
        .await
        .unwrap();

        let walked = expect(&mut alpha, |p| matches!(p, Packet::EntityWalked { .. })).await;
        assert_eq!(
            walked,
            Packet::EntityWalked {
                id: bravo_id,
                x: 6,
                y: 5,
                direction: Direction::Right
            }
        );
        expect(&mut bravo, |p| *p == Packet::Location { x: 6, y: 5 }).await;
    }

    /// Tests that a departure reaches observing players only after the delay
    #[tokio::test]
    async fn departure_is_delayed_for_players() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let mut alpha = server.join("Alpha").await;
        let mut bravo = server.join("Bravo").await;
        let bravo_id = expect_appearance(&mut alpha, "Bravo").await;

        let left_at = Instant::now();
        write_packet(&mut bravo, &Packet::Disconnect).await.unwrap();

        let departed = expect(&mut alpha, |p| matches!(p, Packet::EntityDeparted { .. })).await;
        assert_eq!(departed, Packet::EntityDeparted { id: bravo_id });
        assert!(left_at.elapsed() >= Duration::from_millis(DEPARTURE_DELAY_MS));
    }

    /// Tests that a dropped socket removes the player from the map
    #[tokio::test]
    async fn dropped_connection_leaves_map() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let mut alpha = server.join("Alpha").await;
        let bravo = server.join("Bravo").await;
        let bravo_id = expect_appearance(&mut alpha, "Bravo").await;

        drop(bravo);
        let departed = expect(&mut alpha, |p| matches!(p, Packet::EntityDeparted { .. })).await;
        assert_eq!(departed, Packet::EntityDeparted { id: bravo_id });

        let users = server
            .world
            .map(1)
            .unwrap()
            .inspect(|map| map.user_names())
            .await
            .unwrap();
        assert_eq!(users, vec!["Alpha".to_string()]);
    }

    /// Tests chat delivery within earshot
    #[tokio::test]
    async fn chat_reaches_nearby_players() {
        let server = TestServer::start(vec![mileth()], 16).await;
        let mut alpha = server.join("Alpha").await;
        let mut bravo = server.join("Bravo").await;
        expect_appearance(&mut bravo, "Alpha").await;

        write_packet(
            &mut alpha,
            &Packet::Say {
                text: "hello".to_string(),
                shout: false,
            },
        )
        .await
        .unwrap();

        let chat = expect(&mut bravo, |p| matches!(p, Packet::Chat { .. })).await;
        assert_eq!(
            chat,
            Packet::Chat {
                from: "Alpha".to_string(),
                text: "hello".to_string(),
                shout: false
            }
        );
    }
}

/// MAP INTERACTION TESTS
mod interaction_tests {
    use super::*;

    /// Tests that clicking a door opens it and clears its collision
    #[tokio::test]
    async fn clicking_door_opens_it() {
        let door_at = Point::new(6, 5);
        let mut map = mileth();
        map.set_wall(door_at, true);

        let server = TestServer::start(vec![map], 16).await;
        let handle = server.world.map(1).unwrap().clone();
        let door = Entity::door(DoorState {
            closed: true,
            left_right: false,
            update_collision: true,
        });
        handle.insert(door, door_at, false).await.unwrap();

        let mut alpha = server.join("Alpha").await;
        write_packet(&mut alpha, &Packet::Click { x: 6, y: 5 }).await.unwrap();

        let changed = expect(&mut alpha, |p| matches!(p, Packet::DoorChanged { .. })).await;
        assert_eq!(
            changed,
            Packet::DoorChanged {
                x: 6,
                y: 5,
                closed: false,
                left_right: false
            }
        );

        let wall = handle.inspect(move |map| map.is_wall(door_at)).await.unwrap();
        assert!(!wall);
    }

    /// Tests that stepping onto a warp moves the player to another map
    #[tokio::test]
    async fn warp_moves_player_to_other_map() {
        let mut first = mileth();
        first.add_warp(server::map::Warp {
            source: Point::new(6, 5),
            target_map: 2,
            target: Point::new(3, 3),
            min_level: 0,
            max_level: u8::MAX,
            min_ability: 0,
            mobs_can_use: false,
        });
        let second = Map::new(2, "Abel", 10, 10);

        let server = TestServer::start(vec![first, second], 16).await;
        let mut alpha = server.join("Alpha").await;

        write_packet(
            &mut alpha,
            &Packet::Walk {
                direction: Direction::Right,
            },
        )
        .await
        .unwrap();

        let info = expect(&mut alpha, |p| matches!(p, Packet::MapInfo { .. })).await;
        assert!(matches!(info, Packet::MapInfo { map_id: 2, .. }));
        expect(&mut alpha, |p| *p == Packet::Location { x: 3, y: 3 }).await;
    }
}
