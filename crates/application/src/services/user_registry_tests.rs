use std::sync::Arc;
use std::time::Duration;

use domain::{ConnectionId, ErrorCode};

use crate::cache::LayeredCache;
use crate::clock::SystemClock;
use crate::local_bus::LocalBus;
use crate::memory::MemoryStorage;
use crate::repository::{MemberRepository as _, RoomRepository as _, UserRepository as _};
use crate::presence::MemoryPresenceStore;
use crate::services::room_registry::{RoomRegistry, RoomRegistryDependencies};
use crate::services::user_registry::{UserRegistry, UserRegistryDependencies};
use crate::typing::TypingTracker;

struct Fixture {
    storage: MemoryStorage,
    rooms: Arc<RoomRegistry>,
    users: Arc<UserRegistry>,
}

fn fixture() -> Fixture {
    let storage = MemoryStorage::new();
    let cache = Arc::new(LayeredCache::in_process(Duration::from_secs(60)));
    let clock = Arc::new(SystemClock);

    let rooms = Arc::new(RoomRegistry::new(RoomRegistryDependencies {
        rooms: storage.rooms.clone(),
        members: storage.members.clone(),
        users: storage.users.clone(),
        presence: Arc::new(MemoryPresenceStore::new()),
        cache: cache.clone(),
        bus: Arc::new(LocalBus::new()),
        clock: clock.clone(),
        typing: Arc::new(TypingTracker::new()),
    }));
    let users = Arc::new(UserRegistry::new(UserRegistryDependencies {
        users: storage.users.clone(),
        rooms: rooms.clone(),
        cache,
        clock,
    }));

    Fixture {
        storage,
        rooms,
        users,
    }
}

#[tokio::test]
async fn first_authentication_creates_an_online_user() {
    let f = fixture();
    let outcome = f
        .users
        .authenticate("alice", ConnectionId::random())
        .await
        .unwrap();

    assert!(outcome.is_new);
    assert!(outcome.user.is_online);
    assert_eq!(outcome.user.username.as_str(), "alice");

    let online = f.users.online_users().await.unwrap();
    assert_eq!(online.len(), 1);
}

#[tokio::test]
async fn same_username_online_is_treated_as_reconnection() {
    let f = fixture();
    let first = f
        .users
        .authenticate("alice", ConnectionId::random())
        .await
        .unwrap();
    let second = f
        .users
        .authenticate("alice", ConnectionId::random())
        .await
        .unwrap();

    // 并发同名认证是重连/多设备，不是 USER_EXISTS
    assert!(!second.is_new);
    assert_eq!(second.user.id, first.user.id);
    assert_eq!(second.user.connection_count, 2);
}

#[tokio::test]
async fn invalid_username_maps_to_invalid_message() {
    let f = fixture();
    let err = f
        .users
        .authenticate("no spaces allowed", ConnectionId::random())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidMessage);
}

#[tokio::test]
async fn last_disconnect_goes_offline_and_leaves_rooms() {
    let f = fixture();
    let connection = ConnectionId::random();
    let outcome = f.users.authenticate("alice", connection).await.unwrap();
    let alice = outcome.user;

    let room = f.rooms.create("lobby", &alice).await.unwrap();
    f.rooms.join("lobby", &alice).await.unwrap();

    let summary = f
        .users
        .disconnect(connection)
        .await
        .unwrap()
        .expect("known connection");
    assert!(summary.went_offline);
    assert_eq!(summary.rooms_left.len(), 1);
    assert_eq!(summary.rooms_left[0].as_str(), "lobby");

    let stored = f.storage.users.find_by_id(alice.id).await.unwrap().unwrap();
    assert!(!stored.is_online);
    assert!(stored.current_room.is_none());

    // 最后一个成员断连后房间停用
    let room = f.storage.rooms.find_by_id(room.id).await.unwrap().unwrap();
    assert!(!room.is_active);
    assert_eq!(room.current_users, 0);
}

#[tokio::test]
async fn disconnecting_one_of_two_devices_stays_online() {
    let f = fixture();
    let first = ConnectionId::random();
    let second = ConnectionId::random();
    f.users.authenticate("alice", first).await.unwrap();
    f.users.authenticate("alice", second).await.unwrap();

    let summary = f
        .users
        .disconnect(first)
        .await
        .unwrap()
        .expect("known connection");
    assert!(!summary.went_offline);
    assert!(summary.rooms_left.is_empty());

    let online = f.users.online_users().await.unwrap();
    assert_eq!(online.len(), 1);
}

#[tokio::test]
async fn unknown_connection_disconnect_is_a_noop() {
    let f = fixture();
    let summary = f.users.disconnect(ConnectionId::random()).await.unwrap();
    assert!(summary.is_none());
}

#[tokio::test]
async fn offline_username_gets_a_fresh_user_id() {
    let f = fixture();
    let connection = ConnectionId::random();
    let first = f.users.authenticate("alice", connection).await.unwrap();
    f.users.disconnect(connection).await.unwrap();

    let second = f
        .users
        .authenticate("alice", ConnectionId::random())
        .await
        .unwrap();
    assert!(second.is_new);
    assert_ne!(second.user.id, first.user.id);
}
