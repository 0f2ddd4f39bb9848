use std::sync::Arc;
use std::time::Duration;

use domain::{ConnectionId, DomainError, ErrorCode, User};

use crate::bus::{channels, Bus, BusEvent};
use crate::cache::LayeredCache;
use crate::clock::SystemClock;
use crate::error::ApplicationError;
use crate::local_bus::LocalBus;
use crate::memory::MemoryStorage;
use crate::repository::{MemberRepository as _, RoomRepository as _, UserRepository as _};
use crate::presence::MemoryPresenceStore;
use crate::services::room_registry::{RoomRegistry, RoomRegistryDependencies};
use crate::services::user_registry::{UserRegistry, UserRegistryDependencies};
use crate::typing::TypingTracker;

struct Fixture {
    storage: MemoryStorage,
    bus: Arc<LocalBus>,
    rooms: Arc<RoomRegistry>,
    users: Arc<UserRegistry>,
}

fn fixture() -> Fixture {
    let storage = MemoryStorage::new();
    let bus = Arc::new(LocalBus::new());
    let cache = Arc::new(LayeredCache::in_process(Duration::from_secs(60)));
    let clock = Arc::new(SystemClock);
    let typing = Arc::new(TypingTracker::new());

    let rooms = Arc::new(RoomRegistry::new(RoomRegistryDependencies {
        rooms: storage.rooms.clone(),
        members: storage.members.clone(),
        users: storage.users.clone(),
        presence: Arc::new(MemoryPresenceStore::new()),
        cache: cache.clone(),
        bus: bus.clone(),
        clock: clock.clone(),
        typing,
    }));
    let users = Arc::new(UserRegistry::new(UserRegistryDependencies {
        users: storage.users.clone(),
        rooms: rooms.clone(),
        cache,
        clock,
    }));

    Fixture {
        storage,
        bus,
        rooms,
        users,
    }
}

async fn online_user(fixture: &Fixture, name: &str) -> User {
    fixture
        .users
        .authenticate(name, ConnectionId::random())
        .await
        .expect("authenticate")
        .user
}

#[tokio::test]
async fn duplicate_room_name_is_a_conflict() {
    let f = fixture();
    let alice = online_user(&f, "alice").await;
    let carol = online_user(&f, "carol").await;

    f.rooms.create("lobby", &alice).await.expect("first create");
    let err = f.rooms.create("lobby", &carol).await.unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::RoomExists { .. })
    ));
    assert_eq!(err.code(), ErrorCode::RoomExists);
}

#[tokio::test]
async fn join_tracks_counts_memberships_and_current_room() {
    let f = fixture();
    let alice = online_user(&f, "alice").await;
    let bob = online_user(&f, "bob").await;

    let room = f.rooms.create("lobby", &alice).await.unwrap();
    let first = f.rooms.join("lobby", &alice).await.unwrap();
    assert_eq!(first.member_count, 1);

    let second = f.rooms.join("lobby", &bob).await.unwrap();
    assert_eq!(second.member_count, 2);
    assert_eq!(second.members, vec!["alice".to_owned(), "bob".to_owned()]);

    // 房间计数与活跃成员关系一致
    let members = f.storage.members.active_members(room.id).await.unwrap();
    assert_eq!(members.len() as u32, second.member_count);

    let stored = f.storage.users.find_by_id(bob.id).await.unwrap().unwrap();
    assert_eq!(
        stored.current_room.as_ref().map(|r| r.as_str()),
        Some("lobby")
    );
}

#[tokio::test]
async fn emptied_room_deactivates_and_join_reports_not_found() {
    let f = fixture();
    let alice = online_user(&f, "alice").await;
    let bob = online_user(&f, "bob").await;
    let grace = online_user(&f, "grace").await;

    let room = f.rooms.create("doomed", &alice).await.unwrap();
    f.rooms.join("doomed", &alice).await.unwrap();
    f.rooms.join("doomed", &bob).await.unwrap();

    f.rooms.leave(room.id, &alice).await.unwrap();
    let outcome = f.rooms.leave(room.id, &bob).await.unwrap();
    assert_eq!(outcome.member_count, 0);

    let stored = f.storage.rooms.find_by_id(room.id).await.unwrap().unwrap();
    assert!(!stored.is_active);

    let err = f.rooms.join("doomed", &grace).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::RoomNotFound);
}

#[tokio::test]
async fn recreating_an_emptied_room_reactivates_it() {
    let f = fixture();
    let alice = online_user(&f, "alice").await;

    let room = f.rooms.create("revive", &alice).await.unwrap();
    f.rooms.join("revive", &alice).await.unwrap();
    f.rooms.leave(room.id, &alice).await.unwrap();

    let revived = f.rooms.create("revive", &alice).await.unwrap();
    assert!(revived.is_active);
    assert!(f.rooms.join("revive", &alice).await.is_ok());
}

#[tokio::test]
async fn rejoin_increments_join_count_once_per_cycle() {
    let f = fixture();
    let alice = online_user(&f, "alice").await;

    let room = f.rooms.create("cycle", &alice).await.unwrap();
    f.rooms.join("cycle", &alice).await.unwrap();
    f.rooms.leave(room.id, &alice).await.unwrap();
    f.rooms.create("cycle", &alice).await.unwrap();
    f.rooms.join("cycle", &alice).await.unwrap();

    let members = f.storage.members.active_members(room.id).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].join_count, 2);
    // 同一用户只计一次 unique user
    let stored = f.storage.rooms.find_by_id(room.id).await.unwrap().unwrap();
    assert_eq!(stored.total_unique_users, 1);
}

#[tokio::test]
async fn join_event_excludes_the_joiner() {
    let f = fixture();
    let alice = online_user(&f, "alice").await;
    let bob = online_user(&f, "bob").await;

    let room = f.rooms.create("lobby", &alice).await.unwrap();
    f.rooms.join("lobby", &alice).await.unwrap();

    let mut events = f
        .bus
        .subscribe(&channels::room_events(room.id))
        .await
        .unwrap();
    f.rooms.join("lobby", &bob).await.unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    match envelope.event {
        BusEvent::UserJoined {
            username,
            member_count,
            ..
        } => {
            assert_eq!(username, "bob");
            assert_eq!(member_count, 2);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(envelope.exclude_user, Some(bob.id));
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_expires_within_ttl() {
    let f = fixture();
    let frank = online_user(&f, "frank").await;

    let room = f.rooms.create("quiet", &frank).await.unwrap();
    f.rooms.join("quiet", &frank).await.unwrap();

    let mut events = f
        .bus
        .subscribe(&channels::room_events(room.id))
        .await
        .unwrap();

    f.rooms.typing(room.id, &frank, true).await;

    let envelope = events.recv().await.expect("typing update");
    match envelope.event {
        BusEvent::TypingUpdate { typing_users, .. } => {
            assert_eq!(typing_users, vec!["frank".to_owned()]);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // 没有后续帧：TTL 内必须观察到空集合
    let envelope = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("expiry update in time")
        .expect("event");
    match envelope.event {
        BusEvent::TypingUpdate { typing_users, .. } => assert!(typing_users.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn typing_stop_without_start_is_silent() {
    let f = fixture();
    let frank = online_user(&f, "frank").await;
    let room = f.rooms.create("quiet", &frank).await.unwrap();

    let mut events = f
        .bus
        .subscribe(&channels::room_events(room.id))
        .await
        .unwrap();
    f.rooms.typing(room.id, &frank, false).await;

    let outcome = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
    assert!(outcome.is_err(), "no update should be published");
}
