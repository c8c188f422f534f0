use bytes::Bytes;
use statecraft::{
    start_engine, ChannelTransport, CommandConsistency, Commit, Engine, EngineConfig, Member, MemberId, MemberKind,
    QueryConsistency, RequestError, RoleKind, ServerOptions, SessionId, StateMachine, StorageConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

/// A small replicated KV store speaking a text protocol:
///
///   SET <key> <value>          -> previous value
///   DEL <key>                  -> removed value (tombstone command)
///   NOTIFY <session> <message> -> publishes <message> to <session>
///   GET <key>                  -> current value (query)
///
/// Overwritten and deleted entries are marked clean so compaction can reclaim
/// them.
struct KvMachine {
    applies: Arc<AtomicU64>,
    values: HashMap<String, String>,
    value_indices: HashMap<String, u64>,
}

impl KvMachine {
    fn new(applies: Arc<AtomicU64>) -> Self {
        KvMachine {
            applies,
            values: HashMap::new(),
            value_indices: HashMap::new(),
        }
    }
}

impl StateMachine for KvMachine {
    fn apply(&mut self, commit: &mut Commit) -> Result<Bytes, String> {
        self.applies.fetch_add(1, Ordering::SeqCst);

        let text = String::from_utf8_lossy(commit.payload).into_owned();
        let mut parts = text.splitn(3, ' ');
        let index = commit.index;
        match (parts.next(), parts.next(), parts.next()) {
            (Some("SET"), Some(key), Some(value)) => {
                let previous = self.values.insert(key.to_string(), value.to_string());
                if let Some(previous_index) = self.value_indices.insert(key.to_string(), index.val()) {
                    commit.clean(statecraft::Index::new(previous_index));
                }
                Ok(Bytes::from(previous.unwrap_or_default()))
            }
            (Some("DEL"), Some(key), _) => {
                let previous = self.values.remove(key);
                if let Some(previous_index) = self.value_indices.remove(key) {
                    commit.clean(statecraft::Index::new(previous_index));
                    // The tombstone itself holds no state either; the log
                    // still retains it until it is replicated everywhere.
                    commit.clean(index);
                }
                Ok(Bytes::from(previous.unwrap_or_default()))
            }
            (Some("NOTIFY"), Some(session), Some(message)) => {
                let target: u64 = session.parse().map_err(|_| "bad session id".to_string())?;
                commit.publish(SessionId::new(target), Bytes::from(message.to_string()));
                Ok(Bytes::new())
            }
            _ => Err(format!("unknown command: {}", text)),
        }
    }

    fn query(&self, _session: SessionId, payload: &Bytes) -> Result<Bytes, String> {
        let text = String::from_utf8_lossy(payload).into_owned();
        let mut parts = text.splitn(2, ' ');
        match (parts.next(), parts.next()) {
            (Some("GET"), Some(key)) => Ok(Bytes::from(self.values.get(key).cloned().unwrap_or_default())),
            _ => Err(format!("unknown query: {}", text)),
        }
    }
}

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn test_options() -> ServerOptions {
    ServerOptions {
        heartbeat_interval: Some(Duration::from_millis(50)),
        election_timeout_min: Some(Duration::from_millis(150)),
        election_timeout_max: Some(Duration::from_millis(400)),
        session_check_interval: Some(Duration::from_millis(100)),
        // Quiet in tests: member heartbeats and compaction would otherwise
        // interleave entries at unpredictable indices.
        member_heartbeat_interval: Some(Duration::from_secs(3600)),
        compaction_interval: Some(Duration::from_secs(3600)),
        ..ServerOptions::default()
    }
}

fn active_member(id: u32) -> Member {
    Member::new(
        MemberId::new(id),
        MemberKind::Active,
        format!("server-{}", id),
        format!("client-{}", id),
    )
}

struct Cluster {
    engines: Vec<Engine>,
    applies: Vec<Arc<AtomicU64>>,
    transport: ChannelTransport,
    members: Vec<Member>,
}

fn start_cluster(size: u32) -> Cluster {
    let transport = ChannelTransport::new();
    let members: Vec<Member> = (1..=size).map(active_member).collect();

    let mut engines = Vec::new();
    let mut applies = Vec::new();
    for id in 1..=size {
        let counter = Arc::new(AtomicU64::new(0));
        let engine = start_engine(
            EngineConfig {
                my_id: MemberId::new(id),
                members: members.clone(),
                storage: StorageConfig::in_memory(),
                options: test_options(),
                logger: test_logger(),
                transport: transport.clone(),
            },
            KvMachine::new(counter.clone()),
        )
        .expect("engine must start");
        engines.push(engine);
        applies.push(counter);
    }

    Cluster {
        engines,
        applies,
        transport,
        members,
    }
}

async fn wait_for_leader(cluster: &Cluster) -> usize {
    for _ in 0..300 {
        if let Some(index) = cluster.engines.iter().position(|e| e.role() == RoleKind::Leader) {
            return index;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("no leader elected within the test budget");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn elects_leader_and_assigns_register_index_as_session_id() {
    let cluster = start_cluster(3);
    let leader = &cluster.engines[wait_for_leader(&cluster).await];

    // The new leader's log: no-op at 1, configuration at 2, so the first
    // session lands at 3.
    let session = leader
        .register_session("client-x", 5000)
        .await
        .expect("registration against the leader succeeds");
    assert_eq!(session.session_id(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn register_against_follower_redirects() {
    let cluster = start_cluster(3);
    let leader_index = wait_for_leader(&cluster).await;
    let follower_index = (leader_index + 1) % 3;

    let result = cluster.engines[follower_index].register_session("client-x", 5000).await;
    match result {
        Err(RequestError::NoLeader { leader_hint }) => {
            // The follower should know who leads by now.
            if let Some(hint) = leader_hint {
                assert_eq!(hint.id, cluster.engines[leader_index].member_id());
            }
        }
        other => panic!("expected NoLeader redirect, got {:?}", other.map(|s| s.session_id())),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_commands_are_served_from_the_response_cache() {
    let cluster = start_cluster(3);
    let leader_index = wait_for_leader(&cluster).await;
    let leader = &cluster.engines[leader_index];

    let mut session = leader.register_session("client-x", 60_000).await.unwrap();

    let first = session
        .submit_command(Bytes::from_static(b"SET k v"), CommandConsistency::Sequential, false)
        .await
        .unwrap();
    assert_eq!(first, Bytes::new(), "no previous value for k");

    let second = session
        .submit_command(Bytes::from_static(b"SET k w"), CommandConsistency::Sequential, false)
        .await
        .unwrap();
    assert_eq!(second, Bytes::from_static(b"v"));

    let applies_before = cluster.applies[leader_index].load(Ordering::SeqCst);

    // Resubmitting sequence 1 must replay the cached response without another
    // state-machine invocation.
    let replayed = session
        .resubmit_command(1, Bytes::from_static(b"SET k v"), CommandConsistency::Sequential, false)
        .await
        .unwrap();
    assert_eq!(replayed, first);
    assert_eq!(cluster.applies[leader_index].load(Ordering::SeqCst), applies_before);

    // And the state reflects the second write, not a replayed first one.
    let value = session
        .submit_query(Bytes::from_static(b"GET k"), QueryConsistency::Sequential)
        .await
        .unwrap();
    assert_eq!(value, Bytes::from_static(b"w"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_member_cluster_elects_itself_and_commits_immediately() {
    let cluster = start_cluster(1);
    let leader = &cluster.engines[wait_for_leader(&cluster).await];

    let mut session = leader.register_session("solo", 60_000).await.unwrap();
    session
        .submit_command(Bytes::from_static(b"SET a 1"), CommandConsistency::Sequential, false)
        .await
        .unwrap();
    let value = session
        .submit_query(Bytes::from_static(b"GET a"), QueryConsistency::Linearizable)
        .await
        .unwrap();
    assert_eq!(value, Bytes::from_static(b"1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn linearizable_query_completes_after_quorum_round() {
    let cluster = start_cluster(3);
    let leader = &cluster.engines[wait_for_leader(&cluster).await];

    let mut session = leader.register_session("client-x", 60_000).await.unwrap();
    session
        .submit_command(Bytes::from_static(b"SET k v"), CommandConsistency::Sequential, false)
        .await
        .unwrap();

    let value = timeout(
        Duration::from_secs(5),
        session.submit_query(Bytes::from_static(b"GET k"), QueryConsistency::Linearizable),
    )
    .await
    .expect("linearizable query must not hang")
    .unwrap();
    assert_eq!(value, Bytes::from_static(b"v"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_expires_without_keep_alives() {
    let cluster = start_cluster(3);
    let leader = &cluster.engines[wait_for_leader(&cluster).await];

    let mut doomed = leader.register_session("doomed", 300).await.unwrap();
    let mut pacemaker = leader.register_session("pacemaker", 600_000).await.unwrap();

    // Deterministic time only advances through committed entries, so the
    // pacemaker session writes the clock forward while the doomed session
    // stays completely silent past its timeout. Any activity from the doomed
    // session would refresh its liveness and defeat the test.
    for round in 0..15 {
        pacemaker
            .submit_command(
                Bytes::from(format!("SET tick {}", round)),
                CommandConsistency::Sequential,
                false,
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
    }

    let result = doomed
        .submit_command(Bytes::from_static(b"SET doomed 1"), CommandConsistency::Sequential, false)
        .await;
    assert!(
        matches!(result, Err(RequestError::UnknownSession(_))),
        "leader should have expired the silent session, got {:?}",
        result
    );

    // The survivor is still healthy.
    pacemaker.keep_alive().await.unwrap();
    pacemaker
        .submit_command(Bytes::from_static(b"SET still alive"), CommandConsistency::Sequential, false)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_are_delivered_to_the_connected_session() {
    let cluster = start_cluster(3);
    let leader = &cluster.engines[wait_for_leader(&cluster).await];

    let mut receiver = leader.register_session("receiver", 60_000).await.unwrap();
    let mut sender = leader.register_session("sender", 60_000).await.unwrap();

    sender
        .submit_command(
            Bytes::from(format!("NOTIFY {} ping", receiver.session_id())),
            CommandConsistency::Sequential,
            false,
        )
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), receiver.next_event())
        .await
        .expect("event must arrive")
        .expect("event stream open");
    assert_eq!(event.payload, Bytes::from_static(b"ping"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn linearizable_command_completes_only_after_event_acknowledgement() {
    let cluster = start_cluster(3);
    let leader = &cluster.engines[wait_for_leader(&cluster).await];

    let receiver = leader.register_session("receiver", 60_000).await.unwrap();
    let mut sender = leader.register_session("sender", 60_000).await.unwrap();
    let receiver_id = receiver.session_id();

    // The receiver acknowledges events as they arrive; without this task the
    // linearizable command below could never complete.
    let consumer = tokio::spawn(async move {
        let mut receiver = receiver;
        timeout(Duration::from_secs(10), receiver.next_event())
            .await
            .expect("event must arrive")
            .expect("event stream open")
    });

    let result = timeout(
        Duration::from_secs(10),
        sender.submit_command(
            Bytes::from(format!("NOTIFY {} linear", receiver_id)),
            CommandConsistency::Linearizable,
            false,
        ),
    )
    .await
    .expect("linearizable command must complete once the event is acked");
    assert!(result.is_ok());

    let event = consumer.await.unwrap();
    assert_eq!(event.payload, Bytes::from_static(b"linear"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn joined_member_starts_as_reserve_and_is_promoted() {
    let cluster = start_cluster(3);
    let leader = &cluster.engines[wait_for_leader(&cluster).await];

    // Start the joining member with a view that includes itself as Reserve.
    let new_member = Member::new(MemberId::new(4), MemberKind::Reserve, "server-4", "client-4");
    let mut joined_view = cluster.members.clone();
    joined_view.push(new_member.clone());
    let new_engine = start_engine(
        EngineConfig {
            my_id: MemberId::new(4),
            members: joined_view,
            storage: StorageConfig::in_memory(),
            options: test_options(),
            logger: test_logger(),
            transport: cluster.transport.clone(),
        },
        KvMachine::new(Arc::new(AtomicU64::new(0))),
    )
    .unwrap();
    assert_eq!(new_engine.role(), RoleKind::Reserve);

    let configuration = leader.add_member(new_member).await.unwrap();
    assert_eq!(
        configuration.kind_of(MemberId::new(4)),
        Some(MemberKind::Reserve),
        "new members always join as Reserve"
    );

    // The rebalancer promotes the reserve toward the passive pool; the member
    // observes its reclassification through a Configure push.
    timeout(Duration::from_secs(10), new_engine.wait_for_role(RoleKind::Passive))
        .await
        .expect("joined member should be promoted to Passive");
}
