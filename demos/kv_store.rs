use bytes::Bytes;
use chrono::Utc;
use slog::Drain;
use statecraft::{
    start_engine, ChannelTransport, CommandConsistency, Commit, EngineConfig, Member, MemberId, MemberKind,
    QueryConsistency, RoleKind, ServerOptions, SessionId, StateMachine, StorageConfig,
};
use std::collections::HashMap;

#[tokio::main]
async fn main() {
    let logger = create_root_logger_for_stdout();
    slog::info!(logger, "Starting single-member KV cluster"; "at" => Utc::now().to_rfc3339());

    let transport = ChannelTransport::new();
    let members = vec![Member::new(
        MemberId::new(1),
        MemberKind::Active,
        "kv-server-1",
        "kv-client-1",
    )];

    let engine = start_engine(
        EngineConfig {
            my_id: MemberId::new(1),
            members,
            storage: StorageConfig::in_memory(),
            options: ServerOptions::default(),
            logger: logger.clone(),
            transport,
        },
        KvStore::default(),
    )
    .expect("engine starts");

    engine.wait_for_role(RoleKind::Leader).await;
    let mut session = engine.register_session("kv-demo", 10_000).await.expect("session registers");
    slog::info!(logger, "Session registered"; "session_id" => session.session_id());

    let previous = session
        .submit_command(Bytes::from_static(b"SET greeting hello"), CommandConsistency::Sequential, false)
        .await
        .expect("SET commits");
    assert!(previous.is_empty());

    let value = session
        .submit_query(Bytes::from_static(b"GET greeting"), QueryConsistency::Linearizable)
        .await
        .expect("GET succeeds");
    assert_eq!(value, Bytes::from_static(b"hello"));
    slog::info!(logger, "Read back"; "greeting" => String::from_utf8_lossy(&value).into_owned());

    let removed = session
        .submit_command(Bytes::from_static(b"DEL greeting"), CommandConsistency::Sequential, true)
        .await
        .expect("DEL commits");
    assert_eq!(removed, Bytes::from_static(b"hello"));

    session.unregister().await.expect("session closes");
    slog::info!(logger, "Done");
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("demo" => "kv_store"))
}

/// A replicated map speaking the same text protocol the integration tests
/// use: SET/DEL commands and GET queries. Overwritten and deleted entries are
/// marked clean for compaction.
#[derive(Default)]
struct KvStore {
    values: HashMap<String, String>,
    value_indices: HashMap<String, u64>,
}

impl StateMachine for KvStore {
    fn apply(&mut self, commit: &mut Commit) -> Result<Bytes, String> {
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
                    commit.clean(index);
                }
                Ok(Bytes::from(previous.unwrap_or_default()))
            }
            _ => Err(format!("unknown command: {}", text)),
        }
    }

    fn query(&self, _session: SessionId, payload: &Bytes) -> Result<Bytes, String> {
        let text = String::from_utf8_lossy(payload).into_owned();
        match text.strip_prefix("GET ") {
            Some(key) => Ok(Bytes::from(self.values.get(key).cloned().unwrap_or_default())),
            None => Err(format!("unknown query: {}", text)),
        }
    }
}
