use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::datacenter::address::DatacenterId;
use crate::error::{RpcFailure, RpcResult};
use crate::rpc::error_classification::is_home_migration;
use crate::rpc::RpcOutcome;
use crate::session::driver::{spawn_session, SessionContext, SessionEvent, SessionHandle};
use crate::util::atomic_box::AtomicBox;

/// The engine's front door: one session per datacenter, created on first use. Calls go to the
///  'main' datacenter unless a datacenter is given explicitly, and migrate errors are followed
///  transparently.
pub struct Engine {
    context: SessionContext,
    main_dc: AtomicBox<DatacenterId>,
    sessions: AtomicBox<FxHashMap<DatacenterId, SessionHandle>>,
}

impl Engine {
    pub fn new(context: SessionContext, main_dc: DatacenterId) -> anyhow::Result<Engine> {
        context.config.validate()?;

        Ok(Engine {
            context,
            main_dc: AtomicBox::new(main_dc),
            sessions: Default::default(),
        })
    }

    pub fn main_dc(&self) -> DatacenterId {
        self.main_dc.get()
    }

    /// The session for a datacenter. A session that was closed (e.g. after its auth key was
    ///  rejected) is replaced by a new one.
    pub fn session(&self, dc: DatacenterId) -> SessionHandle {
        self.sessions.modify(|sessions| {
            if let Some(session) = sessions.get(&dc) {
                if !session.is_closed() {
                    return session.clone();
                }
                debug!(?dc, "session was closed - starting a new one");
            }

            let session = spawn_session(self.context.clone(), dc);
            sessions.insert(dc, session.clone());
            session
        })
    }

    pub async fn invoke(&self, body: Bytes) -> RpcResult<Bytes> {
        self.invoke_cancellable(body, CancellationToken::new()).await
    }

    pub async fn invoke_cancellable(&self, body: Bytes, cancel: CancellationToken) -> RpcResult<Bytes> {
        self.invoke_on(self.main_dc(), body, cancel).await
    }

    /// Sends a request to a given datacenter, following migrate errors to other datacenters at
    ///  most `max_migrations` times
    #[tracing::instrument(skip(self, body, cancel))]
    pub async fn invoke_on(&self, dc: DatacenterId, body: Bytes, cancel: CancellationToken) -> RpcResult<Bytes> {
        let mut dc = dc;
        let mut num_migrations = 0;

        loop {
            let outcome = self.session(dc)
                .invoke_cancellable(body.clone(), cancel.clone())
                .await?;

            match outcome {
                RpcOutcome::Response(data) => return Ok(data),
                RpcOutcome::Migrate { dc: target, error_code, description } => {
                    if num_migrations >= self.context.config.max_migrations {
                        warn!(?target, "too many migrations - giving up");
                        return Err(RpcFailure::Rpc { code: error_code, description });
                    }
                    num_migrations += 1;

                    if is_home_migration(&description) {
                        info!(from = ?self.main_dc(), to = ?target, "main datacenter migrated");
                        self.main_dc.swap(target);
                    }
                    debug!(from = ?dc, to = ?target, "following migration");
                    dc = target;
                }
            }
        }
    }

    pub async fn subscribe(&self, dc: DatacenterId) -> RpcResult<mpsc::UnboundedReceiver<SessionEvent>> {
        self.session(dc).subscribe().await
    }

    /// Closes all sessions. Pending calls fail with [RpcFailure::Closed]. Using the engine
    ///  afterwards starts new sessions.
    pub async fn close(&self) {
        let sessions = self.sessions.swap(Default::default());
        for session in sessions.values() {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use super::*;
    use crate::codec::envelope::MessageId;
    use crate::codec::service_messages::{RpcErrorData, RpcResultBody, RpcResultData, ServiceMessage};
    use crate::config::EngineConfig;
    use crate::test_util::environment::TestEnvironment;
    use crate::test_util::transport::ServerConnection;

    const DC2: DatacenterId = DatacenterId(2);
    const DC4: DatacenterId = DatacenterId(4);

    async fn setup(config: EngineConfig) -> (TestEnvironment, Arc<Engine>) {
        let env = TestEnvironment::new(config, &[DC2, DC4]).await.unwrap();
        let engine = Engine::new(env.context.clone(), DC2).unwrap();
        (env, Arc::new(engine))
    }

    fn spawn_call(engine: &Arc<Engine>, body: &'static [u8]) -> tokio::task::JoinHandle<RpcResult<Bytes>> {
        let engine = engine.clone();
        tokio::spawn(async move { engine.invoke(Bytes::from_static(body)).await })
    }

    async fn recv_request(server: &mut ServerConnection) -> (i64, MessageId) {
        let received = timeout(Duration::from_secs(60), server.recv_matching(|m| matches!(m, ServiceMessage::Payload(_))))
            .await.unwrap().unwrap();
        (received.session_id, received.envelope.message_id)
    }

    async fn answer(server: &mut ServerConnection, result: RpcResultBody) {
        let (session_id, request_message_id) = recv_request(server).await;
        server.send(session_id, ServiceMessage::RpcResult(RpcResultData { request_message_id, result })).await.unwrap();
    }

    fn migrate(description: &str) -> RpcResultBody {
        RpcResultBody::Error(RpcErrorData { error_code: 303, description: description.to_string() })
    }

    #[tokio::test]
    async fn test_new_validates_config() {
        let env = TestEnvironment::new(EngineConfig::new(), &[DC2]).await.unwrap();
        let mut context = env.context.clone();
        let mut config = EngineConfig::new();
        config.duplicate_window = 0;
        context.config = Arc::new(config);
        assert!(Engine::new(context, DC2).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_on_main_dc() {
        let (mut env, engine) = setup(EngineConfig::new()).await;
        let call = spawn_call(&engine, b"get1");

        let mut server = env.accept().await.unwrap();
        assert_eq!(server.dc, DC2);
        answer(&mut server, RpcResultBody::Data(Bytes::from_static(b"res1"))).await;
        assert_eq!(call.await.unwrap(), Ok(Bytes::from_static(b"res1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_migrate_moves_main_dc() {
        let (mut env, engine) = setup(EngineConfig::new()).await;
        let call = spawn_call(&engine, b"get1");

        let mut dc2 = env.accept().await.unwrap();
        answer(&mut dc2, migrate("USER_MIGRATE_4")).await;

        let mut dc4 = env.accept().await.unwrap();
        assert_eq!(dc4.dc, DC4);
        answer(&mut dc4, RpcResultBody::Data(Bytes::from_static(b"res1"))).await;

        assert_eq!(call.await.unwrap(), Ok(Bytes::from_static(b"res1")));
        assert_eq!(engine.main_dc(), DC4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_migrate_with_code_prefix_moves_main_dc() {
        let (mut env, engine) = setup(EngineConfig::new()).await;
        let call = spawn_call(&engine, b"get1");

        let mut dc2 = env.accept().await.unwrap();
        answer(&mut dc2, migrate("303 USER_MIGRATE_4")).await;
        let mut dc4 = env.accept().await.unwrap();
        answer(&mut dc4, RpcResultBody::Data(Bytes::from_static(b"res1"))).await;
        assert_eq!(call.await.unwrap(), Ok(Bytes::from_static(b"res1")));
        assert_eq!(engine.main_dc(), DC4);

        // later calls go straight to the new main datacenter
        let call = spawn_call(&engine, b"get2");
        answer(&mut dc4, RpcResultBody::Data(Bytes::from_static(b"res2"))).await;
        assert_eq!(call.await.unwrap(), Ok(Bytes::from_static(b"res2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_migrate_keeps_main_dc() {
        let (mut env, engine) = setup(EngineConfig::new()).await;
        let call = spawn_call(&engine, b"get1");

        let mut dc2 = env.accept().await.unwrap();
        answer(&mut dc2, migrate("FILE_MIGRATE_4")).await;
        let mut dc4 = env.accept().await.unwrap();
        answer(&mut dc4, RpcResultBody::Data(Bytes::from_static(b"res1"))).await;

        assert_eq!(call.await.unwrap(), Ok(Bytes::from_static(b"res1")));
        assert_eq!(engine.main_dc(), DC2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_migrations_are_bounded() {
        let mut config = EngineConfig::new();
        config.max_migrations = 1;
        let (mut env, engine) = setup(config).await;
        let call = spawn_call(&engine, b"get1");

        let mut dc2 = env.accept().await.unwrap();
        answer(&mut dc2, migrate("FILE_MIGRATE_4")).await;
        let mut dc4 = env.accept().await.unwrap();
        answer(&mut dc4, migrate("FILE_MIGRATE_2")).await;

        assert_eq!(call.await.unwrap(), Err(RpcFailure::Rpc { code: 303, description: "FILE_MIGRATE_2".to_string() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_reused() {
        let (_env, engine) = setup(EngineConfig::new()).await;
        let first = engine.session(DC2);
        let second = engine.session(DC2);
        assert!(first.same_session(&second));
        assert!(!first.same_session(&engine.session(DC4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_and_restart() {
        let (mut env, engine) = setup(EngineConfig::new()).await;
        let old_session = engine.session(DC2);
        let _server = env.accept().await.unwrap();

        engine.close().await;
        assert_eq!(old_session.invoke(Bytes::from_static(b"get1")).await, Err(RpcFailure::Closed));

        let call = spawn_call(&engine, b"get2");
        let mut server = env.accept().await.unwrap();
        answer(&mut server, RpcResultBody::Data(Bytes::from_static(b"res2"))).await;
        assert_eq!(call.await.unwrap(), Ok(Bytes::from_static(b"res2")));
    }
}
