//! The softphone pool: one endpoint and registered account shared by all
//! sessions, inbound-call routing, and listener worker supervision.

use crate::config::{DataDirs, SipCredentials, SoftphoneConfig};
use crate::error::Result;
use crate::providers::{SpeechSynthesizer, Transcriber};
use crate::telephony::TelephonySession;
use crate::telephony::driver::{IncomingCall, SipDriver, SipEndpoint};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{error, info, warn};

/// Poll period of a listener worker waiting for pickup.
const LISTEN_POLL: Duration = Duration::from_secs(1);

/// A dialogue to run once an inbound call is picked up.
pub type ListenHandler = Arc<dyn Fn(TelephonySession) + Send + Sync>;

/// Shared SIP endpoint plus the session slots inbound calls route to.
#[derive(Clone)]
pub struct SoftphonePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    endpoint: Arc<dyn SipEndpoint>,
    registrar_host: String,
    config: SoftphoneConfig,
    dirs: DataDirs,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transcriber: Arc<dyn Transcriber>,
    sessions: Mutex<Vec<TelephonySession>>,
    listening: AtomicBool,
}

impl SoftphonePool {
    /// Create the endpoint, register the account, and install the
    /// inbound-call router.
    ///
    /// # Errors
    ///
    /// Returns an error when the data directories cannot be created or
    /// registration fails.
    pub fn new(
        driver: &dyn SipDriver,
        credentials: &SipCredentials,
        config: SoftphoneConfig,
        dirs: DataDirs,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Result<Self> {
        dirs.ensure()?;
        let endpoint = driver.create_endpoint(credentials)?;
        let inner = Arc::new(PoolInner {
            endpoint: endpoint.clone(),
            registrar_host: credentials.registrar_host().to_owned(),
            config,
            dirs,
            synthesizer,
            transcriber,
            sessions: Mutex::new(Vec::new()),
            listening: AtomicBool::new(false),
        });

        let router: Weak<PoolInner> = Arc::downgrade(&inner);
        endpoint.set_incoming_handler(Box::new(move |call| {
            let Some(pool) = router.upgrade() else {
                call.reject_busy();
                return;
            };
            pool.route_incoming(call);
        }));

        Ok(Self { inner })
    }

    /// Create a new session slot backed by the shared endpoint.
    pub fn create_session(&self) -> TelephonySession {
        let session = TelephonySession::new(
            self.inner.endpoint.clone(),
            self.inner.registrar_host.clone(),
            self.inner.config.clone(),
            self.inner.dirs.artifacts.clone(),
            self.inner.dirs.cache.clone(),
            self.inner.synthesizer.clone(),
            self.inner.transcriber.clone(),
        );
        self.inner.lock_sessions().push(session.clone());
        session
    }

    /// Hang up and remove a session. Releasing the last session tears the
    /// endpoint down.
    pub fn release_session(&self, session: &TelephonySession) {
        session.hangup(false);
        let mut sessions = self.inner.lock_sessions();
        sessions.retain(|s| s.id() != session.id());
        if sessions.is_empty() {
            info!("last session released, shutting endpoint down");
            self.inner.endpoint.shutdown();
        }
    }

    /// Number of session slots currently registered.
    pub fn session_count(&self) -> usize {
        self.inner.lock_sessions().len()
    }

    /// Whether listener workers should keep running.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// Create `num_sessions` slots and one listener worker per slot.
    ///
    /// Each worker registers its OS thread with the SIP stack, polls its
    /// session for pickup at 1 Hz, and runs `handler` for every answered
    /// call. A failing or panicking dialogue is contained: the worker hangs
    /// the call up and keeps serving its session.
    pub fn start_listening(&self, num_sessions: usize, handler: ListenHandler) {
        self.inner.listening.store(true, Ordering::SeqCst);
        for _ in 0..num_sessions {
            let session = self.create_session();
            let inner = self.inner.clone();
            let handler = handler.clone();
            std::thread::spawn(move || listen_worker(&inner, &session, handler.as_ref()));
        }
        info!("listening for incoming calls on {num_sessions} session(s)");
    }

    /// Ask all listener workers to exit at their next poll.
    pub fn stop_listening(&self) {
        self.inner.listening.store(false, Ordering::SeqCst);
    }
}

impl PoolInner {
    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, Vec<TelephonySession>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Bind an inbound call to the first idle session, or reject busy.
    fn route_incoming(&self, call: Box<dyn IncomingCall>) {
        let sessions = self.lock_sessions();
        for session in sessions.iter() {
            if !session.is_idle() {
                continue;
            }
            match call.answer() {
                Ok(leg) => {
                    session.bind_incoming(leg);
                    info!("incoming call answered by session {}", session.id());
                }
                Err(e) => warn!("failed to answer incoming call: {e}"),
            }
            return;
        }
        info!("no free session, rejecting incoming call");
        call.reject_busy();
    }
}

/// One listener worker: serves inbound dialogues on a single session until
/// listening stops. Each completed or failed dialogue is followed by a
/// fresh accept loop for the same session.
fn listen_worker(
    pool: &Arc<PoolInner>,
    session: &TelephonySession,
    handler: &(dyn Fn(TelephonySession) + Send + Sync),
) {
    pool.endpoint.register_thread("listener");
    info!("listener worker up for session {}", session.id());

    loop {
        if !pool.listening.load(Ordering::SeqCst) {
            info!("listener worker for session {} exiting", session.id());
            return;
        }
        if session.has_picked_up_call() {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| handler(session.clone())));
            if outcome.is_err() {
                error!("listener dialogue panicked; recovering session");
            }
            session.hangup(false);
            info!("listener worker for session {} ready again", session.id());
        }
        std::thread::sleep(LISTEN_POLL);
    }
}
