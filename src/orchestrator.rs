//! Campaign orchestration: outbound calls against the contact store and
//! inbound listening, both driving the same dialogue loop.

use crate::config::{DataDirs, SipCredentials, SoftphoneConfig};
use crate::conversation::ConversationConfig;
use crate::engine::{
    ConversationEngine, ExtractionStatus, Fragment, FragmentKind, FunctionRegistry,
    InformationSnapshot,
};
use crate::error::Result;
use crate::providers::{LanguageModel, ProviderStack};
use crate::store::{ContactOutcome, ContactStore};
use crate::telephony::driver::SipDriver;
use crate::telephony::{SoftphonePool, TelephonySession};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Poll period while a forwarded call stays bridged.
const FORWARD_POLL: Duration = Duration::from_secs(1);

/// Everything one finished dialogue produced.
struct DialogueOutcome {
    status: ExtractionStatus,
    information: InformationSnapshot,
    transcript: String,
    /// An engine step failed (LLM or plugin error); treated as an abort.
    failed: bool,
}

impl DialogueOutcome {
    fn completed(&self) -> bool {
        !self.failed && self.status == ExtractionStatus::Completed
    }
}

/// Drives outbound campaigns and inbound listening.
pub struct Orchestrator {
    driver: Arc<dyn SipDriver>,
    credentials: SipCredentials,
    softphone_config: SoftphoneConfig,
    dirs: DataDirs,
    providers: ProviderStack,
    functions: Arc<FunctionRegistry>,
    store: ContactStore,
    outgoing: ConversationConfig,
    listen_pool: Mutex<Option<SoftphonePool>>,
}

impl Orchestrator {
    /// Create an orchestrator and ensure the outgoing conversation's
    /// tables exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be opened or the tables
    /// cannot be created.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Arc<dyn SipDriver>,
        credentials: SipCredentials,
        softphone_config: SoftphoneConfig,
        dirs: DataDirs,
        outgoing: ConversationConfig,
        db_path: &Path,
        providers: ProviderStack,
        functions: Arc<FunctionRegistry>,
    ) -> Result<Self> {
        dirs.ensure()?;
        let store = ContactStore::open(db_path)?;
        store.ensure_conversation_tables(&outgoing)?;
        Ok(Self {
            driver,
            credentials,
            softphone_config,
            dirs,
            providers,
            functions,
            store,
            outgoing,
            listen_pool: Mutex::new(None),
        })
    }

    /// Access the contact store (contact CRUD lives there).
    pub fn store(&self) -> &ContactStore {
        &self.store
    }

    /// Swap the outgoing campaign script, ensuring its tables.
    ///
    /// # Errors
    ///
    /// Returns an error when table creation fails.
    pub fn set_outgoing_conversation(&mut self, config: ConversationConfig) -> Result<()> {
        self.store.ensure_conversation_tables(&config)?;
        self.outgoing = config;
        Ok(())
    }

    /// One-off outbound dialogue to a raw number; nothing is persisted.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint or the outbound leg cannot be
    /// set up.
    pub fn call_number(&self, number: &str) -> Result<()> {
        let pool = self.new_pool()?;
        let session = pool.create_session();
        let result = self.dial_and_converse(&session, number).map(|_| ());
        pool.release_session(&session);
        result
    }

    /// Call one contact and lead them through the outgoing conversation,
    /// updating its status and result rows.
    ///
    /// # Errors
    ///
    /// Returns an error on store failures or when the endpoint cannot be
    /// set up. An unanswered call is not an error; the contact stays
    /// `NOT_REACHED`.
    pub fn call_contact(&self, contact_id: i64) -> Result<()> {
        let Some(contact) = self.store.get_contact(contact_id)? else {
            warn!("couldn't make call: invalid contact id {contact_id}");
            return Ok(());
        };
        let table = self.outgoing.table_name().to_owned();

        // An attempt is counted as soon as we dial, answered or not.
        self.store.ensure_status(&table, contact_id)?;
        self.store.increment_attempts(&table, contact_id)?;

        let pool = self.new_pool()?;
        let session = pool.create_session();
        let outcome = self.dial_and_converse(&session, &contact.phone_number);
        pool.release_session(&session);

        let Some(dialogue) = outcome? else {
            info!("call to contact {contact_id} was not picked up");
            return Ok(());
        };

        if dialogue.completed() {
            info!("extraction completed for contact {contact_id}");
            self.store
                .set_outcome(&table, contact_id, ContactOutcome::Completed)?;
            self.store
                .upsert_result(&table, contact_id, &dialogue.information)?;
        } else {
            info!("extraction aborted for contact {contact_id}");
            self.store
                .set_outcome(&table, contact_id, ContactOutcome::Aborted)?;
        }

        self.write_call_log(&table, contact_id, &dialogue.transcript);
        Ok(())
    }

    /// Call a list of contacts (default: every contact, ascending),
    /// honoring their statuses from previous attempts.
    ///
    /// # Errors
    ///
    /// Returns an error on store failures or endpoint setup failures.
    pub fn call_contacts(
        &self,
        contact_ids: Option<Vec<i64>>,
        max_attempts: Option<u32>,
    ) -> Result<()> {
        let ids = match contact_ids {
            Some(ids) => ids,
            None => self.store.contact_ids()?,
        };
        let table = self.outgoing.table_name().to_owned();

        for contact_id in ids {
            info!("attempting to call contact {contact_id}");
            if self.store.get_contact(contact_id)?.is_none() {
                warn!("invalid contact id: {contact_id}");
                continue;
            }
            if let Some(status) = self.store.get_status(&table, contact_id)? {
                if status.outcome != ContactOutcome::NotReached {
                    info!("contact {contact_id} has already been reached");
                    continue;
                }
                if max_attempts.is_some_and(|max| status.num_attempts >= max) {
                    info!("contact {contact_id} has reached the maximum number of attempts");
                    continue;
                }
            }
            self.call_contact(contact_id)?;
        }
        Ok(())
    }

    /// Start answering inbound calls with the given conversation on
    /// `num_sessions` concurrent sessions.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint cannot be set up.
    pub fn start_listening(
        &self,
        conversation: ConversationConfig,
        num_sessions: usize,
    ) -> Result<()> {
        let mut guard = self
            .listen_pool
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_some() {
            warn!("already listening");
            return Ok(());
        }

        let pool = self.new_pool()?;
        let llm = self.providers.llm.clone();
        let functions = self.functions.clone();
        let conversation = Arc::new(conversation);
        pool.start_listening(
            num_sessions,
            Arc::new(move |session: TelephonySession| {
                info!("incoming call picked up, starting dialogue");
                let outcome =
                    run_dialogue(&llm, &functions, &session, &conversation);
                if outcome.completed() {
                    info!("extraction completed");
                } else {
                    info!("extraction aborted");
                }
                wait_while_forwarded(&session);
            }),
        );
        *guard = Some(pool);
        Ok(())
    }

    /// Stop answering inbound calls; workers exit at their next poll.
    pub fn stop_listening(&self) {
        let pool = self
            .listen_pool
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            pool.stop_listening();
        }
    }

    fn new_pool(&self) -> Result<SoftphonePool> {
        SoftphonePool::new(
            self.driver.as_ref(),
            &self.credentials,
            self.softphone_config.clone(),
            self.dirs.clone(),
            self.providers.synthesizer.clone(),
            self.providers.transcriber.clone(),
        )
    }

    /// Dial, wait for pickup, and run the outgoing dialogue.
    ///
    /// Returns `None` when the call was never picked up.
    fn dial_and_converse(
        &self,
        session: &TelephonySession,
        number: &str,
    ) -> Result<Option<DialogueOutcome>> {
        session.call(number)?;
        session.wait_for_stop_calling(None);
        if !session.has_picked_up_call() {
            return Ok(None);
        }

        info!("call picked up, starting dialogue");
        let outcome = run_dialogue(
            &self.providers.llm,
            &self.functions,
            session,
            &self.outgoing,
        );

        // If a plugin forwarded the call, keep the bridge up until the
        // legs part; the pool hangs up on release.
        wait_while_forwarded(session);
        Ok(Some(outcome))
    }

    fn write_call_log(&self, table: &str, contact_id: i64, transcript: &str) {
        let path = self.dirs.logs.join(format!("{table}_{contact_id}.log"));
        if let Err(e) = std::fs::write(&path, transcript) {
            warn!("failed to write call log {}: {e}", path.display());
        }
    }
}

/// Run one full engine conversation over a picked-up call.
fn run_dialogue(
    llm: &Arc<dyn LanguageModel>,
    functions: &Arc<FunctionRegistry>,
    session: &TelephonySession,
    conversation: &ConversationConfig,
) -> DialogueOutcome {
    let mut engine = ConversationEngine::new(
        conversation,
        llm.clone(),
        functions.clone(),
        Some(session.clone()),
    );
    let mut transcript = String::new();
    let mut failed = false;

    match engine.step("") {
        Ok(fragments) => speak(&fragments, session, &mut transcript),
        Err(e) => {
            error!("engine step failed: {e}");
            failed = true;
        }
    }

    while !failed
        && engine.status() == ExtractionStatus::InProgress
        && session.has_picked_up_call()
    {
        let user_input = session.listen();
        transcript.push_str(&format!("User: {user_input}\n"));
        match engine.step(&user_input) {
            Ok(fragments) => speak(&fragments, session, &mut transcript),
            Err(e) => {
                error!("engine step failed: {e}");
                failed = true;
            }
        }
    }

    DialogueOutcome {
        status: engine.status(),
        information: engine.information(),
        transcript,
        failed,
    }
}

/// Speak fragments in order; only scripted `read` fragments are cacheable.
fn speak(fragments: &[Fragment], session: &TelephonySession, transcript: &mut String) {
    for fragment in fragments {
        transcript.push_str("Caller: ");
        transcript.push_str(fragment.text.trim_end_matches('\n'));
        transcript.push('\n');
        session.say(&fragment.text, fragment.kind == FragmentKind::Read);
    }
}

fn wait_while_forwarded(session: &TelephonySession) {
    while session.is_forwarded() {
        std::thread::sleep(FORWARD_POLL);
    }
}
