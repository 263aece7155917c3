//! Call-flow scenarios over the loopback SIP driver: playback caching,
//! forwarding, capture, pool routing, and outbound campaigns.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use ringdown::config::DataDirs;
use ringdown::conversation::ConversationConfig;
use ringdown::engine::FunctionRegistry;
use ringdown::providers::ProviderStack;
use ringdown::store::ContactOutcome;
use ringdown::telephony::SoftphonePool;
use ringdown::telephony::tts::utterance_hash;
use ringdown::test_utils::{
    LoopbackDriver, ScriptedLlm, ScriptedTranscriber, TonePcmSynthesizer, fast_softphone_config,
    loopback_credentials, temp_test_root,
};
use ringdown::Orchestrator;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_pool(driver: &LoopbackDriver, name: &str) -> (SoftphonePool, DataDirs) {
    init_tracing();
    let root = temp_test_root("callflow", name);
    let dirs = DataDirs::at(&root);
    let pool = SoftphonePool::new(
        driver,
        &loopback_credentials(),
        fast_softphone_config(),
        dirs.clone(),
        Arc::new(TonePcmSynthesizer::new(2048)),
        Arc::new(ScriptedTranscriber::fixed("hello")),
    )
    .unwrap();
    (pool, dirs)
}

#[test]
fn say_caches_and_replays_byte_identical_audio() {
    let driver = LoopbackDriver::new();
    let (pool, dirs) = test_pool(&driver, "tts-cache");
    let session = pool.create_session();
    session.call("100").unwrap();
    assert!(session.has_picked_up_call());

    let leg = driver.endpoint().placed_legs()[0].clone();
    let call_audio = leg.audio_handle();

    session.say("hello caller", true);
    let cache_file = dirs.cache.join(format!("{}.wav", utterance_hash("hello caller")));
    assert!(cache_file.exists());
    let first = std::fs::read(&cache_file).unwrap();

    let plays_before = call_audio.plays().len();
    session.say("hello caller", true);
    let second = std::fs::read(&cache_file).unwrap();
    assert_eq!(first, second);

    // The cached replay attaches exactly one player, over the cache file.
    let plays = call_audio.plays();
    assert_eq!(plays.len(), plays_before + 1);
    assert_eq!(plays.last().unwrap(), &cache_file);

    // At most one player transmits toward the leg at any instant.
    assert!(call_audio.max_concurrent_players() <= 1);

    pool.release_session(&session);
    assert!(driver.endpoint().is_shut_down());
}

#[test]
fn forwarding_bridges_legs_and_blocks_local_playback() {
    let driver = LoopbackDriver::new();
    let (pool, _dirs) = test_pool(&driver, "forwarding");
    let session = pool.create_session();
    session.call("100").unwrap();
    session.say("before forwarding", false);

    session.forward("+100", Some(Duration::from_secs(1))).unwrap();
    assert!(session.is_forwarded());

    let endpoint = driver.endpoint();
    let legs = endpoint.placed_legs();
    assert_eq!(legs.len(), 2);
    let active_audio = legs[0].audio_handle();
    let paired_audio = legs[1].audio_handle();
    assert_eq!(active_audio.bridge_count(), 1);
    assert_eq!(paired_audio.bridge_count(), 1);

    // While forwarded, say is rejected without touching the media.
    let plays_before = active_audio.plays().len();
    session.say("x", false);
    assert_eq!(active_audio.plays().len(), plays_before);

    // And listening reports the call as unavailable.
    assert_eq!(session.listen(), "");

    // The peer of the forwarded leg hangs up; only the pair is dropped.
    legs[1].peer_hangup();
    assert!(!session.is_forwarded());
    assert!(session.has_picked_up_call());

    // Local playback works again.
    session.say("back with you", false);
    assert!(active_audio.plays().len() > plays_before);

    pool.release_session(&session);
}

#[test]
fn forward_without_pickup_keeps_the_primary_leg() {
    let ringing = LoopbackDriver::ringing();
    let (pool, _dirs) = test_pool(&ringing, "forward-timeout");
    let session = pool.create_session();
    session.call("100").unwrap();
    // Confirm the active leg manually; the paired leg will stay ringing.
    ringing.endpoint().placed_legs()[0].confirm();
    assert!(session.has_picked_up_call());

    let result = session.forward("+100", Some(Duration::from_millis(300)));
    assert!(result.is_err());
    assert!(!session.is_forwarded());
    assert!(session.has_picked_up_call());

    pool.release_session(&session);
}

#[test]
fn listen_gates_on_voice_activity_and_transcribes() {
    let driver = LoopbackDriver::new();
    let root = temp_test_root("callflow", "listen");
    let dirs = DataDirs::at(&root);
    let pool = SoftphonePool::new(
        &driver,
        &loopback_credentials(),
        fast_softphone_config(),
        dirs,
        Arc::new(TonePcmSynthesizer::new(2048)),
        Arc::new(ScriptedTranscriber::fixed("I am Max")),
    )
    .unwrap();
    let session = pool.create_session();

    // One silent slice, two spoken slices, then trailing quiet.
    driver.push_capture(vec![0; 240]);
    driver.push_capture(vec![8_000; 240]);
    driver.push_capture(vec![8_000; 240]);
    driver.push_capture(vec![50; 240]);

    session.call("100").unwrap();
    assert_eq!(session.listen(), "I am Max");

    pool.release_session(&session);
}

#[test]
fn listen_reports_interruption_when_media_stays_inactive() {
    let driver = LoopbackDriver::new();
    let (pool, _dirs) = test_pool(&driver, "listen-hold");
    let session = pool.create_session();
    session.call("100").unwrap();

    // Peer hold: confirmed call, media gone. The 1 s unavailable-media
    // timeout in the fast config expires quickly.
    driver.endpoint().placed_legs()[0].set_media_active(false);
    assert_eq!(session.listen(), "##INTERRUPTED##");

    pool.release_session(&session);
}

#[test]
fn listen_returns_empty_when_the_call_dies() {
    let driver = LoopbackDriver::new();
    let (pool, _dirs) = test_pool(&driver, "listen-gone");
    let session = pool.create_session();
    session.call("100").unwrap();

    driver.endpoint().placed_legs()[0].peer_hangup();
    assert_eq!(session.listen(), "");

    pool.release_session(&session);
}

#[test]
fn pool_routes_incoming_calls_and_respawns_workers() {
    let driver = LoopbackDriver::new();
    let (pool, _dirs) = test_pool(&driver, "routing");
    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in_worker = handled.clone();
    pool.start_listening(
        2,
        Arc::new(move |_session| {
            handled_in_worker.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let endpoint = driver.endpoint();
    assert_eq!(pool.session_count(), 2);

    // Two concurrent calls bind to distinct sessions; a third is busy.
    let first = endpoint.dial_in();
    let second = endpoint.dial_in();
    let third = endpoint.dial_in();
    assert!(first.is_answered());
    assert!(second.is_answered());
    assert!(!third.is_answered());

    // Workers pick the calls up at their next poll, run the dialogue, and
    // hang up, freeing the sessions again.
    let deadline = Instant::now() + Duration::from_secs(5);
    while handled.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(handled.load(Ordering::SeqCst), 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    let fourth = loop {
        let outcome = endpoint.dial_in();
        if outcome.is_answered() || Instant::now() >= deadline {
            break outcome;
        }
        std::thread::sleep(Duration::from_millis(100));
    };
    assert!(fourth.is_answered());

    // Workers registered their OS threads with the stack.
    assert_eq!(endpoint.registered_threads().len(), 2);

    pool.stop_listening();
    assert!(!pool.is_listening());
}

#[test]
fn incoming_call_without_sessions_is_rejected() {
    let driver = LoopbackDriver::new();
    let (_pool, _dirs) = test_pool(&driver, "no-sessions");
    assert!(!driver.endpoint().dial_in().is_answered());
}

const SURVEY: &str = r#"
conversation_title: survey
conversation_paths:
  entry:
    - type: read
      text: Hi
    - type: information
      interactive: true
      title: name
      description: caller name
      format: text
    - type: read
      text: Thanks
  aborted:
    - type: read
      text: Sorry, goodbye
"#;

fn campaign_fixture(
    name: &str,
    driver: Arc<LoopbackDriver>,
    llm: ScriptedLlm,
    transcriber: ScriptedTranscriber,
) -> (Orchestrator, DataDirs) {
    init_tracing();
    let root = temp_test_root("campaign", name);
    let dirs = DataDirs::at(&root);
    let providers = ProviderStack {
        llm: Arc::new(llm),
        synthesizer: Arc::new(TonePcmSynthesizer::new(2048)),
        transcriber: Arc::new(transcriber),
    };
    let orchestrator = Orchestrator::new(
        driver,
        loopback_credentials(),
        fast_softphone_config(),
        dirs.clone(),
        ConversationConfig::from_yaml_str(SURVEY).unwrap(),
        &root.join("contacts.db"),
        providers,
        Arc::new(FunctionRegistry::new()),
    )
    .unwrap();
    (orchestrator, dirs)
}

#[test]
fn outbound_campaign_persists_results_and_log() {
    let driver = Arc::new(LoopbackDriver::new());
    // Dialogue: greeting + elicitation, then the caller answers and the
    // extraction completes.
    let llm = ScriptedLlm::new()
        .verdicts(["NO", "YES"])
        .filters([("caller name", "Max")])
        .utterances(["What is your name, please?"]);
    let transcriber = ScriptedTranscriber::fixed("I am Max");
    let (orchestrator, dirs) = campaign_fixture("happy", driver.clone(), llm, transcriber);

    orchestrator.store().add_contact("Max", "+100").unwrap();
    let contact_id = orchestrator.store().contact_ids().unwrap()[0];

    // Caller speech for the one listen turn: speech then trailing quiet.
    driver.push_capture(vec![8_000; 240]);
    driver.push_capture(vec![50; 240]);

    orchestrator.call_contact(contact_id).unwrap();

    let status = orchestrator
        .store()
        .get_status("survey", contact_id)
        .unwrap()
        .unwrap();
    assert_eq!(status.num_attempts, 1);
    assert_eq!(status.outcome, ContactOutcome::Completed);

    let log = std::fs::read_to_string(dirs.logs.join(format!("survey_{contact_id}.log"))).unwrap();
    assert!(log.contains("Caller: Hi"));
    assert!(log.contains("User: I am Max"));
    assert!(log.contains("Caller: Thanks"));

    // The outbound leg dialed the contact through the registrar.
    let leg = driver.endpoint().placed_legs()[0].clone();
    assert_eq!(leg.uri(), "sip:+100@loopback");
}

#[test]
fn unanswered_calls_count_an_attempt_but_stay_not_reached() {
    let driver = Arc::new(LoopbackDriver::ringing());
    let llm = ScriptedLlm::new();
    let (orchestrator, _dirs) =
        campaign_fixture("no-answer", driver.clone(), llm, ScriptedTranscriber::default());

    orchestrator.store().add_contact("Max", "+100").unwrap();
    let contact_id = orchestrator.store().contact_ids().unwrap()[0];

    // The callee never picks up; fail the leg shortly after it appears.
    let watcher_driver = driver.clone();
    let watcher = std::thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let leg = watcher_driver
                .try_endpoint()
                .and_then(|endpoint| endpoint.placed_legs().first().cloned());
            if let Some(leg) = leg {
                leg.peer_hangup();
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    });

    orchestrator.call_contact(contact_id).unwrap();
    watcher.join().unwrap();

    let status = orchestrator
        .store()
        .get_status("survey", contact_id)
        .unwrap()
        .unwrap();
    assert_eq!(status.num_attempts, 1);
    assert_eq!(status.outcome, ContactOutcome::NotReached);
}

#[test]
fn call_contacts_skips_reached_and_exhausted_contacts() {
    let driver = Arc::new(LoopbackDriver::new());
    let llm = ScriptedLlm::new()
        .verdicts(["NO", "YES"])
        .filters([("caller name", "Max")])
        .utterances(["What is your name, please?"]);
    let (orchestrator, _dirs) = campaign_fixture(
        "skip",
        driver.clone(),
        llm,
        ScriptedTranscriber::fixed("I am Max"),
    );

    orchestrator.store().add_contact("Max", "+100").unwrap();
    let contact_id = orchestrator.store().contact_ids().unwrap()[0];

    driver.push_capture(vec![8_000; 240]);
    driver.push_capture(vec![50; 240]);
    orchestrator.call_contact(contact_id).unwrap();
    assert_eq!(
        orchestrator
            .store()
            .get_status("survey", contact_id)
            .unwrap()
            .unwrap()
            .outcome,
        ContactOutcome::Completed
    );

    // The scripted LLM is exhausted; if a second dialogue ran it would
    // surface errors and flip the status. Skipping leaves it untouched.
    orchestrator.call_contacts(None, Some(3)).unwrap();
    let status = orchestrator
        .store()
        .get_status("survey", contact_id)
        .unwrap()
        .unwrap();
    assert_eq!(status.num_attempts, 1);
    assert_eq!(status.outcome, ContactOutcome::Completed);

    // Invalid ids are skipped without erroring.
    orchestrator.call_contacts(Some(vec![999]), None).unwrap();
}

#[test]
fn llm_failure_during_dialogue_marks_the_contact_aborted() {
    let driver = Arc::new(LoopbackDriver::new());
    // No scripted responses at all: the first engine step fails.
    let llm = ScriptedLlm::new();
    let (orchestrator, _dirs) = campaign_fixture(
        "llm-failure",
        driver.clone(),
        llm,
        ScriptedTranscriber::default(),
    );

    orchestrator.store().add_contact("Max", "+100").unwrap();
    let contact_id = orchestrator.store().contact_ids().unwrap()[0];
    orchestrator.call_contact(contact_id).unwrap();

    let status = orchestrator
        .store()
        .get_status("survey", contact_id)
        .unwrap()
        .unwrap();
    assert_eq!(status.outcome, ContactOutcome::Aborted);
}
