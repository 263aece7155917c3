//! The conversation engine: a deterministic walker over scripted item
//! graphs, interleaving scripted speech, LLM prompts, information capture,
//! user choice, plugin calls, and sub-path dispatch.
//!
//! One `step` consumes one caller utterance and processes items until an
//! interactive item suspends the walk for the next utterance. Extraction
//! runs as a two-stage chain per item: a constrained classifier verdict
//! first, then either a concurrent filter task (on success) or an
//! open-ended elicitation utterance.

pub mod prompts;
pub mod registry;

pub use registry::{FunctionRegistry, InformationSnapshot, PluginFunction};

use crate::conversation::{
    ABORTED_PATH, ENTRY_PATH, ConversationConfig, ConversationItem, sanitize_identifier,
};
use crate::error::{CallError, Result};
use crate::providers::{ChatMessage, LanguageModel};
use crate::telephony::TelephonySession;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Overall extraction state of one dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStatus {
    /// The dialogue is still running.
    InProgress,
    /// Every scripted item was processed.
    Completed,
    /// The dialogue was abandoned.
    Aborted,
}

/// What produced an utterance fragment. Callers decide caching per kind;
/// only `Read` fragments are byte-stable and therefore cacheable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Read,
    Prompt,
    Information,
    Choice,
    Function,
}

/// One utterance fragment returned by a step.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub kind: FragmentKind,
}

impl Fragment {
    fn new(text: impl Into<String>, kind: FragmentKind) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }
}

/// Walker over one conversation, bound to a call.
///
/// The walker itself is single-threaded: one `step` at a time. Filter
/// tasks run concurrently and publish into the information map; readers
/// synchronize through [`ConversationEngine::information`] or a
/// `function`/`function_choice` item, both of which wait for in-flight
/// filters first.
pub struct ConversationEngine {
    paths: BTreeMap<String, Vec<ConversationItem>>,
    queue: VecDeque<ConversationItem>,
    current: Option<ConversationItem>,
    history: Vec<ChatMessage>,
    information: Arc<Mutex<InformationSnapshot>>,
    filters: Mutex<Vec<JoinHandle<()>>>,
    status: ExtractionStatus,
    llm: Arc<dyn LanguageModel>,
    functions: Arc<FunctionRegistry>,
    session: Option<TelephonySession>,
}

impl ConversationEngine {
    /// Build an engine over a deep copy of the script, starting at the
    /// `entry` path.
    pub fn new(
        config: &ConversationConfig,
        llm: Arc<dyn LanguageModel>,
        functions: Arc<FunctionRegistry>,
        session: Option<TelephonySession>,
    ) -> Self {
        let paths = config.paths.clone();
        let mut queue: VecDeque<ConversationItem> =
            paths.get(ENTRY_PATH).cloned().unwrap_or_default().into();
        let current = queue.pop_front();
        Self {
            paths,
            queue,
            current,
            history: Vec::new(),
            information: Arc::new(Mutex::new(InformationSnapshot::new())),
            filters: Mutex::new(Vec::new()),
            status: ExtractionStatus::InProgress,
            llm,
            functions,
            session,
        }
    }

    /// Process the next caller utterance and return the utterance
    /// fragments to speak.
    ///
    /// A terminal engine is a no-op returning an empty list.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Llm` (and `CallError::Config` for unknown
    /// plugin keys) from chain execution; the caller treats this as an
    /// abandoned dialogue.
    pub fn step(&mut self, user_input: &str) -> Result<Vec<Fragment>> {
        if self.status != ExtractionStatus::InProgress {
            return Ok(Vec::new());
        }
        self.process(user_input, true, false)
    }

    /// Snapshot of the extracted information.
    ///
    /// Waits for in-flight filter tasks, so every verified item has its
    /// key present (value `None` when the filter could not isolate one).
    pub fn information(&self) -> InformationSnapshot {
        self.await_filters();
        self.lock_information().clone()
    }

    /// Current extraction status.
    pub fn status(&self) -> ExtractionStatus {
        self.status
    }

    fn process(
        &mut self,
        user_input: &str,
        append_input: bool,
        aborted: bool,
    ) -> Result<Vec<Fragment>> {
        if append_input {
            self.history.push(ChatMessage::user(user_input));
        }

        let mut fragments = Vec::new();
        while let Some(item) = self.current.clone() {
            match item {
                ConversationItem::Read { ref text, .. } => {
                    let text = format!("{text}\n");
                    self.history.push(ChatMessage::assistant(text.clone()));
                    fragments.push(Fragment::new(text, FragmentKind::Read));
                }
                ConversationItem::Prompt { ref prompt, .. } => {
                    let out = self.llm.run(
                        std::slice::from_ref(prompt),
                        &self.history,
                        None,
                    )?;
                    let text = format!("{out}\n");
                    self.history.push(ChatMessage::assistant(text.clone()));
                    fragments.push(Fragment::new(text, FragmentKind::Prompt));
                }
                ConversationItem::Path { ref path, .. } => {
                    let branch = self.paths.get(path).cloned().ok_or_else(|| {
                        CallError::Config(format!("unknown conversation path '{path}'"))
                    })?;
                    self.queue = branch.into();
                }
                ConversationItem::Information {
                    ref title,
                    ref description,
                    ref format,
                    ..
                } => {
                    let mut chained = self.run_information_chain(
                        user_input,
                        title,
                        description,
                        format,
                    )?;
                    fragments.append(&mut chained);
                    return Ok(fragments);
                }
                ConversationItem::Choice {
                    ref choice,
                    ref options,
                    silent,
                    ..
                } => {
                    let mut chained =
                        self.run_choice_chain(user_input, choice, options, silent)?;
                    fragments.append(&mut chained);
                    return Ok(fragments);
                }
                ConversationItem::Function {
                    ref module,
                    ref function,
                    ..
                } => {
                    let snapshot = self.barrier_snapshot();
                    let callback = self.functions.resolve(module, function)?;
                    let out = callback(&snapshot, self.session.as_ref())?;
                    fragments.push(Fragment::new(out, FragmentKind::Function));
                }
                ConversationItem::FunctionChoice {
                    ref module,
                    ref function,
                    ref options,
                    ..
                } => {
                    let snapshot = self.barrier_snapshot();
                    let callback = self.functions.resolve(module, function)?;
                    let key = callback(&snapshot, self.session.as_ref())?;
                    let branch = options.get(&key).cloned().ok_or_else(|| {
                        CallError::Config(format!(
                            "function '{module}.{function}' selected unknown option '{key}'"
                        ))
                    })?;
                    self.queue = branch.into();
                }
            }

            // Advance. Interactive items suspend the walk for the next
            // caller utterance.
            if let Some(next) = self.queue.pop_front() {
                let suspend = item.interactive();
                self.current = Some(next);
                if suspend {
                    return Ok(fragments);
                }
            } else {
                self.current = None;
                if !aborted {
                    self.mark(ExtractionStatus::Completed);
                }
                return Ok(fragments);
            }
        }
        Ok(fragments)
    }

    /// Verify → (filter + continue | elicit | abort) for one
    /// `information` item.
    fn run_information_chain(
        &mut self,
        user_input: &str,
        title: &str,
        description: &str,
        format: &str,
    ) -> Result<Vec<Fragment>> {
        let systems = [
            prompts::VERIFY_INFORMATION.to_owned(),
            format!("Required information: {description}"),
        ];
        let verdict = self
            .llm
            .run(&systems, &self.history, Some(user_input))?;
        debug!("information verdict for '{title}': {}", verdict.trim());

        match verdict.trim() {
            "YES" => {
                self.spawn_filter(title, description, format, user_input);
                match self.queue.pop_front() {
                    Some(next) => {
                        self.current = Some(next);
                        self.process(user_input, false, false)
                    }
                    None => {
                        self.current = None;
                        self.mark(ExtractionStatus::Completed);
                        Ok(Vec::new())
                    }
                }
            }
            "NO" => {
                let systems = [
                    prompts::ELICIT_INFORMATION.to_owned(),
                    format!("Information you want to have: {description}"),
                ];
                let out = self.llm.run(&systems, &self.history, None)?;
                self.history.push(ChatMessage::assistant(out.clone()));
                Ok(vec![Fragment::new(out, FragmentKind::Information)])
            }
            _ => self.enter_aborted_path(user_input),
        }
    }

    /// Verify → (splice | elicit | abort) for one `choice` item.
    fn run_choice_chain(
        &mut self,
        user_input: &str,
        choice: &str,
        options: &BTreeMap<String, Vec<ConversationItem>>,
        silent: bool,
    ) -> Result<Vec<Fragment>> {
        let option_keys = options.keys().cloned().collect::<Vec<_>>().join(", ");
        let systems = [
            prompts::VERIFY_CHOICE.to_owned(),
            format!("Choice prompt: {choice}, Possible choices: {option_keys}"),
        ];
        let verdict = self
            .llm
            .run(&systems, &self.history, Some(user_input))?;
        let verdict = verdict.trim();
        debug!("choice verdict: {verdict}");

        if verdict == "##NONE##" {
            if silent {
                return Ok(Vec::new());
            }
            let systems = [
                prompts::ELICIT_CHOICE.to_owned(),
                format!("Choice prompt: {choice}, Possible choices: {option_keys}"),
            ];
            let out = self.llm.run(&systems, &self.history, None)?;
            self.history.push(ChatMessage::assistant(out.clone()));
            return Ok(vec![Fragment::new(out, FragmentKind::Choice)]);
        }
        if verdict == "##ABORT##" {
            return self.enter_aborted_path(user_input);
        }
        if let Some(branch) = options.get(verdict) {
            self.queue = branch.clone().into();
            return match self.queue.pop_front() {
                Some(first) => {
                    self.current = Some(first);
                    self.process(user_input, false, false)
                }
                None => Ok(Vec::new()),
            };
        }

        // The classifier was told to answer verbatim; anything else is a
        // classification failure, recovered through the aborted path so
        // the caller still hears a closing utterance.
        warn!("choice classifier returned unknown key {verdict:?}");
        self.enter_aborted_path(user_input)
    }

    /// Abandon the dialogue and play the `aborted` path.
    fn enter_aborted_path(&mut self, user_input: &str) -> Result<Vec<Fragment>> {
        self.mark(ExtractionStatus::Aborted);
        let branch = self.paths.get(ABORTED_PATH).cloned().unwrap_or_default();
        self.queue = branch.into();
        match self.queue.pop_front() {
            Some(first) => {
                self.current = Some(first);
                self.process(user_input, false, true)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Start the concurrent filter task for a verified information item.
    ///
    /// The task holds the information mutex while the filter prompt runs,
    /// so readers that acquire the mutex observe the finished value.
    fn spawn_filter(&self, title: &str, description: &str, format: &str, user_input: &str) {
        let llm = self.llm.clone();
        let information = self.information.clone();
        let column = sanitize_identifier(title);
        let systems = [
            prompts::FILTER_INFORMATION.to_owned(),
            format!("Information description: {description}"),
            format!("Information format: {format}"),
        ];
        let input = user_input.to_owned();

        let handle = std::thread::spawn(move || {
            let mut guard = information
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let value = match llm.run(&systems, &[], Some(&input)) {
                Ok(out) => {
                    let out = out.trim().to_owned();
                    if out == "##FAILED##" { None } else { Some(out) }
                }
                Err(e) => {
                    warn!("information filter for '{column}' failed: {e}");
                    None
                }
            };
            guard.insert(column, value);
        });
        self.filters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }

    /// Wait for in-flight filters, then snapshot the information map.
    fn barrier_snapshot(&self) -> InformationSnapshot {
        self.await_filters();
        self.lock_information().clone()
    }

    fn await_filters(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut filters = self
                .filters
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            filters.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn lock_information(&self) -> std::sync::MutexGuard<'_, InformationSnapshot> {
        self.information
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Status transitions are monotonic: terminal states are sticky.
    fn mark(&mut self, status: ExtractionStatus) {
        if self.status == ExtractionStatus::InProgress {
            self.status = status;
        }
    }
}
