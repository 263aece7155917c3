//! End-to-end engine scenarios over scripted LLM responses.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use ringdown::conversation::ConversationConfig;
use ringdown::engine::{
    ConversationEngine, ExtractionStatus, Fragment, FragmentKind, FunctionRegistry, prompts,
};
use ringdown::test_utils::ScriptedLlm;
use std::sync::Arc;

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

fn survey_engine(llm: ScriptedLlm) -> ConversationEngine {
    let config = ConversationConfig::from_yaml_str(SURVEY).unwrap();
    ConversationEngine::new(
        &config,
        Arc::new(llm),
        Arc::new(FunctionRegistry::new()),
        None,
    )
}

fn read_fragment(text: &str) -> Fragment {
    Fragment {
        text: text.to_owned(),
        kind: FragmentKind::Read,
    }
}

#[test]
fn happy_path_extracts_and_completes() {
    let llm = ScriptedLlm::new().verdicts(["YES"]).filters([("caller name", "Max")]);
    let mut engine = survey_engine(llm);

    let fragments = engine.step("I am Max").unwrap();
    assert_eq!(
        fragments,
        vec![read_fragment("Hi\n"), read_fragment("Thanks\n")]
    );
    assert_eq!(engine.status(), ExtractionStatus::Completed);

    let information = engine.information();
    assert_eq!(information.len(), 1);
    assert_eq!(information["name"].as_deref(), Some("Max"));
}

#[test]
fn off_topic_input_is_redirected() {
    let llm = ScriptedLlm::new()
        .verdicts(["NO"])
        .utterances(["Happy to chat, but first: what is your name?"]);
    let mut engine = survey_engine(llm);

    let fragments = engine.step("tell me a joke").unwrap();
    assert_eq!(fragments[0], read_fragment("Hi\n"));
    assert_eq!(fragments[1].kind, FragmentKind::Information);
    assert!(fragments[1].text.contains("what is your name"));
    assert_eq!(engine.status(), ExtractionStatus::InProgress);
    assert!(engine.information().is_empty());
}

#[test]
fn uncomfortable_caller_reaches_the_aborted_path() {
    let llm = ScriptedLlm::new().verdicts(["ABORT"]);
    let mut engine = survey_engine(llm);

    let fragments = engine.step("leave me alone").unwrap();
    assert_eq!(
        fragments.last().unwrap(),
        &read_fragment("Sorry, goodbye\n")
    );
    assert_eq!(engine.status(), ExtractionStatus::Aborted);
}

#[test]
fn terminal_status_is_sticky() {
    let llm = ScriptedLlm::new().verdicts(["ABORT"]);
    let mut engine = survey_engine(llm);
    engine.step("leave me alone").unwrap();
    assert_eq!(engine.status(), ExtractionStatus::Aborted);

    // Further steps are no-ops and can never flip the status.
    assert!(engine.step("wait, I changed my mind").unwrap().is_empty());
    assert!(engine.step("").unwrap().is_empty());
    assert_eq!(engine.status(), ExtractionStatus::Aborted);
}

#[test]
fn choice_selects_the_matching_branch() {
    let config = ConversationConfig::from_yaml_str(
        r#"
conversation_title: drinks
conversation_paths:
  entry:
    - type: choice
      choice: coffee or tea?
      options:
        coffee:
          - type: read
            text: "☕"
        tea:
          - type: read
            text: "🍵"
  aborted:
    - type: read
      text: Sorry, goodbye
"#,
    )
    .unwrap();

    let llm = ScriptedLlm::new().verdicts(["tea"]);
    let mut engine = ConversationEngine::new(
        &config,
        Arc::new(llm),
        Arc::new(FunctionRegistry::new()),
        None,
    );
    let fragments = engine.step("I'd like tea please").unwrap();
    assert_eq!(fragments, vec![read_fragment("🍵\n")]);
    assert_eq!(engine.status(), ExtractionStatus::Completed);
}

#[test]
fn unclear_choice_elicits_again() {
    let config = ConversationConfig::from_yaml_str(
        r#"
conversation_title: drinks
conversation_paths:
  entry:
    - type: choice
      choice: coffee or tea?
      options:
        coffee:
          - type: read
            text: "☕"
        tea:
          - type: read
            text: "🍵"
  aborted:
    - type: read
      text: Sorry, goodbye
"#,
    )
    .unwrap();

    let llm = ScriptedLlm::new()
        .verdicts(["##NONE##"])
        .utterances(["Coffee or tea, which would you like?"]);
    let mut engine = ConversationEngine::new(
        &config,
        Arc::new(llm),
        Arc::new(FunctionRegistry::new()),
        None,
    );
    let fragments = engine.step("hmm").unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].kind, FragmentKind::Choice);
    assert_eq!(engine.status(), ExtractionStatus::InProgress);

    // The walker stays on the choice item: the next step consults the
    // classifier again (whose script is now exhausted).
    assert!(engine.step("coffee").is_err());
}

#[test]
fn unknown_choice_verdict_recovers_through_aborted_path() {
    let config = ConversationConfig::from_yaml_str(
        r#"
conversation_title: drinks
conversation_paths:
  entry:
    - type: choice
      choice: coffee or tea?
      options:
        coffee:
          - type: read
            text: "☕"
        tea:
          - type: read
            text: "🍵"
  aborted:
    - type: read
      text: Sorry, goodbye
"#,
    )
    .unwrap();

    let llm = ScriptedLlm::new().verdicts(["lemonade"]);
    let mut engine = ConversationEngine::new(
        &config,
        Arc::new(llm),
        Arc::new(FunctionRegistry::new()),
        None,
    );
    let fragments = engine.step("surprise me").unwrap();
    assert_eq!(fragments, vec![read_fragment("Sorry, goodbye\n")]);
    assert_eq!(engine.status(), ExtractionStatus::Aborted);
}

#[test]
fn failed_filter_stores_a_null_value() {
    let llm = ScriptedLlm::new().verdicts(["YES"]).filters([("caller name", "##FAILED##")]);
    let mut engine = survey_engine(llm);
    engine.step("yes yes whatever").unwrap();
    assert_eq!(engine.status(), ExtractionStatus::Completed);

    let information = engine.information();
    assert!(information.contains_key("name"));
    assert_eq!(information["name"], None);
}

#[test]
fn chained_informations_suspend_per_item() {
    let config = ConversationConfig::from_yaml_str(
        r#"
conversation_title: intake
conversation_paths:
  entry:
    - type: information
      interactive: true
      title: name
      description: caller name
      format: text
    - type: information
      interactive: true
      title: age
      description: caller age
      format: number
    - type: read
      text: All done
  aborted:
    - type: read
      text: Sorry, goodbye
"#,
    )
    .unwrap();

    let llm = ScriptedLlm::new()
        .verdicts(["YES", "NO", "YES"])
        .filters([("caller name", "Max"), ("caller age", "42")])
        .utterances(["And how old are you?"]);
    let mut engine = ConversationEngine::new(
        &config,
        Arc::new(llm),
        Arc::new(FunctionRegistry::new()),
        None,
    );

    // Name verified; the walker re-enters at the age item, whose verify
    // says NO, so one elicitation comes back.
    let fragments = engine.step("I am Max").unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].kind, FragmentKind::Information);
    assert_eq!(engine.status(), ExtractionStatus::InProgress);

    let fragments = engine.step("I am 42 years old").unwrap();
    assert_eq!(fragments, vec![read_fragment("All done\n")]);
    assert_eq!(engine.status(), ExtractionStatus::Completed);

    let information = engine.information();
    assert_eq!(information["name"].as_deref(), Some("Max"));
    assert_eq!(information["age"].as_deref(), Some("42"));
}

#[test]
fn verify_prompt_carries_description_and_input() {
    let llm = Arc::new(ScriptedLlm::new().verdicts(["YES"]).filters([("caller name", "Max")]));
    let config = ConversationConfig::from_yaml_str(SURVEY).unwrap();
    let mut engine = ConversationEngine::new(
        &config,
        llm.clone(),
        Arc::new(FunctionRegistry::new()),
        None,
    );
    engine.step("I am Max").unwrap();
    // Force the filter to finish so its invocation is recorded too.
    let _ = engine.information();

    let recorded = llm.recorded();
    let verify = recorded
        .iter()
        .find(|r| r.system_prompts.first().map(String::as_str) == Some(prompts::VERIFY_INFORMATION))
        .expect("verify invocation recorded");
    assert_eq!(verify.user_input.as_deref(), Some("I am Max"));
    assert!(verify.system_prompts[1].contains("caller name"));

    let filter = recorded
        .iter()
        .find(|r| r.system_prompts.first().map(String::as_str) == Some(prompts::FILTER_INFORMATION))
        .expect("filter invocation recorded");
    assert_eq!(filter.user_input.as_deref(), Some("I am Max"));
    assert!(filter.system_prompts[2].contains("text"));
}
