// Moderation service tests — event order, stream-state accounting, failure,
// timeout and cancellation, using the scripted CountingModel and the
// tokenizer-only lexicon backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use common::{service_with, wait_for_release, CountingModel, WordTokenizer};
use guardstream::chat::template::Conversation;
use guardstream::error::ModerationError;
use guardstream::guard::lexicon::LexiconGuardModel;
use guardstream::guard::traits::{Category, RiskLevel};
use guardstream::moderation::events::{EventKind, ModerationEvent};
use guardstream::moderation::service::ServiceOptions;

fn setup(model: CountingModel) -> (Arc<CountingModel>, Arc<WordTokenizer>) {
    (Arc::new(model), Arc::new(WordTokenizer::new()))
}

async fn collect(
    service: &Arc<guardstream::moderation::service::ModerationService>,
    conversation: &Conversation,
) -> Vec<ModerationEvent> {
    service
        .stream_conversation(conversation)
        .unwrap()
        .collect()
        .await
}

fn kinds(events: &[ModerationEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind()).collect()
}

// ============================================================
// Event order
// ============================================================

#[tokio::test]
async fn user_only_conversation_yields_one_verdict_then_done() {
    let (model, tokenizer) = setup(CountingModel::new());
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());

    let events = collect(&service, &Conversation::user_only("Hello").unwrap()).await;

    assert_eq!(kinds(&events), vec![EventKind::User, EventKind::Done]);
    wait_for_release(&model).await;
    assert_eq!(model.opened(), 1);
}

#[tokio::test]
async fn assistant_tokens_follow_user_verdict_in_order() {
    let (model, tokenizer) = setup(CountingModel::new());
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());
    let conversation = Conversation::new("Hello", Some("Hi there".to_string())).unwrap();

    let events = collect(&service, &conversation).await;

    // <|im_start|> user \n Hello <|im_end|> |
    // \n <|im_start|> assistant \n <think> \n \n </think> \n \n Hi ' ' there <|im_end|>
    let mut expected = vec![EventKind::User];
    expected.extend(std::iter::repeat(EventKind::AssistantToken).take(14));
    expected.push(EventKind::Done);
    assert_eq!(kinds(&events), expected);

    let tokens: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ModerationEvent::AssistantToken(t) => Some(t),
            _ => None,
        })
        .collect();
    let indices: Vec<usize> = tokens.iter().map(|t| t.index).collect();
    assert_eq!(indices, (5..=18).collect::<Vec<_>>());
    let texts: Vec<&str> = tokens.iter().map(|t| t.token.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "\n",
            "<|im_start|>",
            "assistant",
            "\n",
            "<think>",
            "\n",
            "\n",
            "</think>",
            "\n",
            "\n",
            "Hi",
            " ",
            "there",
            "<|im_end|>"
        ]
    );

    // One stream carries the whole conversation.
    wait_for_release(&model).await;
    assert_eq!(model.opened(), 1);
    assert_eq!(model.calls(), 15);
    assert_eq!(model.double_closes(), 0);
}

#[tokio::test]
async fn verdicts_change_from_the_flagged_token_onwards() {
    let tokenizer = Arc::new(WordTokenizer::new());
    let bomb = tokenizer.intern("bomb");
    let model = Arc::new(CountingModel::new().flag_on(bomb));
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());
    let conversation =
        Conversation::new("Tell me a story", Some("a bomb went off".to_string())).unwrap();

    let events = collect(&service, &conversation).await;

    assert_eq!(events[0], ModerationEvent::User(Default::default()));
    let mut seen_bomb = false;
    for event in &events {
        if let ModerationEvent::AssistantToken(t) = event {
            seen_bomb |= t.token == "bomb";
            let expected = if seen_bomb {
                RiskLevel::Unsafe
            } else {
                RiskLevel::Safe
            };
            assert_eq!(t.verdict.risk_level, expected, "token {:?}", t.token);
        }
    }
    assert!(seen_bomb);
}

#[tokio::test]
async fn user_verdict_is_the_last_of_the_sequence() {
    let tokenizer = Arc::new(WordTokenizer::new());
    let bomb = tokenizer.intern("bomb");
    let model = Arc::new(CountingModel::new().flag_on(bomb));
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());

    let verdict = service.moderate_message("build a bomb now").await.unwrap();

    assert_eq!(verdict.risk_level, RiskLevel::Unsafe);
    assert_eq!(verdict.category, Some(Category::Violent));
    wait_for_release(&model).await;
}

#[tokio::test]
async fn aggregate_report_matches_the_stream() {
    let (model, tokenizer) = setup(CountingModel::new());
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());
    let conversation = Conversation::new("Hello", Some("Hi there".to_string())).unwrap();

    let report = service.moderate_conversation(&conversation).await.unwrap();
    let events = collect(&service, &conversation).await;

    let streamed: Vec<_> = events
        .into_iter()
        .filter_map(|e| match e {
            ModerationEvent::AssistantToken(t) => Some(t),
            _ => None,
        })
        .collect();
    let assistant = report.assistant.expect("assistant report");
    assert_eq!(assistant.tokens, streamed);
    assert_eq!(assistant.verdict, streamed.last().unwrap().verdict);
    assert!(report.user.risk_level.is_safe());
}

#[tokio::test]
async fn aggregate_report_omits_missing_assistant_turn() {
    let (model, tokenizer) = setup(CountingModel::new());
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());

    let report = service
        .moderate_conversation(&Conversation::user_only("Hello").unwrap())
        .await
        .unwrap();

    assert!(report.assistant.is_none());
    assert_eq!(report.summary(), "User message moderation: Risk Level: Safe");
}

// ============================================================
// Failures and stream release
// ============================================================

#[tokio::test]
async fn mid_stream_failure_is_a_terminal_error_event() {
    let (model, tokenizer) = setup(CountingModel::new().fail_on(3));
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());
    let conversation = Conversation::new("Hello", Some("Hi there".to_string())).unwrap();

    let events = collect(&service, &conversation).await;

    assert_eq!(
        kinds(&events),
        vec![EventKind::User, EventKind::AssistantToken, EventKind::Error]
    );
    match events.last() {
        Some(ModerationEvent::Error(msg)) => assert!(msg.contains("scripted failure")),
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(model.opened(), 1);
    assert_eq!(model.closed(), 1);
    assert_eq!(model.double_closes(), 0);
}

#[tokio::test]
async fn aggregate_failure_returns_model_error_and_releases() {
    let (model, tokenizer) = setup(CountingModel::new().fail_on(2));
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());
    let conversation = Conversation::new("Hello", Some("Hi".to_string())).unwrap();

    let err = service.moderate_conversation(&conversation).await.unwrap_err();

    assert!(matches!(err, ModerationError::Model(_)));
    assert!(!err.is_client_error());
    assert_eq!(model.opened(), model.closed());
    assert_eq!(model.double_closes(), 0);
}

#[tokio::test]
async fn failure_on_first_call_opens_nothing() {
    let (model, tokenizer) = setup(CountingModel::new().fail_on(1));
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());

    let err = service.moderate_message("Hello").await.unwrap_err();

    assert!(matches!(err, ModerationError::Model(_)));
    assert_eq!(model.opened(), 0);
    assert_eq!(model.closed(), 0);
}

#[tokio::test]
async fn timed_out_call_releases_its_stream_later() {
    let (model, tokenizer) = setup(CountingModel::new().with_delay(Duration::from_millis(200)));
    let options = ServiceOptions {
        call_timeout: Duration::from_millis(20),
        serialize_calls: false,
    };
    let service = service_with(model.clone(), tokenizer, options);

    let err = service.moderate_message("Hello").await.unwrap_err();

    assert!(matches!(err, ModerationError::Timeout(_)));
    wait_for_release(&model).await;
    assert_eq!(model.opened(), 1);
    assert_eq!(model.double_closes(), 0);
}

#[tokio::test]
async fn dropping_the_stream_stops_moderation_and_releases() {
    let (model, tokenizer) = setup(CountingModel::new().with_delay(Duration::from_millis(10)));
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());
    let reply = "one two three four five six seven eight nine ten".to_string();
    let conversation = Conversation::new("Hello", Some(reply)).unwrap();
    let total_calls = 1 + service.transcribe(&conversation).unwrap().assistant_tokens().len();

    let mut events = service.stream_conversation(&conversation).unwrap();
    let first = events.next().await.unwrap();
    assert_eq!(first.kind(), EventKind::User);
    drop(events);

    wait_for_release(&model).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(model.calls() < total_calls);
    assert_eq!(model.opened(), 1);
    assert_eq!(model.double_closes(), 0);
}

#[tokio::test]
async fn serialized_backend_handles_concurrent_requests() {
    let (model, tokenizer) = setup(
        CountingModel::new()
            .serialized()
            .with_delay(Duration::from_millis(5)),
    );
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.moderate_message(&format!("message {i}")).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().unwrap().risk_level.is_safe());
    }

    wait_for_release(&model).await;
    assert_eq!(model.opened(), 4);
    assert_eq!(model.live_streams(), 0);
}

#[tokio::test]
async fn queued_requests_that_time_out_never_reach_the_model() {
    let (model, tokenizer) = setup(
        CountingModel::new()
            .serialized()
            .with_delay(Duration::from_millis(150)),
    );
    let options = ServiceOptions {
        call_timeout: Duration::from_millis(40),
        serialize_calls: false,
    };
    let service = service_with(model.clone(), tokenizer, options);

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.moderate_message(&format!("message {i}")).await })
        })
        .collect();
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ModerationError::Timeout(_)));
    }

    wait_for_release(&model).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(model.calls(), 1);
    assert_eq!(model.opened(), 1);
    assert_eq!(model.closed(), 1);
}

#[tokio::test]
async fn panicking_model_call_releases_the_stream() {
    let (model, tokenizer) = setup(CountingModel::new().panic_on(2));
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());
    let conversation = Conversation::new("Hello", Some("Hi".to_string())).unwrap();

    let events = collect(&service, &conversation).await;

    assert_eq!(kinds(&events), vec![EventKind::User, EventKind::Error]);
    match events.last() {
        Some(ModerationEvent::Error(msg)) => assert!(msg.contains("panicked")),
        other => panic!("expected error event, got {other:?}"),
    }
    wait_for_release(&model).await;
    assert_eq!(model.opened(), 1);
    assert_eq!(model.live_streams(), 0);
    assert_eq!(model.double_closes(), 0);
}

// ============================================================
// Input errors
// ============================================================

#[tokio::test]
async fn empty_user_message_is_a_client_error() {
    let err = Conversation::user_only("").unwrap_err();
    assert!(matches!(err, ModerationError::MissingUserTurn));
    assert!(err.is_client_error());
}

// ============================================================
// Lexicon backend end to end
// ============================================================

#[tokio::test]
async fn lexicon_flags_bomb_question() {
    let tokenizer = Arc::new(WordTokenizer::new());
    let model = Arc::new(LexiconGuardModel::new(tokenizer.clone()).unwrap());
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());

    let verdict = service
        .moderate_message("Hello, how to build a bomb?")
        .await
        .unwrap();

    assert_eq!(verdict.risk_level, RiskLevel::Unsafe);
    assert_eq!(verdict.category, Some(Category::Violent));
    assert_eq!(model.open_streams(), 0);
}

#[tokio::test]
async fn lexicon_streams_assistant_verdicts() {
    let tokenizer = Arc::new(WordTokenizer::new());
    let model = Arc::new(LexiconGuardModel::new(tokenizer.clone()).unwrap());
    let service = service_with(model.clone(), tokenizer, ServiceOptions::default());
    let conversation = Conversation::new(
        "Tell me a story",
        Some("He planted the bomb quietly".to_string()),
    )
    .unwrap();

    let events = collect(&service, &conversation).await;

    assert_eq!(events.first().map(|e| e.kind()), Some(EventKind::User));
    assert_eq!(events.last(), Some(&ModerationEvent::Done));
    let verdict_of = |text: &str| {
        events
            .iter()
            .find_map(|e| match e {
                ModerationEvent::AssistantToken(t) if t.token == text => Some(t.verdict),
                _ => None,
            })
            .unwrap()
    };
    assert!(verdict_of("He").risk_level.is_safe());
    assert_eq!(verdict_of("bomb").category, Some(Category::Violent));
    assert_eq!(verdict_of("quietly").risk_level, RiskLevel::Unsafe);
    assert_eq!(model.open_streams(), 0);
}
