use std::sync::Arc;

use tokio::sync::Notify;

use super::*;
use crate::core::chat_stream::CancelReason;
use crate::core::entry::TRANSLATE_CODE;
use crate::utils::test_utils::{
    create_test_controller, create_test_model, create_test_persistence, ScriptedClient,
    ScriptedReply,
};

fn contents(messages: &[Message]) -> Vec<(&str, &str)> {
    messages
        .iter()
        .map(|m| (m.role.as_str(), m.content.as_str()))
        .collect()
}

fn message_at(mut message: Message, timestamp: i64) -> Message {
    message.timestamp = timestamp;
    message
}

fn controller_with_sessions(
    client: Arc<ScriptedClient>,
    sessions: &[(&str, Vec<Message>)],
) -> ConversationController {
    let mut persistence = create_test_persistence();
    for (id, messages) in sessions {
        persistence
            .save_session(id, messages, 0)
            .expect("seed session");
    }
    ConversationController::new(persistence, client, RequestOptions::default())
        .expect("create controller")
}

#[tokio::test]
async fn successful_send_appends_user_and_reply() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["hel", "lo"]));
    let mut controller = create_test_controller(client.clone());

    let outcome = controller.send_message("hi").await.expect("send");

    assert_eq!(
        outcome,
        SendOutcome::Completed {
            content: "hello".to_string()
        }
    );
    assert_eq!(
        contents(controller.messages()),
        vec![("user", "hi"), ("assistant", "hello")]
    );
    assert_eq!(controller.state(), GenerationState::Idle);

    let id = controller.session().expect("active session").id.clone();
    let stored = controller
        .persistence()
        .load_session(&id)
        .expect("load")
        .expect("stored");
    assert_eq!(stored, controller.messages());
    assert_eq!(client.last_request_messages(), vec![("user".to_string(), "hi".to_string())]);
}

#[tokio::test]
async fn each_send_grows_transcript_by_two() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["one"]));
    client.push(ScriptedReply::Chunks(vec!["two"]));
    let mut controller = create_test_controller(client.clone());

    controller.send_message("first").await.expect("send");
    let before = controller.messages().len();
    controller.send_message("second").await.expect("send");

    assert_eq!(controller.messages().len(), before + 2);
    let history = client.last_request_messages();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2], ("user".to_string(), "second".to_string()));
}

#[tokio::test]
async fn placeholder_is_visible_before_streaming_completes() {
    let client = ScriptedClient::new();
    let gate = Arc::new(Notify::new());
    client.push(ScriptedReply::Gated {
        gate: gate.clone(),
        text: "hello",
    });
    let mut controller = create_test_controller(client);
    let mut events = controller.subscribe();

    let observer = async {
        let mut latest = Vec::new();
        loop {
            match events.recv().await.expect("event") {
                SessionEvent::TranscriptChanged { messages, .. } => latest = messages,
                SessionEvent::GenerationChanged(GenerationState::Streaming) => break,
                _ => {}
            }
        }
        gate.notify_one();
        latest
    };
    let (result, during) = tokio::join!(controller.send_message("hi"), observer);

    assert_eq!(contents(&during), vec![("user", "hi"), ("assistant", "")]);
    assert!(during[1].is_pending_placeholder());
    assert!(result.is_ok());
    assert_eq!(
        contents(controller.messages()),
        vec![("user", "hi"), ("assistant", "hello")]
    );
}

#[tokio::test]
async fn sending_without_a_model_changes_nothing() {
    let client = ScriptedClient::new();
    let mut controller = ConversationController::new(
        Persistence::new(crate::core::store::MemoryStore::new()),
        client.clone(),
        RequestOptions::default(),
    )
    .expect("create controller");

    let result = controller.send_message("hi").await;

    assert!(matches!(result, Err(ChatError::NoCurrentModel)));
    assert!(controller.session().is_none());
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn blank_messages_are_rejected() {
    let client = ScriptedClient::new();
    let mut controller = create_test_controller(client.clone());

    let result = controller.send_message("   ").await;

    assert!(matches!(result, Err(ChatError::EmptyMessage)));
    assert!(controller.messages().is_empty());
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn retry_removes_old_reply_before_streaming_new_one() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["b"]));
    client.push(ScriptedReply::Chunks(vec!["c"]));
    let mut controller = create_test_controller(client.clone());
    controller.send_message("a").await.expect("send");
    let mut events = controller.subscribe();

    let outcome = controller.retry_message(1).await.expect("retry");

    assert_eq!(
        outcome,
        SendOutcome::Completed {
            content: "c".to_string()
        }
    );
    assert_eq!(
        contents(controller.messages()),
        vec![("user", "a"), ("assistant", "c")]
    );
    assert_eq!(client.last_request_messages(), vec![("user".to_string(), "a".to_string())]);

    let first_snapshot = loop {
        if let SessionEvent::TranscriptChanged { messages, .. } = events.recv().await.expect("event")
        {
            break messages;
        }
    };
    assert_eq!(contents(&first_snapshot), vec![("user", "a"), ("assistant", "")]);
}

#[tokio::test]
async fn retry_uses_nearest_prior_user_message() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["new"]));
    let mut controller = controller_with_sessions(
        client.clone(),
        &[(
            "100",
            vec![
                Message::user("q1"),
                Message::assistant("r1"),
                Message::user("q2"),
                Message::assistant("r2"),
                Message::assistant("r2b"),
            ],
        )],
    );
    controller.load_chat_session("100").expect("load");

    controller.retry_message(3).await.expect("retry");

    let history: Vec<_> = client
        .last_request_messages()
        .into_iter()
        .map(|(_, content)| content)
        .collect();
    assert_eq!(history, vec!["q1", "r1", "q2"]);
    assert_eq!(
        contents(controller.messages()),
        vec![
            ("user", "q1"),
            ("assistant", "r1"),
            ("user", "q2"),
            ("assistant", "r2b"),
            ("assistant", "new"),
        ]
    );
}

#[tokio::test]
async fn retry_without_prior_user_message_leaves_transcript_unchanged() {
    let client = ScriptedClient::new();
    let mut controller = controller_with_sessions(
        client.clone(),
        &[(
            "100",
            vec![
                Message::system("sys"),
                Message::assistant("greeting"),
                Message::user("q"),
            ],
        )],
    );
    controller.load_chat_session("100").expect("load");
    let before = controller.messages().to_vec();

    let result = controller.retry_message(1).await;
    assert!(matches!(
        result,
        Err(ChatError::NoCorrespondingUserMessage(1))
    ));

    let result = controller.retry_message(2).await;
    assert!(matches!(result, Err(ChatError::NotAnAssistantMessage(2))));

    let result = controller.retry_message(9).await;
    assert!(matches!(result, Err(ChatError::InvalidMessageIndex(9))));

    assert_eq!(controller.messages(), before.as_slice());
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn abort_keeps_partial_text_without_error_message() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::UntilAborted { partial: "par" });
    let mut controller = create_test_controller(client);
    let abort = controller.abort_handle();
    let mut events = controller.subscribe();

    let observer = async {
        loop {
            if let SessionEvent::Progress { .. } = events.recv().await.expect("event") {
                break;
            }
        }
        abort.abort();
    };
    let (result, ()) = tokio::join!(controller.send_message("hi"), observer);

    assert_eq!(
        result.expect("cancel is not an error"),
        SendOutcome::Cancelled(CancelReason::User)
    );
    assert_eq!(
        contents(controller.messages()),
        vec![("user", "hi"), ("assistant", "par")]
    );
    assert_eq!(controller.state(), GenerationState::Idle);

    let id = controller.session().expect("session").id.clone();
    let stored = controller.persistence().load_session(&id).unwrap().unwrap();
    assert_eq!(stored[1].content, "par");
}

#[tokio::test]
async fn superseded_reply_is_reported_as_cancelled() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Fail(StreamError::Cancelled(
        CancelReason::Superseded,
    )));
    let mut controller = create_test_controller(client);

    let outcome = controller.send_message("hi").await.expect("not an error");

    assert_eq!(outcome, SendOutcome::Cancelled(CancelReason::Superseded));
    assert_eq!(
        contents(controller.messages()),
        vec![("user", "hi"), ("assistant", "")]
    );
}

#[tokio::test]
async fn transport_error_replaces_placeholder_with_error_reply() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Fail(StreamError::Http {
        status: 401,
        body: "bad key".to_string(),
    }));
    let mut controller = create_test_controller(client);

    let result = controller.send_message("hi").await;

    assert!(matches!(
        result,
        Err(ChatError::Stream(StreamError::Http { status: 401, .. }))
    ));
    let messages = controller.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[1].content,
        "An error occurred: API request failed with status 401: bad key"
    );
    assert_eq!(controller.state(), GenerationState::Idle);

    let id = controller.session().expect("session").id.clone();
    let stored = controller.persistence().load_session(&id).unwrap().unwrap();
    assert_eq!(stored, messages);
}

#[tokio::test]
async fn reasoning_is_kept_and_thinking_flag_cleared() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Reasoning {
        reasoning: "let me think",
        content: "42",
    });
    let mut controller = create_test_controller(client);
    let mut events = controller.subscribe();

    controller.send_message("answer?").await.expect("send");

    let reply = &controller.messages()[1];
    assert_eq!(reply.content, "42");
    assert_eq!(reply.reasoning_content.as_deref(), Some("let me think"));
    assert!(!reply.is_thinking);

    let mut saw_thinking = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Progress { progress, index, .. } = event {
            assert_eq!(index, 1);
            saw_thinking |= progress.is_thinking;
        }
    }
    assert!(saw_thinking);
}

#[tokio::test]
async fn system_prompt_update_is_idempotent() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["ok"]));
    let mut controller = create_test_controller(client.clone());
    let id = controller.create_new_chat();
    assert!(controller.messages().is_empty());

    controller.update_system_prompt("be brief").expect("update");
    let once = controller.messages().to_vec();
    controller.update_system_prompt("be brief").expect("update");

    assert_eq!(controller.messages(), once.as_slice());
    assert_eq!(contents(controller.messages()), vec![("system", "be brief")]);
    assert!(!controller.persistence().has_session(&id).unwrap());

    controller.send_message("hi").await.expect("send");
    assert_eq!(
        client.last_request_messages()[0],
        ("system".to_string(), "be brief".to_string())
    );

    controller.update_system_prompt("be verbose").expect("update");
    assert_eq!(controller.messages()[0].content, "be verbose");
    assert_eq!(
        controller
            .messages()
            .iter()
            .filter(|m| m.is_system())
            .count(),
        1
    );

    controller.update_system_prompt("  ").expect("update");
    let stored = controller.persistence().load_session(&id).unwrap().unwrap();
    assert_eq!(contents(&stored), vec![("user", "hi"), ("assistant", "ok")]);
}

#[tokio::test]
async fn edit_offers_retry_for_answered_user_message() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["b"]));
    let mut controller = create_test_controller(client);
    controller.send_message("a").await.expect("send");

    let outcome = controller.edit_message(0, "a2").expect("edit");
    assert_eq!(outcome.retry_candidate, Some(1));

    let outcome = controller.edit_message(1, "b2").expect("edit");
    assert_eq!(outcome.retry_candidate, None);

    assert_eq!(
        contents(controller.messages()),
        vec![("user", "a2"), ("assistant", "b2")]
    );
    assert!(matches!(
        controller.edit_message(5, "x"),
        Err(ChatError::InvalidMessageIndex(5))
    ));
}

#[tokio::test]
async fn deleting_every_message_reports_empty_transcript() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["b"]));
    let mut controller = create_test_controller(client);
    controller.send_message("a").await.expect("send");
    let id = controller.session().expect("session").id.clone();

    let outcome = controller.delete_message(0).expect("delete");
    assert!(!outcome.transcript_empty);
    assert_eq!(contents(controller.messages()), vec![("assistant", "b")]);

    let outcome = controller.delete_message(0).expect("delete");
    assert!(outcome.transcript_empty);
    assert!(!controller.persistence().has_session(&id).unwrap());
    assert!(controller.persistence().list_sessions().unwrap().is_empty());
    assert!(!controller.sessions().contains(&id));
}

#[tokio::test]
async fn new_chat_is_stored_only_after_a_message() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["hello"]));
    let mut persistence = create_test_persistence();
    persistence
        .save_models(&[create_test_model().with_system_prompt("  be kind  ")])
        .unwrap();
    let mut controller =
        ConversationController::new(persistence, client, RequestOptions::default()).unwrap();

    let id = controller.create_new_chat();
    assert_eq!(contents(controller.messages()), vec![("system", "be kind")]);
    assert_eq!(controller.sessions().entries()[0].id, id);
    assert!(controller.persistence().list_sessions().unwrap().is_empty());

    controller.send_message("hi").await.expect("send");
    let stored = controller.persistence().list_sessions().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, id);
}

#[tokio::test]
async fn editing_a_fresh_chat_prompt_does_not_store_it() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["hello"]));
    let mut persistence = create_test_persistence();
    persistence
        .save_models(&[create_test_model().with_system_prompt("be brief")])
        .unwrap();
    let mut controller =
        ConversationController::new(persistence, client, RequestOptions::default()).unwrap();

    controller.create_new_chat();
    let outcome = controller.edit_message(0, "be terse").expect("edit");
    assert_eq!(outcome.retry_candidate, None);
    assert_eq!(contents(controller.messages()), vec![("system", "be terse")]);
    assert!(controller.persistence().list_sessions().unwrap().is_empty());

    controller.send_message("hi").await.expect("send");
    let stored = controller.persistence().list_sessions().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].messages[0].content, "be terse");

    let draft = controller.create_new_chat();
    let outcome = controller.delete_message(0).expect("delete");
    assert!(outcome.transcript_empty);
    assert!(!controller.persistence().has_session(&draft).unwrap());
    assert_eq!(controller.persistence().list_sessions().unwrap().len(), 1);
}

#[tokio::test]
async fn switching_away_from_an_unsent_chat_drops_it_from_the_list() {
    let client = ScriptedClient::new();
    let mut controller =
        controller_with_sessions(client, &[("100", vec![Message::user("old")])]);

    let draft = controller.create_new_chat();
    assert!(controller.sessions().contains(&draft));

    controller.load_chat_session("100").expect("load");
    assert!(!controller.sessions().contains(&draft));
    assert!(controller.sessions().contains("100"));
}

#[tokio::test]
async fn completed_reply_moves_session_to_front() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["again"]));
    let mut controller = controller_with_sessions(
        client,
        &[
            ("100", vec![message_at(Message::user("older"), 1)]),
            ("200", vec![message_at(Message::user("newer"), 2)]),
        ],
    );
    assert_eq!(controller.sessions().entries()[0].id, "200");

    controller.load_chat_session("100").expect("load");
    controller.send_message("hi").await.expect("send");

    let order: Vec<_> = controller
        .sessions()
        .entries()
        .iter()
        .map(|entry| entry.id.as_str())
        .collect();
    assert_eq!(order, vec!["100", "200"]);
}

#[tokio::test]
async fn loading_reports_interrupted_reply() {
    let client = ScriptedClient::new();
    let mut controller = controller_with_sessions(
        client,
        &[
            ("100", vec![Message::user("hi"), Message::placeholder()]),
            ("200", vec![Message::user("hi"), Message::assistant("fine")]),
        ],
    );

    let loaded = controller.load_chat_session("100").expect("load");
    assert!(loaded.interrupted);
    assert_eq!(loaded.message_count, 2);

    let loaded = controller.load_chat_session("200").expect("load");
    assert!(!loaded.interrupted);

    assert!(matches!(
        controller.load_chat_session("missing"),
        Err(ChatError::UnknownSession(_))
    ));
    assert_eq!(controller.session().map(|s| s.id.as_str()), Some("200"));
}

#[tokio::test]
async fn deleting_the_active_session_clears_it() {
    let client = ScriptedClient::new();
    let mut controller =
        controller_with_sessions(client, &[("100", vec![Message::user("hi")])]);
    controller.load_chat_session("100").expect("load");

    controller.delete_chat_session("100").expect("delete");

    assert!(controller.session().is_none());
    assert!(controller.sessions().is_empty());
    assert!(!controller.persistence().has_session("100").unwrap());
}

#[tokio::test]
async fn new_ids_stay_above_stored_ids() {
    let client = ScriptedClient::new();
    let far_future = (now_millis() + 1_000_000).to_string();
    let mut controller =
        controller_with_sessions(client, &[(far_future.as_str(), vec![Message::user("hi")])]);

    let id = controller.create_new_chat();

    assert!(id.parse::<i64>().unwrap() > far_future.parse::<i64>().unwrap());
}

#[tokio::test]
async fn translate_entry_runs_a_single_shot_session() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["Hello"]));
    let mut controller = create_test_controller(client.clone());

    let outcome = controller
        .run_entry(&EntryPoint::from_code(TRANSLATE_CODE), "Bonjour")
        .await
        .expect("entry");

    let EntryOutcome::Reply {
        session_id,
        outcome,
    } = outcome
    else {
        panic!("expected a reply");
    };
    assert_eq!(
        outcome,
        SendOutcome::Completed {
            content: "Hello".to_string()
        }
    );
    assert_eq!(controller.session().unwrap().id, session_id);

    let request = client.last_request_messages();
    assert_eq!(request.len(), 2);
    assert_eq!(request[0].0, "system");
    assert!(request[0].1.contains("translation assistant"));
    assert_eq!(request[1], ("user".to_string(), "Bonjour".to_string()));
}

#[tokio::test]
async fn custom_entry_uses_command_prompt() {
    let client = ScriptedClient::new();
    client.push(ScriptedReply::Chunks(vec!["short"]));
    let mut controller = create_test_controller(client.clone());
    controller
        .add_command(CustomCommand::new("sum", "Summarize", "Summarize tersely."))
        .expect("add command");

    controller
        .run_entry(&EntryPoint::Custom("sum".to_string()), "long text")
        .await
        .expect("entry");

    assert_eq!(
        client.last_request_messages()[0],
        ("system".to_string(), "Summarize tersely.".to_string())
    );
    assert_eq!(controller.persistence().load_commands().unwrap().len(), 1);

    let missing = controller
        .run_entry(&EntryPoint::Custom("nope".to_string()), "text")
        .await;
    assert!(matches!(missing, Err(ChatError::UnknownCommand(_))));
    let blank = controller.run_entry(&EntryPoint::Ask, " ").await;
    assert!(matches!(blank, Err(ChatError::EmptyMessage)));
}

#[tokio::test]
async fn list_entry_returns_stored_sessions() {
    let client = ScriptedClient::new();
    let mut controller = controller_with_sessions(
        client,
        &[("100", vec![Message::user("hi")]), ("200", Vec::new())],
    );

    let outcome = controller.run_entry(&EntryPoint::List, "").await.unwrap();

    let EntryOutcome::Sessions(sessions) = outcome else {
        panic!("expected the session list");
    };
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, "100");
}

#[test]
fn model_changes_are_persisted() {
    let client = ScriptedClient::new();
    let mut controller = create_test_controller(client);

    let second = ModelConfig::new("second", "gpt-4o", "https://api.example.com/v2", "sk-2");
    assert_eq!(controller.add_model(second).expect("add"), 1);
    controller.set_current_model(1).expect("select");
    assert_eq!(controller.persistence().load_model_index().unwrap(), 1);

    let invalid = controller.add_model(ModelConfig::new("", "", "nope", ""));
    assert!(matches!(invalid, Err(ChatError::Models(_))));
    assert_eq!(controller.persistence().load_models().unwrap().len(), 2);

    let next = controller.switch_to_next_model().expect("next");
    assert_eq!(next.name, "m");
    assert_eq!(controller.persistence().load_model_index().unwrap(), 0);

    controller.remove_model(0).expect("remove");
    assert_eq!(controller.models().current().unwrap().name, "second");
    assert_eq!(controller.persistence().load_models().unwrap().len(), 1);
}

#[tokio::test]
async fn idle_stream_becomes_an_error_reply() {
    use crate::core::chat_stream::HttpChatClient;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = [0u8; 8192];
        let _ = socket.read(&mut buf).await;
        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n";
        socket.write_all(head.as_bytes()).await.ok();
        socket.write_all(body.as_bytes()).await.ok();
        socket.flush().await.ok();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let http = reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("build client");
    let client = Arc::new(HttpChatClient::with_client(
        http,
        Some(Duration::from_millis(100)),
    ));
    let model = ModelConfig::new(
        "local",
        "gpt",
        format!("http://{addr}/v1/chat/completions"),
        "sk-1",
    );
    let mut persistence = create_test_persistence();
    persistence.save_models(&[model]).unwrap();
    let mut controller =
        ConversationController::new(persistence, client, RequestOptions::default()).unwrap();

    let result = controller.send_message("hi").await;

    assert!(matches!(
        result,
        Err(ChatError::Stream(StreamError::Timeout(limit))) if limit == Duration::from_millis(100)
    ));
    let messages = controller.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].is_assistant());
    assert!(messages[1].content.starts_with(ERROR_REPLY_PREFIX));
    assert!(messages[1].content.contains("no response from the model"));
    assert_eq!(controller.state(), GenerationState::Idle);
    server.abort();
}
