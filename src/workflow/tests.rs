use super::*;
use crate::agent::tools::data_query_tools;
use crate::connections::test_connection;
use crate::conversations::MessageRole;
use crate::notify::{LocalNotifier, RecordingTransport};
use crate::providers::{ModelResponse, ScriptedModel};
use crate::store::{DocumentStore, MemStore, collections};

struct Fixture {
    conversations: ConversationStore,
    transport: Arc<RecordingTransport>,
    workflow: ChatWorkflow,
}

async fn fixture(model: Arc<dyn ChatModel>) -> Fixture {
    let store: Arc<MemStore> = Arc::new(MemStore::new());
    let repo = ConnectionRepo::new(store.clone());
    repo.create(&test_connection("c1", "u1", "Orders")).await.unwrap();
    store
        .insert_one(
            collections::SHEET_ROWS,
            json!({
                "connection_id": "c1",
                "row_number": 2,
                "document": {"platform": "Shopee", "total_amount": 1_000_000.0, "order_date": "2024-01-05"},
            }),
        )
        .await
        .unwrap();

    let conversations = ConversationStore::new(store.clone());
    let transport = Arc::new(RecordingTransport::default());
    let notifier = Arc::new(LocalNotifier::new(transport.clone()));
    let workflow = ChatWorkflow::new(
        model,
        conversations.clone(),
        repo.clone(),
        data_query_tools(store, repo),
        notifier,
        Duration::from_secs(30),
    );
    Fixture {
        conversations,
        transport,
        workflow,
    }
}

fn tool_turn(name: &str, args: serde_json::Value) -> ModelResponse {
    ModelResponse {
        content: None,
        tool_calls: vec![ToolCall {
            id: "t1".into(),
            name: name.into(),
            arguments: args,
        }],
        finish_reason: Some("tool_calls".into()),
    }
}

#[tokio::test]
async fn chat_branch_streams_and_persists() {
    let model = Arc::new(ScriptedModel::new(vec![
        ModelResponse::text("chat"),
        ModelResponse::text("Chào bạn, mình giúp gì được?"),
    ]));
    let fx = fixture(model).await;
    let conversation = fx.conversations.create("u1", None).await.unwrap();

    let outcome = fx
        .workflow
        .handle_message("u1", &conversation.id, "xin chào", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(outcome.intent, Intent::Chat);
    assert_eq!(outcome.content, "Chào bạn, mình giúp gì được?");

    // Event contract: one started, some tokens, one completed.
    let names = fx.transport.event_names();
    assert_eq!(names.first().map(String::as_str), Some("chat:message:started"));
    assert_eq!(names.last().map(String::as_str), Some("chat:message:completed"));
    assert_eq!(names.iter().filter(|n| *n == "chat:message:started").count(), 1);
    assert_eq!(names.iter().filter(|n| *n == "chat:message:completed").count(), 1);
    assert!(names.iter().filter(|n| *n == "chat:message:token").count() >= 1);
    assert_eq!(names.iter().filter(|n| *n == "chat:message:failed").count(), 0);

    // The assistant message was persisted before completion.
    let history = fx.conversations.history(&conversation.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, MessageRole::Assistant);
    assert!(history[1].is_complete);

    // The completed payload references the persisted message id.
    let (_, _, payload) = fx
        .transport
        .events()
        .into_iter()
        .find(|(_, name, _)| name == "chat:message:completed")
        .unwrap();
    assert_eq!(payload["message_id"], json!(history[1].id));

    // Title derives from the first user message.
    let reloaded = fx.conversations.get_owned(&conversation.id, "u1").await.unwrap();
    assert_eq!(reloaded.title, "xin chào");
}

#[tokio::test]
async fn data_agent_branch_emits_tool_events_and_saves_trace() {
    let model = Arc::new(ScriptedModel::new(vec![
        ModelResponse::text("data_query"),
        tool_turn(
            "aggregate_data",
            json!({"connection_name": "Orders", "operation": "sum", "field": "total_amount"}),
        ),
        ModelResponse::text("Tổng doanh thu là 1000000 đ"),
    ]));
    let fx = fixture(model).await;
    let conversation = fx.conversations.create("u1", None).await.unwrap();

    let outcome = fx
        .workflow
        .handle_message("u1", &conversation.id, "doanh thu?", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(outcome.intent, Intent::DataQuery);
    // The formatter normalized the currency.
    assert_eq!(outcome.content, "Tổng doanh thu là 1.000.000 VND");

    let names = fx.transport.event_names();
    let tool_start = names.iter().position(|n| n == "chat:message:tool_start").unwrap();
    let tool_end = names.iter().position(|n| n == "chat:message:tool_end").unwrap();
    let completed = names.iter().position(|n| n == "chat:message:completed").unwrap();
    assert!(tool_start < tool_end && tool_end < completed);

    // Tool-call trace lands in the persisted metadata.
    let history = fx.conversations.history(&conversation.id).await.unwrap();
    let assistant = &history[1];
    assert_eq!(assistant.metadata.tool_calls.len(), 1);
    assert_eq!(assistant.metadata.tool_calls[0].name, "aggregate_data");
    assert!(assistant.metadata.latency_ms.is_some());
    assert_eq!(assistant.metadata.model.as_deref(), Some("scripted"));
}

#[tokio::test]
async fn unclear_intent_goes_to_clarify() {
    let model = Arc::new(ScriptedModel::new(vec![
        ModelResponse::text("hmm not sure"),
        ModelResponse::text("Bạn muốn hỏi gì? Ví dụ: \"Doanh thu tháng này?\""),
    ]));
    let fx = fixture(model).await;
    let conversation = fx.conversations.create("u1", None).await.unwrap();

    let outcome = fx
        .workflow
        .handle_message("u1", &conversation.id, "ừm", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(outcome.intent, Intent::Unclear);
    assert!(outcome.content.contains("Ví dụ"));
}

#[tokio::test]
async fn model_failure_emits_failed_and_persists_nothing() {
    // Script runs dry on the classify call.
    let model = Arc::new(ScriptedModel::new(vec![]));
    let fx = fixture(model).await;
    let conversation = fx.conversations.create("u1", None).await.unwrap();

    let err = fx
        .workflow
        .handle_message("u1", &conversation.id, "hỏi", Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, SheetmindError::External(_)));

    let names = fx.transport.event_names();
    assert_eq!(names, vec!["chat:message:started", "chat:message:failed"]);

    // Only the user message exists.
    let history = fx.conversations.history(&conversation.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, MessageRole::User);
}

#[tokio::test]
async fn deadline_expiry_emits_failed() {
    struct HangingModel;

    #[async_trait::async_trait]
    impl ChatModel for HangingModel {
        async fn complete(&self, _request: ChatRequest) -> Result<ModelResponse> {
            // Longer than any test deadline.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ModelResponse::text("never"))
        }
        fn model_name(&self) -> &str {
            "hanging"
        }
    }

    let fx = fixture(Arc::new(HangingModel)).await;
    let conversation = fx.conversations.create("u1", None).await.unwrap();

    let err = fx
        .workflow
        .handle_message("u1", &conversation.id, "hỏi", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));

    let names = fx.transport.event_names();
    assert_eq!(names, vec!["chat:message:started", "chat:message:failed"]);
}

#[tokio::test]
async fn missing_conversation_fails_before_any_event() {
    let model = Arc::new(ScriptedModel::new(vec![]));
    let fx = fixture(model).await;

    let err = fx
        .workflow
        .handle_message("u1", "ghost", "hỏi", Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, SheetmindError::NotFound(_)));
    assert!(fx.transport.events().is_empty());
}

#[tokio::test]
async fn foreign_conversation_reads_as_not_found() {
    let model = Arc::new(ScriptedModel::new(vec![]));
    let fx = fixture(model).await;
    let conversation = fx.conversations.create("u2", None).await.unwrap();

    let err = fx
        .workflow
        .handle_message("u1", &conversation.id, "hỏi", Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, SheetmindError::NotFound(_)));
    assert!(fx.transport.events().is_empty());
}

#[tokio::test]
async fn empty_model_reply_becomes_empty_result_phrase() {
    let model = Arc::new(ScriptedModel::new(vec![
        ModelResponse::text("chat"),
        ModelResponse::text(""),
    ]));
    let fx = fixture(model).await;
    let conversation = fx.conversations.create("u1", None).await.unwrap();

    let outcome = fx
        .workflow
        .handle_message("u1", &conversation.id, "xin chào", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(outcome.content, formatter::EMPTY_RESULT_REPLY);
}
