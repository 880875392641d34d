//! Integration tests for the converged query pipeline.

use std::sync::Arc;

use common::bridge::MockMlBridge;
use common::config::CoreConfig;
use common::models::{Chat, FeedbackType, Message, Role, UserFeedback};
use common::NodeId;
use embedding::EmbeddingPipeline;
use query::{Query, QueryContext, QueryEngine, SearchDepth, Temperature};
use serde_json::json;
use storage::{Coordinator, DatabaseKind, TimeScope};
use task_scheduler::{Task, TaskError, TaskExecutor, TaskScheduler};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct NoopExecutor;

#[async_trait::async_trait]
impl TaskExecutor for NoopExecutor {
    async fn execute(&self, _task: &Task, _cancel: &CancellationToken) -> Result<(), TaskError> {
        Ok(())
    }
}

struct Stack {
    coordinator: Arc<Coordinator>,
    pipeline: Arc<EmbeddingPipeline>,
    engine: QueryEngine,
    _temp: TempDir,
}

fn build_stack(config: CoreConfig) -> Stack {
    let temp = TempDir::new().unwrap();
    let coordinator = Arc::new(Coordinator::open(temp.path(), config.clone()).unwrap());
    let pipeline = Arc::new(EmbeddingPipeline::new(Arc::new(MockMlBridge), config.clone()));
    let scheduler = TaskScheduler::new(Arc::new(NoopExecutor), &config);
    let engine = QueryEngine::new(
        Arc::clone(&coordinator),
        Arc::clone(&pipeline),
        scheduler,
    );
    Stack {
        coordinator,
        pipeline,
        engine,
        _temp: temp,
    }
}

fn chat(id: &str) -> Chat {
    Chat {
        id: NodeId::new(id),
        title: "Rust DBs".to_string(),
        created_at: common::now_ms(),
        updated_at: common::now_ms(),
        settings: json!({}),
        message_ids: vec![],
        metadata: json!({}),
    }
}

fn message(id: &str, chat_id: &str, text: &str) -> Message {
    Message {
        id: NodeId::new(id),
        chat_id: NodeId::new(chat_id),
        sender: "u".to_string(),
        role: Role::User,
        timestamp: common::now_ms(),
        text_content: text.to_string(),
        attachment_refs: vec![],
        metadata: json!({}),
    }
}

/// Inserts a message and generates both embeddings synchronously, standing
/// in for the weaver.
async fn insert_embedded(stack: &Stack, id: &str, chat_id: &str, text: &str) {
    stack
        .coordinator
        .insert_message(message(id, chat_id, text))
        .unwrap();
    let store = stack.coordinator.embeddings_active();
    stack
        .pipeline
        .embed_fast(&store, text, &NodeId::new(id))
        .await
        .unwrap();
    stack
        .pipeline
        .embed_accurate(&store, text, &NodeId::new(id))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_insert_and_semantic_recall() {
    let stack = build_stack(CoreConfig::default());
    stack.coordinator.insert_chat(chat("c1")).unwrap();
    insert_embedded(&stack, "m1", "c1", "embedded key-value store comparison").await;

    let query = Query {
        semantic: "embedded key-value store comparison".to_string(),
        time_scope: TimeScope::Today,
        context: QueryContext::CurrentChat(NodeId::new("c1")),
        use_knowledge_graph: false,
        search_depth: SearchDepth::Shallow,
        temperature: Temperature::Hot,
        limit: 5,
        confidence_threshold: 0.0,
    };
    let response = stack.engine.execute(&query).await.unwrap();

    assert!(!response.incomplete, "reason: {:?}", response.reason);
    assert_eq!(response.results.len(), 1);
    let hit = &response.results[0];
    assert_eq!(hit.message.id.as_str(), "m1");
    assert!(hit.confidence >= 0.6, "confidence {}", hit.confidence);
    assert!(hit.reasoning.contains("stage1:structural"));
    assert!(hit.reasoning.contains("stage2:semantic/fast"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rerank_promotes_lexical_match() {
    let stack = build_stack(CoreConfig::default());
    stack.coordinator.insert_chat(chat("c1")).unwrap();

    insert_embedded(&stack, "m_target", "c1", "embedded database comparison notes").await;
    for i in 0..6 {
        insert_embedded(
            &stack,
            &format!("m_noise_{i}"),
            "c1",
            &format!("grocery list number {i} apples pears"),
        )
        .await;
    }

    let query = Query {
        semantic: "embedded database comparison".to_string(),
        time_scope: TimeScope::AllTime,
        context: QueryContext::CurrentChat(NodeId::new("c1")),
        use_knowledge_graph: false,
        search_depth: SearchDepth::Shallow,
        temperature: Temperature::Hot,
        limit: 3,
        confidence_threshold: 0.0,
    };
    let response = stack.engine.execute(&query).await.unwrap();

    assert!(!response.results.is_empty());
    assert_eq!(
        response.results[0].message.id.as_str(),
        "m_target",
        "rerank should surface the lexical match first"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_back_to_back_queries_are_deterministic() {
    let stack = build_stack(CoreConfig::default());
    stack.coordinator.insert_chat(chat("c1")).unwrap();
    for i in 0..10 {
        insert_embedded(
            &stack,
            &format!("m_{i}"),
            "c1",
            &format!("message about topic {i} and embedded stores"),
        )
        .await;
    }

    let query = Query {
        semantic: "embedded stores".to_string(),
        time_scope: TimeScope::AllTime,
        context: QueryContext::CurrentChat(NodeId::new("c1")),
        use_knowledge_graph: false,
        search_depth: SearchDepth::Shallow,
        temperature: Temperature::Hot,
        limit: 5,
        confidence_threshold: 0.0,
    };

    let first = stack.engine.execute(&query).await.unwrap();
    let second = stack.engine.execute(&query).await.unwrap();

    let ids = |r: &query::QueryResponse| {
        r.results
            .iter()
            .map(|h| h.message.id.as_str().to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_correction_feedback_widens_next_plan() {
    let stack = build_stack(CoreConfig::default());
    stack.coordinator.insert_chat(chat("c1")).unwrap();
    insert_embedded(&stack, "m1", "c1", "Rust database talk").await;

    let query = Query {
        semantic: "Rust database".to_string(),
        time_scope: TimeScope::AllTime,
        context: QueryContext::AllChats,
        use_knowledge_graph: false,
        search_depth: SearchDepth::Shallow,
        temperature: Temperature::Hot,
        limit: 5,
        confidence_threshold: 0.0,
    };

    let first = stack.engine.execute(&query).await.unwrap();
    assert!(!first.plan.use_knowledge_graph);

    stack
        .coordinator
        .insert_feedback(UserFeedback {
            id: NodeId::new("fb_1"),
            outcome_id: first.stats_id.clone(),
            feedback: FeedbackType::Correction,
            comment: Some("meant embedded".to_string()),
            timestamp: common::now_ms(),
        })
        .unwrap();

    let second = stack.engine.execute(&query).await.unwrap();
    assert!(
        second.plan.informed_by_meta,
        "plan should consult the recorded correction"
    );
    assert!(second.plan.use_knowledge_graph);
    assert!(second.plan.max_depth >= 1);

    // Both runs left performance stats.
    let meta = stack.coordinator.meta();
    assert!(query::stats::load(&meta, first.stats_id.as_str())
        .unwrap()
        .is_some());
    assert!(query::stats::load(&meta, second.stats_id.as_str())
        .unwrap()
        .is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadline_returns_partial() {
    let config = CoreConfig {
        query_deadline_ms: 0,
        ..CoreConfig::default()
    };
    let stack = build_stack(config);
    stack.coordinator.insert_chat(chat("c1")).unwrap();
    insert_embedded(&stack, "m1", "c1", "some text").await;

    let response = stack
        .engine
        .execute(&Query::semantic("some text"))
        .await
        .unwrap();
    assert!(response.incomplete);
    assert_eq!(response.reason.as_deref(), Some("deadline"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_degraded_index_flags_incomplete() {
    let stack = build_stack(CoreConfig::default());
    stack.coordinator.insert_chat(chat("c1")).unwrap();
    insert_embedded(&stack, "m1", "c1", "degraded run").await;

    stack
        .coordinator
        .set_degraded(DatabaseKind::Embeddings, true);
    let response = stack
        .engine
        .execute(&Query::semantic("degraded run"))
        .await
        .unwrap();

    assert!(response.incomplete);
    assert_eq!(response.reason.as_deref(), Some("degraded-index"));
    // Full-scan fallback still surfaces the message.
    assert_eq!(response.results.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_candidate_set_returns_empty() {
    let stack = build_stack(CoreConfig::default());
    stack.coordinator.insert_chat(chat("c1")).unwrap();

    let response = stack
        .engine
        .execute(&Query::semantic("nothing stored yet"))
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert!(!response.cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_query_is_marked() {
    let stack = build_stack(CoreConfig::default());
    stack.coordinator.insert_chat(chat("c1")).unwrap();
    insert_embedded(&stack, "m1", "c1", "cancel me").await;

    let token = CancellationToken::new();
    token.cancel();
    let response = stack
        .engine
        .execute_with_cancel(&Query::semantic("cancel me"), &token)
        .await
        .unwrap();

    assert!(response.cancelled);
    let meta = stack.coordinator.meta();
    let stats = query::stats::load(&meta, response.stats_id.as_str())
        .unwrap()
        .unwrap();
    assert!(stats.cancelled);
}
