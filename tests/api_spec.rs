use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;

use storyline::agents::*;
use storyline::api::{create_router, AppState};
use storyline::config::EngineConfig;
use storyline::db::Database;
use storyline::events::{EventBus, InMemoryBroker};
use storyline::models::*;
use storyline::orchestrator::Orchestrator;

/// Approves everything and produces a single task and file.
struct OneTaskAgent;

#[async_trait]
impl TaskDivider for OneTaskAgent {
    async fn divide(&self, _story: &Story) -> anyhow::Result<Vec<TaskDraft>> {
        Ok(vec![TaskDraft {
            title: "Page".to_string(),
            description: String::new(),
            task_type: TaskType::Frontend,
            priority: 0,
            dependencies: vec![],
        }])
    }
}

#[async_trait]
impl TaskReviewer for OneTaskAgent {
    async fn review(&self, _story: &Story, _tasks: &[Task]) -> anyhow::Result<Vec<TaskReview>> {
        Ok(vec![])
    }
}

#[async_trait]
impl CodeGenerator for OneTaskAgent {
    async fn generate(
        &self,
        _story: &Story,
        _task: &Task,
        _files: &[ProjectFile],
    ) -> anyhow::Result<Vec<FileChange>> {
        Ok(vec![FileChange::Write {
            path: "index.html".to_string(),
            content: "<h1>hi</h1>".to_string(),
        }])
    }
}

#[async_trait]
impl CodeReviewer for OneTaskAgent {
    async fn review_code(
        &self,
        _story: &Story,
        _task: &Task,
        _files: &[ProjectFile],
    ) -> anyhow::Result<CodeReview> {
        Ok(CodeReview {
            approved: true,
            comments: String::new(),
        })
    }
}

#[async_trait]
impl TestAuthor for OneTaskAgent {
    async fn write_tests(
        &self,
        _story: &Story,
        _task: &Task,
        _files: &[ProjectFile],
    ) -> anyhow::Result<Vec<FileChange>> {
        Ok(vec![])
    }

    async fn run_tests(
        &self,
        _story: &Story,
        _task: &Task,
        _files: &[ProjectFile],
    ) -> anyhow::Result<TestReport> {
        Ok(TestReport {
            passed: true,
            summary: String::new(),
        })
    }
}

#[async_trait]
impl Deployer for OneTaskAgent {
    async fn deploy(
        &self,
        _story: &Story,
        _tasks: &[Task],
        _files: &[ProjectFile],
    ) -> anyhow::Result<Vec<FileChange>> {
        Ok(vec![])
    }
}

async fn setup() -> TestServer {
    let db = Database::open_memory().expect("Failed to create database");
    db.migrate().expect("Failed to migrate");

    let bus = Arc::new(EventBus::new(
        Arc::new(InMemoryBroker::new(128)),
        db.clone(),
        "api-test",
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        db,
        bus.clone(),
        Agents::uniform(Arc::new(OneTaskAgent)),
        EngineConfig::default(),
    ));
    orchestrator.register();
    bus.start_listening().await.expect("Failed to start listening");

    let app = create_router(AppState::new(orchestrator));
    TestServer::new(app).expect("Failed to create test server")
}

async fn create_test_project(server: &TestServer) -> Project {
    server
        .post("/api/v1/projects")
        .json(&CreateProjectInput {
            name: "Test Project".to_string(),
            description: None,
        })
        .await
        .json::<Project>()
}

async fn create_test_story(server: &TestServer, project: &Project) -> Story {
    server
        .post(&format!("/api/v1/projects/{}/stories", project.id))
        .json(&json!({ "title": "Landing page" }))
        .await
        .json::<Story>()
}

async fn wait_for_status(server: &TestServer, story_id: uuid::Uuid, status: StoryStatus) -> Story {
    for _ in 0..500 {
        let story = server
            .get(&format!("/api/v1/stories/{}", story_id))
            .await
            .json::<Story>();
        if story.status == status {
            return story;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("story never reached {:?}", status);
}

async fn wait_for_event(server: &TestServer, story_id: uuid::Uuid, event_type: EventType) -> Vec<AgentLog> {
    for _ in 0..500 {
        let events: Vec<AgentLog> = server
            .get(&format!("/api/v1/stories/{}/events", story_id))
            .await
            .json();
        if events.iter().any(|e| e.event_type == event_type) {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} was never published", event_type);
}

mod health {
    use super::*;

    #[tokio::test]
    async fn returns_ok() {
        let server = setup().await;

        let response = server.get("/api/v1/health").await;

        response.assert_status_ok();
        assert_eq!(response.json::<serde_json::Value>()["status"], "ok");
    }
}

mod projects {
    use super::*;

    #[tokio::test]
    async fn create_returns_created_status() {
        let server = setup().await;

        let response = server
            .post("/api/v1/projects")
            .json(&CreateProjectInput {
                name: "New".to_string(),
                description: Some("Shop front".to_string()),
            })
            .await;

        response.assert_status(StatusCode::CREATED);
        let project: Project = response.json();
        assert_eq!(project.name, "New");
    }

    #[tokio::test]
    async fn get_returns_not_found_for_nonexistent_project() {
        let server = setup().await;

        let response = server
            .get(&format!("/api/v1/projects/{}", uuid::Uuid::new_v4()))
            .await;

        response.assert_status_not_found();
    }

    #[tokio::test]
    async fn files_can_be_written_and_listed() {
        let server = setup().await;
        let project = create_test_project(&server).await;
        let url = format!("/api/v1/projects/{}/files", project.id);

        server
            .put(&url)
            .json(&UpsertFileInput {
                path: "README.md".to_string(),
                content: "hello".to_string(),
            })
            .await
            .assert_status_ok();

        let files: Vec<ProjectFile> = server.get(&url).await.json();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "hello");
    }

    #[tokio::test]
    async fn rejects_blank_file_paths() {
        let server = setup().await;
        let project = create_test_project(&server).await;

        let response = server
            .put(&format!("/api/v1/projects/{}/files", project.id))
            .json(&json!({ "path": " ", "content": "x" }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }
}

mod stories {
    use super::*;

    #[tokio::test]
    async fn create_returns_pending_story() {
        let server = setup().await;
        let project = create_test_project(&server).await;

        let response = server
            .post(&format!("/api/v1/projects/{}/stories", project.id))
            .json(&json!({ "title": "Landing page", "priority": 2 }))
            .await;

        response.assert_status(StatusCode::CREATED);
        let story: Story = response.json();
        assert_eq!(story.status, StoryStatus::Pending);
        assert_eq!(story.priority, 2);
    }

    #[tokio::test]
    async fn create_returns_not_found_for_unknown_project() {
        let server = setup().await;

        let response = server
            .post(&format!("/api/v1/projects/{}/stories", uuid::Uuid::new_v4()))
            .json(&json!({ "title": "Orphan" }))
            .await;

        response.assert_status_not_found();
    }

    #[tokio::test]
    async fn lists_the_stories_of_a_project() {
        let server = setup().await;
        let project = create_test_project(&server).await;
        let other = create_test_project(&server).await;
        create_test_story(&server, &project).await;
        create_test_story(&server, &other).await;

        let stories: Vec<Story> = server
            .get(&format!("/api/v1/projects/{}/stories", project.id))
            .await
            .json();

        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].project_id, project.id);
    }

    #[tokio::test]
    async fn get_returns_not_found_for_unknown_story() {
        let server = setup().await;

        server
            .get(&format!("/api/v1/stories/{}", uuid::Uuid::new_v4()))
            .await
            .assert_status_not_found();
    }
}

mod processing {
    use super::*;

    #[tokio::test]
    async fn returns_accepted_immediately() {
        let server = setup().await;
        let project = create_test_project(&server).await;
        let story = create_test_story(&server, &project).await;

        let response = server
            .post(&format!("/api/v1/stories/{}/process", story.id))
            .await;

        response.assert_status(StatusCode::ACCEPTED);
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "processing_started");
        assert_eq!(body["story_id"], story.id.to_string());
    }

    #[tokio::test]
    async fn rejects_a_second_request_while_processing() {
        let server = setup().await;
        let project = create_test_project(&server).await;
        let story = create_test_story(&server, &project).await;
        let url = format!("/api/v1/stories/{}/process", story.id);

        server.post(&url).await.assert_status(StatusCode::ACCEPTED);
        server.post(&url).await.assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn exposes_tasks_and_events_of_a_finished_story() {
        let server = setup().await;
        let project = create_test_project(&server).await;
        let story = create_test_story(&server, &project).await;

        server
            .post(&format!("/api/v1/stories/{}/process", story.id))
            .await
            .assert_status(StatusCode::ACCEPTED);
        wait_for_status(&server, story.id, StoryStatus::Completed).await;

        let tasks: Vec<Task> = server
            .get(&format!("/api/v1/stories/{}/tasks", story.id))
            .await
            .json();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Deployed);

        let events = wait_for_event(&server, story.id, EventType::StoryCompleted).await;
        assert_eq!(
            events.first().map(|e| e.event_type),
            Some(EventType::StoryProcessingStarted)
        );

        server
            .post(&format!("/api/v1/stories/{}/process", story.id))
            .await
            .assert_status(StatusCode::CONFLICT);
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn cancels_a_pending_story() {
        let server = setup().await;
        let project = create_test_project(&server).await;
        let story = create_test_story(&server, &project).await;

        let response = server
            .post(&format!("/api/v1/stories/{}/cancel", story.id))
            .json(&json!({}))
            .await;

        response.assert_status_ok();
        let outcome: serde_json::Value = response.json();
        assert!(outcome["rollback"].is_object());

        let story: Story = server
            .get(&format!("/api/v1/stories/{}", story.id))
            .await
            .json();
        assert_eq!(story.status, StoryStatus::Cancelled);
    }

    #[tokio::test]
    async fn rolls_back_by_default_without_a_body() {
        let server = setup().await;
        let project = create_test_project(&server).await;
        let story = create_test_story(&server, &project).await;

        let response = server
            .post(&format!("/api/v1/stories/{}/cancel", story.id))
            .await;

        response.assert_status_ok();
        let outcome: serde_json::Value = response.json();
        assert!(outcome["rollback"].is_object());
    }

    #[tokio::test]
    async fn keeps_changes_when_asked() {
        let server = setup().await;
        let project = create_test_project(&server).await;
        let story = create_test_story(&server, &project).await;

        let response = server
            .post(&format!("/api/v1/stories/{}/cancel", story.id))
            .json(&json!({ "rollback": false }))
            .await;

        response.assert_status_ok();
        let outcome: serde_json::Value = response.json();
        assert!(outcome["rollback"].is_null());
    }

    #[tokio::test]
    async fn refuses_completed_stories() {
        let server = setup().await;
        let project = create_test_project(&server).await;
        let story = create_test_story(&server, &project).await;

        server
            .post(&format!("/api/v1/stories/{}/process", story.id))
            .await
            .assert_status(StatusCode::ACCEPTED);
        wait_for_status(&server, story.id, StoryStatus::Completed).await;

        server
            .post(&format!("/api/v1/stories/{}/cancel", story.id))
            .json(&json!({ "rollback": false }))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn returns_not_found_for_unknown_story() {
        let server = setup().await;

        server
            .post(&format!("/api/v1/stories/{}/cancel", uuid::Uuid::new_v4()))
            .json(&json!({}))
            .await
            .assert_status_not_found();
    }
}
