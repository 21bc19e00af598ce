//! Question Broker - blocking human-in-the-loop questions
//!
//! The asking side runs inside an agent process; the answering side is the
//! dashboard. They share nothing but the store, so `ask` polls for the answer
//! with `tokio::time::sleep`.
//!
//! ```text
//! ask ──▶ question (pending) ──▶ task blocked
//!              │ answer / timeout sentinel
//!              ▼
//!         task in_progress (when no other question is pending)
//! ```

use dashboard_foundation::{
    Error, NewQuestion, Question, QuestionSettings, QuestionType, Result, TaskPatch, TaskStatus,
    TaskStore,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Answer persisted when nobody responds in time
pub const TIMEOUT_ANSWER: &str = "[TIMEOUT - no answer received]";

/// A question raised by an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskRequest {
    pub task_id: String,
    pub question: String,
    #[serde(default)]
    pub question_type: QuestionType,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

/// What the asking agent gets back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AskOutcome {
    pub question_id: String,
    pub answer: String,
    pub auto_accepted: bool,
    pub timed_out: bool,
}

/// Deterministic answer used for auto-accepting tasks
pub fn default_answer(question_type: QuestionType, options: Option<&[String]>) -> String {
    if let Some(first) = options.and_then(|o| o.first()) {
        return first.clone();
    }
    match question_type {
        QuestionType::PlanReview => "approved".to_string(),
        _ => "yes".to_string(),
    }
}

/// Ask/answer over the shared store
#[derive(Debug, Clone)]
pub struct QuestionBroker {
    store: TaskStore,
    settings: QuestionSettings,
}

impl QuestionBroker {
    pub fn new(store: TaskStore, settings: QuestionSettings) -> Self {
        Self { store, settings }
    }

    /// Ask and wait for the answer
    ///
    /// Auto-accepting tasks get [`default_answer`] immediately. Otherwise the
    /// task is blocked until a human answers or the timeout elapses; the
    /// timeout stores [`TIMEOUT_ANSWER`] and returns `timed_out = true`.
    pub async fn ask(&self, request: &AskRequest) -> Result<AskOutcome> {
        let task = self
            .store
            .find_task(&request.task_id)?
            .ok_or_else(|| Error::not_found("Task", &request.task_id))?;

        let question = self.store.create_question(&NewQuestion {
            task_id: request.task_id.clone(),
            agent: request.agent.clone(),
            question: request.question.clone(),
            question_type: request.question_type,
            options: request.options.clone(),
            context: request.context.clone(),
        })?;

        if task.auto_accept {
            let answer = default_answer(request.question_type, request.options.as_deref());
            self.store.answer_question(&question.id, &answer, true)?;
            debug!("Auto-accepted question {} with '{}'", question.id, answer);
            return Ok(AskOutcome {
                question_id: question.id,
                answer,
                auto_accepted: true,
                timed_out: false,
            });
        }

        self.store
            .update_task(&request.task_id, &TaskPatch::new().status(TaskStatus::Blocked))?;
        info!(
            "Task {} blocked on question {}",
            request.task_id, question.id
        );

        let deadline = Instant::now() + self.settings.timeout();
        loop {
            if let Some(answered) = self.answered(&question.id)? {
                self.resume(&request.task_id)?;
                return Ok(AskOutcome {
                    question_id: question.id,
                    answer: answered.answer.unwrap_or_default(),
                    auto_accepted: answered.auto_accepted,
                    timed_out: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval().min(deadline - now)).await;
        }

        // Only wins if nobody answered in the meantime
        if self.store.answer_question(&question.id, TIMEOUT_ANSWER, false)? {
            warn!(
                "Question {} on task {} timed out",
                question.id, request.task_id
            );
            self.resume(&request.task_id)?;
            return Ok(AskOutcome {
                question_id: question.id,
                answer: TIMEOUT_ANSWER.to_string(),
                auto_accepted: false,
                timed_out: true,
            });
        }

        let answered = self
            .answered(&question.id)?
            .ok_or_else(|| Error::not_found("Question", &question.id))?;
        self.resume(&request.task_id)?;
        Ok(AskOutcome {
            question_id: question.id,
            answer: answered.answer.unwrap_or_default(),
            auto_accepted: answered.auto_accepted,
            timed_out: false,
        })
    }

    /// Answer a pending question (the human side)
    pub fn answer(&self, question_id: &str, answer: &str) -> Result<Question> {
        let question = self
            .store
            .get_question(question_id)?
            .ok_or_else(|| Error::not_found("Question", question_id))?;
        if !question.is_pending() {
            return Err(Error::InvalidInput(format!(
                "Question '{}' is already answered",
                question_id
            )));
        }

        if !self.store.answer_question(question_id, answer, false)? {
            // Lost the race against another answer or the timeout
            return Err(Error::InvalidInput(format!(
                "Question '{}' is already answered",
                question_id
            )));
        }
        self.resume(&question.task_id)?;

        self.store
            .get_question(question_id)?
            .ok_or_else(|| Error::not_found("Question", question_id))
    }

    fn answered(&self, question_id: &str) -> Result<Option<Question>> {
        Ok(self
            .store
            .get_question(question_id)?
            .filter(|q| !q.is_pending()))
    }

    fn resume(&self, task_id: &str) -> Result<()> {
        if self.store.resume_if_unblocked(task_id)? {
            info!("Task {} resumed", task_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashboard_foundation::NewTask;
    use std::time::Duration;

    fn fast_settings(timeout_secs: u64) -> QuestionSettings {
        QuestionSettings {
            poll_interval_ms: 20,
            timeout_secs,
        }
    }

    fn temp_store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = TaskStore::open(dir.path().join("tasks.db")).expect("Failed to open store");
        (dir, store)
    }

    fn request(task_id: &str) -> AskRequest {
        AskRequest {
            task_id: task_id.to_string(),
            question: "Proceed?".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_answer() {
        let options = vec!["A".to_string(), "B".to_string()];
        assert_eq!(default_answer(QuestionType::Single, Some(options.as_slice())), "A");
        assert_eq!(default_answer(QuestionType::PlanReview, None), "approved");
        let empty: Vec<String> = Vec::new();
        assert_eq!(
            default_answer(QuestionType::PlanReview, Some(empty.as_slice())),
            "approved"
        );
        assert_eq!(default_answer(QuestionType::Confirm, None), "yes");
        assert_eq!(default_answer(QuestionType::Text, None), "yes");
    }

    #[tokio::test]
    async fn test_auto_accept_returns_immediately() {
        let (_dir, store) = temp_store();
        let task = store
            .create_task(
                &NewTask::new("auto")
                    .with_status(TaskStatus::InProgress)
                    .with_auto_accept(true),
            )
            .unwrap();
        let broker = QuestionBroker::new(store.clone(), fast_settings(3600));

        let mut req = request(&task.id);
        req.question_type = QuestionType::PlanReview;
        let outcome = tokio::time::timeout(Duration::from_secs(1), broker.ask(&req))
            .await
            .expect("auto-accept must not wait")
            .unwrap();

        assert_eq!(outcome.answer, "approved");
        assert!(outcome.auto_accepted);
        assert!(!outcome.timed_out);
        let stored = store.get_question(&outcome.question_id).unwrap().unwrap();
        assert!(stored.auto_accepted);
        assert_eq!(
            store.find_task(&task.id).unwrap().unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_timeout_stores_sentinel_and_resumes() {
        let (_dir, store) = temp_store();
        let task = store
            .create_task(&NewTask::new("t").with_status(TaskStatus::InProgress))
            .unwrap();
        let broker = QuestionBroker::new(store.clone(), fast_settings(0));

        let outcome = broker.ask(&request(&task.id)).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.answer, TIMEOUT_ANSWER);
        assert_eq!(
            store.find_task(&task.id).unwrap().unwrap().status,
            TaskStatus::InProgress
        );
        let stored = store.get_question(&outcome.question_id).unwrap().unwrap();
        assert_eq!(stored.answer.as_deref(), Some(TIMEOUT_ANSWER));
    }

    #[tokio::test]
    async fn test_timeout_keeps_block_for_other_question() {
        let (_dir, store) = temp_store();
        let task = store
            .create_task(&NewTask::new("t").with_status(TaskStatus::InProgress))
            .unwrap();
        let broker = QuestionBroker::new(store.clone(), fast_settings(0));

        // Another question on the same task stays open
        store
            .create_question(&NewQuestion {
                task_id: task.id.clone(),
                question: "other".into(),
                ..Default::default()
            })
            .unwrap();

        let outcome = broker.ask(&request(&task.id)).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(
            store.find_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Blocked
        );
    }

    #[tokio::test]
    async fn test_answer_unblocks_waiting_ask() {
        let (_dir, store) = temp_store();
        let task = store
            .create_task(&NewTask::new("t").with_status(TaskStatus::InProgress))
            .unwrap();
        let broker = QuestionBroker::new(store.clone(), fast_settings(30));

        let asker = {
            let broker = broker.clone();
            let req = request(&task.id);
            tokio::spawn(async move { broker.ask(&req).await })
        };

        // Wait until the asker has blocked the task
        while store.find_task(&task.id).unwrap().unwrap().status != TaskStatus::Blocked {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let pending = store.pending_questions().unwrap();
        assert_eq!(pending.len(), 1);
        let question = pending.into_iter().next().unwrap();

        let answered = broker.answer(&question.id, "go ahead").unwrap();
        assert_eq!(answered.answer.as_deref(), Some("go ahead"));

        let outcome = asker.await.unwrap().unwrap();
        assert_eq!(outcome.answer, "go ahead");
        assert!(!outcome.timed_out);
        assert_eq!(
            store.find_task(&task.id).unwrap().unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_answer_rejects_unknown_and_answered() {
        let (_dir, store) = temp_store();
        let task = store.create_task(&NewTask::new("t")).unwrap();
        let broker = QuestionBroker::new(store.clone(), fast_settings(30));

        assert!(matches!(
            broker.answer("missing", "x"),
            Err(Error::NotFound(_))
        ));

        let question = store
            .create_question(&NewQuestion {
                task_id: task.id.clone(),
                question: "q".into(),
                ..Default::default()
            })
            .unwrap();
        broker.answer(&question.id, "first").unwrap();
        assert!(matches!(
            broker.answer(&question.id, "second"),
            Err(Error::InvalidInput(_))
        ));
        let stored = store.get_question(&question.id).unwrap().unwrap();
        assert_eq!(stored.answer.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_ask_unknown_task() {
        let (_dir, store) = temp_store();
        let broker = QuestionBroker::new(store, fast_settings(1));
        assert!(matches!(
            broker.ask(&request("nope")).await,
            Err(Error::NotFound(_))
        ));
    }
}
