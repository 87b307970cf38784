//! Debounced commit scheduling for cell edits.
//!
//! Free-text edits are committed after a quiet period following the last
//! keystroke; every keystroke restarts the timer. Confirming (blur, submit)
//! commits the latest draft at once, cancelling (escape) throws the draft
//! away. Enumerated choices commit as soon as one is selected.
//!
//! ```text
//! keystroke ─► [draft] ─(350ms quiet)─► commit
//!                 │
//!                 ├── confirm ─► commit now
//!                 └── cancel  ─► revert, no commit
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Quiet period between the last keystroke and the commit.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(350);

/// Receives committed field values (normally forwards them to `begin_edit`
/// plus the mutation request).
pub trait CommitSink: Send + Sync + 'static {
    fn commit(&self, field: &str, value: Value);

    /// Value currently displayed for `field`, when the sink can see it.
    ///
    /// Drafts are compared against this rather than the editor's own last
    /// commit, so a commit that was rolled back can be retried unchanged.
    fn shown(&self, _field: &str) -> Option<Value> {
        None
    }
}

impl<F> CommitSink for F
where
    F: Fn(&str, Value) + Send + Sync + 'static,
{
    fn commit(&self, field: &str, value: Value) {
        self(field, value)
    }
}

/// How a field is edited.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorKind {
    /// Typed input, debounced.
    FreeText,
    /// Closed set of valid values, committed on selection.
    Choice(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DraftError {
    #[error("{0} is not one of the allowed choices")]
    NotAChoice(Value),
    #[error("free-text fields have no choices to select")]
    NotAChoiceField,
    #[error("choice fields commit on selection, not on keystrokes")]
    NotFreeText,
}

struct DraftState {
    committed: Value,
    draft: Value,
    editing: bool,
    /// Bumped on every keystroke/confirm/cancel; stale timers compare against it.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl DraftState {
    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Promote the draft to committed, unless it matches what is shown.
    fn take_commit(&mut self, shown: Option<Value>) -> Option<Value> {
        if let Some(shown) = shown {
            self.committed = shown;
        }
        if self.draft == self.committed {
            return None;
        }
        self.committed = self.draft.clone();
        Some(self.draft.clone())
    }
}

/// Editing state of one field of one record.
pub struct DraftEditor {
    field: String,
    kind: EditorKind,
    quiet: Duration,
    sink: Arc<dyn CommitSink>,
    state: Arc<Mutex<DraftState>>,
}

impl DraftEditor {
    pub fn new(
        field: impl Into<String>,
        kind: EditorKind,
        committed: Value,
        sink: impl CommitSink,
    ) -> Self {
        Self {
            field: field.into(),
            kind,
            quiet: DEFAULT_DEBOUNCE,
            sink: Arc::new(sink),
            state: Arc::new(Mutex::new(DraftState {
                draft: committed.clone(),
                committed,
                editing: false,
                generation: 0,
                timer: None,
            })),
        }
    }

    /// Override the quiet period.
    pub fn with_quiet_period(mut self, quiet: Duration) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn kind(&self) -> &EditorKind {
        &self.kind
    }

    fn lock(&self) -> MutexGuard<'_, DraftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter edit mode with the last committed value as the draft.
    pub fn begin(&self) {
        let shown = self.sink.shown(&self.field);
        let mut state = self.lock();
        if !state.editing {
            if let Some(shown) = shown {
                state.committed = shown;
            }
            state.draft = state.committed.clone();
            state.editing = true;
        }
    }

    /// Record a keystroke and restart the quiet-period timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn keystroke(&self, draft: Value) -> Result<(), DraftError> {
        if self.kind != EditorKind::FreeText {
            return Err(DraftError::NotFreeText);
        }

        let mut state = self.lock();
        state.cancel_timer();
        state.draft = draft;
        state.editing = true;

        let generation = state.generation;
        let shared = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let field = self.field.clone();
        let quiet = self.quiet;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            let shown = sink.shown(&field);
            let value = {
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if state.generation != generation {
                    return;
                }
                state.timer = None;
                state.take_commit(shown)
            };
            if let Some(value) = value {
                log::debug!("Debounced commit of field '{field}'");
                sink.commit(&field, value);
            }
        }));
        Ok(())
    }

    /// Commit the latest draft immediately and leave edit mode.
    pub fn confirm(&self) {
        let shown = self.sink.shown(&self.field);
        let value = {
            let mut state = self.lock();
            state.cancel_timer();
            state.editing = false;
            state.take_commit(shown)
        };
        if let Some(value) = value {
            self.sink.commit(&self.field, value);
        }
    }

    /// Discard the draft and leave edit mode without committing.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancel_timer();
        state.draft = state.committed.clone();
        state.editing = false;
    }

    /// Pick one of the allowed values; commits immediately.
    pub fn select(&self, value: Value) -> Result<(), DraftError> {
        let EditorKind::Choice(choices) = &self.kind else {
            return Err(DraftError::NotAChoiceField);
        };
        if !choices.contains(&value) {
            return Err(DraftError::NotAChoice(value));
        }

        let shown = self.sink.shown(&self.field);
        let commit = {
            let mut state = self.lock();
            state.cancel_timer();
            state.draft = value;
            state.editing = false;
            state.take_commit(shown)
        };
        if let Some(value) = commit {
            self.sink.commit(&self.field, value);
        }
        Ok(())
    }

    /// Follow an authoritative value shown for this field.
    ///
    /// An in-progress draft is never clobbered.
    pub fn sync_committed(&self, value: Value) {
        let mut state = self.lock();
        if !state.editing {
            state.draft = value.clone();
        }
        state.committed = value;
    }

    pub fn draft(&self) -> Value {
        self.lock().draft.clone()
    }

    pub fn committed(&self) -> Value {
        self.lock().committed.clone()
    }

    pub fn is_editing(&self) -> bool {
        self.lock().editing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, RecordData};
    use crate::reconcile::RecordCache;
    use chrono::Utc;
    use serde_json::json;

    type Commits = Arc<Mutex<Vec<(String, Value)>>>;

    fn recorder() -> (Commits, impl CommitSink) {
        let commits: Commits = Arc::new(Mutex::new(Vec::new()));
        let sink_commits = commits.clone();
        let sink = move |field: &str, value: Value| {
            sink_commits.lock().unwrap().push((field.to_string(), value));
        };
        (commits, sink)
    }

    fn count(commits: &Commits) -> usize {
        commits.lock().unwrap().len()
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystrokes_restart_quiet_period() {
        let (commits, sink) = recorder();
        let editor = DraftEditor::new("title", EditorKind::FreeText, json!("A"), sink);

        editor.keystroke(json!("B")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        editor.keystroke(json!("Bo")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count(&commits), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let commits = commits.lock().unwrap();
        assert_eq!(commits.as_slice(), &[("title".to_string(), json!("Bo"))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_commits_immediately_once() {
        let (commits, sink) = recorder();
        let editor = DraftEditor::new("title", EditorKind::FreeText, json!("A"), sink);

        editor.begin();
        editor.keystroke(json!("B")).unwrap();
        editor.confirm();
        assert_eq!(count(&commits), 1);
        assert!(!editor.is_editing());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count(&commits), 1);
        assert_eq!(editor.committed(), json!("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_draft() {
        let (commits, sink) = recorder();
        let editor = DraftEditor::new("title", EditorKind::FreeText, json!("A"), sink);

        editor.keystroke(json!("typo")).unwrap();
        editor.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(count(&commits), 0);
        assert_eq!(editor.draft(), json!("A"));
        assert!(!editor.is_editing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_draft_is_not_committed() {
        let (commits, sink) = recorder();
        let editor = DraftEditor::new("title", EditorKind::FreeText, json!("A"), sink);

        editor.keystroke(json!("AB")).unwrap();
        editor.keystroke(json!("A")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        editor.confirm();

        assert_eq!(count(&commits), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_quiet_period() {
        let (commits, sink) = recorder();
        let editor = DraftEditor::new("score", EditorKind::FreeText, json!(1), sink)
            .with_quiet_period(Duration::from_millis(50));

        editor.keystroke(json!(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count(&commits), 1);
    }

    #[tokio::test]
    async fn test_choice_commits_on_selection() {
        let (commits, sink) = recorder();
        let choices = vec![json!("draft"), json!("published")];
        let editor = DraftEditor::new("status", EditorKind::Choice(choices), json!("draft"), sink);

        editor.begin();
        editor.select(json!("published")).unwrap();
        assert_eq!(count(&commits), 1);
        assert!(!editor.is_editing());

        assert_eq!(
            editor.select(json!("bogus")),
            Err(DraftError::NotAChoice(json!("bogus")))
        );
        assert_eq!(editor.keystroke(json!("x")), Err(DraftError::NotFreeText));
        assert_eq!(count(&commits), 1);
    }

    #[test]
    fn test_free_text_has_no_choices() {
        let (_commits, sink) = recorder();
        let editor = DraftEditor::new("title", EditorKind::FreeText, json!("A"), sink);
        assert_eq!(editor.select(json!("A")), Err(DraftError::NotAChoiceField));
    }

    /// Sink over a record cache whose every mutation fails and rolls back.
    struct RejectingSink {
        cache: Arc<RecordCache>,
        commits: Commits,
    }

    impl CommitSink for RejectingSink {
        fn commit(&self, field: &str, value: Value) {
            let mut patch = RecordData::new();
            patch.insert(field.to_string(), value.clone());
            let ticket = self.cache.begin_edit(1, patch).unwrap();
            self.cache.fail_mutation(ticket);
            self.commits.lock().unwrap().push((field.to_string(), value));
        }

        fn shown(&self, field: &str) -> Option<Value> {
            let snapshot = self.cache.snapshot();
            let record = snapshot.get(1)?.display();
            record.field(field).cloned()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolled_back_commit_can_be_retried() {
        let cache = Arc::new(RecordCache::new());
        let mut data = RecordData::new();
        data.insert("title".into(), json!("A"));
        cache.apply_incoming(Record::new_created(1, data, Utc::now()));

        let commits: Commits = Arc::new(Mutex::new(Vec::new()));
        let sink = RejectingSink {
            cache: cache.clone(),
            commits: commits.clone(),
        };
        let editor = DraftEditor::new("title", EditorKind::FreeText, json!("A"), sink);

        editor.begin();
        editor.keystroke(json!("B")).unwrap();
        editor.confirm();
        assert_eq!(count(&commits), 1);
        let shown = cache.snapshot().get(1).unwrap().display();
        assert_eq!(shown.field("title"), Some(&json!("A")));

        // The draft starts from what is shown, and the same value goes out again
        editor.begin();
        assert_eq!(editor.draft(), json!("A"));
        editor.keystroke(json!("B")).unwrap();
        editor.confirm();
        assert_eq!(count(&commits), 2);

        editor.begin();
        editor.keystroke(json!("B")).unwrap();
        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        assert_eq!(count(&commits), 3);
    }

    #[test]
    fn test_sync_committed_respects_active_draft() {
        let (_commits, sink) = recorder();
        let editor = DraftEditor::new("title", EditorKind::FreeText, json!("A"), sink);

        editor.sync_committed(json!("server"));
        assert_eq!(editor.draft(), json!("server"));

        editor.begin();
        editor.sync_committed(json!("newer"));
        assert_eq!(editor.draft(), json!("server"));
        assert_eq!(editor.committed(), json!("newer"));
    }
}
