//! In-memory order sessions.
//!
//! A session lives only as long as the process. Each one carries its own
//! lock; per-item resolution tasks update counters and proposal slots
//! through the methods here, never by sharing the state directly. Every
//! change bumps a `watch` version so progress streams can wake up.

use serde::{Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};

use crate::models::{CatalogProduct, ListItem};
use crate::resolver::MatchStatus;

/// Lifecycle of a session. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Starting,
    LoggingIn,
    FetchingList,
    Searching,
    Ready,
    Committing,
    Done,
    Error,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Done | SessionPhase::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Starting => "starting",
            SessionPhase::LoggingIn => "logging_in",
            SessionPhase::FetchingList => "fetching_list",
            SessionPhase::Searching => "searching",
            SessionPhase::Ready => "ready",
            SessionPhase::Committing => "committing",
            SessionPhase::Done => "done",
            SessionPhase::Error => "error",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-proposal status shown in the review listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalStatus {
    Pending,
    Resolved(MatchStatus),
    Error(String),
}

impl ProposalStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, ProposalStatus::Error(_))
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalStatus::Pending => f.write_str("Pending"),
            ProposalStatus::Resolved(status) => write!(f, "{}", status),
            ProposalStatus::Error(message) => write!(f, "Error: {}", message),
        }
    }
}

impl Serialize for ProposalStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One deduplicated line of the shopping list and its resolution.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalItem {
    pub index: usize,
    pub text: String,
    /// Every list entry folded into this proposal; all are checked off on commit.
    pub sources: Vec<ListItem>,
    pub grocery_item_id: Option<i64>,
    pub grocery_item_name: Option<String>,
    pub status: ProposalStatus,
    pub chosen: Option<CatalogProduct>,
    pub alternatives: Vec<CatalogProduct>,
    pub matched_rank: Option<i64>,
}

impl ProposalItem {
    pub fn new(index: usize, text: String, sources: Vec<ListItem>) -> Self {
        Self {
            index,
            text,
            sources,
            grocery_item_id: None,
            grocery_item_name: None,
            status: ProposalStatus::Pending,
            chosen: None,
            alternatives: Vec::new(),
            matched_rank: None,
        }
    }
}

/// Point-in-time view of a session for progress reporting.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Progress {
    pub session_id: String,
    pub phase: SessionPhase,
    pub total: usize,
    pub searched: usize,
    /// Texts of proposals currently being resolved.
    pub active: Vec<String>,
    pub error: Option<String>,
    pub detail: Option<String>,
}

struct SessionState {
    phase: SessionPhase,
    proposals: Vec<ProposalItem>,
    searched: usize,
    active: BTreeSet<usize>,
    error: Option<String>,
    detail: Option<String>,
    last_activity: Instant,
}

pub struct OrderSession {
    pub id: String,
    state: RwLock<SessionState>,
    version: watch::Sender<u64>,
}

impl OrderSession {
    fn new(id: String) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            id,
            state: RwLock::new(SessionState {
                phase: SessionPhase::Starting,
                proposals: Vec::new(),
                searched: 0,
                active: BTreeSet::new(),
                error: None,
                detail: None,
                last_activity: Instant::now(),
            }),
            version,
        }
    }

    /// Apply `f` under the write lock and notify watchers.
    async fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let result = {
            let mut state = self.state.write().await;
            state.last_activity = Instant::now();
            f(&mut state)
        };
        self.version.send_modify(|v| *v += 1);
        result
    }

    /// Receiver that changes whenever the session does.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.read().await.phase
    }

    /// Move to `phase`. Refused (returns `false`) once the session is terminal.
    pub async fn set_phase(&self, phase: SessionPhase) -> bool {
        self.update(|s| {
            if s.phase.is_terminal() {
                return false;
            }
            s.phase = phase;
            true
        })
        .await
    }

    /// Move from `expected` to `next` atomically. Returns the actual phase on mismatch.
    pub async fn transition(
        &self,
        expected: SessionPhase,
        next: SessionPhase,
    ) -> Result<(), SessionPhase> {
        self.update(|s| {
            if s.phase != expected {
                return Err(s.phase);
            }
            s.phase = next;
            Ok(())
        })
        .await
    }

    /// Enter the terminal `error` phase with a user-facing message.
    pub async fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let id = self.id.clone();
        self.update(|s| {
            if s.phase.is_terminal() {
                return;
            }
            tracing::error!(session_id = %id, error = %message, "Order session failed");
            s.phase = SessionPhase::Error;
            s.active.clear();
            s.error = Some(message);
        })
        .await
    }

    pub async fn set_detail(&self, detail: impl Into<String>) {
        let detail = detail.into();
        self.update(|s| s.detail = Some(detail)).await
    }

    pub async fn set_proposals(&self, proposals: Vec<ProposalItem>) {
        self.update(|s| {
            s.proposals = proposals;
            s.searched = 0;
            s.active.clear();
        })
        .await
    }

    pub async fn begin_item(&self, index: usize) {
        self.update(|s| {
            s.active.insert(index);
        })
        .await
    }

    /// Record a finished resolution: applies `f` to the proposal, drops it
    /// from the active set and bumps the searched counter.
    pub async fn finish_item(&self, index: usize, f: impl FnOnce(&mut ProposalItem)) {
        self.update(|s| {
            if let Some(proposal) = s.proposals.get_mut(index) {
                f(proposal);
            }
            s.active.remove(&index);
            s.searched += 1;
        })
        .await
    }

    pub async fn proposals(&self) -> Vec<ProposalItem> {
        self.state.read().await.proposals.clone()
    }

    pub async fn touch(&self) {
        self.update(|_| ()).await
    }

    pub async fn idle_for(&self) -> Duration {
        self.state.read().await.last_activity.elapsed()
    }

    pub async fn progress(&self) -> Progress {
        let s = self.state.read().await;
        Progress {
            session_id: self.id.clone(),
            phase: s.phase,
            total: s.proposals.len(),
            searched: s.searched,
            active: s
                .active
                .iter()
                .filter_map(|i| s.proposals.get(*i))
                .map(|p| p.text.clone())
                .collect(),
            error: s.error.clone(),
            detail: s.detail.clone(),
        }
    }
}

/// Registry of live sessions, keyed by id.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<OrderSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self) -> Arc<OrderSession> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(OrderSession::new(id.clone()));
        self.sessions.write().await.insert(id, session.clone());
        session
    }

    pub async fn get(&self, id: &str) -> Option<Arc<OrderSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<OrderSession>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions idle for longer than `ttl`. Returns how many went.
    pub async fn expire(&self, ttl: Duration) -> usize {
        let snapshot: Vec<Arc<OrderSession>> =
            self.sessions.read().await.values().cloned().collect();

        let mut stale = Vec::new();
        for session in snapshot {
            if session.idle_for().await > ttl {
                stale.push(session.id.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        for id in &stale {
            sessions.remove(id);
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "Expired idle order sessions");
        }
        stale.len()
    }
}
