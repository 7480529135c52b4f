//! Order session pipeline.
//!
//! ```text
//! starting → logging_in → fetching_list → searching → ready → committing → done
//!     └──────────────┴──────────────┴────────────┴─────────────→ error
//! ```
//!
//! [`OrderPipeline::start_session`] returns at once and drives the session
//! in a background task. Searching fans out one task per proposal, bounded
//! by `order.search_concurrency`; a failing or panicking task only marks
//! its own proposal `Error: ..`. The session reaches `ready` once every
//! task has been joined.
//!
//! [`OrderPipeline::commit`] applies the reviewed decisions with the same
//! fan-out and reports per-item [`CommitEvent`]s over a channel, ending
//! with [`CommitEvent::Complete`].

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::error::{ServiceError, SessionError};
use crate::history::record_order_log;
use crate::http_services::{HttpCatalog, HttpShoppingList};
use crate::learning::{is_correction, learn_from_choice};
use crate::matcher::{find_match, normalize};
use crate::models::{CatalogProduct, GroceryItem, ListItem, NewOrderLog};
use crate::resolver::{CatalogResolver, Resolution};
use crate::retry::{ResilientCatalog, ResilientList, RetryPolicy};
use crate::services::{ProductCatalog, ShoppingList};
use crate::session::{
    OrderSession, ProposalItem, ProposalStatus, Progress, SessionManager, SessionPhase,
};
use crate::store::PreferenceStore;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub search_concurrency: usize,
    pub search_limit: usize,
    pub login_timeout: Duration,
    pub stale_after: Duration,
    pub session_ttl: Duration,
    pub skip_checkoff: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            search_concurrency: config.order.search_concurrency.max(1),
            search_limit: config.order.search_limit.max(1),
            login_timeout: config.order.login_timeout(),
            stale_after: config.order.stale_after(),
            session_ttl: config.order.session_ttl(),
            skip_checkoff: config
                .shopping_list
                .as_ref()
                .map(|l| l.skip_checkoff)
                .unwrap_or(false),
        }
    }
}

/// The user's verdict on one proposal.
///
/// Proposals without a decision commit their proposed product.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitDecision {
    pub index: usize,
    #[serde(default)]
    pub skip: bool,
    /// Replacement product; `None` keeps the proposal's choice.
    #[serde(default)]
    pub product: Option<CatalogProduct>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommitEvent {
    Active {
        index: usize,
        text: String,
    },
    Done {
        index: usize,
        text: String,
        success: bool,
        product: Option<String>,
        reason: Option<String>,
    },
    Skip {
        index: usize,
        text: String,
    },
    Complete {
        added: usize,
        skipped: usize,
        failed: usize,
    },
    Error {
        message: String,
    },
}

impl CommitEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CommitEvent::Active { .. } => "active",
            CommitEvent::Done { .. } => "done",
            CommitEvent::Skip { .. } => "skip",
            CommitEvent::Complete { .. } => "complete",
            CommitEvent::Error { .. } => "error",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, CommitEvent::Complete { .. } | CommitEvent::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitOutcome {
    Added,
    Skipped,
    Failed,
}

struct Resolved {
    grocery_item: Option<GroceryItem>,
    resolution: Resolution,
}

#[derive(Clone)]
pub struct OrderPipeline {
    store: Arc<PreferenceStore>,
    catalog: Arc<dyn ProductCatalog>,
    list: Arc<dyn ShoppingList>,
    resolver: Arc<CatalogResolver>,
    sessions: Arc<SessionManager>,
    settings: PipelineSettings,
}

impl OrderPipeline {
    /// Build a pipeline over already-constructed collaborators. Retry
    /// wrapping is the caller's business (see [`OrderPipeline::from_config`]).
    pub fn new(
        store: Arc<PreferenceStore>,
        catalog: Arc<dyn ProductCatalog>,
        list: Arc<dyn ShoppingList>,
        settings: PipelineSettings,
    ) -> Self {
        let resolver = Arc::new(CatalogResolver::new(
            catalog.clone(),
            store.clone(),
            settings.search_limit,
        ));
        Self {
            store,
            catalog,
            list,
            resolver,
            sessions: Arc::new(SessionManager::new()),
            settings,
        }
    }

    /// Wire the HTTP bridges from `[catalog]` / `[shopping_list]`, wrapped
    /// in the configured retry policy.
    pub fn from_config(config: &Config, store: Arc<PreferenceStore>) -> Result<Self> {
        let Some(catalog_config) = &config.catalog else {
            bail!("[catalog] section is required to place orders");
        };
        let Some(list_config) = &config.shopping_list else {
            bail!("[shopping_list] section is required to place orders");
        };

        let policy = RetryPolicy::from_config(&config.retry);
        let catalog: Arc<dyn ProductCatalog> = Arc::new(ResilientCatalog::new(
            Arc::new(HttpCatalog::new(catalog_config)?),
            policy.clone(),
        ));
        let list: Arc<dyn ShoppingList> = Arc::new(ResilientList::new(
            Arc::new(HttpShoppingList::new(list_config)?),
            policy,
        ));

        Ok(Self::new(
            store,
            catalog,
            list,
            PipelineSettings::from_config(config),
        ))
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<PreferenceStore> {
        &self.store
    }

    /// Register a new session and resolve it in the background.
    pub async fn start_session(&self) -> Arc<OrderSession> {
        let session = self.sessions.create().await;
        let this = self.clone();
        let background = session.clone();
        tokio::spawn(async move {
            this.run_session(background).await;
        });
        session
    }

    pub async fn session(&self, session_id: &str) -> Result<Arc<OrderSession>> {
        self.sessions
            .get(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()).into())
    }

    pub async fn progress(&self, session_id: &str) -> Result<Progress> {
        Ok(self.session(session_id).await?.progress().await)
    }

    pub async fn review(&self, session_id: &str) -> Result<Vec<ProposalItem>> {
        Ok(self.session(session_id).await?.proposals().await)
    }

    /// Drive a session from `starting` to `ready` (or `error`).
    pub async fn run_session(&self, session: Arc<OrderSession>) {
        tracing::info!(session_id = %session.id, "Order session started");

        session.set_phase(SessionPhase::LoggingIn).await;
        session.set_detail("Checking logins...").await;
        match tokio::time::timeout(self.settings.login_timeout, self.login()).await {
            Err(_) => {
                session
                    .fail(format!(
                        "Timed out after {:?} waiting for login",
                        self.settings.login_timeout
                    ))
                    .await;
                return;
            }
            Ok(Err(e)) => {
                session.fail(service_failure_message(&e)).await;
                return;
            }
            Ok(Ok(())) => {}
        }

        session.set_phase(SessionPhase::FetchingList).await;
        session
            .set_detail(format!("Fetching your {} items", self.list.name()))
            .await;
        let items = match self.list.fetch_items().await {
            Ok(items) => items,
            Err(e) => {
                session.fail(service_failure_message(&e)).await;
                return;
            }
        };

        let proposals = group_list_items(items);
        if proposals.is_empty() {
            session
                .fail("The shopping list is empty; there is nothing to order")
                .await;
            return;
        }
        session.set_proposals(proposals.clone()).await;

        session.set_phase(SessionPhase::Searching).await;
        session
            .set_detail(format!("Searching for {} items", proposals.len()))
            .await;
        if let Some(message) = self.search_all(&session, &proposals).await {
            session.fail(message).await;
            return;
        }

        if session.set_phase(SessionPhase::Ready).await {
            let proposals = session.proposals().await;
            let failed = proposals.iter().filter(|p| p.status.is_error()).count();
            session
                .set_detail(format!("{} items ready for review", proposals.len()))
                .await;
            tracing::info!(
                session_id = %session.id,
                proposals = proposals.len(),
                failed,
                "Order session ready for review"
            );
        }
    }

    async fn login(&self) -> Result<(), ServiceError> {
        tokio::try_join!(self.catalog.authenticate(), self.list.authenticate())?;
        Ok(())
    }

    /// Resolve every proposal concurrently. Returns a session-level error
    /// message when authorization failed for good.
    async fn search_all(
        &self,
        session: &Arc<OrderSession>,
        proposals: &[ProposalItem],
    ) -> Option<String> {
        let semaphore = Arc::new(Semaphore::new(self.settings.search_concurrency));
        let mut tasks = Vec::with_capacity(proposals.len());

        let mut scheduling_error = None;
        for proposal in proposals {
            let permit = match acquire_slot(&semaphore, "Search").await {
                Ok(permit) => permit,
                Err(message) => {
                    scheduling_error = Some(message);
                    break;
                }
            };
            let this = self.clone();
            let session = session.clone();
            let index = proposal.index;
            let text = proposal.text.clone();

            let task = tokio::spawn(async move {
                session.begin_item(index).await;
                let outcome = this.resolve_text(&text).await;
                drop(permit);

                let auth_failure = match &outcome {
                    Err(e) => e
                        .downcast_ref::<ServiceError>()
                        .filter(|e| e.is_auth())
                        .map(service_failure_message),
                    Ok(_) => None,
                };
                if let Err(e) = &outcome {
                    tracing::warn!(session_id = %session.id, text = %text, error = %e, "Resolution failed");
                }
                session
                    .finish_item(index, |p| apply_resolution(p, outcome))
                    .await;
                auth_failure
            });
            tasks.push((index, task));
        }

        let mut auth_failure = None;
        for (index, task) in tasks {
            match task.await {
                Ok(Some(message)) => {
                    auth_failure.get_or_insert(message);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(session_id = %session.id, index, error = %e, "Resolution task failed");
                    session
                        .finish_item(index, |p| {
                            p.status = ProposalStatus::Error(format!("resolution task failed: {}", e))
                        })
                        .await;
                }
            }
        }
        auth_failure.or(scheduling_error)
    }

    async fn resolve_text(&self, text: &str) -> Result<Resolved> {
        let matched = find_match(&self.store, text).await?;
        let resolution = self.resolver.resolve(text, &matched).await?;
        Ok(Resolved {
            grocery_item: matched.grocery_item,
            resolution,
        })
    }

    /// Apply review decisions to a `ready` session.
    ///
    /// Returns the receiving end of the event stream; the work itself runs
    /// in the background and ends the session in `done`.
    pub async fn commit(
        &self,
        session_id: &str,
        decisions: Vec<CommitDecision>,
    ) -> Result<mpsc::Receiver<CommitEvent>> {
        let session = self.session(session_id).await?;
        let proposals = session.proposals().await;
        if let Some(bad) = decisions.iter().find(|d| d.index >= proposals.len()) {
            return Err(SessionError::UnknownProposal(bad.index).into());
        }

        session
            .transition(SessionPhase::Ready, SessionPhase::Committing)
            .await
            .map_err(|actual| SessionError::WrongPhase {
                id: session_id.to_string(),
                expected: SessionPhase::Ready.as_str(),
                actual: actual.to_string(),
            })?;

        // Room for every event, so senders never wait on a slow reader.
        let (tx, rx) = mpsc::channel(proposals.len() * 2 + 2);
        let decisions: HashMap<usize, CommitDecision> =
            decisions.into_iter().map(|d| (d.index, d)).collect();

        let this = self.clone();
        tokio::spawn(async move {
            this.run_commit(session, proposals, decisions, tx).await;
        });
        Ok(rx)
    }

    async fn run_commit(
        &self,
        session: Arc<OrderSession>,
        proposals: Vec<ProposalItem>,
        mut decisions: HashMap<usize, CommitDecision>,
        tx: mpsc::Sender<CommitEvent>,
    ) {
        tracing::info!(session_id = %session.id, items = proposals.len(), "Committing order");

        let semaphore = Arc::new(Semaphore::new(self.settings.search_concurrency));
        let mut tasks = Vec::with_capacity(proposals.len());

        let mut scheduling_error = None;
        for proposal in proposals {
            let decision = decisions.remove(&proposal.index);
            let permit = match acquire_slot(&semaphore, "Commit").await {
                Ok(permit) => permit,
                Err(message) => {
                    scheduling_error = Some(message);
                    break;
                }
            };
            let this = self.clone();
            let session = session.clone();
            let tx = tx.clone();
            let index = proposal.index;
            let text = proposal.text.clone();

            let task = tokio::spawn(async move {
                let outcome = this.commit_item(&session.id, proposal, decision, &tx).await;
                drop(permit);
                session.touch().await;
                outcome
            });
            tasks.push((index, text, task));
        }

        let (mut added, mut skipped, mut failed) = (0, 0, 0);
        for (index, text, task) in tasks {
            match task.await {
                Ok(CommitOutcome::Added) => added += 1,
                Ok(CommitOutcome::Skipped) => skipped += 1,
                Ok(CommitOutcome::Failed) => failed += 1,
                Err(e) => {
                    failed += 1;
                    tracing::error!(session_id = %session.id, index, error = %e, "Commit task failed");
                    send(
                        &tx,
                        CommitEvent::Done {
                            index,
                            text,
                            success: false,
                            product: None,
                            reason: Some(format!("commit task failed: {}", e)),
                        },
                    )
                    .await;
                }
            }
        }

        if let Some(message) = scheduling_error {
            send(
                &tx,
                CommitEvent::Error {
                    message: message.clone(),
                },
            )
            .await;
            session.fail(message).await;
            return;
        }

        send(
            &tx,
            CommitEvent::Complete {
                added,
                skipped,
                failed,
            },
        )
        .await;
        session.set_phase(SessionPhase::Done).await;
        tracing::info!(session_id = %session.id, added, skipped, failed, "Order committed");
    }

    async fn commit_item(
        &self,
        session_id: &str,
        proposal: ProposalItem,
        decision: Option<CommitDecision>,
        tx: &mpsc::Sender<CommitEvent>,
    ) -> CommitOutcome {
        let index = proposal.index;
        let text = proposal.text.clone();
        let proposed_name = proposal.chosen.as_ref().map(|p| p.name.clone());
        let mut entry = NewOrderLog {
            session_id: session_id.to_string(),
            list_text: text.clone(),
            matched_grocery_item_id: proposal.grocery_item_id,
            proposed_product: proposed_name,
            ..Default::default()
        };

        let (skip, replacement) = match decision {
            Some(d) => (d.skip, d.product),
            None => (false, None),
        };

        if skip {
            entry.skipped = true;
            self.log(&entry).await;
            send(tx, CommitEvent::Skip { index, text }).await;
            return CommitOutcome::Skipped;
        }

        send(
            tx,
            CommitEvent::Active {
                index,
                text: text.clone(),
            },
        )
        .await;

        let Some(chosen) = replacement.or_else(|| proposal.chosen.clone()) else {
            self.log(&entry).await;
            send(tx, failed_event(index, text, None, "No product selected".into())).await;
            return CommitOutcome::Failed;
        };
        entry.final_product = Some(chosen.name.clone());

        if let Err(e) = self.add_to_cart(&chosen).await {
            tracing::warn!(session_id, text = %text, product = %chosen.name, error = %e, "Cart add failed");
            self.log(&entry).await;
            send(
                tx,
                failed_event(index, text, Some(chosen.name.clone()), format!("{:#}", e)),
            )
            .await;
            return CommitOutcome::Failed;
        }
        entry.added_to_cart = true;

        let mut notes = Vec::new();
        if !self.settings.skip_checkoff {
            for source in &proposal.sources {
                if let Err(e) = self.list.mark_complete(source).await {
                    tracing::warn!(session_id, text = %source.text, error = %e, "Check-off failed");
                    notes.push(format!("'{}' not checked off", source.text));
                }
            }
        }

        entry.was_corrected = is_correction(proposal.chosen.as_ref(), &chosen);
        if let Err(e) = learn_from_choice(
            &self.store,
            &text,
            proposal.grocery_item_id,
            &chosen.to_product_info(),
            entry.was_corrected,
        )
        .await
        {
            tracing::warn!(session_id, text = %text, error = %e, "Learning failed");
            notes.push(format!("preferences not updated: {:#}", e));
        }

        self.log(&entry).await;
        send(
            tx,
            CommitEvent::Done {
                index,
                text,
                success: true,
                product: Some(chosen.name),
                reason: (!notes.is_empty()).then(|| notes.join("; ")),
            },
        )
        .await;
        CommitOutcome::Added
    }

    /// Add by identifier; otherwise resolve the URL to a catalog reference first.
    async fn add_to_cart(&self, product: &CatalogProduct) -> Result<()> {
        if let Some(identifier) = product.identifier.as_deref().filter(|i| !i.is_empty()) {
            self.catalog.add_to_cart(identifier, 1).await?;
            return Ok(());
        }

        let Some(url) = product.url.as_deref().filter(|u| !u.is_empty()) else {
            bail!("'{}' has no catalog identifier or URL", product.name);
        };
        let details = self
            .catalog
            .get_details(url)
            .await?
            .ok_or_else(|| anyhow!("'{}' was not found in the catalog", product.name))?;
        let reference = details.reference().unwrap_or(url).to_string();
        self.catalog.add_to_cart(&reference, 1).await?;
        Ok(())
    }

    async fn log(&self, entry: &NewOrderLog) {
        if let Err(e) = record_order_log(&self.store, entry).await {
            tracing::error!(session_id = %entry.session_id, text = %entry.list_text, error = %e, "Failed to write order log");
        }
    }

    /// Free-text catalog search for the review product picker.
    pub async fn search_catalog(&self, query: &str) -> Result<Vec<CatalogProduct>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.catalog.search(query, self.settings.search_limit).await?)
    }

    /// Look up a product by URL or identifier pasted during review.
    pub async fn lookup_product(&self, reference: &str) -> Result<Option<CatalogProduct>> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Ok(None);
        }
        Ok(self.catalog.get_details(reference).await?)
    }
}

/// Collapse list entries with the same normalized text into one proposal.
/// Proposal order follows first appearance; blank entries are dropped.
pub fn group_list_items(items: Vec<ListItem>) -> Vec<ProposalItem> {
    let mut proposals: Vec<ProposalItem> = Vec::new();
    let mut by_text: HashMap<String, usize> = HashMap::new();

    for item in items {
        let key = normalize(&item.text);
        if key.is_empty() {
            continue;
        }
        match by_text.get(&key) {
            Some(&index) => proposals[index].sources.push(item),
            None => {
                let index = proposals.len();
                by_text.insert(key, index);
                let text = item.text.trim().to_string();
                proposals.push(ProposalItem::new(index, text, vec![item]));
            }
        }
    }
    proposals
}

fn apply_resolution(proposal: &mut ProposalItem, outcome: Result<Resolved>) {
    match outcome {
        Ok(resolved) => {
            if let Some(item) = resolved.grocery_item {
                proposal.grocery_item_id = Some(item.id);
                proposal.grocery_item_name = Some(item.name);
            }
            proposal.status = ProposalStatus::Resolved(resolved.resolution.status);
            proposal.chosen = resolved.resolution.best().cloned();
            proposal.matched_rank = resolved.resolution.matched_rank;
            proposal.alternatives = resolved.resolution.candidates;
        }
        Err(e) => proposal.status = ProposalStatus::Error(format!("{:#}", e)),
    }
}

fn service_failure_message(e: &ServiceError) -> String {
    if e.is_auth() {
        format!("Needs re-authentication: {}", e)
    } else {
        format!("External service unavailable: {}", e)
    }
}

fn failed_event(index: usize, text: String, product: Option<String>, reason: String) -> CommitEvent {
    CommitEvent::Done {
        index,
        text,
        success: false,
        product,
        reason: Some(reason),
    }
}

/// Wait for a concurrency slot. A closed semaphore becomes a session error
/// message instead of a panic.
async fn acquire_slot(
    semaphore: &Arc<Semaphore>,
    what: &str,
) -> std::result::Result<OwnedSemaphorePermit, String> {
    semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| format!("{} scheduling failed: {}", what, e))
}

async fn send(tx: &mpsc::Sender<CommitEvent>, event: CommitEvent) {
    if tx.send(event).await.is_err() {
        tracing::debug!("Commit listener went away");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, text: &str) -> ListItem {
        ListItem {
            id: id.to_string(),
            text: text.to_string(),
            list_id: "L".into(),
            version: 1,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_grouping_collapses_duplicates() {
        let proposals = group_list_items(vec![
            entry("1", "Milk"),
            entry("2", "eggs"),
            entry("3", " milk "),
            entry("4", "   "),
            entry("5", "MILK"),
        ]);
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].index, 0);
        assert_eq!(proposals[0].text, "Milk");
        let ids: Vec<&str> = proposals[0].sources.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3", "5"]);
        assert_eq!(proposals[1].index, 1);
        assert_eq!(proposals[1].text, "eggs");
    }

    #[test]
    fn test_commit_event_shape() {
        let event = CommitEvent::Complete {
            added: 2,
            skipped: 1,
            failed: 0,
        };
        assert!(event.is_final());
        assert_eq!(event.name(), "complete");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["added"], 2);
    }

    #[test]
    fn test_decision_defaults() {
        let d: CommitDecision = serde_json::from_str(r#"{"index": 3}"#).unwrap();
        assert_eq!(d.index, 3);
        assert!(!d.skip);
        assert!(d.product.is_none());
    }

    #[tokio::test]
    async fn test_closed_semaphore_is_a_message() {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = acquire_slot(&semaphore, "Search").await.unwrap();
        drop(permit);

        semaphore.close();
        let err = acquire_slot(&semaphore, "Commit").await.unwrap_err();
        assert!(err.starts_with("Commit scheduling failed: "), "{}", err);
    }

    #[test]
    fn test_service_failure_messages_differ() {
        let auth = ServiceError::Unauthorized {
            service: "catalog".into(),
            message: "HTTP 401".into(),
        };
        let down = ServiceError::Unavailable {
            service: "catalog".into(),
            status: 503,
        };
        assert!(service_failure_message(&auth).starts_with("Needs re-authentication"));
        assert!(service_failure_message(&down).starts_with("External service unavailable"));
    }
}
