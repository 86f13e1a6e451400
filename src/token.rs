//! Hierarchical progress reporting.
//!
//! A [`Token`] is a shared handle onto one node of a progress tree. Each node
//! carries its own progress, status and state, plus a list of child tokens.
//! Reads aggregate over the subtree: state takes the maximum by severity rank,
//! progress averages over nodes that have actually reported, and status comes
//! from the most recently updated node.
//!
//! Locks are held only while copying a single node's record or child list,
//! never while recursing into children, so a worker can update its own token
//! while the runner polls the root.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// State reported by a token.
///
/// Ordering follows [`TokenState::rank`], not declaration order. Aggregation
/// takes the maximum, so an error anywhere in a subtree dominates, and a
/// running child keeps a parent running even when its siblings are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenState {
    NotStarted,
    Running,
    Done,
    Cancelled,
    Error,
}

impl TokenState {
    /// Severity rank used for aggregation.
    ///
    /// DONE=0 < NOTSTARTED=1 < RUNNING=2 < CANCELLED=3 < ERROR=4
    pub const fn rank(self) -> u8 {
        match self {
            TokenState::Done => 0,
            TokenState::NotStarted => 1,
            TokenState::Running => 2,
            TokenState::Cancelled => 3,
            TokenState::Error => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TokenState::Done | TokenState::Cancelled | TokenState::Error
        )
    }
}

impl Ord for TokenState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for TokenState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TokenState::NotStarted => "NOTSTARTED",
            TokenState::Running => "RUNNING",
            TokenState::Done => "DONE",
            TokenState::Cancelled => "CANCELLED",
            TokenState::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Record {
    progress: f64,
    status: String,
    state: TokenState,
    /// Set on the first `update`; distinguishes "never touched" from "touched at 0%".
    latest_update: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Node {
    name: String,
    category: Option<String>,
    record: Mutex<Record>,
    subtokens: Mutex<Vec<Token>>,
}

/// Thread-safe progress/state/status reporter. Cloning yields another handle
/// onto the same node.
#[derive(Clone)]
pub struct Token {
    node: Arc<Node>,
}

impl Token {
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    fn build(name: String, category: Option<String>) -> Self {
        Self {
            node: Arc::new(Node {
                name,
                category,
                record: Mutex::new(Record {
                    progress: 0.0,
                    status: "Not started".to_string(),
                    state: TokenState::NotStarted,
                    latest_update: None,
                }),
                subtokens: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn category(&self) -> Option<&str> {
        self.node.category.as_deref()
    }

    /// Append a new child and return it.
    pub fn create_subtoken(&self, name: impl Into<String>, category: Option<&str>) -> Token {
        let child = Token::detached(name, category);
        self.attach(&child);
        child
    }

    /// A token with a category that has no parent yet. See [`attach`](Self::attach).
    pub(crate) fn detached(name: impl Into<String>, category: Option<&str>) -> Token {
        Token::build(name.into(), category.map(str::to_owned))
    }

    /// Append an existing token as a child.
    pub(crate) fn attach(&self, child: &Token) {
        self.node.subtokens.lock().push(child.clone());
    }

    /// Snapshot of the direct children, optionally restricted to one category.
    pub fn get_subtokens(&self, category: Option<&str>) -> Vec<Token> {
        let subtokens = self.node.subtokens.lock();
        match category {
            None => subtokens.clone(),
            Some(category) => subtokens
                .iter()
                .filter(|t| t.category() == Some(category))
                .cloned()
                .collect(),
        }
    }

    /// Record new progress for this node. Progress is clamped to `[0, 1]`.
    pub fn update(&self, progress: f64, status: impl Into<String>, state: TokenState) {
        let progress = clamp_progress(progress);
        let status = status.into();
        let mut record = self.node.record.lock();
        record.progress = progress;
        record.status = status;
        record.state = state;
        record.latest_update = Some(Utc::now());
    }

    /// [`update`](Self::update) with state `RUNNING`.
    pub fn update_running(&self, progress: f64, status: impl Into<String>) {
        self.update(progress, status, TokenState::Running);
    }

    pub fn start(&self, status: Option<&str>) {
        self.update(0.01, status.unwrap_or("Started"), TokenState::Running);
    }

    pub fn done(&self, status: Option<&str>) {
        self.update(1.0, status.unwrap_or("Done"), TokenState::Done);
    }

    pub fn cancel(&self, status: Option<&str>) {
        self.update(1.0, status.unwrap_or("Cancelled"), TokenState::Cancelled);
    }

    pub fn error(&self, status: Option<&str>) {
        self.update(1.0, status.unwrap_or("Error"), TokenState::Error);
    }

    /// When this node itself was last updated. Children are not considered.
    pub fn latest_update(&self) -> Option<DateTime<Utc>> {
        self.node.record.lock().latest_update
    }

    /// True if this node or any descendant has ever been updated.
    pub fn is_touched(&self) -> bool {
        self.latest_update().is_some() || self.get_subtokens(None).iter().any(Token::is_touched)
    }

    /// Most severe state in the subtree. Every child contributes, this node
    /// contributes only once touched.
    pub fn state(&self) -> TokenState {
        let own = self.record();
        let subtokens = self.get_subtokens(None);
        subtokens
            .iter()
            .map(Token::state)
            .chain(own.latest_update.map(|_| own.state))
            .max()
            .unwrap_or(TokenState::NotStarted)
    }

    /// Mean progress over this node (if touched) and every touched child.
    /// Untouched children are left out so they do not pull the mean to zero.
    pub fn progress(&self) -> f64 {
        let own = self.record();
        let subtokens = self.get_subtokens(None);
        let values: Vec<f64> = own
            .latest_update
            .map(|_| own.progress)
            .into_iter()
            .chain(
                subtokens
                    .iter()
                    .filter(|t| t.is_touched())
                    .map(Token::progress),
            )
            .collect();

        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    /// Status of the most recently updated node in the subtree, or this
    /// node's own status if nothing has been touched.
    pub fn status(&self) -> String {
        match self.latest() {
            Some((_, status)) => status,
            None => self.record().status,
        }
    }

    fn latest(&self) -> Option<(DateTime<Utc>, String)> {
        let own = self.record();
        let mut latest = own.latest_update.map(|at| (at, own.status));
        for subtoken in self.get_subtokens(None) {
            let Some((at, status)) = subtoken.latest() else {
                continue;
            };
            if latest.as_ref().is_none_or(|(current, _)| at >= *current) {
                latest = Some((at, status));
            }
        }
        latest
    }

    fn record(&self) -> Record {
        self.node.record.lock().clone()
    }

    /// Serializable view of the whole subtree.
    pub fn snapshot(&self) -> TokenSnapshot {
        let own = self.record();
        TokenSnapshot {
            name: self.node.name.clone(),
            category: self.node.category.clone(),
            state: self.state(),
            progress: self.progress(),
            status: self.status(),
            latest_update: own.latest_update,
            subtokens: self
                .get_subtokens(None)
                .iter()
                .map(Token::snapshot)
                .collect(),
        }
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("name", &self.node.name)
            .field("category", &self.node.category)
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}

fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// Point-in-time copy of a token subtree, for display and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub name: String,
    pub category: Option<String>,
    pub state: TokenState,
    pub progress: f64,
    pub status: String,
    pub latest_update: Option<DateTime<Utc>>,
    pub subtokens: Vec<TokenSnapshot>,
}
