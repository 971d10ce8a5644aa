//! Human-In-The-Loop (HITL) approval workflow.
//!
//! 1. The gateway gets `RequireApproval` from the policy engine
//! 2. [`ApprovalQueue::enqueue`] stores a pending request in memory
//! 3. The caller blocks in [`ApprovalQueue::wait`], bounded by the request's
//!    `expires_at`
//! 4. An admin approves or denies via `POST /approval/decide`
//!
//! State machine: `pending -> approved | denied | expired`. Terminal states
//! are final. A request whose window has elapsed is expired on first touch,
//! whether that is the waiting caller, a late `decide`, or the sweeper job.
//!
//! Each entry carries a `watch` channel so a decision wakes its waiter
//! without polling.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::approval::{ApprovalRequest, ApprovalStatus, Decision};
use crate::models::operation::Operation;

pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Error, PartialEq)]
pub enum ApprovalError {
    #[error("approval request '{0}' not found")]
    NotFound(String),
    #[error("approval request is already {0}")]
    AlreadyDecided(ApprovalStatus),
}

struct Entry {
    request: ApprovalRequest,
    tx: watch::Sender<ApprovalStatus>,
}

impl Entry {
    fn finish(&mut self, status: ApprovalStatus, by: &str, now: DateTime<Utc>) {
        self.request.status = status;
        self.request.decided_at = Some(now);
        self.request.decided_by = Some(by.to_string());
        // send_replace never fails, even with no receivers left.
        self.tx.send_replace(status);
    }
}

pub struct ApprovalQueue {
    entries: Mutex<HashMap<String, Entry>>,
    wait_window: Duration,
}

impl ApprovalQueue {
    pub fn new(wait_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            wait_window,
        }
    }

    pub fn wait_window(&self) -> Duration {
        self.wait_window
    }

    /// Register a pending request. The receiver resolves once the request
    /// reaches a terminal state.
    pub fn enqueue(
        &self,
        token_id: &str,
        operation: Operation,
    ) -> (ApprovalRequest, watch::Receiver<ApprovalStatus>) {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.wait_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let request = ApprovalRequest {
            id: format!("apr_{}", Uuid::new_v4().simple()),
            token_id: token_id.to_string(),
            summary: operation.summary(),
            operation,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + window,
            decided_at: None,
            decided_by: None,
        };
        let (tx, rx) = watch::channel(ApprovalStatus::Pending);

        tracing::info!(
            approval_id = %request.id,
            token_id = %token_id,
            op = %request.summary,
            "approval requested"
        );

        self.entries.lock().insert(
            request.id.clone(),
            Entry {
                request: request.clone(),
                tx,
            },
        );
        (request, rx)
    }

    pub fn get(&self, id: &str) -> Result<ApprovalRequest, ApprovalError> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
        expire_if_overdue(entry, now);
        Ok(entry.request.clone())
    }

    /// All requests still awaiting a decision, oldest first.
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let mut pending: Vec<ApprovalRequest> = entries
            .values_mut()
            .filter_map(|entry| {
                expire_if_overdue(entry, now);
                (entry.request.status == ApprovalStatus::Pending).then(|| entry.request.clone())
            })
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Apply an admin decision. Fails with `AlreadyDecided` on any request
    /// that is not pending, including one whose window just elapsed.
    pub fn decide(
        &self,
        id: &str,
        decision: Decision,
        decided_by: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;

        expire_if_overdue(entry, now);
        if entry.request.status.is_terminal() {
            return Err(ApprovalError::AlreadyDecided(entry.request.status));
        }

        let status = ApprovalStatus::from(decision);
        entry.finish(status, decided_by, now);
        tracing::info!(
            approval_id = %id,
            status = %status,
            decided_by = %decided_by,
            "approval decided"
        );
        Ok(entry.request.clone())
    }

    /// Block until `id` reaches a terminal state or its window elapses, in
    /// which case the request is expired. Returns the final status.
    pub async fn wait(
        &self,
        request: &ApprovalRequest,
        mut rx: watch::Receiver<ApprovalStatus>,
    ) -> ApprovalStatus {
        let remaining = (request.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let outcome = tokio::time::timeout(remaining, async {
            rx.wait_for(|s| s.is_terminal()).await.map(|s| *s)
        })
        .await;

        match outcome {
            Ok(Ok(status)) => status,
            // Sender dropped: the entry was pruned, which only happens to
            // terminal requests. Re-read to be sure.
            Ok(Err(_)) => self
                .get(&request.id)
                .map(|r| r.status)
                .unwrap_or(ApprovalStatus::Expired),
            Err(_) => self.expire(&request.id),
        }
    }

    /// Force a pending request to `expired`; returns whatever terminal
    /// state the request ends up in.
    fn expire(&self, id: &str) -> ApprovalStatus {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(entry) => {
                if entry.request.status == ApprovalStatus::Pending {
                    entry.finish(ApprovalStatus::Expired, SYSTEM_ACTOR, Utc::now());
                    tracing::info!(approval_id = %id, "approval expired without a decision");
                }
                entry.request.status
            }
            None => ApprovalStatus::Expired,
        }
    }

    /// Expire every overdue pending request. Returns how many changed.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        entries
            .values_mut()
            .map(|entry| expire_if_overdue(entry, now))
            .filter(|changed| *changed)
            .count()
    }

    /// Drop terminal requests decided more than `retention` ago.
    pub fn prune(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let r = &entry.request;
            !(r.status.is_terminal() && r.decided_at.is_some_and(|t| now - t >= retention))
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expire_if_overdue(entry: &mut Entry, now: DateTime<Utc>) -> bool {
    if entry.request.status == ApprovalStatus::Pending && now >= entry.request.expires_at {
        entry.finish(ApprovalStatus::Expired, SYSTEM_ACTOR, now);
        tracing::info!(approval_id = %entry.request.id, "approval expired without a decision");
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn op() -> Operation {
        Operation::FsRm {
            path: "/tmp/x".into(),
            recursive: false,
        }
    }

    #[test]
    fn decide_transitions_once() {
        let q = ApprovalQueue::new(Duration::from_secs(30));
        let (req, _rx) = q.enqueue("tok_a", op());
        assert_eq!(q.list_pending().len(), 1);

        let decided = q.decide(&req.id, Decision::Approved, "tok_admin").unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(decided.decided_by.as_deref(), Some("tok_admin"));
        assert!(q.list_pending().is_empty());

        assert_eq!(
            q.decide(&req.id, Decision::Denied, "tok_admin"),
            Err(ApprovalError::AlreadyDecided(ApprovalStatus::Approved))
        );
    }

    #[test]
    fn unknown_id_is_not_found() {
        let q = ApprovalQueue::new(Duration::from_secs(30));
        assert_eq!(
            q.decide("apr_nope", Decision::Approved, "x"),
            Err(ApprovalError::NotFound("apr_nope".into()))
        );
        assert!(q.get("apr_nope").is_err());
    }

    #[test]
    fn late_decision_expires_instead() {
        let q = ApprovalQueue::new(Duration::ZERO);
        let (req, _rx) = q.enqueue("tok_a", op());
        assert_eq!(
            q.decide(&req.id, Decision::Approved, "admin"),
            Err(ApprovalError::AlreadyDecided(ApprovalStatus::Expired))
        );
        assert_eq!(q.get(&req.id).unwrap().status, ApprovalStatus::Expired);
    }

    #[test]
    fn expire_overdue_only_touches_pending() {
        let q = ApprovalQueue::new(Duration::ZERO);
        let (a, _rx_a) = q.enqueue("tok_a", op());
        let (b, _rx_b) = q.enqueue("tok_b", op());
        let later = Utc::now() + chrono::Duration::seconds(1);

        assert_eq!(q.expire_overdue(later), 2);
        assert_eq!(q.expire_overdue(later), 0);
        assert_eq!(q.get(&a.id).unwrap().status, ApprovalStatus::Expired);
        assert_eq!(q.get(&b.id).unwrap().decided_by.as_deref(), Some(SYSTEM_ACTOR));
    }

    #[tokio::test]
    async fn waiter_wakes_on_decision() {
        let q = Arc::new(ApprovalQueue::new(Duration::from_secs(10)));
        let (req, rx) = q.enqueue("tok_a", op());

        let waiter = {
            let q = q.clone();
            let req = req.clone();
            tokio::spawn(async move { q.wait(&req, rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.decide(&req.id, Decision::Denied, "admin").unwrap();

        let status = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ApprovalStatus::Denied);
    }

    #[tokio::test]
    async fn wait_expires_after_window() {
        let q = ApprovalQueue::new(Duration::from_millis(100));
        let (req, rx) = q.enqueue("tok_a", op());
        let started = std::time::Instant::now();
        assert_eq!(q.wait(&req, rx).await, ApprovalStatus::Expired);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(q.decide(&req.id, Decision::Approved, "admin").is_err());
    }

    #[test]
    fn sweeper_expires_and_prunes() {
        let q = ApprovalQueue::new(Duration::from_secs(5));
        let (a, _ra) = q.enqueue("tok_a", op());
        let (_b, _rb) = q.enqueue("tok_b", op());
        q.decide(&a.id, Decision::Approved, "admin").unwrap();

        let later = Utc::now() + chrono::Duration::seconds(10);
        assert_eq!(q.expire_overdue(later), 1);
        assert_eq!(q.expire_overdue(later), 0);

        assert_eq!(q.prune(Duration::from_secs(3600), later), 0);
        let much_later = later + chrono::Duration::hours(2);
        assert_eq!(q.prune(Duration::from_secs(3600), much_later), 2);
        assert!(q.is_empty());
    }
}
