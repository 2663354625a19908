use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{LocalStore, OUTBOX, StoreResult};
use crate::core::models::{
    Agent, Execution, Invoice, MissionOrder, ProfileUpdate, Record, now_iso,
};

/// A write that reached the local cache but not the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PendingOp {
    CreateAgent { agent: Agent },
    UpdateAgent { agent: Agent },
    DeleteAgent { agent_id: String },
    AddInvoice { agent_id: String, invoice: Invoice },
    DeleteInvoice { agent_id: String, invoice_id: String },
    SetMissionOrder { agent_id: String, order: MissionOrder },
    DeleteMissionOrder { agent_id: String },
    CreateExecution { execution: Execution },
    DeleteExecution { execution_id: String },
    SaveAnalysis { execution_id: String, results: Value },
    FailExecution { execution_id: String, message: String },
    UpdateProfile { update: ProfileUpdate },
    UploadInvoiceFile {
        agent_id: String,
        path: String,
        placeholder_id: String,
    },
    DeleteInvoiceFile { file_id: String },
    UploadMissionOrderFile { agent_id: String, path: String },
    DeleteMissionOrderFile { file_id: String },
}

impl PendingOp {
    pub fn describe(&self) -> String {
        match self {
            PendingOp::CreateAgent { agent } => format!("create agent '{}'", agent.name),
            PendingOp::UpdateAgent { agent } => format!("update agent '{}'", agent.name),
            PendingOp::DeleteAgent { agent_id } => format!("delete agent {}", agent_id),
            PendingOp::AddInvoice { agent_id, invoice } => {
                format!("add invoice {} to agent {}", invoice.invoice_number, agent_id)
            }
            PendingOp::DeleteInvoice {
                agent_id,
                invoice_id,
            } => format!("delete invoice {} of agent {}", invoice_id, agent_id),
            PendingOp::SetMissionOrder { agent_id, order } => {
                format!("set mission order '{}' on agent {}", order.mission_name, agent_id)
            }
            PendingOp::DeleteMissionOrder { agent_id } => {
                format!("delete mission order of agent {}", agent_id)
            }
            PendingOp::CreateExecution { execution } => format!("record execution {}", execution.id),
            PendingOp::DeleteExecution { execution_id } => {
                format!("delete execution {}", execution_id)
            }
            PendingOp::SaveAnalysis { execution_id, .. } => {
                format!("save analysis of execution {}", execution_id)
            }
            PendingOp::FailExecution { execution_id, .. } => {
                format!("mark execution {} failed", execution_id)
            }
            PendingOp::UpdateProfile { .. } => "update profile".to_string(),
            PendingOp::UploadInvoiceFile { agent_id, path, .. } => {
                format!("upload invoice {} for agent {}", path, agent_id)
            }
            PendingOp::DeleteInvoiceFile { file_id } => format!("delete invoice file {}", file_id),
            PendingOp::UploadMissionOrderFile { agent_id, path } => {
                format!("upload mission order {} for agent {}", path, agent_id)
            }
            PendingOp::DeleteMissionOrderFile { file_id } => {
                format!("delete mission order file {}", file_id)
            }
        }
    }

    /// Point every reference to a locally generated agent id at the id the
    /// backend assigned once the agent itself was synced.
    pub fn rebind_agent(&mut self, old: &str, new: &str) {
        let swap = |id: &mut String| {
            if id.as_str() == old {
                *id = new.to_string();
            }
        };
        match self {
            PendingOp::CreateAgent { agent } | PendingOp::UpdateAgent { agent } => swap(&mut agent.id),
            PendingOp::DeleteAgent { agent_id }
            | PendingOp::DeleteInvoice { agent_id, .. }
            | PendingOp::DeleteMissionOrder { agent_id }
            | PendingOp::UploadInvoiceFile { agent_id, .. }
            | PendingOp::UploadMissionOrderFile { agent_id, .. } => swap(agent_id),
            PendingOp::AddInvoice { agent_id, invoice } => {
                swap(agent_id);
                if let Some(id) = invoice.agent_id.as_mut() {
                    swap(id);
                }
            }
            PendingOp::SetMissionOrder { agent_id, order } => {
                swap(agent_id);
                if let Some(id) = order.agent_id.as_mut() {
                    swap(id);
                }
            }
            PendingOp::CreateExecution { execution } => swap(&mut execution.agent_id),
            PendingOp::DeleteExecution { .. }
            | PendingOp::SaveAnalysis { .. }
            | PendingOp::FailExecution { .. }
            | PendingOp::UpdateProfile { .. }
            | PendingOp::DeleteInvoiceFile { .. }
            | PendingOp::DeleteMissionOrderFile { .. } => {}
        }
    }

    /// Same as [`PendingOp::rebind_agent`] for executions recorded offline.
    pub fn rebind_execution(&mut self, old: &str, new: &str) {
        let swap = |id: &mut String| {
            if id.as_str() == old {
                *id = new.to_string();
            }
        };
        match self {
            PendingOp::CreateExecution { execution } => swap(&mut execution.id),
            PendingOp::DeleteExecution { execution_id }
            | PendingOp::SaveAnalysis { execution_id, .. }
            | PendingOp::FailExecution { execution_id, .. } => swap(execution_id),
            _ => {}
        }
    }

    /// Follow-up deletes of an invoice that was added offline carry the
    /// local id until the backend assigns its own.
    pub fn rebind_invoice(&mut self, old: &str, new: &str) {
        if let PendingOp::DeleteInvoice { invoice_id, .. } = self
            && invoice_id.as_str() == old
        {
            *invoice_id = new.to_string();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    pub queued_at: String,
    pub reason: String,
    /// Account that was signed in when the write was queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub op: PendingOp,
}

impl OutboxEntry {
    /// Ops queued without a session belong to whoever flushes next.
    pub fn belongs_to(&self, user_id: Option<&str>) -> bool {
        match (&self.user_id, user_id) {
            (None, _) => true,
            (Some(owner), Some(user)) => owner == user,
            (Some(_), None) => false,
        }
    }
}

impl Record for OutboxEntry {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

impl LocalStore {
    pub async fn enqueue(
        &self,
        op: PendingOp,
        reason: &str,
        owner: Option<&str>,
    ) -> StoreResult<OutboxEntry> {
        let entry = OutboxEntry {
            id: uuid::Uuid::new_v4().to_string(),
            queued_at: now_iso(),
            reason: reason.to_string(),
            user_id: owner.map(str::to_string),
            op,
        };
        info!("Queued for sync: {} ({})", entry.op.describe(), reason);
        self.save(OUTBOX, &entry).await?;
        Ok(entry)
    }

    /// Queued operations, oldest first.
    pub async fn pending(&self) -> StoreResult<Vec<OutboxEntry>> {
        self.get(OUTBOX).await
    }

    pub async fn dequeue(&self, entry_id: &str) -> StoreResult<bool> {
        self.delete(OUTBOX, entry_id).await
    }

    pub async fn rebind_pending_agent(&self, old: &str, new: &str) -> StoreResult<()> {
        let mut entries = self.pending().await?;
        for entry in entries.iter_mut() {
            entry.op.rebind_agent(old, new);
        }
        self.replace_all(OUTBOX, &entries).await
    }

    pub async fn rebind_pending_invoice(&self, old: &str, new: &str) -> StoreResult<()> {
        let mut entries = self.pending().await?;
        for entry in entries.iter_mut() {
            entry.op.rebind_invoice(old, new);
        }
        self.replace_all(OUTBOX, &entries).await
    }

    pub async fn rebind_pending_execution(&self, old: &str, new: &str) -> StoreResult<()> {
        let mut entries = self.pending().await?;
        for entry in entries.iter_mut() {
            entry.op.rebind_execution(old, new);
        }
        self.replace_all(OUTBOX, &entries).await
    }

    /// Whether an agent only exists locally, i.e. its creation is still queued.
    pub async fn is_pending_creation(&self, agent_id: &str) -> StoreResult<bool> {
        Ok(self
            .pending()
            .await?
            .iter()
            .any(|e| matches!(&e.op, PendingOp::CreateAgent { agent } if agent.id == agent_id)))
    }

    /// Whether an execution was only recorded locally so far.
    pub async fn is_pending_execution(&self, execution_id: &str) -> StoreResult<bool> {
        Ok(self.pending().await?.iter().any(|e| {
            matches!(&e.op, PendingOp::CreateExecution { execution } if execution.id == execution_id)
        }))
    }

    pub async fn discard_pending_where<F>(&self, drop_if: F) -> StoreResult<usize>
    where
        F: Fn(&PendingOp) -> bool,
    {
        let entries = self.pending().await?;
        let before = entries.len();
        let kept: Vec<OutboxEntry> = entries.into_iter().filter(|e| !drop_if(&e.op)).collect();
        let dropped = before - kept.len();
        if dropped > 0 {
            self.replace_all(OUTBOX, &kept).await?;
        }
        Ok(dropped)
    }

    pub async fn discard_pending_owned_by(&self, user_id: &str) -> StoreResult<usize> {
        let entries = self.pending().await?;
        let before = entries.len();
        let kept: Vec<OutboxEntry> = entries
            .into_iter()
            .filter(|e| e.user_id.as_deref() != Some(user_id))
            .collect();
        let dropped = before - kept.len();
        if dropped > 0 {
            self.replace_all(OUTBOX, &kept).await?;
        }
        Ok(dropped)
    }

    /// Drop queued operations that only concern `agent_id`.
    pub async fn discard_pending_for_agent(&self, agent_id: &str) -> StoreResult<usize> {
        self.discard_pending_where(|op| op_targets_agent(op, agent_id))
            .await
    }

    pub async fn discard_pending_for_execution(&self, execution_id: &str) -> StoreResult<usize> {
        self.discard_pending_where(|op| op_targets_execution(op, execution_id))
            .await
    }
}

fn op_targets_execution(op: &PendingOp, execution_id: &str) -> bool {
    match op {
        PendingOp::CreateExecution { execution } => execution.id == execution_id,
        PendingOp::DeleteExecution { execution_id: id }
        | PendingOp::SaveAnalysis { execution_id: id, .. }
        | PendingOp::FailExecution { execution_id: id, .. } => id == execution_id,
        _ => false,
    }
}

fn op_targets_agent(op: &PendingOp, agent_id: &str) -> bool {
    match op {
        PendingOp::CreateAgent { agent } | PendingOp::UpdateAgent { agent } => agent.id == agent_id,
        PendingOp::AddInvoice { agent_id: id, .. }
        | PendingOp::DeleteInvoice { agent_id: id, .. }
        | PendingOp::SetMissionOrder { agent_id: id, .. }
        | PendingOp::DeleteMissionOrder { agent_id: id }
        | PendingOp::UploadInvoiceFile { agent_id: id, .. }
        | PendingOp::UploadMissionOrderFile { agent_id: id, .. } => id == agent_id,
        PendingOp::CreateExecution { execution } => execution.agent_id == agent_id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> Agent {
        Agent {
            id: id.to_string(),
            name: "Agent X".to_string(),
            role: "Reviewer".to_string(),
            description: None,
            created_at: None,
            user_id: Some("u1".to_string()),
            invoices: vec![],
        }
    }

    #[tokio::test]
    async fn queue_preserves_order() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        store
            .enqueue(PendingOp::CreateAgent { agent: agent("local-1") }, "offline", None)
            .await
            .unwrap();
        store
            .enqueue(
                PendingOp::DeleteMissionOrder {
                    agent_id: "local-1".into(),
                },
                "offline",
                None,
            )
            .await
            .unwrap();

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(matches!(pending[0].op, PendingOp::CreateAgent { .. }));
        assert!(store.dequeue(&pending[0].id).await.unwrap());
        assert_eq!(store.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rebind_rewrites_later_references() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        let mut invoice = Invoice::draft(&agent("local-1"));
        invoice.amount = 10.0;
        store
            .enqueue(
                PendingOp::AddInvoice {
                    agent_id: "local-1".into(),
                    invoice,
                },
                "offline",
                None,
            )
            .await
            .unwrap();
        store.rebind_pending_agent("local-1", "srv-9").await.unwrap();

        let pending = store.pending().await.unwrap();
        match &pending[0].op {
            PendingOp::AddInvoice { agent_id, invoice } => {
                assert_eq!(agent_id, "srv-9");
                assert_eq!(invoice.agent_id.as_deref(), Some("srv-9"));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[tokio::test]
    async fn discard_drops_only_that_agent() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        store
            .enqueue(PendingOp::CreateAgent { agent: agent("a") }, "offline", None)
            .await
            .unwrap();
        store
            .enqueue(PendingOp::CreateAgent { agent: agent("b") }, "offline", None)
            .await
            .unwrap();
        assert_eq!(store.discard_pending_for_agent("a").await.unwrap(), 1);
        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].op.describe().contains("Agent X"));
    }

    #[test]
    fn rebind_execution_touches_follow_up_ops() {
        let mut op = PendingOp::SaveAnalysis {
            execution_id: "local-e".into(),
            results: serde_json::json!([]),
        };
        op.rebind_execution("local-e", "srv-e");
        assert!(matches!(&op, PendingOp::SaveAnalysis { execution_id, .. } if execution_id == "srv-e"));

        let mut other = PendingOp::DeleteAgent {
            agent_id: "local-e".into(),
        };
        other.rebind_execution("local-e", "srv-e");
        assert!(matches!(&other, PendingOp::DeleteAgent { agent_id } if agent_id == "local-e"));
    }

    #[test]
    fn invoice_rebind_only_touches_matching_deletes() {
        let mut delete = PendingOp::DeleteInvoice {
            agent_id: "a1".into(),
            invoice_id: "local-inv".into(),
        };
        delete.rebind_invoice("local-inv", "srv-inv");
        assert!(matches!(&delete, PendingOp::DeleteInvoice { invoice_id, .. } if invoice_id == "srv-inv"));

        let mut other = PendingOp::DeleteInvoice {
            agent_id: "a1".into(),
            invoice_id: "kept".into(),
        };
        other.rebind_invoice("local-inv", "srv-inv");
        assert!(matches!(&other, PendingOp::DeleteInvoice { invoice_id, .. } if invoice_id == "kept"));
    }

    #[tokio::test]
    async fn entries_remember_their_account() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        let mine = store
            .enqueue(PendingOp::CreateAgent { agent: agent("a") }, "offline", Some("u1"))
            .await
            .unwrap();
        let anonymous = store
            .enqueue(PendingOp::CreateAgent { agent: agent("b") }, "offline", None)
            .await
            .unwrap();

        assert!(mine.belongs_to(Some("u1")));
        assert!(!mine.belongs_to(Some("u2")));
        assert!(!mine.belongs_to(None));
        assert!(anonymous.belongs_to(Some("u2")));

        assert_eq!(store.discard_pending_owned_by("u1").await.unwrap(), 1);
        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, anonymous.id);
    }

    #[test]
    fn ops_are_tagged_in_json() {
        let op = PendingOp::FailExecution {
            execution_id: "e1".into(),
            message: "canceled".into(),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["op"], "fail_execution");
        assert_eq!(value["execution_id"], "e1");
    }
}
