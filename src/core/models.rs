use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::core::status::ExecutionStatus;

/// Anything kept in a local collection is addressed by a string id.
pub trait Record {
    fn record_id(&self) -> String;
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invoices: Vec<Invoice>,
}

impl Record for Agent {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

/// Fields a user may change on an existing agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentPatch {
    pub name: Option<String>,
    pub role: Option<String>,
    pub description: Option<String>,
}

impl AgentPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.role.is_none() && self.description.is_none()
    }

    pub fn apply(&self, agent: &mut Agent) {
        if let Some(name) = &self.name {
            agent.name = name.clone();
        }
        if let Some(role) = &self.role {
            agent.role = role.clone();
        }
        if let Some(description) = &self.description {
            agent.description = Some(description.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    #[default]
    #[serde(alias = "PENDING", alias = "Pending")]
    Pending,
    #[serde(alias = "PAID", alias = "Paid")]
    Paid,
    #[serde(alias = "OVERDUE", alias = "Overdue")]
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Some(InvoiceStatus::Pending),
            "paid" => Some(InvoiceStatus::Paid),
            "overdue" => Some(InvoiceStatus::Overdue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub invoice_number: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub issue_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub status: InvoiceStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl Record for Invoice {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

impl Invoice {
    /// A pending invoice for `agent` with generated number and a 30-day due date.
    pub fn draft(agent: &Agent) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            invoice_number: format!("INV-{}", now.timestamp_millis()),
            client_name: agent.name.clone(),
            amount: 0.0,
            issue_date: Some(now.to_rfc3339()),
            due_date: Some((now + Duration::days(30)).to_rfc3339()),
            status: InvoiceStatus::Pending,
            description: Some(format!("Invoice for {}", agent.name)),
            agent_id: Some(agent.id.clone()),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionOrder {
    pub id: String,
    #[serde(default)]
    pub mission_name: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl MissionOrder {
    pub fn draft(agent: &Agent) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mission_name: format!("Mission-{}", now.timestamp_millis()),
            client_name: agent.name.clone(),
            description: Some(format!("Mission order for {}", agent.name)),
            file_name: None,
            file_type: None,
            upload_date: Some(now.to_rfc3339()),
            start_date: Some(now.to_rfc3339()),
            end_date: Some((now + Duration::days(30)).to_rfc3339()),
            agent_id: Some(agent.id.clone()),
        }
    }
}

/// Metadata of an uploaded invoice or mission-order file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub upload_date: Option<String>,
}

impl Record for StoredFile {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: ExecutionStatus,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(default, alias = "notes")]
    pub error: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Record for Execution {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

impl Execution {
    pub fn start(agent_id: &str, user_id: Option<String>, files: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            user_id,
            status: ExecutionStatus::Running,
            start_time: Some(now_iso()),
            end_time: None,
            result: Value::Null,
            error: None,
            files,
        }
    }

    pub fn verdicts(&self) -> Vec<FraudVerdict> {
        verdicts_from_payload(&self.result)
    }

    /// `Some(true)` when any analysed file was flagged, `None` before results exist.
    pub fn is_fraudulent(&self) -> Option<bool> {
        let verdicts = self.verdicts();
        if verdicts.is_empty() {
            return None;
        }
        Some(verdicts.iter().any(|v| v.fraud))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub results: Value,
}

impl Record for AnalysisResult {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

impl AnalysisResult {
    pub fn verdicts(&self) -> Vec<FraudVerdict> {
        verdicts_from_payload(&self.results)
    }
}

/// One per-file verdict from the fraud analysis endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudVerdict {
    pub file_name: String,
    pub merchant: String,
    pub invoice_date: String,
    pub total_amount: String,
    pub city: String,
    pub address: String,
    pub fraud: bool,
    pub reasons: Vec<String>,
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "oui" | "yes" | "true" | "1"
        ),
        _ => false,
    }
}

fn reasons_of(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(display_value)
            .filter(|s| !s.is_empty())
            .collect(),
        Value::Null => Vec::new(),
        other => {
            let s = display_value(other);
            if s.is_empty() { Vec::new() } else { vec![s] }
        }
    }
}

impl FraudVerdict {
    /// Keys are matched by substring so both the analysis service's French
    /// labels and slightly different spellings end up in the right field.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut verdict = FraudVerdict::default();
        for (key, v) in obj {
            let k = key.to_lowercase();
            if k.contains("fraude") || k == "fraud" {
                verdict.fraud = truthy(v);
            } else if k.contains("commerce") || k == "storename" {
                verdict.merchant = display_value(v);
            } else if k.contains("date") {
                verdict.invoice_date = display_value(v);
            } else if k.contains("montant") || k == "totalamount" {
                verdict.total_amount = display_value(v);
            } else if k.contains("ville") || k == "city" {
                verdict.city = display_value(v);
            } else if k.contains("adresse") || k == "fulladdress" {
                verdict.address = display_value(v);
            } else if k.contains("raison") || k == "fraudreasons" {
                verdict.reasons = reasons_of(v);
            } else if k.contains("fichier") || k == "nom_facture" || k == "filename" {
                verdict.file_name = display_value(v);
            }
        }
        Some(verdict)
    }
}

fn looks_like_verdict(obj: &Map<String, Value>) -> bool {
    obj.keys().any(|k| k.to_lowercase().contains("fraude"))
}

/// Extract verdicts from whatever shape the analysis payload arrived in: a bare
/// list, an object wrapping a `résultats` list, a single verdict object, or any
/// of those encoded as a JSON string.
pub fn verdicts_from_payload(payload: &Value) -> Vec<FraudVerdict> {
    match payload {
        Value::Array(items) => items.iter().filter_map(FraudVerdict::from_value).collect(),
        Value::Object(obj) => {
            for key in ["résultats", "resultats", "results"] {
                if let Some(inner) = obj.get(key)
                    && !inner.is_null()
                {
                    return verdicts_from_payload(inner);
                }
            }
            if looks_like_verdict(obj) {
                FraudVerdict::from_value(payload).into_iter().collect()
            } else {
                Vec::new()
            }
        }
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map(|v| verdicts_from_payload(&v))
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// The backend stores one flat verdict object per analysis. Pick the first
/// verdict out of `results`, or rebuild one from recognisable keys.
pub fn backend_analysis_payload(results: &Value, timestamp: &str) -> Value {
    let mut formatted = match results {
        Value::Object(obj) if obj.contains_key("fraude") => results.clone(),
        Value::Array(items) if !items.is_empty() => items[0].clone(),
        Value::Object(obj) => match obj.get("résultats").or_else(|| obj.get("resultats")) {
            Some(Value::Array(items)) if !items.is_empty() => items[0].clone(),
            _ => rebuild_verdict(obj),
        },
        _ => default_verdict(),
    };
    if let Value::Object(obj) = &mut formatted {
        obj.insert("timestamp".to_string(), Value::String(timestamp.to_string()));
    }
    formatted
}

fn default_verdict() -> Value {
    json!({
        "fraude": "Non",
        "Nom du commerce": "inconnu",
        "Date de la facture": "",
        "Montant total": 0,
        "Ville": "",
        "Adresse complète": "",
        "raison": [],
    })
}

fn rebuild_verdict(source: &Map<String, Value>) -> Value {
    let mut out = default_verdict();
    if let Value::Object(target) = &mut out {
        for (key, value) in source {
            let k = key.to_lowercase();
            let field = if k.contains("fraude") {
                "fraude"
            } else if k.contains("commerce") {
                "Nom du commerce"
            } else if k.contains("date") {
                "Date de la facture"
            } else if k.contains("montant") {
                "Montant total"
            } else if k.contains("ville") {
                "Ville"
            } else if k.contains("adresse") {
                "Adresse complète"
            } else if k.contains("raison") && value.is_array() {
                "raison"
            } else {
                continue;
            };
            target.insert(field.to_string(), value.clone());
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    #[serde(default)]
    pub total_agents: u32,
    #[serde(default)]
    pub total_executions: u32,
    #[serde(default)]
    pub successful_executions: u32,
    #[serde(default)]
    pub failed_executions: u32,
}

impl UserStats {
    pub fn compute(agents: &[Agent], executions: &[Execution]) -> Self {
        Self {
            total_agents: agents.len() as u32,
            total_executions: executions.len() as u32,
            successful_executions: executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Completed)
                .count() as u32,
            failed_executions: executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Failed)
                .count() as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub profile_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub stats: UserStats,
}

impl Record for User {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

impl ProfileUpdate {
    pub fn apply(&self, user: &mut User) {
        if let Some(name) = &self.name {
            user.name = name.clone();
        }
        if let Some(email) = &self.email {
            user.email = email.clone();
        }
        if let Some(image) = &self.profile_image {
            user.profile_image = Some(image.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

impl Record for Client {
    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub stock: u32,
}

impl Record for Product {
    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_verdict() -> Value {
        json!({
            "nom_fichier": "facture_01.pdf",
            "Nom du commerce": "Hotel Atlas",
            "Date de la facture": "2024-03-02",
            "Montant total": 412.5,
            "Ville": "Rabat",
            "Adresse complète": "12 avenue Hassan II",
            "fraude": "Oui",
            "raison": ["Date hors mission", "Ville différente"]
        })
    }

    #[test]
    fn verdict_reads_french_keys() {
        let v = FraudVerdict::from_value(&sample_verdict()).unwrap();
        assert_eq!(v.file_name, "facture_01.pdf");
        assert_eq!(v.merchant, "Hotel Atlas");
        assert_eq!(v.invoice_date, "2024-03-02");
        assert_eq!(v.total_amount, "412.5");
        assert_eq!(v.city, "Rabat");
        assert_eq!(v.address, "12 avenue Hassan II");
        assert!(v.fraud);
        assert_eq!(v.reasons.len(), 2);
    }

    #[test]
    fn payload_shapes_are_unwrapped() {
        let wrapped = json!({ "execution_id": "e1", "résultats": [sample_verdict()] });
        assert_eq!(verdicts_from_payload(&wrapped).len(), 1);

        let bare = json!([sample_verdict(), { "fraude": "Non" }]);
        let verdicts = verdicts_from_payload(&bare);
        assert_eq!(verdicts.len(), 2);
        assert!(!verdicts[1].fraud);

        let single = sample_verdict();
        assert_eq!(verdicts_from_payload(&single).len(), 1);

        let encoded = Value::String(bare.to_string());
        assert_eq!(verdicts_from_payload(&encoded).len(), 2);

        assert!(verdicts_from_payload(&json!({ "foo": 1 })).is_empty());
        assert!(verdicts_from_payload(&Value::Null).is_empty());
    }

    #[test]
    fn execution_fraud_flag_needs_results() {
        let mut exec = Execution::start("a1", None, vec![]);
        assert_eq!(exec.is_fraudulent(), None);
        exec.result = json!([{ "fraude": "Non" }, { "fraude": "oui" }]);
        assert_eq!(exec.is_fraudulent(), Some(true));
        exec.result = json!([{ "fraude": "Non" }]);
        assert_eq!(exec.is_fraudulent(), Some(false));
    }

    #[test]
    fn backend_payload_takes_first_verdict_and_stamps_it() {
        let payload = backend_analysis_payload(&json!([sample_verdict()]), "2024-01-01T00:00:00Z");
        assert_eq!(payload["Ville"], "Rabat");
        assert_eq!(payload["timestamp"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn backend_payload_rebuilds_unknown_shapes() {
        let payload = backend_analysis_payload(
            &json!({ "est_fraude": "Oui", "ville_facture": "Fes", "raisons": "x" }),
            "t",
        );
        assert_eq!(payload["fraude"], "Oui");
        assert_eq!(payload["Ville"], "Fes");
        assert_eq!(payload["Nom du commerce"], "inconnu");
        assert_eq!(payload["raison"], json!([]));

        let fallback = backend_analysis_payload(&json!("garbage"), "t");
        assert_eq!(fallback["fraude"], "Non");
    }

    #[test]
    fn execution_accepts_backend_shape() {
        let exec: Execution = serde_json::from_value(json!({
            "id": "x",
            "agentId": "a",
            "status": "TERMINÉ",
            "notes": "boom"
        }))
        .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.error.as_deref(), Some("boom"));
        assert!(exec.files.is_empty());
    }

    #[test]
    fn user_stats_flatten_into_user() {
        let user: User = serde_json::from_value(json!({
            "id": "u1",
            "name": "Sara",
            "email": "s@x.io",
            "totalAgents": 3,
            "failedExecutions": 1
        }))
        .unwrap();
        assert_eq!(user.stats.total_agents, 3);
        assert_eq!(user.stats.failed_executions, 1);
        let back = serde_json::to_value(&user).unwrap();
        assert_eq!(back["totalAgents"], 3);
        assert!(back.get("token").is_none());
    }

    #[test]
    fn invoice_draft_defaults() {
        let agent = Agent {
            id: "a1".into(),
            name: "Agent X".into(),
            role: "Reviewer".into(),
            description: None,
            created_at: None,
            user_id: None,
            invoices: vec![],
        };
        let invoice = Invoice::draft(&agent);
        assert!(invoice.invoice_number.starts_with("INV-"));
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.client_name, "Agent X");
        assert_eq!(invoice.agent_id.as_deref(), Some("a1"));
        assert!(invoice.due_date > invoice.issue_date);
    }

    #[test]
    fn invoice_status_accepts_uppercase() {
        let s: InvoiceStatus = serde_json::from_str("\"PAID\"").unwrap();
        assert_eq!(s, InvoiceStatus::Paid);
        assert_eq!(InvoiceStatus::parse("Overdue"), Some(InvoiceStatus::Overdue));
    }
}
