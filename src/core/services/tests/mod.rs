mod users;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

use super::Services;
use crate::core::api::ApiClient;
use crate::core::config::Config;
use crate::core::models::{User, UserStats};
use crate::core::store::{LocalStore, SESSION_KEY};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const TOKEN: &str = "tok-1";
pub const USER_ID: &str = "u1";

/// In-memory stand-in for the primary API, the execution store and the
/// fraud endpoint.
#[derive(Default)]
pub struct MockState {
    pub agents: Vec<Value>,
    pub executions: Vec<Value>,
    pub store_executions: Vec<Value>,
    pub analyses: Vec<(String, Value)>,
    pub failures: Vec<(String, String)>,
    pub fail_writes: bool,
    /// Answer invoice creation with a 400, as for a malformed invoice.
    pub reject_invoices: bool,
    pub analysis_delay_ms: u64,
    next_id: u64,
}

impl MockState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

type Shared = Arc<Mutex<MockState>>;

fn lock(state: &Shared) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn backend_down() -> Response {
    reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "message": "backend down" }),
    )
}

fn not_found(what: &str) -> Response {
    reply(
        StatusCode::NOT_FOUND,
        json!({ "message": format!("{} not found", what) }),
    )
}

fn id_is(item: &Value, id: &str) -> bool {
    item.get("id").and_then(Value::as_str) == Some(id)
}

async fn login(Json(body): Json<Value>) -> Response {
    if body["password"] != "secret" {
        return reply(
            StatusCode::UNAUTHORIZED,
            json!({ "message": "Bad credentials" }),
        );
    }
    reply(
        StatusCode::OK,
        json!({
            "id": USER_ID,
            "name": "Sara",
            "email": body["email"],
            "token": TOKEN,
            "totalAgents": 0
        }),
    )
}

async fn me(headers: HeaderMap) -> Response {
    let bearer = format!("Bearer {}", TOKEN);
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(bearer.as_str()) {
        return reply(StatusCode::UNAUTHORIZED, json!({ "message": "expired" }));
    }
    reply(
        StatusCode::OK,
        json!({ "id": USER_ID, "name": "Sara", "email": "sara@example.com" }),
    )
}

async fn create_agent(State(state): State<Shared>, Json(mut body): Json<Value>) -> Response {
    let mut s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    body["id"] = json!(s.next("srv"));
    s.agents.push(body.clone());
    reply(StatusCode::CREATED, body)
}

async fn agents_for_user(State(state): State<Shared>, Path(user_id): Path<String>) -> Response {
    let s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    let mine: Vec<Value> = s
        .agents
        .iter()
        .filter(|a| a["userId"] == user_id.as_str())
        .map(|a| {
            let mut a = a.clone();
            if let Some(obj) = a.as_object_mut() {
                obj.remove("invoices");
            }
            a
        })
        .collect();
    reply(StatusCode::OK, json!(mine))
}

async fn get_agent(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    match s.agents.iter().find(|a| id_is(a, &id)) {
        Some(agent) => reply(StatusCode::OK, agent.clone()),
        None => not_found("Agent"),
    }
}

async fn update_agent(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    match s.agents.iter_mut().find(|a| id_is(a, &id)) {
        Some(agent) => {
            *agent = body.clone();
            reply(StatusCode::OK, body)
        }
        None => not_found("Agent"),
    }
}

async fn delete_agent(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    let before = s.agents.len();
    s.agents.retain(|a| !id_is(a, &id));
    if s.agents.len() == before {
        return not_found("Agent");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn list_invoices(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let s = lock(&state);
    match s.agents.iter().find(|a| id_is(a, &id)) {
        Some(agent) => reply(
            StatusCode::OK,
            agent.get("invoices").cloned().unwrap_or_else(|| json!([])),
        ),
        None => not_found("Agent"),
    }
}

async fn add_invoice(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(mut body): Json<Value>,
) -> Response {
    let mut s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    if s.reject_invoices {
        return reply(
            StatusCode::BAD_REQUEST,
            json!({ "message": "invalid invoice" }),
        );
    }
    body["id"] = json!(s.next("inv"));
    let Some(agent) = s.agents.iter_mut().find(|a| id_is(a, &id)) else {
        return not_found("Agent");
    };
    if !agent.get("invoices").is_some_and(Value::is_array) {
        agent["invoices"] = json!([]);
    }
    if let Some(list) = agent["invoices"].as_array_mut() {
        list.push(body.clone());
    }
    reply(StatusCode::CREATED, body)
}

async fn create_execution(State(state): State<Shared>, Json(mut body): Json<Value>) -> Response {
    let mut s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    body["id"] = json!(s.next("exec"));
    s.executions.push(body.clone());
    reply(StatusCode::CREATED, body)
}

async fn delete_execution(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    let before = s.executions.len();
    s.executions.retain(|e| !id_is(e, &id));
    if s.executions.len() == before {
        return not_found("Execution");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn executions_for_user(State(state): State<Shared>, Path(user_id): Path<String>) -> Response {
    let s = lock(&state);
    let mine: Vec<Value> = s
        .executions
        .iter()
        .filter(|e| e["userId"] == user_id.as_str())
        .cloned()
        .collect();
    reply(StatusCode::OK, json!(mine))
}

async fn save_analysis(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    if let Some(exec) = s.executions.iter_mut().find(|e| id_is(e, &id)) {
        exec["status"] = json!("COMPLETED");
    }
    s.analyses.push((id.clone(), body));
    let result_id = s.next("ar");
    reply(
        StatusCode::CREATED,
        json!({ "id": result_id, "executionId": id }),
    )
}

async fn fail_analysis(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    let message = body["error"].as_str().unwrap_or_default().to_string();
    s.failures.push((id, message));
    reply(StatusCode::OK, json!({ "status": "FAILED" }))
}

async fn store_list(State(state): State<Shared>) -> Response {
    let s = lock(&state);
    if s.fail_writes {
        return backend_down();
    }
    reply(StatusCode::OK, json!(s.store_executions))
}

async fn store_delete_for_agent(
    State(state): State<Shared>,
    Path(agent_id): Path<String>,
) -> Response {
    let mut s = lock(&state);
    let before = s.store_executions.len();
    s.store_executions
        .retain(|e| e["agent_id"] != agent_id.as_str());
    let count = before - s.store_executions.len();
    reply(
        StatusCode::OK,
        json!({ "message": "deleted", "count": count }),
    )
}

async fn detect_fraud(State(state): State<Shared>, mut multipart: Multipart) -> Response {
    let delay = lock(&state).analysis_delay_ms;
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let mut agent_id = String::new();
    let mut invoices = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let data = field.bytes().await.unwrap_or_default();
        match name.as_str() {
            "agent_id" => agent_id = String::from_utf8_lossy(&data).into_owned(),
            "factures" => invoices.push(file_name.unwrap_or_default()),
            _ => {}
        }
    }

    let verdicts: Vec<Value> = invoices
        .iter()
        .map(|f| {
            json!({
                "nom_fichier": f,
                "Nom du commerce": "Hotel Atlas",
                "Ville": "Rabat",
                "Montant total": 412.5,
                "fraude": "Oui",
                "raison": ["Date hors mission"]
            })
        })
        .collect();

    let mut s = lock(&state);
    let execution_id = s.next("mongo");
    s.store_executions.push(json!({
        "_id": execution_id,
        "agent_id": agent_id,
        "status": "termine",
        "resultats": verdicts,
        "fichiers": { "nb_factures": invoices.len(), "ordre_mission": "om.pdf" }
    }));
    reply(
        StatusCode::OK,
        json!({
            "execution_id": execution_id,
            "agent_id": agent_id,
            "résultats": verdicts,
            "status": "termine"
        }),
    )
}

pub struct MockBackend {
    pub port: u16,
    state: Shared,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockBackend {
    pub async fn start() -> TestResult<Self> {
        let port = find_free_port()?;
        let state: Shared = Arc::new(Mutex::new(MockState::default()));
        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/users/me", get(me))
            .route("/api/agents", post(create_agent))
            .route("/api/agents/user/{user_id}", get(agents_for_user))
            .route(
                "/api/agents/{id}",
                get(get_agent).put(update_agent).delete(delete_agent),
            )
            .route(
                "/api/agents/{id}/invoices",
                get(list_invoices).post(add_invoice),
            )
            .route("/api/executions", post(create_execution))
            .route("/api/executions/{id}", delete(delete_execution))
            .route("/api/executions/user/{user_id}", get(executions_for_user))
            .route("/api/analysis-results/execution/{id}", post(save_analysis))
            .route(
                "/api/analysis-results/execution/{id}/fail",
                post(fail_analysis),
            )
            .route("/executions/", get(store_list))
            .route("/executions/agent/{agent_id}", delete(store_delete_for_agent))
            .route("/detecter_fraude/", post(detect_fraud))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            port,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn config(&self) -> Config {
        config_for(self.port)
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    pub fn set_failing(&self, on: bool) {
        self.state().fail_writes = on;
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

pub fn find_free_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

pub fn config_for(port: u16) -> Config {
    Config {
        api_url: format!("http://127.0.0.1:{}/api", port),
        executions_url: format!("http://127.0.0.1:{}", port),
        analysis_url: format!("http://127.0.0.1:{}/detecter_fraude/", port),
        request_timeout_secs: 5,
        ..Config::default()
    }
}

/// Points at a port nobody listens on.
pub fn offline_config() -> TestResult<Config> {
    Ok(config_for(find_free_port()?))
}

pub fn services_with(store: LocalStore, config: &Config) -> TestResult<Services> {
    Ok(Services::new(store, ApiClient::new(config)?))
}

pub fn services(config: &Config) -> TestResult<Services> {
    services_with(LocalStore::in_memory(1024 * 1024)?, config)
}

pub fn sample_user() -> User {
    User {
        id: USER_ID.to_string(),
        name: "Sara".to_string(),
        email: "sara@example.com".to_string(),
        profile_image: None,
        token: Some(TOKEN.to_string()),
        stats: UserStats::default(),
    }
}

/// Write a session directly, as a previous `login` would have.
pub async fn sign_in(services: &Services) -> TestResult<User> {
    let user = sample_user();
    services.store.set_value(SESSION_KEY, &user).await?;
    services.restore_session().await?;
    Ok(user)
}
