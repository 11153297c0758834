use actix_cors::Cors;
use actix_web::http::StatusCode;
use actix_web::{get, post, web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use actix_ws::Message;
use flowcore::{
    Config, DeleteFilter, ExecutionFilter, LifecycleError, PushBus, StoreError, SubmitRequest,
    WebhookResponse,
};
use flowruntime::{
    open_store, ExecutionRuntime, NodeRegistry, ResumeScheduler, WorkflowExecutor,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// How long a webhook caller waits for the first response by default
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Application state shared across handlers
struct AppState {
    runtime: ExecutionRuntime,
    registry: Arc<NodeRegistry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitQuery {
    /// Answer with the final result instead of the execution id
    #[serde(default)]
    wait: bool,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    /// JSON-encoded `ExecutionFilter`
    filter: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryQuery {
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushQuery {
    session_id: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse {
        error: message.into(),
    })
}

fn status_for(e: &LifecycleError) -> StatusCode {
    match e {
        LifecycleError::UnknownExecution(_) => StatusCode::NOT_FOUND,
        LifecycleError::DuplicateExecution(_)
        | LifecycleError::WaiterAlreadySet(_)
        | LifecycleError::NotRetryable { .. } => StatusCode::CONFLICT,
        LifecycleError::WaitTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        LifecycleError::Engine(_) => StatusCode::BAD_REQUEST,
        LifecycleError::Store(StoreError::InvalidFilter(_)) => StatusCode::BAD_REQUEST,
        LifecycleError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        LifecycleError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        LifecycleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: LifecycleError) -> HttpResponse {
    let status = status_for(&e);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        debug!("Request rejected: {}", e);
    }
    HttpResponse::build(status).json(ErrorResponse {
        error: e.to_string(),
    })
}

/// Replays a step's webhook response to the HTTP caller.
fn webhook_reply(response: WebhookResponse) -> HttpResponse {
    let status = response
        .response_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);
    let mut builder = HttpResponse::build(status);
    for (name, value) in response.headers {
        builder.insert_header((name, value));
    }
    builder.json(response.data)
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "flowengine"
    }))
}

/// Start an execution
#[post("/api/executions")]
async fn submit_execution(
    data: web::Data<AppState>,
    query: web::Query<SubmitQuery>,
    body: web::Json<SubmitRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    if let Err(e) = data.registry.validate_workflow(&request.workflow_data) {
        return bad_request(e.to_string());
    }
    let limit = query.timeout_secs.map(Duration::from_secs);

    let (submitted, pending) = match data.runtime.submit_with_response(request).await {
        Ok(submitted) => submitted,
        Err(e) => return error_response(e),
    };
    info!("Execution {} submitted", submitted.execution_id);

    if let Some(pending) = pending {
        return match pending.wait(limit.or(Some(DEFAULT_RESPONSE_TIMEOUT))).await {
            Ok(response) => webhook_reply(response),
            Err(e) => error_response(e),
        };
    }

    if query.wait {
        return match data
            .runtime
            .wait_for_completion(submitted.execution_id, limit)
            .await
        {
            Ok(result) => HttpResponse::Ok().json(result),
            Err(e) => error_response(e),
        };
    }

    HttpResponse::Accepted().json(submitted)
}

/// List stored executions, newest first
#[get("/api/executions")]
async fn list_executions(data: web::Data<AppState>, query: web::Query<ListQuery>) -> HttpResponse {
    let mut filter = match query.filter.as_deref() {
        Some(raw) => match serde_json::from_str::<ExecutionFilter>(raw) {
            Ok(filter) => filter,
            Err(e) => return bad_request(format!("invalid filter: {}", e)),
        },
        None => ExecutionFilter::default(),
    };
    if query.limit.is_some() {
        filter.limit = query.limit;
    }

    match data.runtime.list(&filter).await {
        Ok(page) => HttpResponse::Ok().json(page),
        Err(e) => error_response(e),
    }
}

/// Get a specific execution
#[get("/api/executions/{id}")]
async fn get_execution(data: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    let id = path.into_inner();
    match data.runtime.load(id).await {
        Ok(Some(record)) => HttpResponse::Ok().json(record),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Execution {} not found", id),
        }),
        Err(e) => error_response(e),
    }
}

#[post("/api/executions/delete")]
async fn delete_executions(
    data: web::Data<AppState>,
    filter: web::Json<DeleteFilter>,
) -> HttpResponse {
    match data.runtime.delete(&filter).await {
        Ok(deleted) => {
            info!("Deleted {} executions", deleted);
            HttpResponse::Ok().json(serde_json::json!({ "deleted": deleted }))
        }
        Err(e) => error_response(e),
    }
}

#[post("/api/executions/{id}/retry")]
async fn retry_execution(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<RetryQuery>,
) -> HttpResponse {
    let user = query.user_id.as_deref().unwrap_or("api");
    match data.runtime.retry(path.into_inner(), user).await {
        Ok(submitted) => HttpResponse::Accepted().json(submitted),
        Err(e) => error_response(e),
    }
}

#[post("/api/executions/{id}/stop")]
async fn stop_execution(data: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    match data.runtime.stop(path.into_inner()).await {
        Ok(outcome) => HttpResponse::Ok().json(outcome),
        Err(e) => error_response(e),
    }
}

#[get("/api/executions-current")]
async fn current_executions(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(data.runtime.current())
}

/// List available node types
#[get("/api/nodes")]
async fn list_node_types(data: web::Data<AppState>) -> impl Responder {
    let nodes: Vec<_> = data
        .registry
        .list_node_types()
        .iter()
        .map(|node_type| {
            let metadata = data.registry.get_metadata(node_type);
            serde_json::json!({
                "type": node_type,
                "description": metadata.as_ref().map(|m| m.description.clone()).unwrap_or_default(),
                "category": metadata.as_ref().map(|m| m.category.clone()).unwrap_or_default(),
                "version": metadata.as_ref().map(|m| m.version).unwrap_or(1),
            })
        })
        .collect();

    HttpResponse::Ok().json(nodes)
}

/// WebSocket push channel for one UI session
#[get("/push")]
async fn push_socket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<PushQuery>,
    data: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    let session_id = query.into_inner().session_id;
    let push: &PushBus = data.runtime.push();
    let mut subscription = match &session_id {
        Some(id) => push.subscribe_session(id.clone()),
        None => push.subscribe(),
    };
    info!(
        "Push client connected (session {})",
        session_id.as_deref().unwrap_or("-")
    );

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    match serde_json::to_string(&message) {
                        Ok(json) => {
                            if session.text(json).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => error!("Cannot encode {} push message: {}", message.kind(), e),
                    }
                }

                incoming = msg_stream.recv() => {
                    match incoming {
                        Some(Ok(Message::Ping(bytes))) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        if subscription.dropped() > 0 {
            debug!(
                "Push client fell behind, {} messages dropped",
                subscription.dropped()
            );
        }
        info!("Push client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(submit_execution)
        .service(list_executions)
        .service(delete_executions)
        .service(get_execution)
        .service(retry_execution)
        .service(stop_execution)
        .service(current_executions)
        .service(list_node_types)
        .service(push_socket);
}

fn load_config() -> anyhow::Result<Config> {
    Ok(match std::env::var("FLOW_CONFIG") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::from_env()?,
    })
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🚀 Starting Flow Engine Server");

    let config = load_config()?;
    let store = open_store(&config).await?;

    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry);
    let registry = Arc::new(registry);

    let engine = WorkflowExecutor::new(registry.clone(), config.engine.max_parallel_nodes);
    let push = PushBus::new(config.push.subscriber_capacity, config.push.overflow);
    let runtime = ExecutionRuntime::new(&config, store.clone(), Arc::new(engine), push);

    info!("✅ Runtime initialized with {} node types", registry.list_node_types().len());

    let shutdown = CancellationToken::new();
    let scheduler = ResumeScheduler::new(store, Arc::new(runtime.clone()), &config.scheduler);
    let scheduler_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let app_state = web::Data::new(AppState { runtime, registry });
    let bind_address = config.server.bind_address.clone();

    info!("🌐 Server starting on http://{}", bind_address);

    let served = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes)
    })
    .bind(&bind_address)?
    .run()
    .await;

    shutdown.cancel();
    let _ = scheduler_task.await;
    served?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;
    use flowcore::{ExecutionMode, ExecutionStatus, NodeSpec, ResponseMode, RunResult, Workflow};
    use flowruntime::MemoryStore;

    fn state() -> web::Data<AppState> {
        let mut registry = NodeRegistry::new();
        flownodes::register_all(&mut registry);
        let registry = Arc::new(registry);
        let config = Config::default();
        let runtime = ExecutionRuntime::new(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(WorkflowExecutor::new(registry.clone(), 4)),
            PushBus::new(16, Default::default()),
        );
        web::Data::new(AppState { runtime, registry })
    }

    fn logging_workflow() -> Workflow {
        let mut workflow = Workflow::new("http");
        workflow.add_node(
            NodeSpec::new("debug.log")
                .with_name("log")
                .with_config("message", "from http"),
        );
        workflow
    }

    #[actix_web::test]
    async fn test_health() {
        let app = test::init_service(App::new().app_data(state()).configure(routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_submit_wait_and_fetch() {
        let app = test::init_service(App::new().app_data(state()).configure(routes)).await;
        let request = SubmitRequest::new(ExecutionMode::Manual, Arc::new(logging_workflow()), "t");

        let result: RunResult = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/api/executions?wait=true&timeoutSecs=5")
                .set_json(&request)
                .to_request(),
        )
        .await;
        assert_eq!(result.status, ExecutionStatus::Success);

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/api/executions/{}", result.execution_id))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let page: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/api/executions").to_request(),
        )
        .await;
        assert_eq!(page["count"], 1);
        assert_eq!(page["estimated"], false);
    }

    #[actix_web::test]
    async fn test_first_response_is_returned_to_the_caller() {
        let app = test::init_service(App::new().app_data(state()).configure(routes)).await;
        let mut workflow = Workflow::new("hook");
        workflow.add_node(
            NodeSpec::new("webhook.respond")
                .with_name("respond")
                .with_config("body", "thanks")
                .with_config("status", 202.0),
        );
        let mut request = SubmitRequest::new(ExecutionMode::Webhook, Arc::new(workflow), "t");
        request.response_mode = ResponseMode::FirstResponse;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/executions")
                .set_json(&request)
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, serde_json::json!("thanks"));
    }

    #[actix_web::test]
    async fn test_errors_map_to_status_codes() {
        let app = test::init_service(App::new().app_data(state()).configure(routes)).await;
        let missing = Uuid::new_v4();

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/api/executions/{}", missing))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri(&format!("/api/executions/{}/stop", missing))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/executions/delete")
                .set_json(serde_json::json!({}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/executions?filter=%7B%22filters%22%3A%7B%22bogus%22%3A1%7D%7D")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let mut workflow = Workflow::new("unknown");
        workflow.add_node(NodeSpec::new("nope.missing"));
        let request = SubmitRequest::new(ExecutionMode::Manual, Arc::new(workflow), "t");
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/executions")
                .set_json(&request)
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
