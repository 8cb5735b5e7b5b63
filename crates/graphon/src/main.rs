//! The HTTP server: loads an index and answers SPARQL over HTTP with
//! streaming TSV/CSV/JSON bodies fed by a pump thread.

mod response;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use actix_web::http::header;
use actix_web::web::{self, Data};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer};
use anyhow::Context;
use clap::Parser;
use hexad::search::planner::{Plan, Planner};
use hexad::{CancellationHandle, EngineConfig, Error, ExecutionContext, Index, UserError};
use serde::Deserialize;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    /// Directory holding the index built by `graphontool build-index`.
    #[arg(long, env = "GRAPHON_INDEX_DIR")]
    index_dir: PathBuf,

    /// Address the HTTP server binds to.
    #[arg(long, env = "GRAPHON_LISTEN", default_value = "127.0.0.1:7001")]
    listen: String,

    /// Engine configuration file (JSON).
    #[arg(long, env = "GRAPHON_CONFIG")]
    config: Option<PathBuf>,
}

struct AppState {
    index: Arc<Index>,
    config: Arc<EngineConfig>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            let code = match error.downcast_ref::<Error>() {
                Some(Error::IoError(_)) => 3,
                Some(Error::InternalError(_)) => 4,
                Some(Error::UserError(_)) => 5,
                None if error.downcast_ref::<io::Error>().is_some() => 3,
                None => 2,
            };
            ExitCode::from(code)
        }
    }
}

#[actix_web::main]
async fn run() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let config: Arc<EngineConfig> = Arc::new(match &opt.config {
        None => EngineConfig::default(),
        Some(path) => serde_json::from_slice(
            &std::fs::read(path)
                .with_context(|| format!("reading the configuration file {}", path.display()))?,
        )
        .with_context(|| format!("parsing the configuration file {}", path.display()))?,
    });
    let index = Arc::new(Index::open(&opt.index_dir)?);
    tracing::info!(listen = opt.listen, "serving SPARQL over HTTP");

    let state = Data::new(AppState { index, config });
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/", web::get().to(stats))
            .route("/query", web::get().to(query_get))
            .route("/query", web::post().to(query_post))
            .route("/delta/insert", web::post().to(delta_insert))
            .route("/delta/delete", web::post().to(delta_delete))
    })
    .bind(&opt.listen)?
    .run()
    .await?;
    Ok(())
}

/// Index statistics plus the live delta-triples counts.
async fn stats(state: Data<AppState>) -> HttpResponse {
    let delta = state.index.delta().count();
    HttpResponse::Ok().json(serde_json::json!({
        "meta": state.index.meta(),
        "deltaTriples": delta,
    }))
}

#[derive(Deserialize)]
struct QueryParams {
    query: String,
    /// Milliseconds until the query is cancelled.
    timeout_ms: Option<u64>,
}

async fn query_get(
    request: HttpRequest,
    state: Data<AppState>,
    params: web::Query<QueryParams>,
) -> HttpResponse {
    let params = params.into_inner();
    answer_query(request, state, params.query, params.timeout_ms).await
}

async fn query_post(request: HttpRequest, state: Data<AppState>, body: String) -> HttpResponse {
    // The body is the query itself (application/sparql-query).
    answer_query(request, state, body, None).await
}

async fn answer_query(
    request: HttpRequest,
    state: Data<AppState>,
    query: String,
    timeout_ms: Option<u64>,
) -> HttpResponse {
    let format = response::negotiate(request.headers().get(header::ACCEPT));
    let cancellation = CancellationHandle::default();
    if let Some(timeout_ms) = timeout_ms {
        let handle = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
            handle.cancel();
        });
    }

    let index = state.index.clone();
    let config = state.config.clone();
    let result = web::block(move || -> hexad::Result<response::Payload> {
        let parsed = sparql_parser::parse_query(&query)
            .map_err(|error| UserError::QueryParse(error.to_string()))?;
        let plan: Plan = Planner::new(index.clone(), config.clone()).plan(&parsed)?;
        let context =
            ExecutionContext::new(index.clone(), config).with_cancellation(cancellation);
        response::evaluate(&index, &context, plan, format)
    })
    .await;

    match result {
        Ok(Ok(payload)) => response::stream(payload, format),
        Ok(Err(error)) => error_response(error),
        Err(blocking) => {
            tracing::error!(%blocking, "query worker failed");
            HttpResponse::InternalServerError().body("query worker failed")
        }
    }
}

fn error_response(error: Error) -> HttpResponse {
    let message = error.to_string();
    match &error {
        Error::UserError(UserError::Cancelled) => {
            HttpResponse::RequestTimeout().body(message)
        }
        Error::UserError(_) => HttpResponse::BadRequest().body(message),
        _ => {
            tracing::error!(%error, "internal error while answering a query");
            HttpResponse::InternalServerError().body(message)
        }
    }
}

/// Applies an N-Triples-style body of `<s> <p> <o> .` lines (every term
/// must already exist in the knowledge graph) to the delta overlay.
fn parse_delta_body(index: &Index, body: &str) -> Result<Vec<hexad::IdTriple>, String> {
    let mut triples = Vec::new();
    for line in body.lines() {
        let line = line.trim().trim_end_matches('.').trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut ids = Vec::with_capacity(3);
        for part in line.split_whitespace() {
            match index.id_for_term(part) {
                Ok(Some(id)) => ids.push(id),
                Ok(None) => return Err(format!("unknown term {part}")),
                Err(error) => return Err(error.to_string()),
            }
        }
        let [s, p, o] = ids.as_slice() else {
            return Err(format!("expected three terms per line, got `{line}`"));
        };
        triples.push([*s, *p, *o]);
    }
    Ok(triples)
}

async fn delta_insert(state: Data<AppState>, body: String) -> HttpResponse {
    match parse_delta_body(&state.index, &body) {
        Ok(triples) => {
            state.index.delta().insert(&triples);
            HttpResponse::Ok().json(state.index.delta().count())
        }
        Err(message) => HttpResponse::BadRequest().body(message),
    }
}

async fn delta_delete(state: Data<AppState>, body: String) -> HttpResponse {
    match parse_delta_body(&state.index, &body) {
        Ok(triples) => {
            state.index.delta().delete(&triples);
            HttpResponse::Ok().json(state.index.delta().count())
        }
        Err(message) => HttpResponse::BadRequest().body(message),
    }
}
