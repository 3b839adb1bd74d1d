//! HTTP server for query generation
//! Simple HTTP server using tokio and basic HTTP handling

use anyhow::Result;
use sis_query::executor::{init_pool, PgQueryExecutor};
use sis_query::fragments::{CachedFragmentStore, FragmentStore, JsonFragmentStore};
use sis_query::orchestrator::{GeneratorSettings, QueryGenerator};
use sis_query::scope::{AccessScope, ActiveSchool, SchoolAccess};
use sis_query::{AppConfig, GenerationRequest, OpenAiChatModel};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;
    let llm = OpenAiChatModel::from_config(&config)?;
    let store: Arc<dyn FragmentStore> = Arc::new(CachedFragmentStore::new(
        Arc::new(JsonFragmentStore::new(config.fragments_path.clone())),
        config.fragment_cache_ttl,
    ));

    let mut generator = QueryGenerator::new(Arc::new(llm), store, GeneratorSettings::from(&config));
    match config.database_url.as_deref() {
        Some(url) => {
            let pool = init_pool(url).await?;
            generator = generator.with_executor(Arc::new(PgQueryExecutor::new(pool, config.max_rows)));
        }
        None => warn!("DATABASE_URL not set - queries will be generated but not executed"),
    }
    let generator = Arc::new(generator);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on {}", config.bind_addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, Arc::clone(&generator)));
    }
}

async fn handle_connection(mut stream: TcpStream, generator: Arc<QueryGenerator>) {
    let response = match read_request(&mut stream).await {
        Ok(Some(request)) => handle_request(&request, &generator).await,
        Ok(None) => create_response(413, "Payload Too Large", r#"{"success":false,"error":"Request too large"}"#),
        Err(e) => {
            error!("Failed to read from stream: {}", e);
            return;
        }
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

/// Read headers, then as much body as Content-Length announces.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut data = Vec::new();
    let mut buffer = [0u8; 4096];

    loop {
        let size = stream.read(&mut buffer).await?;
        if size == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..size]);
        if data.len() > MAX_REQUEST_BYTES {
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&data);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }

    Ok(Some(String::from_utf8_lossy(&data).into_owned()))
}

async fn handle_request(request: &str, generator: &QueryGenerator) -> String {
    let lines: Vec<&str> = request.lines().collect();
    if lines.is_empty() {
        return create_response(400, "Bad Request", "{}");
    }

    let parts: Vec<&str> = lines[0].split_whitespace().collect();
    if parts.len() < 2 {
        return create_response(400, "Bad Request", "{}");
    }

    let method = parts[0];
    let path = parts[1].split('?').next().unwrap_or("/").trim_end_matches('/');

    // Parse headers
    let mut headers = HashMap::new();
    for line in &lines[1..] {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    match (method, path) {
        ("GET", "/health") | ("GET", "/api/health") => {
            create_response(200, "OK", r#"{"status":"ok","service":"sis-query"}"#)
        }
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        ("POST", "/api/query") => {
            let body_start = request.find("\r\n\r\n").map(|i| i + 4).unwrap_or(request.len());
            let body = request[body_start..].trim();

            let query: GenerationRequest = match serde_json::from_str(body) {
                Ok(q) => q,
                Err(e) => {
                    let body = serde_json::json!({"success": false, "error": format!("Invalid request body: {}", e)});
                    return create_response(400, "Bad Request", &body.to_string());
                }
            };

            let scope = match scope_from_headers(&headers) {
                Ok(scope) => scope,
                Err(message) => {
                    let body = serde_json::json!({"success": false, "error": message});
                    return create_response(403, "Forbidden", &body.to_string());
                }
            };

            let response = generator.handle(&query, &scope).await;
            let status = response.status_code();
            match serde_json::to_string(&response) {
                Ok(json) => create_response(status, status_text(status), &json),
                Err(e) => {
                    error!("Failed to serialize response: {}", e);
                    create_response(500, "Internal Server Error", r#"{"success":false,"error":"Internal error"}"#)
                }
            }
        }
        _ => create_response(404, "Not Found", r#"{"success":false,"error":"Not found"}"#),
    }
}

/// Access scope as set by the authenticating gateway. Missing or malformed
/// school headers deny access rather than widen it.
fn scope_from_headers(headers: &HashMap<String, String>) -> std::result::Result<AccessScope, String> {
    let allowed = headers
        .get("x-allowed-schools")
        .ok_or_else(|| "Missing x-allowed-schools header".to_string())?;

    let allowed_schools = if allowed.eq_ignore_ascii_case("district") {
        SchoolAccess::District
    } else {
        let ids = allowed
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| v.parse::<i64>().map_err(|_| format!("Invalid school id '{}'", v)))
            .collect::<std::result::Result<BTreeSet<i64>, String>>()?;
        SchoolAccess::Schools(ids)
    };

    let active_school = match headers.get("x-active-school").map(|v| v.trim()) {
        None | Some("") => ActiveSchool::All,
        Some(v) if v.eq_ignore_ascii_case("all") => ActiveSchool::All,
        Some(v) => ActiveSchool::School(
            v.parse::<i64>()
                .map_err(|_| format!("Invalid active school '{}'", v))?,
        ),
    };

    let roster_teacher = match headers.get("x-roster-teacher").map(|v| v.trim()) {
        None | Some("") => None,
        Some(v) => Some(
            v.parse::<i64>()
                .map_err(|_| format!("Invalid roster teacher '{}'", v))?,
        ),
    };

    let diagnostics = headers
        .get("x-diagnostics")
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    Ok(AccessScope {
        active_school,
        allowed_schools,
        roster_teacher,
        diagnostics,
    })
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        422 => "Unprocessable Entity",
        _ => "Internal Server Error",
    }
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type, X-Active-School, X-Allowed-Schools, X-Roster-Teacher, X-Diagnostics\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_scope_from_headers() {
        let scope = scope_from_headers(&headers(&[
            ("x-allowed-schools", "3, 4"),
            ("x-active-school", "4"),
            ("x-roster-teacher", "17"),
            ("x-diagnostics", "true"),
        ]))
        .unwrap();
        assert_eq!(scope.allowed_schools, SchoolAccess::Schools([3, 4].into_iter().collect()));
        assert_eq!(scope.active_school, ActiveSchool::School(4));
        assert_eq!(scope.roster_teacher, Some(17));
        assert!(scope.diagnostics);

        let district = scope_from_headers(&headers(&[("x-allowed-schools", "district")])).unwrap();
        assert_eq!(district, AccessScope::district());
    }

    #[test]
    fn test_missing_or_bad_scope_is_refused() {
        assert!(scope_from_headers(&headers(&[])).is_err());
        assert!(scope_from_headers(&headers(&[("x-allowed-schools", "3,abc")])).is_err());
    }

    #[test]
    fn test_path_and_method_routing() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let generator = QueryGenerator::new(
            Arc::new(OpenAiChatModel::new(
                "test".to_string(),
                "http://127.0.0.1:9".to_string(),
                "test".to_string(),
                std::time::Duration::from_secs(1),
            )
            .unwrap()),
            Arc::new(sis_query::fragments::StaticFragmentStore::new(Default::default())),
            GeneratorSettings::default(),
        );
        let health = rt.block_on(handle_request("GET /health HTTP/1.1\r\n\r\n", &generator));
        assert!(health.starts_with("HTTP/1.1 200 OK"));
        let missing = rt.block_on(handle_request("GET /nope HTTP/1.1\r\n\r\n", &generator));
        assert!(missing.starts_with("HTTP/1.1 404"));
        let bad = rt.block_on(handle_request(
            "POST /api/query HTTP/1.1\r\nx-allowed-schools: 3\r\n\r\n{not json",
            &generator,
        ));
        assert!(bad.starts_with("HTTP/1.1 400"));
    }
}
