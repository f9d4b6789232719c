use std::convert::Infallible;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

const DEFAULT_BACKEND_PORT: u16 = 19_001;
const DEFAULT_DELAY_MS: u64 = 40;

type MockBody = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Copy, Clone)]
enum MockScenario {
    Text,
    Widget,
    Error,
    ErrorRecord,
    Stall,
}

/// How a streamed reply ends after its scripted chunks.
#[derive(Copy, Clone)]
enum Ending {
    Done,
    Close,
    Hang,
}

struct MockState {
    scenario: MockScenario,
    delay: Duration,
    requests: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u64("BACKEND_PORT", u64::from(DEFAULT_BACKEND_PORT));
    let port = u16::try_from(port).unwrap_or(DEFAULT_BACKEND_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        delay: Duration::from_millis(env_u64("MOCK_DELAY_MS", DEFAULT_DELAY_MS)),
        requests: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock backend on 127.0.0.1:{port}: {err}"));
    eprintln!("mock chat backend listening on http://127.0.0.1:{port}/api");

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("mock backend connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("widget") => MockScenario::Widget,
        Ok("error") => MockScenario::Error,
        Ok("error_record") => MockScenario::ErrorRecord,
        Ok("stall") => MockScenario::Stall,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &Arc<MockState>) -> Response<MockBody> {
    let (parts, body) = request.into_parts();
    let body = body
        .collect()
        .await
        .map(http_body_util::Collected::to_bytes)
        .unwrap_or_default();

    if parts.method != Method::POST {
        return json_response(StatusCode::METHOD_NOT_ALLOWED, r#"{"detail":"method not allowed"}"#);
    }
    if !matches!(parts.uri.path(), "/api/chat/completions" | "/chat/completions") {
        return json_response(StatusCode::NOT_FOUND, r#"{"detail":"not found"}"#);
    }
    let authorized = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Bearer ") && value.len() > "Bearer ".len());
    if !authorized {
        return json_response(
            StatusCode::UNAUTHORIZED,
            r#"{"error":{"message":"missing bearer token"}}"#,
        );
    }

    let seq = state.requests.fetch_add(1, Ordering::Relaxed) + 1;
    let request_id = parts
        .headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-");
    eprintln!(
        "request #{seq} id={request_id} body={}",
        String::from_utf8_lossy(&body)
    );

    match state.scenario {
        MockScenario::Error => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error":{"message":"mock injected error"}}"#,
        ),
        MockScenario::Text => sse_response(
            text_chunks(&format!("This is reply number {seq} from the mock backend.")),
            state.delay,
            Ending::Done,
        ),
        MockScenario::Widget => {
            let mut chunks = text_chunks("Here are your open tasks:");
            chunks.push(delta_frame(r#" <widget type="task_list">{"tasks":["#));
            chunks.push(delta_frame(r#"{"title":"Reply to Ana","done":false},"#));
            chunks.push(delta_frame(r#"{"title":"Pay invoice","done":true}]}</widget>"#));
            sse_response(chunks, state.delay, Ending::Done)
        }
        MockScenario::ErrorRecord => {
            let mut chunks = text_chunks("Looking through your inbox");
            chunks.push("data: {\"error\":{\"message\":\"mailbox unavailable\"}}\n\n".to_string());
            sse_response(chunks, state.delay, Ending::Close)
        }
        MockScenario::Stall => sse_response(text_chunks("Thinking"), state.delay, Ending::Hang),
    }
}

fn delta_frame(text: &str) -> String {
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    format!("data: {{\"id\":\"mock\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{escaped}\"}}}}]}}\n\n")
}

fn text_chunks(reply: &str) -> Vec<String> {
    reply
        .split_inclusive(' ')
        .map(delta_frame)
        .collect()
}

fn sse_response(mut chunks: Vec<String>, delay: Duration, ending: Ending) -> Response<MockBody> {
    if matches!(ending, Ending::Done) {
        chunks.push("data: [DONE]\n\n".to_string());
    }
    let frames = futures_util::stream::unfold(
        (chunks.into_iter(), true),
        move |(mut iter, first)| async move {
            let chunk = iter.next()?;
            if !first {
                tokio::time::sleep(delay).await;
            }
            Some((Ok::<_, Infallible>(Frame::data(Bytes::from(chunk))), (iter, false)))
        },
    );
    let frames = match ending {
        Ending::Hang => frames.chain(futures_util::stream::pending()).boxed(),
        Ending::Done | Ending::Close => frames.boxed(),
    };
    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn json_response(status: StatusCode, body: &'static str) -> Response<MockBody> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())).boxed_unsync());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
