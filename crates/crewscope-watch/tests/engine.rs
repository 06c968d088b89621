use crewscope_watch::{EngineClient, EngineError, StopOutcome};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    body: String,
}

type Route = fn(&str, &str) -> (u16, String);

/// Minimal HTTP/1.1 responder: one request per connection, answered by `route`.
async fn launch_http(route: Route) -> (Url, Arc<Mutex<Vec<Recorded>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let log = recorded.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let _ = answer(stream, route, log).await;
            });
        }
    });
    (
        Url::parse(&format!("http://{addr}")).expect("url"),
        recorded,
    )
}

async fn answer(
    mut stream: TcpStream,
    route: Route,
    log: Arc<Mutex<Vec<Recorded>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
    }
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
    log.lock().expect("log").push(Recorded {
        method: method.clone(),
        path: path.clone(),
        body,
    });

    let (status, payload) = route(&method, &path);
    let response = format!(
        "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
        payload.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn crew_engine(method: &str, path: &str) -> (u16, String) {
    match (method, path) {
        ("GET", "/api/v1/crews/crew-1/variables") => (200, r#"["topic","audience"]"#.to_string()),
        ("POST", "/api/v1/crews/crew-1/execute") => (200, r#"{"status":"started"}"#.to_string()),
        ("GET", "/api/v1/crews/crew-1") => (
            200,
            r#"{"id":"crew-1","name":"Research crew","description":"d","process_type":"sequential","agents":[{"id":"A1","name":"Researcher","role":"r","tools":["search"]},{"id":"A2","name":"Writer","role":"w"}]}"#
                .to_string(),
        ),
        ("GET", "/api/v1/tasks") => (
            200,
            r#"[
                {"id":"T1","name":"Collect","description":"collect sources","expected_output":"links","agent_id":"A1","crew_id":null},
                {"id":"T2","name":"Draft","description":"draft article","expected_output":"text","agent_id":"A2"},
                {"id":"T3","name":"Other","description":"belongs elsewhere","expected_output":"-","agent_id":"B7","crew_id":"crew-9"}
            ]"#
            .to_string(),
        ),
        ("POST", "/api/v1/crews/crew-1/stop") => (405, r#"{"detail":"Method Not Allowed"}"#.to_string()),
        _ => (404, r#"{"detail":"Not Found"}"#.to_string()),
    }
}

#[tokio::test]
async fn start_run_posts_inputs_after_checking_variables() {
    let (url, recorded) = launch_http(crew_engine).await;
    let client = EngineClient::new(&url);
    let inputs = BTreeMap::from([
        ("topic".to_string(), "tokio".to_string()),
        ("audience".to_string(), "operators".to_string()),
    ]);
    let accepted = client.start_run("crew-1", &inputs).await.expect("start");
    assert_eq!(accepted["status"], "started");

    let recorded = recorded.lock().expect("log").clone();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].path, "/api/v1/crews/crew-1/variables");
    assert_eq!(recorded[1].method, "POST");
    assert_eq!(recorded[1].path, "/api/v1/crews/crew-1/execute");
    let body: serde_json::Value = serde_json::from_str(&recorded[1].body).expect("json body");
    assert_eq!(body["inputs"]["topic"], "tokio");
    assert_eq!(body["inputs"]["audience"], "operators");
}

#[tokio::test]
async fn start_run_refuses_missing_inputs_without_posting() {
    let (url, recorded) = launch_http(crew_engine).await;
    let client = EngineClient::new(&url);
    let inputs = BTreeMap::from([("topic".to_string(), "tokio".to_string())]);
    let err = client.start_run("crew-1", &inputs).await.expect_err("missing");
    assert!(matches!(err, EngineError::MissingInputs(ref names) if names == &["audience".to_string()]));
    let recorded = recorded.lock().expect("log");
    assert!(recorded.iter().all(|request| request.method == "GET"));
}

#[tokio::test]
async fn rejected_stop_is_an_outcome_not_an_error() {
    let (url, _) = launch_http(crew_engine).await;
    let client = EngineClient::new(&url);
    assert_eq!(
        client.stop_run("crew-1").await.expect("stop"),
        StopOutcome::Rejected { status: 405 }
    );
}

#[tokio::test]
async fn definition_joins_crew_agents_with_their_tasks() {
    let (url, _) = launch_http(crew_engine).await;
    let client = EngineClient::new(&url);
    let definition = client.fetch_definition("crew-1").await.expect("definition");
    assert_eq!(definition.name, "Research crew");
    assert_eq!(definition.agents.len(), 2);
    let task_ids: Vec<_> = definition.tasks.iter().map(|task| task.id.as_str()).collect();
    assert_eq!(task_ids, vec!["T1", "T2"]);
    assert_eq!(definition.tasks[0].description, "collect sources");
}

#[tokio::test]
async fn unknown_crew_surfaces_status_and_detail() {
    let (url, _) = launch_http(crew_engine).await;
    let client = EngineClient::new(&url);
    let err = client.required_variables("crew-404").await.expect_err("not found");
    match err {
        EngineError::Status { status, body, .. } => {
            assert_eq!(status, 404);
            assert_eq!(body, "Not Found");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_engine_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let client = EngineClient::new(&Url::parse(&format!("http://{addr}")).expect("url"));
    assert!(matches!(
        client.required_variables("crew-1").await,
        Err(EngineError::Unreachable { .. })
    ));
}
