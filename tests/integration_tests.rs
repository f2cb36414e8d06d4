//! End-to-end step-executor scenarios (spec §8), driven against a scripted
//! in-process CDP peer rather than a real browser so the suite never needs
//! Chrome installed.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use browserstep::capture::{ConsoleCapture, NetworkCapture};
use browserstep::config::RunConfig;
use browserstep::error::ErrorKind;
use browserstep::page_session::PageSession;
use browserstep::session::SessionRegistry;
use browserstep::step::executor::StepExecutor;
use browserstep::step::{Step, StepStatus};
use browserstep::target::TargetRegistry;
use browserstep::transport::Transport;

fn step(value: Value) -> Step {
    Step(value.as_object().unwrap().clone())
}

/// Names the one selector that should fail to resolve; every other selector
/// resolves to a fresh object id.
struct Scenario {
    missing_selector: &'static str,
}

fn handle(method: &str, params: &Value, scenario: &Scenario) -> Value {
    match method {
        "Runtime.evaluate" => {
            let expr = params.get("expression").and_then(|v| v.as_str()).unwrap_or("");
            if let Some(call) = expr.strip_prefix("window.__browserstepResolve.bySelector(") {
                if call.contains(scenario.missing_selector) {
                    json!({ "result": { "type": "undefined" } })
                } else {
                    json!({ "result": { "type": "object", "objectId": "obj-1" } })
                }
            } else if let Some(rest) = expr.strip_prefix("window.__browserstepSerialize(") {
                if rest.contains("document.location.href") {
                    json!({ "result": { "value": { "tag": "string", "value": "https://example.test/widgets" } } })
                } else if rest.contains("document.title") {
                    json!({ "result": { "value": { "tag": "string", "value": "Widgets" } } })
                } else if rest.contains("__testReady") {
                    json!({ "result": { "value": { "tag": "boolean", "value": true } } })
                } else {
                    json!({ "result": { "value": { "tag": "null" } } })
                }
            } else {
                // helper-loading evaluates (resolve.js/actionability.js/eval_serializer.js)
                json!({ "result": { "type": "undefined" } })
            }
        }
        "Runtime.callFunctionOn" => {
            let decl = params.get("functionDeclaration").and_then(|v| v.as_str()).unwrap_or("");
            if decl.contains("__browserstepActionability") {
                json!({ "result": { "value": { "matches": true, "received": "ok" } } })
            } else if decl.contains("clickablePoint") {
                json!({ "result": { "value": { "x": 12.0, "y": 34.0 } } })
            } else if decl.contains("boundingBox") {
                json!({ "result": { "value": { "x": 0.0, "y": 0.0, "width": 20.0, "height": 20.0 } } })
            } else if decl.contains("return !!this.__browserstepClicked") {
                json!({ "result": { "value": true } })
            } else {
                json!({ "result": {} })
            }
        }
        _ => json!({ "result": {} }),
    }
}

async fn spawn_scenario_server(scenario: Scenario) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let frame: Value = serde_json::from_str(&text).unwrap();
                let id = frame.get("id").cloned().unwrap_or(Value::Null);
                let method = frame.get("method").and_then(|v| v.as_str()).unwrap_or("");
                let params = frame.get("params").cloned().unwrap_or_else(|| json!({}));
                let result = handle(method, &params, &scenario);
                let reply = json!({ "id": id, "result": result });
                if ws.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
            }
        }
    });
    port
}

async fn make_executor(scenario: Scenario) -> StepExecutor {
    let port = spawn_scenario_server(scenario).await;
    let transport = Arc::new(Transport::connect(&format!("ws://127.0.0.1:{port}")).await.unwrap());
    let page = Arc::new(PageSession::new(transport.clone(), "s1".into(), "t1".into()));
    let target_registry = Arc::new(TargetRegistry::new(transport.clone()));
    let session_registry = Arc::new(SessionRegistry::new(transport));
    let console = Arc::new(ConsoleCapture::new(100));
    let network = Arc::new(NetworkCapture::new(vec![]));
    StepExecutor::new(page, target_registry, session_registry, RunConfig::default(), console, network)
}

#[tokio::test]
async fn happy_path_click_reports_native_strategy() {
    let executor = make_executor(Scenario { missing_selector: "#never-matches" }).await;
    let steps = vec![step(json!({ "click": "#ok" }))];

    let report = executor.run(&steps, true).await.unwrap();

    assert_eq!(report.status, StepStatus::Ok);
    assert_eq!(report.steps.len(), 1);
    let output = report.steps[0].output.clone().unwrap();
    assert_eq!(output["strategy"], json!("native"));
}

#[tokio::test]
async fn validation_errors_abort_before_any_step_runs() {
    let executor = make_executor(Scenario { missing_selector: "#missing" }).await;
    // An empty selector fails validation; the list is rejected as a whole
    // before the well-formed second step ever reaches the transport.
    let steps = vec![step(json!({ "click": "" })), step(json!({ "click": "#ok" }))];

    let err = executor.run(&steps, true).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::StepValidation);
}

#[tokio::test]
async fn stop_on_error_halts_after_the_first_failing_step() {
    let executor = make_executor(Scenario { missing_selector: "#missing" }).await;
    let steps = vec![step(json!({ "click": "#missing" })), step(json!({ "click": "#ok" }))];

    let report = executor.run(&steps, true).await.unwrap();

    assert_eq!(report.status, StepStatus::Error);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].status, StepStatus::Error);
}

#[tokio::test]
async fn continue_on_error_runs_every_step_regardless() {
    let executor = make_executor(Scenario { missing_selector: "#missing" }).await;
    let steps = vec![step(json!({ "click": "#missing" })), step(json!({ "click": "#ok" }))];

    let report = executor.run(&steps, false).await.unwrap();

    assert_eq!(report.status, StepStatus::Error);
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[0].status, StepStatus::Error);
    assert_eq!(report.steps[1].status, StepStatus::Ok);
}

#[tokio::test]
async fn url_assertion_passes_against_the_mocked_location() {
    let executor = make_executor(Scenario { missing_selector: "#missing" }).await;
    let steps = vec![step(json!({ "assert": { "url": { "contains": "widgets" } } }))];

    let report = executor.run(&steps, true).await.unwrap();

    assert_eq!(report.status, StepStatus::Ok);
    assert_eq!(report.steps[0].status, StepStatus::Ok);
}

#[tokio::test]
async fn url_assertion_failure_is_reported_without_aborting_when_continuing() {
    let executor = make_executor(Scenario { missing_selector: "#missing" }).await;
    let steps = vec![
        step(json!({ "assert": { "url": { "contains": "nope" } } })),
        step(json!({ "click": "#ok" })),
    ];

    let report = executor.run(&steps, false).await.unwrap();

    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[0].status, StepStatus::Error);
    assert_eq!(report.steps[1].status, StepStatus::Ok);
}

#[tokio::test]
async fn poll_resolves_true_on_the_first_evaluation_once_truthy() {
    let executor = make_executor(Scenario { missing_selector: "#missing" }).await;
    let steps = vec![step(json!({ "poll": { "fn": "window.__testReady === true", "interval": 10 } }))];

    let report = executor.run(&steps, true).await.unwrap();

    assert_eq!(report.status, StepStatus::Ok);
    let output = report.steps[0].output.clone().unwrap();
    assert_eq!(output["resolved"], json!(true));
    assert_eq!(output["evaluations"], json!(1));
}
