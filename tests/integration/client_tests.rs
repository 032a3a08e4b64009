//! Integration tests for the conversational client over a scripted child.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_conduit::events::EventHandlerSet;
use agent_conduit::{AgentClient, SdkError};
use serde_json::json;

use super::test_helpers::{bounded, sh_config, wait_until};

async fn client(script: &str, handlers: EventHandlerSet) -> AgentClient {
    AgentClient::connect(&sh_config(script), handlers)
        .await
        .expect("connect client")
}

/// A prompt goes out as a stream-json `user` record.
#[tokio::test]
async fn query_sends_user_record() {
    let client = client(r#"read -r line; printf '%s\n' "$line""#, EventHandlerSet::new()).await;

    client.query("What is 2 + 2?", Some("s-42")).await.expect("query");
    let echoed = bounded(client.receive_messages())
        .await
        .expect("echo")
        .expect("decoded");
    assert_eq!(
        echoed,
        json!({
            "type": "user",
            "message": {"role": "user", "content": "What is 2 + 2?"},
            "parent_tool_use_id": null,
            "session_id": "s-42",
        })
    );
    client.disconnect().await.expect("disconnect");
}

/// A response is collected up to the `result` record; undecodable lines in
/// between are skipped.
#[tokio::test]
async fn receive_response_stops_at_result() {
    let client = client(
        r#"read -r line
echo '{"type":"system","subtype":"init"}'
echo '{bad json'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"4"}]}}'
echo '{"type":"result","subtype":"success","result":"4"}'
echo '{"type":"assistant","message":{"content":"after"}}'
sleep 5"#,
        EventHandlerSet::new(),
    )
    .await;

    client.query("What is 2 + 2?", None).await.expect("query");
    let messages = bounded(client.receive_response()).await.expect("response");
    let kinds: Vec<_> = messages
        .iter()
        .map(|m| m["type"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(kinds, vec!["system", "assistant", "result"]);
    assert_eq!(messages[2]["result"], "4");

    // The record after `result` is left for the next read.
    let next = bounded(client.receive_messages()).await.expect("next").expect("decoded");
    assert_eq!(next["message"]["content"], "after");
    client.disconnect().await.expect("disconnect");
}

/// A child dying mid-response surfaces its exit code and stderr.
#[tokio::test]
async fn receive_response_reports_process_failure() {
    let client = client(
        r#"read -r line; echo '{"type":"assistant","message":{}}'; echo 'rate limited' >&2; exit 1"#,
        EventHandlerSet::new(),
    )
    .await;

    client.query("hi", None).await.expect("query");
    let err = bounded(client.receive_response()).await.expect_err("child died");
    match err {
        SdkError::Process { exit_code, stderr } => {
            assert_eq!(exit_code, 1);
            assert_eq!(stderr, "rate limited");
        }
        other => panic!("expected Process, got {other:?}"),
    }
    client.disconnect().await.expect("disconnect");
}

/// A stream that ends cleanly before any `result` is reported as closed.
#[tokio::test]
async fn receive_response_without_result_is_closed() {
    let client = client(
        r#"read -r line; echo '{"type":"assistant","message":{}}'"#,
        EventHandlerSet::new(),
    )
    .await;

    client.query("hi", None).await.expect("query");
    let err = bounded(client.receive_response()).await.expect_err("no result");
    assert!(matches!(err, SdkError::Closed));
    client.disconnect().await.expect("disconnect");
}

/// Interrupts are control requests with increasing request ids, each
/// acknowledged by the matching control response.
#[tokio::test]
async fn interrupt_waits_for_control_response() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handlers = EventHandlerSet::new().on_notification(move |note| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().expect("lock").push(note.raw);
            Ok(())
        }
    });

    let client = client(
        r#"read -r a; printf '%s\n' "$a"
echo '{"type":"control_response","response":{"subtype":"success","request_id":"req_1"}}'
read -r b; printf '%s\n' "$b"
echo '{"type":"control_response","response":{"subtype":"success","request_id":"req_2"}}'
sleep 5"#,
        handlers,
    )
    .await;

    bounded(client.interrupt()).await.expect("interrupt 1");
    bounded(client.interrupt()).await.expect("interrupt 2");
    assert_eq!(client.connection().pending_calls(), 0);

    assert!(wait_until(Duration::from_secs(5), || seen.lock().expect("lock").len() == 2).await);
    let seen = seen.lock().expect("lock").clone();
    assert_eq!(
        seen[0],
        json!({"type": "control_request", "request_id": "req_1", "request": {"subtype": "interrupt"}})
    );
    assert_eq!(seen[1]["request_id"], "req_2");
    client.disconnect().await.expect("disconnect");
}

/// A control response reporting an error fails the interrupt.
#[tokio::test]
async fn refused_interrupt_is_an_error() {
    let client = client(
        r#"read -r a
echo '{"type":"control_response","response":{"subtype":"error","request_id":"req_1","error":"no turn running"}}'
sleep 5"#,
        EventHandlerSet::new(),
    )
    .await;

    let err = bounded(client.interrupt()).await.expect_err("refused");
    assert!(
        matches!(err, SdkError::Sdk(ref msg) if msg.contains("no turn running")),
        "got {err:?}"
    );
    client.disconnect().await.expect("disconnect");
}

/// An interrupt nobody acknowledges times out and is forgotten.
#[tokio::test]
async fn unacknowledged_interrupt_times_out() {
    let mut config = sh_config("cat > /dev/null");
    config.call_timeout_seconds = 1;
    let client = AgentClient::connect(&config, EventHandlerSet::new())
        .await
        .expect("connect client");

    let err = bounded(client.interrupt()).await.expect_err("no response");
    assert!(matches!(err, SdkError::Timeout(_)), "got {err:?}");
    assert_eq!(client.connection().pending_calls(), 0);
    client.disconnect().await.expect("disconnect");
}

// ── One-shot query ──────────────────────────────────────────────────────────

/// The one-shot form sends the prompt and collects through `result`.
#[tokio::test]
async fn one_shot_query_collects_response() {
    let config = sh_config(
        r#"read -r line
echo '{"type":"system","subtype":"init"}'
printf '{"type":"result","subtype":"success","prompt":%s}\n' "$line"
sleep 5"#,
    );

    let messages = bounded(agent_conduit::query(&config, "ping")).await.expect("query");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["prompt"]["message"]["content"], "ping");
}

/// An `error` record becomes a tool-execution error with its hint, and the
/// child is shut down even though the query failed.
#[tokio::test]
async fn one_shot_query_maps_error_record_and_disconnects() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pidfile = dir.path().join("child.pid");
    let config = sh_config(&format!(
        r#"echo $$ > '{}'
read -r line
echo '{{"type":"assistant","error":{{"code":-32001,"message":"tool crashed","data":{{"hint":"retry later"}}}}}}'
exec sleep 30"#,
        pidfile.display()
    ));

    let err = bounded(agent_conduit::query(&config, "go"))
        .await
        .expect_err("error record");
    match &err {
        SdkError::ToolExecution { code, message, .. } => {
            assert_eq!(*code, -32001);
            assert_eq!(message, "tool crashed");
        }
        other => panic!("expected ToolExecution, got {other:?}"),
    }
    assert_eq!(err.hint(), Some("retry later"));

    let pid = std::fs::read_to_string(&pidfile).expect("pidfile");
    let pid = nix::unistd::Pid::from_raw(pid.trim().parse().expect("numeric pid"));
    assert!(
        wait_until(Duration::from_secs(5), || nix::sys::signal::kill(pid, None).is_err()).await,
        "child outlived the one-shot query"
    );
}
