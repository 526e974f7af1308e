//! End-to-end tests for the streaming flow: SSE relay, marker handling,
//! continuation and failure semantics.

use integration_tests::{final_chunk, spawn_gateway, sse_data_lines, text_chunk};
use serde_json::{Value, json};

fn streaming_request(content: &str) -> Value {
    json!({
        "model": "gemini-2.5-flash",
        "messages": [{ "role": "user", "content": content }],
        "stream": true
    })
}

fn delta_contents(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| *line != "[DONE]")
        .filter_map(|line| {
            let chunk: Value = serde_json::from_str(line).unwrap();
            chunk["choices"][0]["delta"]["content"].as_str().map(str::to_string)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn chunks_are_relayed_and_the_marker_is_stripped() {
    let gateway = spawn_gateway(1).await;

    gateway.upstream.queue_stream_chunks(vec![
        text_chunk("The "),
        text_chunk("answer "),
        final_chunk("is 42.[done]", 7),
    ]);

    let response = gateway
        .client
        .post("/v1/chat/completions", &streaming_request("what is the answer?"))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);

    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert_eq!(response.headers()["x-accel-buffering"], "no");

    let body = response.text().await.unwrap();

    // The lowercase marker never reaches the caller; the sentinel is emitted
    // exactly once, at the very end.
    assert!(!body.contains("[done]"), "{body}");

    let lines = sse_data_lines(&body);
    assert_eq!(lines.iter().filter(|line| *line == "[DONE]").count(), 1);
    assert_eq!(lines.last().unwrap(), "[DONE]");

    assert_eq!(delta_contents(&lines), ["The ", "answer ", "is 42."]);

    let first: Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");

    // The segment terminated with the marker, so exactly one upstream stream
    // was opened.
    assert_eq!(gateway.upstream.stream_requests().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_stream_triggers_a_continuation() {
    let gateway = spawn_gateway(1).await;

    gateway.upstream.queue_stream_chunks(vec![text_chunk("part A")]);
    gateway.upstream.queue_stream_chunks(vec![final_chunk("part B[done]", 3)]);

    let response = gateway
        .client
        .post("/v1/chat/completions", &streaming_request("tell me a story"))
        .await
        .unwrap();

    let body = response.text().await.unwrap();
    let lines = sse_data_lines(&body);

    assert_eq!(delta_contents(&lines), ["part A", "part B"]);
    assert_eq!(lines.last().unwrap(), "[DONE]");

    let requests = gateway.upstream.stream_requests();
    assert_eq!(requests.len(), 2);

    // The continuation request carries the collected output as a model
    // message, followed by the literal continue prompt.
    let contents = requests[1]["contents"].as_array().unwrap();
    let count = contents.len();

    assert_eq!(
        contents[count - 2],
        json!({ "role": "model", "parts": [{ "text": "part A" }] })
    );

    assert_eq!(contents[count - 1]["role"], "user");
    assert_eq!(
        contents[count - 1]["parts"][0]["text"],
        "Continue from where you left off. You have already output approximately 6 characters ending with:\n\"...part A\"\n\nContinue:"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn continuations_are_bounded_and_the_stream_closes_cleanly() {
    let gateway = spawn_gateway(1).await;

    for text in ["a", "b", "c", "d"] {
        gateway.upstream.queue_stream_chunks(vec![text_chunk(text)]);
    }

    let response = gateway
        .client
        .post("/v1/chat/completions", &streaming_request("go on forever"))
        .await
        .unwrap();

    let body = response.text().await.unwrap();
    let lines = sse_data_lines(&body);

    // The marker never arrived, but the gateway still closes after the
    // initial stream plus MAX_CONTINUATIONS follow-ups.
    assert_eq!(delta_contents(&lines), ["a", "b", "c", "d"]);
    assert_eq!(lines.last().unwrap(), "[DONE]");
    assert_eq!(gateway.upstream.stream_requests().len(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limited_stream_open_swaps_credentials() {
    let gateway = spawn_gateway(2).await;

    gateway.upstream.queue_stream_error(429, "wait 5 seconds");
    gateway.upstream.queue_stream_chunks(vec![final_chunk("ok[done]", 1)]);

    let response = gateway
        .client
        .post("/v1/chat/completions", &streaming_request("hello"))
        .await
        .unwrap();

    let body = response.text().await.unwrap();
    let lines = sse_data_lines(&body);

    assert_eq!(delta_contents(&lines), ["ok"]);
    assert_eq!(lines.last().unwrap(), "[DONE]");

    assert_eq!(gateway.upstream.stream_requests().len(), 2);

    let metrics: Value = gateway.client.get("/metrics").await.json().await.unwrap();
    let credentials = metrics["credentials"].as_array().unwrap();

    let errors: u64 = credentials.iter().map(|entry| entry["error_count"].as_u64().unwrap()).sum();
    assert_eq!(errors, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_stream_error_is_a_single_sse_event() {
    let gateway = spawn_gateway(1).await;

    gateway.upstream.queue_stream_error(403, "forbidden");

    let response = gateway
        .client
        .post("/v1/chat/completions", &streaming_request("hello"))
        .await
        .unwrap();

    // The SSE response is already committed; the failure arrives as a single
    // error event and the stream closes without the sentinel.
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    let lines = sse_data_lines(&body);

    assert_eq!(lines.len(), 1);

    let event: Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(event["error"]["code"], 403);
    assert_eq!(event["error"]["type"], "gateway_error");
    assert_eq!(event["error"]["message"], "forbidden");
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_usage_uses_the_last_reported_token_count() {
    let gateway = spawn_gateway(1).await;

    gateway.upstream.queue_stream_chunks(vec![
        text_chunk("The "),
        final_chunk("answer[done]", 9),
    ]);

    let response = gateway
        .client
        .post("/v1/chat/completions", &streaming_request("what is the answer?"))
        .await
        .unwrap();

    response.text().await.unwrap();

    let metrics: Value = gateway.client.get("/metrics").await.json().await.unwrap();
    let global = &metrics["tokens"]["global"];

    // "what is the answer?" is 19 bytes, estimating to 4 input tokens.
    assert_eq!(global["input_tokens"], 4);
    assert_eq!(global["output_tokens"], 9);
    assert_eq!(global["requests"], 1);
}
