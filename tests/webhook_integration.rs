use std::time::Duration;

use mailwatch::webhook::{self, WebhookState, WEBHOOK_PATH};
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct RunningWebhook {
    url: String,
    ids: mpsc::Receiver<String>,
    stop: oneshot::Sender<()>,
    server: JoinHandle<anyhow::Result<()>>,
}

async fn start_webhook(client_state: &str) -> RunningWebhook {
    start_webhook_on("127.0.0.1:0", client_state).await
}

async fn start_webhook_on(bind_addr: &str, client_state: &str) -> RunningWebhook {
    let listener = webhook::bind(bind_addr)
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let (tx, ids) = mpsc::channel(16);
    let (stop, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(webhook::serve(
        listener,
        WebhookState::new(client_state.to_string(), tx),
        async move {
            let _ = stop_rx.await;
        },
    ));
    RunningWebhook {
        url: format!("http://{addr}{WEBHOOK_PATH}"),
        ids,
        stop,
        server,
    }
}

impl RunningWebhook {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .expect("server stops within timeout")
            .expect("join server task")
            .expect("server exits cleanly");
    }
}

fn notification(client_state: &str, id: &str) -> serde_json::Value {
    json!({
        "subscriptionId": "sub-1",
        "clientState": client_state,
        "changeType": "created",
        "resource": format!("Users/owner@example.com/Messages/{id}"),
        "resourceData": { "id": id }
    })
}

#[tokio::test]
async fn validation_handshake_echoes_token_over_http() {
    let running = start_webhook("s3cret").await;
    let client = reqwest::Client::new();

    let response = client
        .post(&running.url)
        .query(&[("validationToken", "Validation: Token+1 & more")])
        .send()
        .await
        .expect("send validation request");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .starts_with("text/plain"));
    assert_eq!(
        response.text().await.expect("read body"),
        "Validation: Token+1 & more"
    );

    running.shutdown().await;
}

#[tokio::test]
async fn only_authenticated_notifications_reach_the_processor_queue() {
    let mut running = start_webhook("s3cret").await;
    let client = reqwest::Client::new();

    let response = client
        .post(&running.url)
        .json(&json!({
            "value": [
                notification("s3cret", "AAMk-1"),
                notification("forged", "AAMk-2"),
                notification("s3cret", "AAMk-3"),
            ]
        }))
        .send()
        .await
        .expect("send notifications");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let mut received = Vec::new();
    while let Ok(id) = running.ids.try_recv() {
        received.push(id);
    }
    assert_eq!(received, vec!["AAMk-1".to_string(), "AAMk-3".to_string()]);

    let response = client
        .post(&running.url)
        .body("{not json")
        .send()
        .await
        .expect("send malformed body");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(running.ids.try_recv().is_err());

    running.shutdown().await;
}

#[tokio::test]
async fn listener_binds_by_host_name() {
    let running = start_webhook_on("localhost:0", "s3cret").await;
    let response = reqwest::Client::new()
        .post(&running.url)
        .query(&[("validationToken", "by-name")])
        .send()
        .await
        .expect("send validation request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.expect("read body"), "by-name");

    running.shutdown().await;
}
