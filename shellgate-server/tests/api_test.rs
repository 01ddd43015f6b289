use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shellgate_core::ShellgateConfig;
use shellgate_server::{router, AppState};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

async fn spawn_server(config: ShellgateConfig) -> (String, AppState) {
    let state = AppState::new(&config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("http://{}", addr), state)
}

fn test_config() -> ShellgateConfig {
    let mut config = ShellgateConfig::default();
    config.terminal.default_shell = Some("/bin/sh".to_string());
    config.terminal.default_cwd = Some(std::env::temp_dir().to_string_lossy().into_owned());
    config.helper.binary = "/nonexistent/shellgate-test-helper".to_string();
    config
}

mod session_api_tests {
    use super::*;

    #[tokio::test]
    async fn test_status() {
        let (base, _state) = spawn_server(test_config()).await;
        let body: Value = reqwest::get(format!("{}/api/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_create_list_close() {
        let (base, state) = spawn_server(test_config()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/terminal/sessions", base))
            .json(&json!({ "cols": 100, "rows": 30 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let created: Value = response.json().await.unwrap();
        let session_id = created["sessionId"].as_str().unwrap().to_string();

        let listed: Value = client
            .get(format!("{}/api/terminal/sessions", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let sessions = listed.as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["id"], session_id.as_str());
        assert_eq!(sessions[0]["cols"], 100);
        assert_eq!(sessions[0]["connected"], false);

        let closed: Value = client
            .post(format!("{}/api/terminal/sessions/close", base))
            .json(&json!({ "sessionId": session_id }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(closed["success"], true);
        assert!(state.pty.is_empty());

        let again = client
            .post(format!("{}/api/terminal/sessions/close", base))
            .json(&json!({ "sessionId": session_id }))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), 404);
        let body: Value = again.json().await.unwrap();
        assert_eq!(body["code"], "E1001");
    }

    #[tokio::test]
    async fn test_invalid_geometry() {
        let (base, state) = spawn_server(test_config()).await;
        let response = reqwest::Client::new()
            .post(format!("{}/api/terminal/sessions", base))
            .json(&json!({ "cols": 0 }))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], "E9001");
        assert!(state.pty.is_empty());
    }

    #[tokio::test]
    async fn test_session_limit() {
        let mut config = test_config();
        config.terminal.max_sessions = 1;
        let (base, state) = spawn_server(config).await;
        let client = reqwest::Client::new();
        let url = format!("{}/api/terminal/sessions", base);

        let first = client.post(&url).json(&json!({})).send().await.unwrap();
        assert_eq!(first.status(), 200);
        let second = client.post(&url).json(&json!({})).send().await.unwrap();
        assert_eq!(second.status(), 429);

        state.pty.shutdown();
    }

    #[tokio::test]
    async fn test_socket_for_unknown_session() {
        let (base, _state) = spawn_server(test_config()).await;
        let response = reqwest::get(format!("{}/api/terminal/sessions/missing/ws", base))
            .await
            .unwrap();
        assert_ne!(response.status(), 200);
    }
}

mod socket_tests {
    use super::*;

    async fn open_socket(base: &str, session_id: &str) -> Socket {
        let url = format!(
            "{}/api/terminal/sessions/{}/ws",
            base.replacen("http", "ws", 1),
            session_id
        );
        let (socket, _) = connect_async(url).await.unwrap();
        socket
    }

    /// Next text frame as JSON, or None once the socket closes.
    async fn next_json(socket: &mut Socket) -> Option<Value> {
        loop {
            match timeout(WAIT, socket.next()).await.ok()?? {
                Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Skip frames until one has the given `type`.
    async fn wait_for_type(socket: &mut Socket, kind: &str) -> Option<Value> {
        while let Some(frame) = next_json(socket).await {
            if frame["type"] == kind {
                return Some(frame);
            }
        }
        None
    }

    async fn read_output_until(socket: &mut Socket, needle: &str) -> String {
        let mut seen = String::new();
        while let Some(frame) = next_json(socket).await {
            if frame["type"] == "output" {
                seen.push_str(frame["data"].as_str().unwrap_or_default());
                if seen.contains(needle) {
                    break;
                }
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_socket_session_round_trip() {
        let (base, state) = spawn_server(test_config()).await;
        let session_id = state.pty.create_with(Default::default()).unwrap();
        let mut socket = open_socket(&base, &session_id).await;

        let connected = next_json(&mut socket).await.unwrap();
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["sessionId"], session_id.as_str());

        socket
            .send(Message::Text(
                json!({ "type": "input", "data": "echo socket-$((20 + 1))\n" })
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
        let output = read_output_until(&mut socket, "socket-21").await;
        assert!(output.contains("socket-21"), "output was: {:?}", output);

        socket
            .send(Message::Text(r#"{"type":"ping"}"#.to_string().into()))
            .await
            .unwrap();
        assert!(wait_for_type(&mut socket, "pong").await.is_some());

        socket
            .send(Message::Binary(b"echo binary-$((3 * 3))\n".to_vec().into()))
            .await
            .unwrap();
        let output = read_output_until(&mut socket, "binary-9").await;
        assert!(output.contains("binary-9"), "output was: {:?}", output);

        state.pty.shutdown();
    }

    #[tokio::test]
    async fn test_second_socket_takes_over() {
        let (base, state) = spawn_server(test_config()).await;
        let session_id = state.pty.create_with(Default::default()).unwrap();

        let mut first = open_socket(&base, &session_id).await;
        assert_eq!(next_json(&mut first).await.unwrap()["type"], "connected");

        let mut second = open_socket(&base, &session_id).await;
        assert_eq!(next_json(&mut second).await.unwrap()["type"], "connected");

        // The first socket is closed by the server.
        assert!(wait_for_type(&mut first, "connected").await.is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let sessions = state.pty.list();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].connected);

        second
            .send(Message::Text(r#"{"type":"ping"}"#.to_string().into()))
            .await
            .unwrap();
        assert!(wait_for_type(&mut second, "pong").await.is_some());

        state.pty.shutdown();
    }

    #[tokio::test]
    async fn test_socket_sees_exit() {
        let (base, state) = spawn_server(test_config()).await;
        let session_id = state.pty.create_with(Default::default()).unwrap();
        let mut socket = open_socket(&base, &session_id).await;
        assert_eq!(next_json(&mut socket).await.unwrap()["type"], "connected");

        socket
            .send(Message::Text(
                json!({ "type": "input", "data": "exit 4\n" }).to_string().into(),
            ))
            .await
            .unwrap();

        let exit = wait_for_type(&mut socket, "exit").await.unwrap();
        assert_eq!(exit["code"], 4);
        assert!(next_json(&mut socket).await.is_none());
    }
}

mod helper_api_tests {
    use super::*;

    #[tokio::test]
    async fn test_helper_status_when_missing() {
        let (base, _state) = spawn_server(test_config()).await;
        let body: Value = reqwest::get(format!("{}/api/terminal/helper", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["installed"], false);
        assert_eq!(body["sessions"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_create_helper_when_missing() {
        let (base, _state) = spawn_server(test_config()).await;
        let response = reqwest::Client::new()
            .post(format!("{}/api/terminal/helper", base))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 503);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], "E2001");
    }

    #[tokio::test]
    async fn test_stop_unknown_helper() {
        let (base, _state) = spawn_server(test_config()).await;
        let body: Value = reqwest::Client::new()
            .post(format!("{}/api/terminal/helper/stop", base))
            .json(&json!({ "port": 7681 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["success"], true);
    }
}

mod auth_tests {
    use super::*;

    fn secured_config() -> ShellgateConfig {
        let mut config = test_config();
        config.server.auth_token = Some("s3cret".to_string());
        config
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let (base, _state) = spawn_server(secured_config()).await;
        let response = reqwest::get(format!("{}/api/status", base)).await.unwrap();

        assert_eq!(response.status(), 401);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_bearer_token() {
        let (base, _state) = spawn_server(secured_config()).await;
        let client = reqwest::Client::new();

        let wrong = client
            .get(format!("{}/api/status", base))
            .bearer_auth("nope")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401);

        let right = client
            .get(format!("{}/api/status", base))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(right.status(), 200);
    }

    #[tokio::test]
    async fn test_query_token() {
        let (base, _state) = spawn_server(secured_config()).await;
        let response = reqwest::get(format!("{}/api/status?token=s3cret", base))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_query_token_with_reserved_characters() {
        let mut config = test_config();
        config.server.auth_token = Some("a&b=c d+e".to_string());
        let (base, _state) = spawn_server(config).await;

        let encoded = reqwest::get(format!("{}/api/status?token=a%26b%3Dc%20d%2Be", base))
            .await
            .unwrap();
        assert_eq!(encoded.status(), 200);

        let raw = reqwest::get(format!("{}/api/status?token=a&b=c d+e", base))
            .await
            .unwrap();
        assert_eq!(raw.status(), 401);
    }
}
