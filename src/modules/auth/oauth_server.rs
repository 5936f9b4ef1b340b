use std::process::Command;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::error::{AppError, AppResult};

fn oauth_success_html() -> &'static str {
    "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n\
    <html>\
    <body style='font-family: sans-serif; text-align: center; padding: 50px;'>\
    <h1 style='color: green;'>Authorization Successful</h1>\
    <p>You can close this window and return to the terminal.</p>\
    <script>setTimeout(function() { window.close(); }, 2000);</script>\
    </body>\
    </html>"
}

fn oauth_fail_html() -> &'static str {
    "HTTP/1.1 400 Bad Request\r\nContent-Type: text/html; charset=utf-8\r\n\r\n\
    <html>\
    <body style='font-family: sans-serif; text-align: center; padding: 50px;'>\
    <h1 style='color: red;'>Authorization Failed</h1>\
    <p>No authorization code was received. Return to the terminal and try again.</p>\
    </body>\
    </html>"
}

pub fn open_browser_url(url: &str) -> AppResult<()> {
    #[cfg(target_os = "windows")]
    {
        Command::new("cmd")
            .args(["/C", "start", "", url])
            .spawn()
            .map_err(|e| AppError::Config(format!("failed_to_open_browser: {}", e)))?;
        return Ok(());
    }

    #[cfg(target_os = "macos")]
    {
        Command::new("open")
            .arg(url)
            .spawn()
            .map_err(|e| AppError::Config(format!("failed_to_open_browser: {}", e)))?;
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        Command::new("xdg-open")
            .arg(url)
            .spawn()
            .map_err(|e| AppError::Config(format!("failed_to_open_browser: {}", e)))?;
        return Ok(());
    }

    #[allow(unreachable_code)]
    Err(AppError::Config(
        "unsupported_platform_for_auto_browser_open".to_string(),
    ))
}

// Code and state extracted from the first matching redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectOutcome {
    pub code: String,
    pub state: Option<String>,
}

// One-shot loopback redirect listener on an ephemeral local port. The accept
// task owns the socket; the watch channel tears it down on every exit path,
// including drop.
pub struct LoopbackListener {
    redirect_uri: String,
    code_rx: mpsc::Receiver<Result<RedirectOutcome, String>>,
    cancel_tx: watch::Sender<bool>,
}

impl LoopbackListener {
    pub async fn bind() -> AppResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{}/oauth/callback", port);

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (code_tx, code_rx) = mpsc::channel::<Result<RedirectOutcome, String>>(1);

        tokio::spawn(async move {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = cancel_rx.changed() => return,
            };
            let Ok((mut stream, _)) = accepted else {
                let _ = code_tx
                    .send(Err("failed_to_accept_oauth_callback_connection".to_string()))
                    .await;
                return;
            };

            let mut buffer = [0u8; 4096];
            let bytes_read = stream.read(&mut buffer).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buffer[..bytes_read]);
            let outcome = parse_redirect_request(&request);

            let (result, response_html) = match outcome {
                Some(outcome) => {
                    tracing::info!("Captured OAuth code from loopback listener");
                    (Ok(outcome), oauth_success_html())
                }
                None => {
                    if bytes_read > 0 {
                        tracing::error!(
                            "OAuth callback carried no authorization code. Raw request (first 256 bytes): {}",
                            &request.chars().take(256).collect::<String>()
                        );
                    }
                    (
                        Err("no authorization code in callback".to_string()),
                        oauth_fail_html(),
                    )
                }
            };

            let _ = stream.write_all(response_html.as_bytes()).await;
            let _ = stream.flush().await;
            let _ = code_tx.send(result).await;
        });

        Ok(Self {
            redirect_uri,
            code_rx,
            cancel_tx,
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub async fn wait_for_redirect(&mut self) -> AppResult<RedirectOutcome> {
        match self.code_rx.recv().await {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(e)) => Err(AppError::OAuth(e)),
            None => Err(AppError::OAuth(
                "OAuth callback channel closed unexpectedly".to_string(),
            )),
        }
    }

    pub fn close(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
    }
}

// First request line of the redirect, e.g.
// `GET /oauth/callback?code=...&state=... HTTP/1.1`.
fn parse_redirect_request(request: &str) -> Option<RedirectOutcome> {
    let path = request.lines().next().and_then(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            Some(parts[1])
        } else {
            None
        }
    })?;
    let url = Url::parse(&format!("http://localhost{}", path)).ok()?;

    let mut code = None;
    let mut state = None;
    for (k, v) in url.query_pairs() {
        if k == "code" {
            code = Some(v.to_string());
        } else if k == "state" {
            state = Some(v.to_string());
        }
    }
    code.map(|code| RedirectOutcome { code, state })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_request_parsing_extracts_code_and_state() {
        let request = "GET /oauth/callback?code=4%2FABC&state=xyz HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n";
        let outcome = parse_redirect_request(request).unwrap();
        assert_eq!(outcome.code, "4/ABC");
        assert_eq!(outcome.state.as_deref(), Some("xyz"));
    }

    #[test]
    fn redirect_without_code_is_rejected() {
        let request = "GET /oauth/callback?error=access_denied HTTP/1.1\r\n\r\n";
        assert!(parse_redirect_request(request).is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn listener_resolves_on_first_matching_redirect() {
        let mut listener = LoopbackListener::bind().await.expect("bind listener");
        let uri = listener.redirect_uri().to_string();
        assert!(uri.starts_with("http://127.0.0.1:"));

        let port: u16 = uri
            .trim_start_matches("http://127.0.0.1:")
            .split('/')
            .next()
            .unwrap()
            .parse()
            .unwrap();

        tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .expect("connect to loopback listener");
            stream
                .write_all(b"GET /oauth/callback?code=abc123&state=st HTTP/1.1\r\n\r\n")
                .await
                .expect("write redirect");
            let mut response = Vec::new();
            let _ = stream.read_to_end(&mut response).await;
        });

        let outcome = listener.wait_for_redirect().await.expect("redirect");
        assert_eq!(outcome.code, "abc123");
        assert_eq!(outcome.state.as_deref(), Some("st"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn closed_listener_reports_channel_closure() {
        let mut listener = LoopbackListener::bind().await.expect("bind listener");
        listener.close();
        let err = listener.wait_for_redirect().await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
