use std::fmt;
use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use directories::BaseDirs;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{AuthSettings, Endpoints};
use crate::error::SyncError;

/// CMR session token. Debug output never shows the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Issues and invalidates the token shared by one run.
pub trait TokenService: Send + Sync {
    fn acquire(&self) -> Result<Token, SyncError>;
    fn revoke(&self, token: &Token) -> Result<(), SyncError>;
}

#[derive(Clone)]
pub struct CmrTokenClient {
    client: Client,
    token_url: String,
    credentials: Credentials,
    client_id: String,
    client_ip: String,
}

impl CmrTokenClient {
    pub fn new(
        endpoints: &Endpoints,
        settings: &AuthSettings,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("earthdata-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::TokenHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::TokenHttp(err.to_string()))?;
        let client_ip = settings
            .client_ip
            .clone()
            .unwrap_or_else(|| local_ip_address().to_string());
        Ok(Self {
            client,
            token_url: endpoints.token_url(),
            credentials,
            client_id: settings.client_id.clone(),
            client_ip,
        })
    }
}

impl TokenService for CmrTokenClient {
    fn acquire(&self) -> Result<Token, SyncError> {
        let body = token_request_body(&self.credentials, &self.client_id, &self.client_ip);
        debug!(url = %self.token_url, client_id = %self.client_id, "requesting CMR token");
        let response = self
            .client
            .post(&self.token_url)
            .header(CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .map_err(|err| SyncError::TokenHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "token request failed".to_string());
            return Err(SyncError::TokenStatus { status, message });
        }
        let text = response
            .text()
            .map_err(|err| SyncError::TokenHttp(err.to_string()))?;
        let token = parse_token_response(&text)?;
        info!("CMR token issued");
        Ok(token)
    }

    fn revoke(&self, token: &Token) -> Result<(), SyncError> {
        let url = format!("{}/{}", self.token_url, token.as_str());
        let response = self
            .client
            .delete(&url)
            .header(CONTENT_TYPE, "application/xml")
            .send()
            .map_err(|err| SyncError::TokenHttp(err.to_string()))?;
        let status = response.status();
        if status != StatusCode::NO_CONTENT && !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "token delete failed".to_string());
            return Err(SyncError::TokenStatus {
                status: status.as_u16(),
                message,
            });
        }
        info!("CMR token deleted");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    id: String,
}

pub fn parse_token_response(text: &str) -> Result<Token, SyncError> {
    let envelope: TokenEnvelope =
        serde_json::from_str(text).map_err(|err| SyncError::TokenResponse(err.to_string()))?;
    if envelope.token.id.trim().is_empty() {
        return Err(SyncError::TokenResponse("empty token id".to_string()));
    }
    Ok(Token::new(envelope.token.id.trim()))
}

pub fn token_request_body(credentials: &Credentials, client_id: &str, client_ip: &str) -> String {
    format!(
        "<?xml version='1.0' encoding='utf-8'?>\
         <token><username>{}</username><password>{}</password>\
         <client_id>{}</client_id><user_ip_address>{}</user_ip_address></token>",
        xml_escape(&credentials.username),
        xml_escape(&credentials.password),
        xml_escape(client_id),
        xml_escape(client_ip),
    )
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Address reported to the token endpoint as the client identifier.
/// Resolved from the host name once per process.
pub fn local_ip_address() -> IpAddr {
    static LOCAL_IP: OnceLock<IpAddr> = OnceLock::new();
    *LOCAL_IP.get_or_init(|| {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let resolved = (hostname.as_str(), 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.find(|addr| addr.is_ipv4()).map(|addr| addr.ip()));
        match resolved {
            Some(ip) => ip,
            None => {
                warn!(%hostname, "could not resolve host name, reporting loopback address");
                IpAddr::from([127, 0, 0, 1])
            }
        }
    })
}

/// Looks up Earthdata Login credentials for `host`: netrc first, then an
/// interactive prompt when allowed and stdin is a terminal.
pub fn resolve_credentials(settings: &AuthSettings, host: &str) -> Result<Credentials, SyncError> {
    let netrc_path = settings.netrc.clone().or_else(default_netrc_path);
    if let Some(path) = &netrc_path {
        match read_netrc(path, host) {
            Ok(Some(credentials)) => {
                debug!(path = %path.display(), host, "using netrc credentials");
                return Ok(credentials);
            }
            Ok(None) => warn!(path = %path.display(), host, "no netrc entry for login host"),
            Err(err) => warn!(path = %path.display(), "netrc not usable: {err}"),
        }
    }

    if settings.prompt && io::stdin().is_terminal() {
        return prompt_credentials(host)
            .map_err(|err| SyncError::MissingCredentials(format!("prompt failed: {err}")));
    }

    Err(SyncError::MissingCredentials(format!(
        "no netrc entry for {host} and interactive prompt unavailable"
    )))
}

fn default_netrc_path() -> Option<PathBuf> {
    if let Some(value) = std::env::var_os("NETRC") {
        if !value.is_empty() {
            return Some(PathBuf::from(value));
        }
    }
    let home = BaseDirs::new()?.home_dir().to_path_buf();
    let name = if cfg!(windows) { "_netrc" } else { ".netrc" };
    Some(home.join(name))
}

fn read_netrc(path: &Path, host: &str) -> io::Result<Option<Credentials>> {
    let content = fs::read_to_string(path)?;
    Ok(lookup_netrc(&content, host))
}

/// Finds the `machine <host>` entry of a netrc document, falling back to `default`.
pub fn lookup_netrc(content: &str, host: &str) -> Option<Credentials> {
    #[derive(Default)]
    struct Entry {
        machine: Option<String>,
        login: Option<String>,
        password: Option<String>,
    }

    let mut entries: Vec<Entry> = Vec::new();
    let mut lines = content.lines();
    let mut tokens: Vec<&str> = Vec::new();
    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if line.starts_with("macdef") {
            // Macro bodies run until the next blank line.
            for body in lines.by_ref() {
                if body.trim().is_empty() {
                    break;
                }
            }
            continue;
        }
        tokens.extend(line.split_whitespace());
    }

    let mut iter = tokens.into_iter();
    while let Some(token) = iter.next() {
        match token {
            "machine" => entries.push(Entry {
                machine: iter.next().map(str::to_string),
                ..Entry::default()
            }),
            "default" => entries.push(Entry::default()),
            "login" => {
                if let Some(entry) = entries.last_mut() {
                    entry.login = iter.next().map(str::to_string);
                }
            }
            "password" => {
                if let Some(entry) = entries.last_mut() {
                    entry.password = iter.next().map(str::to_string);
                }
            }
            "account" => {
                iter.next();
            }
            _ => {}
        }
    }

    let to_credentials = |entry: &Entry| match (&entry.login, &entry.password) {
        (Some(username), Some(password)) => Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => None,
    };

    entries
        .iter()
        .find(|entry| entry.machine.as_deref() == Some(host))
        .and_then(to_credentials)
        .or_else(|| {
            entries
                .iter()
                .find(|entry| entry.machine.is_none())
                .and_then(to_credentials)
        })
}

fn prompt_credentials(host: &str) -> io::Result<Credentials> {
    let mut stderr = io::stderr();
    writeln!(
        stderr,
        "Please provide your Earthdata Login credentials; they are only sent to {host}"
    )?;
    write!(stderr, "Username: ")?;
    stderr.flush()?;
    let mut username = String::new();
    io::stdin().lock().read_line(&mut username)?;
    write!(stderr, "Password: ")?;
    stderr.flush()?;
    let password = read_hidden_line();
    writeln!(stderr)?;
    Ok(Credentials {
        username: username.trim().to_string(),
        password: password?,
    })
}

fn read_hidden_line() -> io::Result<String> {
    enable_raw_mode()?;
    let result = read_keys_until_enter();
    disable_raw_mode()?;
    result
}

fn read_keys_until_enter() -> io::Result<String> {
    let mut line = String::new();
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(line),
            KeyCode::Backspace => {
                line.pop();
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
            }
            KeyCode::Char(ch) => line.push(ch),
            KeyCode::Esc => return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled")),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const NETRC: &str = "\
# personal credentials
machine uat.urs.earthdata.nasa.gov login uat_user password uat_pass
machine urs.earthdata.nasa.gov
    login ops_user
    password ops_pass

macdef init
machine urs.earthdata.nasa.gov login macro_user password macro_pass

default login anon password guest
";

    #[test]
    fn netrc_matches_machine() {
        let creds = lookup_netrc(NETRC, "urs.earthdata.nasa.gov").unwrap();
        assert_eq!(creds.username, "ops_user");
        assert_eq!(creds.password, "ops_pass");

        let uat = lookup_netrc(NETRC, "uat.urs.earthdata.nasa.gov").unwrap();
        assert_eq!(uat.username, "uat_user");
    }

    #[test]
    fn netrc_falls_back_to_default() {
        let creds = lookup_netrc(NETRC, "example.org").unwrap();
        assert_eq!(creds.username, "anon");
    }

    #[test]
    fn netrc_without_match_is_none() {
        let content = "machine other.host login a password b\n";
        assert!(lookup_netrc(content, "urs.earthdata.nasa.gov").is_none());
    }

    #[test]
    fn token_body_escapes_values() {
        let creds = Credentials {
            username: "jane".to_string(),
            password: "p<&>ss".to_string(),
        };
        let body = token_request_body(&creds, "Sentinel-6MF", "10.0.0.5");
        assert!(body.contains("<username>jane</username>"));
        assert!(body.contains("<password>p&lt;&amp;&gt;ss</password>"));
        assert!(body.contains("<client_id>Sentinel-6MF</client_id>"));
        assert!(body.contains("<user_ip_address>10.0.0.5</user_ip_address>"));
    }

    #[test]
    fn token_response_parsing() {
        let token =
            parse_token_response(r#"{"token":{"id":"75E5CEBE-6BBB","username":"jane"}}"#).unwrap();
        assert_eq!(token.as_str(), "75E5CEBE-6BBB");

        assert_matches!(
            parse_token_response(r#"{"errors":["bad credentials"]}"#),
            Err(SyncError::TokenResponse(_))
        );
    }

    #[test]
    fn secrets_are_hidden_from_debug() {
        let creds = Credentials {
            username: "jane".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
        assert_eq!(format!("{:?}", Token::new("abc")), "Token(***)");
    }
}
