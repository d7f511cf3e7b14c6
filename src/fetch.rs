use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::app::{EventKind, ProgressEvent, ProgressSink};
use crate::auth::Credentials;
use crate::error::SyncError;

const MAX_REDIRECTS: usize = 10;

/// A URL selected for download together with the allowed extension it matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadCandidate {
    pub url: String,
    pub extension: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub success_count: usize,
    pub failure_count: usize,
    pub failed_urls: Vec<String>,
}

pub trait Downloader: Send + Sync {
    /// Retrieves `url` and stores the body at `destination`, replacing any existing file.
    fn download(&self, url: &str, destination: &Path) -> Result<(), SyncError>;
}

/// Path component of `url` used for extension matching and naming; query and
/// fragment are ignored. Unparseable input is used as is.
fn url_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    }
}

pub fn file_name_for(url: &str) -> Option<String> {
    url_path(url)
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(|name| name.to_string())
}

/// Pairs every URL with every allowed extension its path ends with (case-insensitive).
///
/// A URL matching two extensions yields two candidates and is downloaded twice.
pub fn select_candidates(urls: &[String], extensions: &[String]) -> Vec<DownloadCandidate> {
    let mut candidates = Vec::new();
    for url in urls {
        let path = url_path(url).to_lowercase();
        let matched: Vec<&String> = extensions
            .iter()
            .filter(|ext| path.ends_with(ext.to_lowercase().as_str()))
            .collect();
        if matched.len() > 1 {
            warn!(
                url = %url,
                extensions = ?matched,
                "URL matches several extensions and will be downloaded once per match"
            );
        }
        let Some(file_name) = file_name_for(url) else {
            if !matched.is_empty() {
                warn!(url = %url, "URL has no file name, skipping");
            }
            continue;
        };
        for ext in matched {
            candidates.push(DownloadCandidate {
                url: url.clone(),
                extension: ext.clone(),
                file_name: file_name.clone(),
            });
        }
    }
    candidates
}

/// Downloads every candidate into `destination_dir`, one after another.
/// A failed candidate is counted and reported; the remaining ones still run.
pub fn fetch_all<D: Downloader + ?Sized>(
    downloader: &D,
    candidates: &[DownloadCandidate],
    destination_dir: &Utf8Path,
    sink: &dyn ProgressSink,
) -> FetchOutcome {
    let mut outcome = FetchOutcome::default();
    for candidate in candidates {
        let destination: Utf8PathBuf = destination_dir.join(&candidate.file_name);
        let start = Instant::now();
        match downloader.download(&candidate.url, destination.as_std_path()) {
            Ok(()) => {
                outcome.success_count += 1;
                info!(url = %candidate.url, path = %destination, "downloaded");
                sink.event(ProgressEvent {
                    kind: EventKind::Success,
                    message: candidate.url.clone(),
                    elapsed: Some(start.elapsed()),
                });
            }
            Err(err) => {
                outcome.failure_count += 1;
                outcome.failed_urls.push(candidate.url.clone());
                warn!(url = %candidate.url, "download failed: {err}");
                sink.event(ProgressEvent {
                    kind: EventKind::Failure,
                    message: format!("{} ({err})", candidate.url),
                    elapsed: Some(start.elapsed()),
                });
            }
        }
    }
    outcome
}

/// Blocking HTTP downloader that logs in to Earthdata Login on redirect.
///
/// Redirects are followed here rather than by reqwest so basic credentials
/// are attached only to requests for the login host.
#[derive(Clone)]
pub struct HttpDownloader {
    client: Client,
    login_host: String,
    credentials: Option<Credentials>,
    retries: u32,
}

impl HttpDownloader {
    pub fn new(
        login_host: &str,
        credentials: Option<Credentials>,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self, SyncError> {
        let client = client_builder(timeout)?
            .build()
            .map_err(|err| SyncError::DownloadHttp(err.to_string()))?;
        Ok(Self::with_client(client, login_host, credentials, retries))
    }

    fn with_client(
        client: Client,
        login_host: &str,
        credentials: Option<Credentials>,
        retries: u32,
    ) -> Self {
        Self {
            client,
            login_host: login_host.to_string(),
            credentials,
            retries,
        }
    }

    fn get_following_redirects(
        &self,
        url: &str,
    ) -> Result<reqwest::blocking::Response, SyncError> {
        let mut current =
            Url::parse(url).map_err(|err| SyncError::DownloadHttp(format!("{url}: {err}")))?;
        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(current.clone());
            if let Some(credentials) = &self.credentials
                && current.host_str() == Some(self.login_host.as_str())
            {
                request = request.basic_auth(&credentials.username, Some(&credentials.password));
            }
            let response = self.send_with_retries(request)?;
            if !response.status().is_redirection() {
                return Ok(response);
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| {
                    SyncError::DownloadHttp(format!("redirect without location from {current}"))
                })?;
            current = current.join(location).map_err(|err| {
                SyncError::DownloadHttp(format!("bad redirect {location}: {err}"))
            })?;
        }
        Err(SyncError::DownloadHttp(format!("too many redirects for {url}")))
    }

    fn send_with_retries(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response, SyncError> {
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0u32;
        loop {
            let Some(this_try) = request.try_clone() else {
                return request
                    .send()
                    .map_err(|err| SyncError::DownloadHttp(err.to_string()));
            };
            match this_try.send() {
                Ok(resp) => {
                    if attempt < self.retries && is_retryable_status(resp.status().as_u16()) {
                        attempt += 1;
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * u64::from(attempt)));
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.retries && is_retryable_error(&err) {
                        attempt += 1;
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * u64::from(attempt)));
                        continue;
                    }
                    return Err(SyncError::DownloadHttp(err.to_string()));
                }
            }
        }
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, destination: &Path) -> Result<(), SyncError> {
        let mut response = self.get_following_redirects(url)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "download failed".to_string());
            return Err(SyncError::DownloadStatus { status, message });
        }
        let parent = destination
            .parent()
            .ok_or_else(|| SyncError::Filesystem("invalid destination path".to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".earthdata-sync")
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        io::copy(&mut response, &mut temp)
            .map_err(|err| SyncError::DownloadHttp(format!("{url}: {err}")))?;
        temp.persist(destination)
            .map_err(|err| SyncError::Filesystem(err.error.to_string()))?;
        Ok(())
    }
}

fn client_builder(timeout: Duration) -> Result<reqwest::blocking::ClientBuilder, SyncError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("earthdata-sync/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| SyncError::DownloadHttp(err.to_string()))?,
    );
    Ok(Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .cookie_store(true)
        .redirect(Policy::none()))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;

    use super::*;

    /// Loopback server answering each accepted connection with the next canned response.
    struct TestServer {
        base: String,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl TestServer {
        fn start(responses: Vec<String>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&requests);
            thread::spawn(move || {
                for response in responses {
                    let Ok((mut stream, _)) = listener.accept() else {
                        return;
                    };
                    let request = read_request(&mut stream);
                    seen.lock().unwrap().push(request);
                    let _ = stream.write_all(response.as_bytes());
                }
            });
            Self { base, requests }
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn read_request(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        while !data.windows(4).any(|window| window == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => data.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&data).to_lowercase()
    }

    fn response(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n{extra_headers}\r\n{body}",
            body.len()
        )
    }

    fn redirect(location: &str) -> String {
        response("302 Found", &format!("Location: {location}\r\n"), "")
    }

    fn downloader(login_host: &str, retries: u32) -> HttpDownloader {
        let client = client_builder(Duration::from_secs(5))
            .unwrap()
            .no_proxy()
            .build()
            .unwrap();
        let credentials = Credentials {
            username: "jane".to_string(),
            password: "secret".to_string(),
        };
        HttpDownloader::with_client(client, login_host, Some(credentials), retries)
    }

    fn part_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".part"))
            .collect()
    }

    #[test]
    fn truncated_body_keeps_previous_file() {
        let server = TestServer::start(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\npartial"
                .to_string(),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let destination = temp.path().join("a.nc");
        std::fs::write(&destination, "old").unwrap();

        let result =
            downloader("urs.example", 0).download(&format!("{}/a.nc", server.base), &destination);

        assert_matches!(result, Err(SyncError::DownloadHttp(_)));
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "old");
        assert!(part_files(temp.path()).is_empty());
    }

    #[test]
    fn credentials_only_reach_login_host() {
        let server = TestServer::start(vec![
            redirect("/login"),
            response("200 OK", "", "granule"),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let destination = temp.path().join("a.nc");

        downloader("urs.example", 0)
            .download(&format!("{}/a.nc", server.base), &destination)
            .unwrap();

        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "granule");
        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].starts_with("get /login "));
        assert!(requests.iter().all(|request| !request.contains("authorization:")));
    }

    #[test]
    fn login_host_receives_basic_auth() {
        let server = TestServer::start(vec![response("200 OK", "", "granule")]);
        let temp = tempfile::tempdir().unwrap();
        let destination = temp.path().join("a.nc");

        downloader("127.0.0.1", 0)
            .download(&format!("{}/a.nc", server.base), &destination)
            .unwrap();

        // base64("jane:secret")
        assert!(server.requests()[0].contains("authorization: basic amfuztpzzwnyzxq="));
    }

    #[test]
    fn redirect_loop_is_cut_off() {
        let server = TestServer::start(vec![redirect("/loop"); MAX_REDIRECTS + 1]);
        let temp = tempfile::tempdir().unwrap();
        let destination = temp.path().join("a.nc");

        let result =
            downloader("urs.example", 0).download(&format!("{}/loop", server.base), &destination);

        assert_matches!(
            result,
            Err(SyncError::DownloadHttp(message)) if message.contains("too many redirects")
        );
        assert_eq!(server.requests().len(), MAX_REDIRECTS + 1);
        assert!(!destination.exists());
    }

    #[test]
    fn unavailable_server_is_retried_when_configured() {
        let server = TestServer::start(vec![
            response("503 Service Unavailable", "", "busy"),
            response("200 OK", "", "granule"),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let destination = temp.path().join("a.nc");

        downloader("urs.example", 1)
            .download(&format!("{}/a.nc", server.base), &destination)
            .unwrap();

        assert_eq!(server.requests().len(), 2);
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "granule");
    }

    #[test]
    fn client_errors_are_not_retried() {
        let server = TestServer::start(vec![
            response("404 Not Found", "", "missing"),
            response("200 OK", "", "granule"),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let destination = temp.path().join("a.nc");

        let result =
            downloader("urs.example", 3).download(&format!("{}/a.nc", server.base), &destination);

        assert_matches!(result, Err(SyncError::DownloadStatus { status: 404, .. }));
        assert_eq!(server.requests().len(), 1);
        assert!(!destination.exists());
    }

    fn urls(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn exts(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn extension_match_ignores_case() {
        let candidates = select_candidates(
            &urls(&["https://x/S6A_P4_2__LR_RED.NC"]),
            &exts(&[".nc", ".bin"]),
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].extension, ".nc");
        assert_eq!(candidates[0].file_name, "S6A_P4_2__LR_RED.NC");
    }

    #[test]
    fn unmatched_extensions_are_dropped() {
        let candidates = select_candidates(
            &urls(&["https://x/a.nc.md5", "https://x/a.xml", "https://x/a.bufr.bin"]),
            &exts(&[".nc", ".bin"]),
        );
        let names: Vec<&str> = candidates.iter().map(|c| c.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.bufr.bin"]);
    }

    #[test]
    fn overlapping_extensions_yield_one_candidate_each() {
        let candidates = select_candidates(
            &urls(&["https://x/a.bufr.bin"]),
            &exts(&[".bin", ".bufr.bin"]),
        );
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.file_name == "a.bufr.bin"));
    }

    #[test]
    fn query_string_does_not_hide_extension() {
        let candidates = select_candidates(
            &urls(&["https://x/dir/a.nc?token=abc#frag"]),
            &exts(&[".nc"]),
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].file_name, "a.nc");
    }

    #[test]
    fn file_name_rejects_directory_urls() {
        assert_eq!(file_name_for("https://x/dir/"), None);
        assert_eq!(file_name_for("https://x/dir/a.nc"), Some("a.nc".to_string()));
    }
}
