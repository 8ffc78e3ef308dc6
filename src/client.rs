//! The HTTPS object client: pooled connections, basic auth, and the
//! retry-until-cancelled policy for transient trouble.
//!
//! Each worker thread holds its own clone; clones share the connection pool
//! but block independently on their own sockets.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::prelude::*;
use tracing::*;

use crate::error::{Error, Result};
use crate::hashing::ObjectId;
use crate::object::CHUNK_SIZE;
use crate::store::{HistoryEntry, ObjectStore};

/// Delay between retries of a transient failure.
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct HttpStore {
    agent: ureq::Agent,
    base: String,
    history_path: String,
    auth: String,
    cancel: Arc<AtomicBool>,
}

impl HttpStore {
    /// `host` may be a bare hostname (TLS assumed) or a full URL.
    /// `aname`/`apass` is the device credential from provisioning.
    pub fn new(
        host: &str,
        device_name: &str,
        user: Option<&str>,
        aname: &str,
        apass: &str,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let base = if host.contains("://") {
            host.trim_end_matches('/').to_owned()
        } else {
            format!("https://{host}")
        };
        let history_path = match user {
            Some(u) => format!(
                "/users/{}/devices/{}/history",
                urlencode(u),
                urlencode(device_name)
            ),
            None => format!("/devices/{}/history", urlencode(device_name)),
        };
        let auth = format!(
            "Basic {}",
            BASE64_STANDARD.encode(format!("{aname}:{apass}"))
        );
        Self {
            agent: ureq::agent(),
            base,
            history_path,
            auth,
            cancel,
        }
    }

    fn object_url(&self, id: &ObjectId) -> String {
        format!("{}/object/{}", self.base, id)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run a request until it produces a terminal status. Transport errors,
    /// TLS trouble, and 5xx all sleep a second and try again until the
    /// surrounding run is cancelled; 401/403 give up immediately.
    fn execute<F>(&self, mut req: F) -> Result<ureq::Response>
    where
        F: FnMut() -> std::result::Result<ureq::Response, ureq::Error>,
    {
        loop {
            if self.cancelled() {
                return Err(Error::Cancelled);
            }
            match req() {
                Ok(resp) => return Ok(resp),
                Err(ureq::Error::Status(code, resp)) => match code {
                    401 | 403 => return Err(Error::Permission(code)),
                    c if c >= 500 => info!("Back end error: HTTP {c}"),
                    // 4xx are terminal; the caller decides what they mean.
                    _ => return Ok(resp),
                },
                Err(ureq::Error::Transport(t)) => info!("Back end error: {t}"),
            }
            std::thread::sleep(RETRY_DELAY);
        }
    }
}

impl ObjectStore for HttpStore {
    fn test_object(&self, id: &ObjectId) -> Result<bool> {
        let url = self.object_url(id);
        loop {
            let resp = self.execute(|| {
                self.agent
                    .head(&url)
                    .set("authorization", &self.auth)
                    .call()
            })?;
            match resp.status() {
                204 => return Ok(true),
                404 => return Ok(false),
                s => {
                    // Unexpected but not fatal; ask again.
                    info!("Verify object got unexpected reply: HTTP {s}");
                    if self.cancelled() {
                        return Err(Error::Cancelled);
                    }
                    std::thread::sleep(RETRY_DELAY);
                }
            }
        }
    }

    fn upload_object(&self, bytes: &[u8]) -> Result<()> {
        let url = self.object_url(&ObjectId::hash(bytes));
        loop {
            let resp = self.execute(|| {
                self.agent
                    .post(&url)
                    .set("authorization", &self.auth)
                    .set("content-type", "application/octet-stream")
                    .send_bytes(bytes)
            })?;
            match resp.status() {
                201 => return Ok(()),
                s => {
                    info!("Unable to upload object - server said HTTP {s}");
                    if self.cancelled() {
                        return Err(Error::Cancelled);
                    }
                    std::thread::sleep(RETRY_DELAY);
                }
            }
        }
    }

    fn fetch_object(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let url = self.object_url(id);
        let resp = self.execute(|| {
            self.agent
                .get(&url)
                .set("authorization", &self.auth)
                .call()
        })?;
        if resp.status() != 200 {
            return Err(Error::NotFound);
        }
        let mut body = Vec::new();
        resp.into_reader()
            .take(CHUNK_SIZE as u64 + 1)
            .read_to_end(&mut body)
            .map_err(|e| Error::Transient(format!("reading object body: {e}")))?;
        if body.len() > CHUNK_SIZE {
            return Err(Error::Malformed("object larger than the chunk limit".into()));
        }
        Ok(body)
    }

    fn commit_history(&self, entry: &HistoryEntry) -> Result<()> {
        let url = format!("{}{}", self.base, self.history_path);
        let body = format!(
            "<backup>\n  <tstamp>{}</tstamp>\n  <root>{}</root>\n  <type>{}</type>\n</backup>\n",
            entry.tstamp.format("%Y-%m-%dT%H:%M:%SZ"),
            entry.root,
            entry.kind.as_char(),
        );
        let resp = self.execute(|| {
            self.agent
                .post(&url)
                .set("authorization", &self.auth)
                .set("content-type", "application/xml")
                .send_string(&body)
        })?;
        match resp.status() {
            201 => {
                debug!("Successfully uploaded new root");
                Ok(())
            }
            // The uploaded objects stay reachable from the root either way.
            s => {
                warn!("New root error: HTTP {s}");
                Ok(())
            }
        }
    }
}

/// Percent-encode everything outside the unreserved set.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            b => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::thread;

    use chrono::TimeZone;

    use crate::store::SnapshotKind;

    /// A tiny one-request-per-connection HTTP responder. Each canned
    /// response is served in order with `connection: close`, and the raw
    /// request head + body are captured for assertions.
    fn stub_server(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        thread::spawn(move || {
            for response in responses {
                let (mut sock, _) = listener.accept().unwrap();
                let mut req = Vec::new();
                let mut buf = [0u8; 4096];
                let (mut head_len, mut body_len) = (None, 0usize);
                loop {
                    let n = sock.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    req.extend_from_slice(&buf[..n]);
                    if head_len.is_none() {
                        if let Some(pos) = req.windows(4).position(|w| w == b"\r\n\r\n") {
                            head_len = Some(pos + 4);
                            let head = String::from_utf8_lossy(&req[..pos]).to_lowercase();
                            body_len = head
                                .lines()
                                .find_map(|l| l.strip_prefix("content-length:"))
                                .and_then(|v| v.trim().parse().ok())
                                .unwrap_or(0);
                        }
                    }
                    if let Some(h) = head_len {
                        if req.len() >= h + body_len {
                            break;
                        }
                    }
                }
                seen2.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&req).into_owned());
                sock.write_all(response.as_bytes()).unwrap();
            }
        });
        (format!("http://{addr}"), seen)
    }

    fn no_content() -> String {
        "HTTP/1.1 204 No Content\r\nconnection: close\r\ncontent-length: 0\r\n\r\n".to_owned()
    }

    fn status(code: u16, reason: &str) -> String {
        format!(
            "HTTP/1.1 {code} {reason}\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
        )
    }

    fn client(base: &str) -> HttpStore {
        HttpStore::new(
            base,
            "test device",
            None,
            "aname",
            "apass",
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn head_semantics() -> Result<()> {
        let (base, seen) = stub_server(vec![no_content(), status(404, "Not Found")]);
        let store = client(&base);
        let id = ObjectId::hash(b"whatever");
        assert!(store.test_object(&id)?);
        assert!(!store.test_object(&id)?);

        let seen = seen.lock().unwrap();
        assert!(seen[0].starts_with(&format!("HEAD /object/{id} ")));
        assert!(seen[0].to_lowercase().contains("authorization: basic "));
        Ok(())
    }

    #[test]
    fn upload_posts_under_the_hash() -> Result<()> {
        let (base, seen) = stub_server(vec![status(201, "Created")]);
        let store = client(&base);
        store.upload_object(b"some bytes")?;

        let seen = seen.lock().unwrap();
        let id = ObjectId::hash(b"some bytes");
        assert!(seen[0].starts_with(&format!("POST /object/{id} ")));
        assert!(seen[0].ends_with("some bytes"));
        Ok(())
    }

    #[test]
    fn transient_errors_retry() -> Result<()> {
        let (base, seen) = stub_server(vec![status(500, "Oops"), no_content()]);
        let store = client(&base);
        assert!(store.test_object(&ObjectId::hash(b"x"))?);
        assert_eq!(seen.lock().unwrap().len(), 2);
        Ok(())
    }

    #[test]
    fn bad_credentials_give_up() {
        let (base, _seen) = stub_server(vec![status(401, "Unauthorized")]);
        let store = client(&base);
        assert!(matches!(
            store.test_object(&ObjectId::hash(b"x")),
            Err(Error::Permission(401))
        ));
    }

    #[test]
    fn cancellation_stops_retries() {
        let cancel = Arc::new(AtomicBool::new(true));
        // No server at all; the transport error would retry forever.
        let store = HttpStore::new(
            "http://127.0.0.1:1",
            "dev",
            None,
            "a",
            "b",
            cancel,
        );
        assert!(matches!(
            store.test_object(&ObjectId::hash(b"x")),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn history_body_is_well_formed() -> Result<()> {
        let (base, seen) = stub_server(vec![status(201, "Created")]);
        let store = client(&base);
        let root = ObjectId::hash(b"device root");
        store.commit_history(&HistoryEntry {
            tstamp: chrono::Utc.with_ymd_and_hms(2013, 10, 15, 7, 48, 35).unwrap(),
            root,
            kind: SnapshotKind::Complete,
        })?;

        let seen = seen.lock().unwrap();
        assert!(seen[0].starts_with("POST /devices/test%20device/history "));
        assert!(seen[0].contains("<tstamp>2013-10-15T07:48:35Z</tstamp>"));
        assert!(seen[0].contains(&format!("<root>{root}</root>")));
        assert!(seen[0].contains("<type>c</type>"));
        Ok(())
    }
}
