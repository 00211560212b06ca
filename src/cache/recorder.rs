//! Tee for one request's output: everything written goes to the real response
//! and into a capture buffer the cache can snapshot afterwards.

use bytes::BytesMut;

use super::entry::CacheEntry;
use crate::http::{Headers, Response, StatusCode};

#[derive(Debug, Default)]
pub struct ResponseRecorder {
    sink: Response,
    status: Option<StatusCode>,
    headers: Headers,
    body: BytesMut,
}

impl ResponseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.sink.set_status(status);
        self.status = Some(status);
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.sink.add_header(name, value);
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.sink.set_header(name, value);
    }

    /// Forwards `chunk` to the sink unchanged and appends it to the capture.
    /// Headers are captured as they stand at this write.
    pub fn write(&mut self, chunk: &[u8]) {
        self.sink.write_body(chunk);
        self.headers = self.sink.headers().clone();
        self.body.extend_from_slice(chunk);
    }

    /// Plays a finished downstream response through the recorder: status,
    /// then headers in order, then the body as a single write.
    pub fn record(&mut self, response: &Response) {
        self.set_status(response.status());
        for (name, value) in response.headers().iter() {
            self.add_header(name, value);
        }
        self.write(response.body_ref());
    }

    /// Status as set by the handler, `200 OK` if it never set one.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::Ok)
    }

    pub fn snapshot(&self) -> CacheEntry {
        CacheEntry::new(
            self.status(),
            self.headers.clone(),
            self.body.clone().freeze(),
        )
    }

    pub fn into_inner(self) -> Response {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_defaults_to_ok() {
        let mut recorder = ResponseRecorder::new();
        recorder.write(b"body");
        assert_eq!(recorder.snapshot().status(), StatusCode::Ok);
    }

    #[test]
    fn writes_reach_sink_and_capture() {
        let mut recorder = ResponseRecorder::new();
        recorder.set_status(StatusCode::Created);
        recorder.add_header("Content-Type", "application/feed+json");
        recorder.write(b"{\"items\":");
        recorder.write(b"[]}");

        let entry = recorder.snapshot();
        assert_eq!(entry.status(), StatusCode::Created);
        assert_eq!(&entry.body()[..], b"{\"items\":[]}");

        let sink = recorder.into_inner();
        assert_eq!(sink.status(), StatusCode::Created);
        assert_eq!(sink.body_ref(), b"{\"items\":[]}");
        assert_eq!(sink.headers().get("content-type"), Some("application/feed+json"));
    }

    #[test]
    fn headers_captured_at_last_write() {
        let mut recorder = ResponseRecorder::new();
        recorder.add_header("X-Before", "1");
        recorder.write(b"a");
        recorder.add_header("X-After", "2");

        let entry = recorder.snapshot();
        assert!(entry.headers().contains("x-before"));
        assert!(!entry.headers().contains("x-after"));
        assert!(recorder.into_inner().headers().contains("x-after"));
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let mut recorder = ResponseRecorder::new();
        recorder.add_header("X-Value", "old");
        recorder.write(b"1");
        let entry = recorder.snapshot();

        recorder.set_header("X-Value", "new");
        recorder.write(b"2");
        assert_eq!(entry.headers().get("x-value"), Some("old"));
        assert_eq!(&entry.body()[..], b"1");
    }

    #[test]
    fn record_replays_downstream_response() {
        let downstream = Response::new(StatusCode::NotFound)
            .header("Content-Type", "text/plain")
            .body("404 Not Found\n");
        let mut recorder = ResponseRecorder::new();
        recorder.record(&downstream);

        let entry = recorder.snapshot();
        assert_eq!(entry.status(), StatusCode::NotFound);
        assert_eq!(entry.headers().get("content-type"), Some("text/plain"));
        assert_eq!(recorder.into_inner().body_ref(), b"404 Not Found\n");
    }
}
