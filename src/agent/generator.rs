//! Turns a metric snapshot into outbound request descriptors.
//!
//! Every valid series yields three single-metric requests (path-encoded
//! text, JSON, gzip JSON). After the last series, the batch endpoint gets
//! a plain and a gzip JSON array of everything that parsed.

use std::collections::VecDeque;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;

use crate::codec::{CodecError, Encoder};
use crate::metric::{MetricError, MetricKind, Metrics};
use crate::snapshot::MetricSnapshot;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Bytes escaped inside one path segment of a plain-text update.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// `/update/{kind}/{name}/{value}` with every segment escaped.
pub fn update_path(kind: MetricKind, name: &str, value: &str) -> String {
    format!(
        "/update/{}/{}/{}",
        kind,
        utf8_percent_encode(name, PATH_SEGMENT),
        utf8_percent_encode(value, PATH_SEGMENT)
    )
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("{kind} {name}: {source}")]
    Metric {
        kind: MetricKind,
        name: String,
        #[source]
        source: MetricError,
    },

    #[error("encoding {path}: {source}")]
    Encode {
        path: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty batch")]
    EmptyBatch,
}

/// A fully encoded request ready for the poster.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// Path relative to the collector base URL, starting with `/`.
    pub path: String,
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub gzip: bool,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Generator {
    encoder: Encoder,
}

impl Generator {
    pub fn new(encoder: Encoder) -> Self {
        Self { encoder }
    }

    /// Lazily produces every request for `snapshot`.
    pub fn generate<'a>(
        &'a self,
        snapshot: &'a MetricSnapshot,
    ) -> Requests<'a, impl Iterator<Item = (MetricKind, &'a str, &'a str)> + 'a> {
        Requests {
            encoder: &self.encoder,
            series: snapshot.iter(),
            pending: VecDeque::with_capacity(3),
            batch: Vec::with_capacity(snapshot.len()),
            batch_done: false,
        }
    }
}

/// Iterator returned by [`Generator::generate`].
pub struct Requests<'a, I> {
    encoder: &'a Encoder,
    series: I,
    pending: VecDeque<Result<OutboundRequest, GenerateError>>,
    batch: Vec<Metrics>,
    batch_done: bool,
}

impl<'a, I> Requests<'a, I> {
    fn json(&self, path: &'static str, body: Vec<u8>, gzip: bool) -> Result<OutboundRequest, GenerateError> {
        let encoded = self
            .encoder
            .encode(body, gzip)
            .map_err(|source| GenerateError::Encode { path, source })?;
        Ok(OutboundRequest {
            path: path.to_string(),
            body: encoded.payload,
            content_type: CONTENT_TYPE_JSON,
            gzip: encoded.gzip,
            signature: encoded.signature,
        })
    }

    fn queue_single(&mut self, kind: MetricKind, metric: &Metrics) {
        let value = match kind {
            MetricKind::Gauge => metric.value.map(|v| v.to_string()),
            MetricKind::Counter => metric.delta.map(|d| d.to_string()),
        }
        .unwrap_or_default();

        self.pending.push_back(Ok(OutboundRequest {
            path: update_path(kind, &metric.id, &value),
            body: Vec::new(),
            content_type: CONTENT_TYPE_TEXT,
            gzip: false,
            signature: None,
        }));

        match serde_json::to_vec(metric) {
            Ok(body) => {
                let plain = self.json("/update", body.clone(), false);
                let packed = self.json("/update", body, true);
                self.pending.push_back(plain);
                self.pending.push_back(packed);
            }
            Err(e) => self.pending.push_back(Err(e.into())),
        }
    }

    fn queue_batch(&mut self) {
        if self.batch.is_empty() {
            self.pending.push_back(Err(GenerateError::EmptyBatch));
            return;
        }
        match serde_json::to_vec(&self.batch) {
            Ok(body) => {
                let plain = self.json("/updates", body.clone(), false);
                let packed = self.json("/updates", body, true);
                self.pending.push_back(plain);
                self.pending.push_back(packed);
            }
            Err(e) => self.pending.push_back(Err(e.into())),
        }
    }
}

impl<'a, I> Iterator for Requests<'a, I>
where
    I: Iterator<Item = (MetricKind, &'a str, &'a str)>,
{
    type Item = Result<OutboundRequest, GenerateError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if let Some((kind, name, raw)) = self.series.next() {
                match Metrics::from_raw(kind, name, raw) {
                    Ok(metric) => {
                        self.queue_single(kind, &metric);
                        self.batch.push(metric);
                    }
                    Err(source) => {
                        return Some(Err(GenerateError::Metric {
                            kind,
                            name: name.to_string(),
                            source,
                        }))
                    }
                }
                continue;
            }
            if !self.batch_done {
                self.batch_done = true;
                self.queue_batch();
                continue;
            }
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_keys::{private_key, public_key};
    use crate::codec::{Decoder, EncodedBody};

    fn snapshot() -> MetricSnapshot {
        let mut s = MetricSnapshot::new();
        s.set_gauge("Alloc", 1024.5);
        s.set_counter("PollCount", 3);
        s
    }

    #[test]
    fn test_three_per_metric_plus_two_batches() {
        let generator = Generator::default();
        let snap = snapshot();
        let requests: Vec<_> = generator
            .generate(&snap)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(requests.len(), 2 * 3 + 2);

        assert_eq!(requests[0].path, "/update/gauge/Alloc/1024.5");
        assert!(requests[0].body.is_empty());
        assert_eq!(requests[0].content_type, CONTENT_TYPE_TEXT);

        assert_eq!(requests[1].path, "/update");
        assert!(!requests[1].gzip);
        assert_eq!(
            requests[1].body,
            br#"{"id":"Alloc","type":"gauge","value":1024.5}"#
        );
        assert!(requests[2].gzip);

        assert_eq!(requests[3].path, "/update/counter/PollCount/3");

        let batch = &requests[6];
        assert_eq!(batch.path, "/updates");
        let parsed: Vec<Metrics> = serde_json::from_slice(&batch.body).unwrap();
        assert_eq!(
            parsed,
            vec![Metrics::gauge("Alloc", 1024.5), Metrics::counter("PollCount", 3)]
        );
        assert!(requests[7].gzip);
    }

    #[test]
    fn test_plain_path_escapes_reserved_characters() {
        assert_eq!(
            update_path(MetricKind::Counter, "a/b", "5"),
            "/update/counter/a%2Fb/5"
        );
        assert_eq!(
            update_path(MetricKind::Counter, "cpu#1", "5"),
            "/update/counter/cpu%231/5"
        );
        assert_eq!(
            update_path(MetricKind::Gauge, "q?x 50%", "-1.5"),
            "/update/gauge/q%3Fx%2050%25/-1.5"
        );
        assert_eq!(
            update_path(MetricKind::Gauge, "CPUutilization1", "12.5"),
            "/update/gauge/CPUutilization1/12.5"
        );
    }

    #[test]
    fn test_bad_value_yields_one_error_and_is_skipped() {
        let mut snap = snapshot();
        snap.insert_raw(MetricKind::Counter, "Broken", "1.5");

        let generator = Generator::default();
        let items: Vec<_> = generator.generate(&snap).collect();
        let errors: Vec<_> = items.iter().filter(|r| r.is_err()).collect();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Err(GenerateError::Metric { .. })));
        assert_eq!(items.len(), 1 + 2 * 3 + 2);

        let batch = items
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .find(|r| r.path == "/updates")
            .unwrap();
        let parsed: Vec<Metrics> = serde_json::from_slice(&batch.body).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_empty_snapshot_yields_empty_batch_error() {
        let generator = Generator::default();
        let snap = MetricSnapshot::new();
        let items: Vec<_> = generator.generate(&snap).collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(GenerateError::EmptyBatch)));
    }

    #[test]
    fn test_signed_and_encrypted_requests_decode() {
        let generator = Generator::new(Encoder::new(Some("k".into()), Some(public_key())));
        let decoder = Decoder::new(Some("k".into()), Some(private_key()));
        let snap = snapshot();

        for request in generator.generate(&snap).map(Result::unwrap) {
            if request.content_type != CONTENT_TYPE_JSON {
                assert!(request.signature.is_none());
                continue;
            }
            assert!(request.signature.is_some());
            let body = decoder
                .decode(&EncodedBody {
                    payload: request.body,
                    gzip: request.gzip,
                    signature: request.signature,
                })
                .unwrap();
            let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert!(value.is_object() || value.is_array());
        }
    }
}
