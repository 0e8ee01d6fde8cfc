//! Built-in collaborators, so the server runs without external services.
//!
//! Each reports a fixed nominal quality figure taken from its own
//! configuration rather than a measured one.

use beacon_ws::{
    accept_key, decode, encode_frame, encode_masked_text, find_websocket_key, Opcode, WsError,
};
use serde_json::{json, Value};

use crate::collaborator::{
    AnalyticsResult, AnalyticsService, ItemDescription, Prediction, PredictionService,
    ServiceError, SyncOutcome, SyncService, TestCase, TestReport, TestSuiteService,
};

const DEFAULT_CATEGORIES: &[(&str, &[&str])] = &[
    ("textbooks", &["textbook", "book", "edition", "isbn", "novel", "workbook"]),
    ("electronics", &["laptop", "calculator", "phone", "tablet", "monitor", "headphones", "charger"]),
    ("furniture", &["desk", "chair", "lamp", "shelf", "bed", "mattress"]),
    ("clothing", &["jacket", "shirt", "hoodie", "shoes", "dress", "jeans"]),
    ("supplies", &["notebook", "pen", "pencil", "backpack", "binder", "stationery"]),
];

const FALLBACK_LABEL: &str = "other";

/// Keyword-matching item classifier.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    categories: Vec<(String, Vec<String>)>,
    reported_accuracy: f64,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let categories = DEFAULT_CATEGORIES
            .iter()
            .map(|(label, words)| {
                (
                    label.to_string(),
                    words.iter().map(|w| w.to_string()).collect(),
                )
            })
            .collect();
        Self {
            categories,
            reported_accuracy: 0.96,
        }
    }
}

impl PredictionService for KeywordClassifier {
    fn predict(&self, item: &ItemDescription) -> Result<Prediction, ServiceError> {
        if item.title.trim().is_empty() {
            return Err(ServiceError::InvalidInput("item title is empty".to_string()));
        }

        let text = format!("{} {} {}", item.title, item.description, item.tags.join(" "))
            .to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let mut best: Option<(&str, usize)> = None;
        let mut total_hits = 0;
        for (label, keywords) in &self.categories {
            let hits = words
                .iter()
                .filter(|w| keywords.iter().any(|k| k == *w))
                .count();
            total_hits += hits;
            if hits > 0 && best.map_or(true, |(_, top)| hits > top) {
                best = Some((label.as_str(), hits));
            }
        }

        let (label, confidence) = match best {
            Some((label, hits)) => (label.to_string(), hits as f64 / total_hits as f64),
            None => (FALLBACK_LABEL.to_string(), 0.0),
        };

        Ok(Prediction {
            label,
            confidence,
            accuracy: self.reported_accuracy,
        })
    }
}

/// Numeric summary and trend analytics over `params.values`.
#[derive(Debug, Clone)]
pub struct SummaryAnalytics {
    reported_accuracy: f64,
}

impl Default for SummaryAnalytics {
    fn default() -> Self {
        Self {
            reported_accuracy: 1.0,
        }
    }
}

impl SummaryAnalytics {
    fn values(params: &Value) -> Result<Vec<f64>, ServiceError> {
        let values = params
            .get("values")
            .and_then(Value::as_array)
            .ok_or_else(|| ServiceError::InvalidInput("params.values must be an array".to_string()))?;
        if values.is_empty() {
            return Err(ServiceError::InvalidInput("params.values is empty".to_string()));
        }
        values
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| ServiceError::InvalidInput(format!("not a number: {v}")))
            })
            .collect()
    }
}

impl AnalyticsService for SummaryAnalytics {
    fn analyze(&self, kind: &str, params: &Value) -> Result<AnalyticsResult, ServiceError> {
        let result = match kind {
            "summary" => {
                let values = Self::values(params)?;
                let count = values.len();
                let sum: f64 = values.iter().sum();
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                json!({
                    "count": count,
                    "sum": sum,
                    "mean": sum / count as f64,
                    "min": min,
                    "max": max,
                })
            }
            "trend" => {
                let values = Self::values(params)?;
                let slope = least_squares_slope(&values);
                let direction = if slope > f64::EPSILON {
                    "rising"
                } else if slope < -f64::EPSILON {
                    "falling"
                } else {
                    "flat"
                };
                json!({
                    "count": values.len(),
                    "slope": slope,
                    "direction": direction,
                })
            }
            other => {
                return Err(ServiceError::Unsupported {
                    what: "analytics kind",
                    value: other.to_string(),
                })
            }
        };

        Ok(AnalyticsResult {
            result,
            accuracy: self.reported_accuracy,
        })
    }
}

/// Slope of the least-squares line through `(i, values[i])`.
fn least_squares_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    num / den
}

/// Sync that accepts records locally and counts them.
#[derive(Debug, Clone)]
pub struct LoopbackSync {
    reported_success_rate: f64,
}

impl Default for LoopbackSync {
    fn default() -> Self {
        Self {
            reported_success_rate: 1.0,
        }
    }
}

impl SyncService for LoopbackSync {
    fn sync(&self, config: &Value) -> Result<SyncOutcome, ServiceError> {
        let config = match config {
            Value::Null => return Ok(self.outcome("synced", 0)),
            Value::Object(map) => map,
            _ => return Err(ServiceError::InvalidInput("sync config must be an object".to_string())),
        };

        let records = match (config.get("records"), config.get("record_count")) {
            (Some(Value::Array(records)), _) => records.len() as u64,
            (Some(_), _) => {
                return Err(ServiceError::InvalidInput("records must be an array".to_string()))
            }
            (None, Some(count)) => count.as_u64().ok_or_else(|| {
                ServiceError::InvalidInput("record_count must be a non-negative integer".to_string())
            })?,
            (None, None) => 0,
        };

        let dry_run = config
            .get("dry_run")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let status = if dry_run { "dry_run" } else { "synced" };
        Ok(self.outcome(status, records))
    }
}

impl LoopbackSync {
    fn outcome(&self, status: &str, records: u64) -> SyncOutcome {
        SyncOutcome {
            status: status.to_string(),
            records,
            success_rate: self.reported_success_rate,
        }
    }
}

/// Self-diagnostic suite exercising the frame codec and handshake.
#[derive(Debug, Clone, Default)]
pub struct SelfDiagnostics;

const RFC_SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const RFC_SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

impl SelfDiagnostics {
    fn codec_cases() -> Vec<TestCase> {
        let mut cases: Vec<TestCase> = [0usize, 125, 126, 65_535, 65_536]
            .iter()
            .map(|&len| {
                let payload = vec![b'x'; len];
                let wire = encode_masked_text(&payload, [0x37, 0xfa, 0x21, 0x3d]);
                let outcome = decode(&wire);
                let passed = matches!(&outcome, Ok(frame) if frame.payload == payload && frame.is_final_text());
                TestCase {
                    name: format!("codec_roundtrip_{len}"),
                    passed,
                    detail: outcome.err().map(|e| e.to_string()),
                }
            })
            .collect();

        let unmasked = encode_frame(true, Opcode::Text, b"hello", None);
        let rejected = matches!(decode(&unmasked), Err(WsError::UnmaskedFrame));
        cases.push(TestCase {
            name: "codec_rejects_unmasked".to_string(),
            passed: rejected,
            detail: None,
        });
        cases
    }

    fn handshake_cases() -> Vec<TestCase> {
        let accept = accept_key(RFC_SAMPLE_KEY);
        let request = format!(
            "GET /ws HTTP/1.1\r\nHost: localhost\r\nsec-websocket-KEY: {RFC_SAMPLE_KEY}\r\n\r\n"
        );
        vec![
            TestCase {
                name: "handshake_accept_token".to_string(),
                passed: accept == RFC_SAMPLE_ACCEPT,
                detail: (accept != RFC_SAMPLE_ACCEPT).then(|| format!("got {accept}")),
            },
            TestCase {
                name: "handshake_key_lookup".to_string(),
                passed: find_websocket_key(&request) == Some(RFC_SAMPLE_KEY),
                detail: None,
            },
            TestCase {
                name: "handshake_missing_key".to_string(),
                passed: find_websocket_key("GET / HTTP/1.1\r\nHost: x\r\n\r\n").is_none(),
                detail: None,
            },
        ]
    }
}

impl TestSuiteService for SelfDiagnostics {
    fn run(&self, test_type: &str) -> Result<TestReport, ServiceError> {
        let cases = match test_type {
            "codec" => Self::codec_cases(),
            "handshake" => Self::handshake_cases(),
            "all" => {
                let mut cases = Self::codec_cases();
                cases.extend(Self::handshake_cases());
                cases
            }
            other => {
                return Err(ServiceError::Unsupported {
                    what: "test type",
                    value: other.to_string(),
                })
            }
        };
        Ok(TestReport {
            test_type: test_type.to_string(),
            cases,
        })
    }
}
