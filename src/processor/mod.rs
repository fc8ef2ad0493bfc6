use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde_json::{json, Value};

use crate::wire::envelope::TranslationRequest;

#[derive(Clone, Debug, PartialEq)]
pub struct Translation {
    pub text: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, PartialEq)]
pub enum ProcessorError {
    Released,
    UnsupportedLanguagePair { source: String, target: String },
    NoTranslationAvailable { text: String },
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => write!(f, "processor has been released"),
            Self::UnsupportedLanguagePair { source, target } => {
                write!(f, "unsupported language pair {source}->{target}")
            }
            Self::NoTranslationAvailable { text } => {
                write!(f, "no translation available for '{text}'")
            }
        }
    }
}

impl std::error::Error for ProcessorError {}

/// The injected per-job computation. Implementations must be safe to call
/// from every worker thread at once, or serialize internally. `process` must
/// not be called after `release`; `release` itself is idempotent.
pub trait Processor: Send + Sync {
    fn process(&self, request: &TranslationRequest) -> Result<Translation, ProcessorError>;

    fn stats_payload(&self) -> Value;

    /// Runs a self-test job and reports whether the engine is usable.
    fn health_report(&self) -> Value;

    fn supported_languages(&self) -> Value;

    fn release(&self);
}

/// Built-in dictionary translator standing in for a model-backed engine.
/// Handles the en->ja pair from a fixed phrase glossary; safe for concurrent
/// calls.
pub struct GlossaryProcessor {
    glossary: HashMap<&'static str, &'static str>,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    total_time_ms: AtomicU64,
    released: AtomicBool,
}

impl Default for GlossaryProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl GlossaryProcessor {
    pub fn new() -> Self {
        let glossary = HashMap::from([
            ("Hello", "こんにちは"),
            ("Good morning", "おはようございます"),
            ("Good evening", "こんばんは"),
            ("Thank you", "ありがとうございます"),
            ("Goodbye", "さようなら"),
            ("Yes", "はい"),
            ("No", "いいえ"),
            ("Please", "お願いします"),
            ("Excuse me", "すみません"),
            ("World", "世界"),
        ]);

        Self {
            glossary,
            total_processed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_time_ms: AtomicU64::new(0),
            released: AtomicBool::new(false),
        }
    }

    fn lookup(&self, request: &TranslationRequest) -> Result<String, ProcessorError> {
        if request.source_lang != "en" || request.target_lang != "ja" {
            return Err(ProcessorError::UnsupportedLanguagePair {
                source: request.source_lang.clone(),
                target: request.target_lang.clone(),
            });
        }

        self.glossary
            .get(request.text.as_str())
            .map(|translated| (*translated).to_owned())
            .ok_or_else(|| ProcessorError::NoTranslationAvailable {
                text: request.text.clone(),
            })
    }
}

impl Processor for GlossaryProcessor {
    fn process(&self, request: &TranslationRequest) -> Result<Translation, ProcessorError> {
        if self.released.load(Ordering::Acquire) {
            return Err(ProcessorError::Released);
        }

        let started = Instant::now();
        let result = self.lookup(request);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(text) => {
                self.total_processed.fetch_add(1, Ordering::Relaxed);
                self.total_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
                Ok(Translation { text, elapsed_ms })
            }
            Err(error) => {
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                Err(error)
            }
        }
    }

    fn stats_payload(&self) -> Value {
        let processed = self.total_processed.load(Ordering::Relaxed);
        let total_time_ms = self.total_time_ms.load(Ordering::Relaxed);
        let average_time_ms = if processed == 0 {
            0.0
        } else {
            total_time_ms as f64 / processed as f64
        };

        json!({
            "engine": "glossary",
            "total_processed": processed,
            "total_failed": self.total_failed.load(Ordering::Relaxed),
            "total_time_ms": total_time_ms,
            "average_time_ms": average_time_ms,
        })
    }

    fn health_report(&self) -> Value {
        if self.released.load(Ordering::Acquire) {
            return json!({
                "healthy": false,
                "engine": "glossary",
                "self_test": "skipped",
                "detail": "processor has been released",
            });
        }

        let self_test = TranslationRequest {
            request_id: "health-self-test".to_owned(),
            text: "Hello".to_owned(),
            source_lang: "en".to_owned(),
            target_lang: "ja".to_owned(),
            priority: "normal".to_owned(),
        };

        match self.process(&self_test) {
            Ok(translation) => json!({
                "healthy": true,
                "engine": "glossary",
                "self_test": "passed",
                "self_test_output": translation.text,
            }),
            Err(error) => json!({
                "healthy": false,
                "engine": "glossary",
                "self_test": "failed",
                "detail": error.to_string(),
            }),
        }
    }

    fn supported_languages(&self) -> Value {
        json!([{"source": "en", "target": "ja"}])
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}
