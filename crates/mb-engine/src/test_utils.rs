//! Shared test doubles: a scripted vision client and a manual clock.
//! Compiled into the crate so downstream integration tests can use them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mb_core::{Clock, MbError, MbResult, VisionAnalysis};

use crate::inspect::VisionFrame;
use crate::vision::{VisionClient, VisionPrompt};

#[derive(Debug, Clone)]
pub enum VisionScriptStep {
    Succeed(VisionAnalysis),
    Fail(String),
    /// The model answered but nothing parseable came back.
    Empty,
}

impl VisionScriptStep {
    fn into_result(self) -> MbResult<Option<VisionAnalysis>> {
        match self {
            Self::Succeed(analysis) => Ok(Some(analysis)),
            Self::Fail(msg) => Err(MbError::Model(msg)),
            Self::Empty => Ok(None),
        }
    }
}

/// Vision client that replays a script, then a fallback step. Records call
/// counts and the peak number of concurrent calls.
pub struct ScriptedVision {
    steps: Mutex<VecDeque<VisionScriptStep>>,
    fallback: VisionScriptStep,
    delay: Option<Duration>,
    calls: AtomicUsize,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl ScriptedVision {
    pub fn script(steps: Vec<VisionScriptStep>, fallback: VisionScriptStep) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    pub fn always(analysis: VisionAnalysis) -> Self {
        Self::script(Vec::new(), VisionScriptStep::Succeed(analysis))
    }

    pub fn failing(message: &str) -> Self {
        Self::script(Vec::new(), VisionScriptStep::Fail(message.into()))
    }

    /// Like [`always`] but each call takes `delay`, for concurrency tests.
    pub fn slow(analysis: VisionAnalysis, delay: Duration) -> Self {
        let mut vision = Self::always(analysis);
        vision.delay = Some(delay);
        vision
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionClient for ScriptedVision {
    async fn analyze(
        &self,
        _frames: &[VisionFrame],
        _prompt: VisionPrompt<'_>,
    ) -> MbResult<Option<VisionAnalysis>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let step = self
            .steps
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        self.current.fetch_sub(1, Ordering::SeqCst);
        step.into_result()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Clock whose time only moves when a test advances it.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut now = self.now.lock().expect("clock lock");
        *now += chrono::Duration::milliseconds(ms);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// Minimal bytes that sniff as a static PNG.
pub fn png_bytes() -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(&[0, 0, 0, 13]);
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&1u32.to_be_bytes());
    bytes.extend_from_slice(&1u32.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes
}
