use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use serde::Serialize;

/// Optional JSONL copy of everything emitted. Set once in main().
static JSONL_WRITER: OnceLock<Mutex<BufWriter<File>>> = OnceLock::new();

/// Also append every emitted line to `path`.
pub fn init_jsonl_file(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    JSONL_WRITER
        .set(Mutex::new(BufWriter::new(file)))
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "JSONL file already set"))
}

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    let Ok(json) = serde_json::to_string(event) else {
        return;
    };
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{json}");
    let _ = lock.flush();

    if let Some(writer) = JSONL_WRITER.get() {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{json}");
            let _ = w.flush();
        }
    }
}

pub fn now_iso() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ── Run events ──────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub scenario: String,
    pub seed: Option<u64>,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(scenario: &str, seed: Option<u64>) -> Self {
        Self {
            event: "started",
            scenario: scenario.to_string(),
            seed,
            timestamp: now_iso(),
        }
    }
}

/// Something one earbud's topology reported upward.
#[derive(Serialize)]
pub struct EventTopology {
    pub event: &'static str,
    pub node: &'static str,
    pub detail: String,
    pub elapsed_ms: f64,
}

/// Fault injected by the chaos scenario.
#[derive(Serialize)]
pub struct EventFault {
    pub event: &'static str,
    pub round: u32,
    pub fault: String,
    pub elapsed_ms: f64,
}
