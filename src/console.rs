use parking_lot::Mutex;
use std::sync::Arc;

/// Must return promptly; the reader task calls it for every line.
pub trait ConsoleSink: Send + Sync {
    fn write(&self, bytes: &[u8]);
}

#[derive(Debug, Default)]
pub struct MemoryConsole {
    buffer: Mutex<Vec<u8>>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub fn tail(&self, max_chars: usize) -> String {
        let contents = self.contents();
        let total = contents.chars().count();
        if total > max_chars {
            contents.chars().skip(total - max_chars).collect()
        } else {
            contents
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConsoleSink for MemoryConsole {
    fn write(&self, bytes: &[u8]) {
        self.buffer.lock().extend_from_slice(bytes);
    }
}

#[derive(Debug, Default)]
pub struct TracingConsole;

impl ConsoleSink for TracingConsole {
    fn write(&self, bytes: &[u8]) {
        for line in String::from_utf8_lossy(bytes).lines() {
            tracing::info!(target: "console", "{}", line);
        }
    }
}

impl ConsoleSink for Vec<Arc<dyn ConsoleSink>> {
    fn write(&self, bytes: &[u8]) {
        for sink in self {
            sink.write(bytes);
        }
    }
}
