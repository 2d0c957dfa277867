use std::fmt;
use std::sync::Arc;

/// Function invoked from the polling context when a registered status byte
/// arrives. Any per-callback data is captured by the closure.
pub type SrqCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// One row of the callback table.
#[derive(Clone)]
pub(crate) struct CallbackEntry {
    pub(crate) status: u8,
    pub(crate) callback: SrqCallback,
    /// Queue the byte as well after the callback fired.
    pub(crate) keep_in_fifo: bool,
}

impl fmt::Debug for CallbackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackEntry")
            .field("status", &format_args!("0x{:02x}", self.status))
            .field("keep_in_fifo", &self.keep_in_fifo)
            .finish()
    }
}

/// Ordered callback table. Index 0 is the most recent registration and the
/// lookup returns the first match.
#[derive(Debug, Default)]
pub(crate) struct CallbackTable {
    entries: Vec<CallbackEntry>,
}

impl CallbackTable {
    pub(crate) fn register(&mut self, status: u8, callback: SrqCallback, keep_in_fifo: bool) {
        self.entries.insert(
            0,
            CallbackEntry {
                status,
                callback,
                keep_in_fifo,
            },
        );
    }

    pub(crate) fn lookup(&self, status: u8) -> Option<&CallbackEntry> {
        self.entries.iter().find(|entry| entry.status == status)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
