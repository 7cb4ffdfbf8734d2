//! Process-wide error queue.
//!
//! Worker threads never let errors escape; they record them here and exit.
//! The query surface drains the queue to report the most recent failure to
//! the operator.

use crate::hrtime::HighResTime;
use lazy_static::lazy_static;
use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_RECORDS: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: u32,
    pub message: String,
    pub when: HighResTime,
}

impl ErrorRecord {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        ErrorRecord {
            code,
            message: message.into(),
            when: HighResTime::now(),
        }
    }
}

lazy_static! {
    static ref QUEUE: Mutex<VecDeque<ErrorRecord>> = Mutex::new(VecDeque::new());
}

/// Appends a record, evicting the oldest entry when full.
pub fn push(record: ErrorRecord) {
    let mut q = QUEUE.lock().unwrap();
    if q.len() == MAX_RECORDS {
        let lost = q.pop_front().unwrap();
        log::warn!("error queue full, dropping: {} {}", lost.code, lost.message);
    }
    log::error!("({}) {}", record.code, record.message);
    q.push_back(record);
}

pub fn push_error(code: u32, message: impl Into<String>) {
    push(ErrorRecord::new(code, message));
}

/// Removes and returns the oldest record.
pub fn pop() -> Option<ErrorRecord> {
    QUEUE.lock().unwrap().pop_front()
}

/// Most recent record without consuming it.
pub fn last() -> Option<ErrorRecord> {
    QUEUE.lock().unwrap().back().cloned()
}

pub fn len() -> usize {
    QUEUE.lock().unwrap().len()
}

pub fn clear() {
    QUEUE.lock().unwrap().clear()
}

// The queue is process-global; tests touching it (here and in other
// modules) serialize through this lock.
#[cfg(test)]
pub(crate) mod testsync {
    use super::*;
    lazy_static! {
        pub static ref LOCK: Mutex<()> = Mutex::new(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_and_last() {
        let _guard = testsync::LOCK.lock().unwrap();
        clear();
        push_error(4, "first");
        push_error(6, "second");
        assert_eq!(last().unwrap().message, "second");
        assert_eq!(pop().unwrap().message, "first");
        assert_eq!(pop().unwrap().message, "second");
        assert_eq!(pop(), None);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let _guard = testsync::LOCK.lock().unwrap();
        clear();
        for i in 0..(MAX_RECORDS + 3) {
            push_error(4, format!("e{}", i));
        }
        assert_eq!(len(), MAX_RECORDS);
        assert_eq!(pop().unwrap().message, "e3");
        clear();
    }
}
