use std::{collections::VecDeque, time::Duration};

use log::debug;

use crate::protocol::{Control, LdapResult, SearchEntry};

use super::{ClientError, SearchBatch, search::Search};

/// Search results as an enumeration that keeps growing while the server
/// streams.
///
/// Entries already received are handed out first; once the buffer runs dry
/// the enumeration waits for more on the underlying [`Search`]. An engine
/// error is raised once, after which the enumeration reports itself
/// exhausted.
pub struct SearchResults {
    buffer: VecDeque<SearchEntry>,
    references: Vec<Vec<String>>,
    result: Option<LdapResult>,
    controls: Vec<Control>,
    finished: bool,
    search: Option<Search>,
}

impl SearchResults {
    pub(crate) fn new(batch: SearchBatch, search: Search) -> Self {
        let mut results = Self {
            buffer: VecDeque::new(),
            references: Vec::new(),
            result: None,
            controls: Vec::new(),
            finished: false,
            search: Some(search),
        };
        results.absorb(batch);
        results
    }

    /// Whether another entry is available, waiting up to `timeout` for one.
    pub fn has_more(&mut self, timeout: Duration) -> Result<bool, ClientError> {
        while self.buffer.is_empty() && !self.finished {
            let Some(search) = self.search.as_mut() else {
                self.finished = true;
                break;
            };
            match search.fill(timeout) {
                Ok(batch) => self.absorb(batch),
                Err(err) if err.is_timeout() => return Err(err),
                Err(err) => {
                    debug!("search {} ended with {err}", search.id());
                    self.finish();
                    return Err(err);
                }
            }
        }
        Ok(!self.buffer.is_empty())
    }

    /// Takes the next entry, waiting up to `timeout` for it.
    pub fn next(&mut self, timeout: Duration) -> Result<SearchEntry, ClientError> {
        if self.has_more(timeout)? {
            if let Some(entry) = self.buffer.pop_front() {
                return Ok(entry);
            }
        }
        Err(ClientError::Exhausted)
    }

    /// Iterates over the remaining entries. Iteration ends after the first
    /// error.
    pub fn entries(&mut self, timeout: Duration) -> Entries<'_> {
        Entries {
            results: self,
            timeout,
            failed: false,
        }
    }

    /// Stops waiting for further entries. Buffered entries are discarded.
    pub fn close(&mut self) {
        self.buffer.clear();
        self.finish();
    }

    /// Continuation references seen so far.
    pub fn references(&self) -> &[Vec<String>] {
        &self.references
    }

    /// The final result, once the done marker has been received.
    pub fn result(&self) -> Option<&LdapResult> {
        self.result.as_ref()
    }

    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn absorb(&mut self, batch: SearchBatch) {
        self.buffer.extend(batch.entries);
        self.references.extend(batch.references);
        if let Some(result) = batch.result {
            self.result = Some(result);
            self.controls = batch.controls;
            self.finish();
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        // Dropping an unfinished search deregisters it.
        self.search = None;
    }
}

pub struct Entries<'a> {
    results: &'a mut SearchResults,
    timeout: Duration,
    failed: bool,
}

impl Iterator for Entries<'_> {
    type Item = Result<SearchEntry, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.results.has_more(self.timeout) {
            Ok(true) => self.results.buffer.pop_front().map(Ok),
            Ok(false) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
