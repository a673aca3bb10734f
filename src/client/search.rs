//! Streaming search.
//!
//! A search answers with any number of entries and references followed by a
//! done marker. The dispatcher folds each arrival into the search's
//! [`SearchAssembly`]; the owning [`Search`] handle waits until enough has
//! accumulated, drains a chunk and hands control back to the caller while
//! the dispatcher keeps filling the next chunk.
use std::{
    collections::HashMap,
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, trace};

use crate::protocol::{
    CodecError, Control, LdapResult, Message, MessageId, Payload, Response, ResponseKind,
    SearchEntry,
};

use super::{ClientError, connection::Shared, table::SearchPhase};

/// One chunk of search results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchBatch {
    pub entries: Vec<SearchEntry>,
    pub references: Vec<Vec<String>>,
    /// Set once the done marker has been drained; no entries follow it.
    pub result: Option<LdapResult>,
    /// Controls that came with the done marker.
    pub controls: Vec<Control>,
}

impl SearchBatch {
    pub fn is_done(&self) -> bool {
        self.result.is_some()
    }
}

/// Accumulated, not yet drained results of one search.
///
/// Entries are keyed by their lower-cased DN: a second arrival for the same
/// DN is merged into the first instead of being listed twice.
#[derive(Debug, Default)]
pub(crate) struct SearchAssembly {
    entries: Vec<SearchEntry>,
    index: HashMap<String, usize>,
    references: Vec<Vec<String>>,
    done: Option<(LdapResult, Vec<Control>)>,
    error: Option<ClientError>,
}

impl SearchAssembly {
    pub fn on_entry(&mut self, entry: SearchEntry) {
        let key = entry.dn.to_ascii_lowercase();
        match self.index.get(&key) {
            Some(&position) => {
                trace!("merging repeated entry {}", entry.dn);
                self.entries[position].merge(entry);
            }
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn on_reference(&mut self, urls: Vec<String>) {
        self.references.push(urls);
    }

    pub fn on_done(&mut self, result: LdapResult, controls: Vec<Control>) {
        self.done = Some((result, controls));
    }

    /// Records a failure unless the search already finished.
    pub fn fail(&mut self, error: ClientError) {
        if self.done.is_none() && self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Whether a waiter asking for `threshold` entries can stop waiting.
    /// `None` waits for the done marker.
    pub fn is_ready(&self, threshold: Option<usize>) -> bool {
        self.done.is_some()
            || self.error.is_some()
            || threshold.is_some_and(|wanted| self.entries.len() >= wanted)
    }

    /// Takes up to `limit` entries and every reference.
    ///
    /// The done marker is only handed out with the last entry, and an error
    /// only once everything before it has been drained.
    pub fn drain(&mut self, limit: Option<usize>) -> Result<SearchBatch, ClientError> {
        if self.entries.is_empty() && self.references.is_empty() {
            if let Some(error) = self.error.take() {
                return Err(error);
            }
        }

        let take = limit.map_or(self.entries.len(), |limit| limit.min(self.entries.len()));
        let entries = self.entries.drain(..take).collect::<Vec<_>>();
        if take > 0 {
            self.reindex();
        }
        let references = mem::take(&mut self.references);
        let (result, controls) = match self.done.take() {
            Some(done) if self.entries.is_empty() => (Some(done.0), done.1),
            done => {
                self.done = done;
                (None, Vec::new())
            }
        };

        Ok(SearchBatch {
            entries,
            references,
            result,
            controls,
        })
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.dn.to_ascii_lowercase(), position))
            .collect();
    }
}

/// Search state shared between the dispatcher and the owning handle.
///
/// The doorbell holds at most one ring: the dispatcher rings after every
/// deposit and the waiter re-checks the assembly after every ring.
pub(crate) struct SearchState {
    assembly: Mutex<SearchAssembly>,
    bell: Sender<()>,
    ring: Receiver<()>,
}

impl SearchState {
    pub fn new() -> Arc<Self> {
        let (bell, ring) = bounded(1);
        Arc::new(Self {
            assembly: Mutex::new(SearchAssembly::default()),
            bell,
            ring,
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, SearchAssembly> {
        self.assembly.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Folds one arrival into the assembly. Returns `true` once the search
    /// is over.
    pub fn deposit(&self, id: MessageId, message: Result<Message<Response>, ClientError>) -> bool {
        let finished = {
            let mut assembly = self.lock();
            match message {
                Ok(message) => {
                    let terminal = ResponseKind::Search.is_terminal(message.op_tag());
                    let (payload, controls) = message.into_parts();
                    match payload {
                        Response::SearchEntry(entry) => {
                            assembly.on_entry(entry);
                            terminal
                        }
                        Response::SearchReference(urls) => {
                            assembly.on_reference(urls);
                            terminal
                        }
                        Response::SearchDone(result) => {
                            assembly.on_done(result, controls);
                            terminal
                        }
                        other => {
                            let err = CodecError::UnexpectedResponse {
                                tag: other.op_tag(),
                                expected: ResponseKind::Search,
                            };
                            assembly.fail(ClientError::codec(id, err));
                            true
                        }
                    }
                }
                Err(err) => {
                    assembly.fail(err);
                    true
                }
            }
        };
        self.ring();
        finished
    }

    pub fn fail(&self, error: ClientError) {
        self.lock().fail(error);
        self.ring();
    }

    fn ring(&self) {
        // Full means a ring is already pending.
        let _ = self.bell.try_send(());
    }
}

/// Handle on a search in progress.
///
/// Dropping an unfinished handle deregisters the search locally; the server
/// is only told to stop by [`Search::abandon`].
pub struct Search {
    id: MessageId,
    shared: Arc<Shared>,
    state: Arc<SearchState>,
    finished: bool,
}

impl std::fmt::Debug for Search {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Search")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Search {
    pub(crate) fn new(id: MessageId, shared: Arc<Shared>, state: Arc<SearchState>) -> Self {
        Self {
            id,
            shared,
            state,
            finished: false,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// All results, including the done marker, have been handed out.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the dispatcher is filling the search without a caller waiting.
    pub fn is_batched(&self) -> bool {
        self.shared.table.phase(self.id) == Some(SearchPhase::Batched)
    }

    /// Entries received but not drained yet.
    pub fn pending(&self) -> usize {
        self.state.lock().pending()
    }

    /// Waits for the next chunk.
    ///
    /// Returns once `batch_size` entries are available (handing out exactly
    /// that many), or once the search is done. A `batch_size` of 0 waits for
    /// the done marker and drains everything.
    ///
    /// A timeout leaves the search registered, so it can be resumed again.
    pub fn resume(&mut self, timeout: Duration, batch_size: usize) -> Result<SearchBatch, ClientError> {
        let batch = (batch_size > 0).then_some(batch_size);
        self.next_batch(timeout, batch, batch)
    }

    /// Waits for at least one entry and drains all that are available.
    pub(crate) fn fill(&mut self, timeout: Duration) -> Result<SearchBatch, ClientError> {
        self.next_batch(timeout, Some(1), None)
    }

    /// Stops the search on the server and deregisters it.
    pub fn abandon(mut self) -> Result<(), ClientError> {
        self.finished = true;
        self.shared.abandon(self.id)
    }

    fn next_batch(
        &mut self,
        timeout: Duration,
        threshold: Option<usize>,
        limit: Option<usize>,
    ) -> Result<SearchBatch, ClientError> {
        if self.finished {
            return Err(ClientError::Exhausted);
        }
        let registered = self.shared.table.set_phase(self.id, SearchPhase::Draining);
        if !registered && !self.state.lock().is_ready(None) {
            // Nothing is left to drain and nothing more will be routed here.
            debug!("search {} is no longer registered", self.id);
            self.finished = true;
            return Err(ClientError::Exhausted);
        }

        let result = self.wait(timeout, threshold, limit);
        match &result {
            Ok(batch) if batch.is_done() => {
                debug!("search {} done", self.id);
                self.finished = true;
            }
            Ok(_) => self.park(),
            Err(err) if err.is_timeout() => self.park(),
            Err(err) => {
                debug!("search {} failed: {err}", self.id);
                self.finished = true;
                self.shared.table.remove(self.id);
            }
        }
        result
    }

    fn park(&self) {
        if self.shared.table.set_phase(self.id, SearchPhase::Batched) {
            trace!(
                "search {} batched with {} entries pending",
                self.id,
                self.pending()
            );
        }
    }

    fn wait(
        &self,
        timeout: Duration,
        threshold: Option<usize>,
        limit: Option<usize>,
    ) -> Result<SearchBatch, ClientError> {
        let deadline = Instant::now() + timeout;
        let closed = self.shared.closed_signal();
        loop {
            {
                let mut assembly = self.state.lock();
                if assembly.is_ready(threshold) {
                    return assembly.drain(limit);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(self.state.ring) -> _ => {}
                recv(closed) -> _ => {
                    let mut assembly = self.state.lock();
                    if assembly.is_ready(threshold) {
                        return assembly.drain(limit);
                    }
                    return Err(self.shared.closed_error());
                }
                default(remaining) => {
                    let mut assembly = self.state.lock();
                    if assembly.is_ready(threshold) {
                        return assembly.drain(limit);
                    }
                    return Err(ClientError::Timeout { id: self.id, timeout });
                }
            }
        }
    }
}

impl Drop for Search {
    fn drop(&mut self) {
        if !self.finished && self.shared.table.remove(self.id) {
            debug!("search {} dropped before completion", self.id);
        }
    }
}
