use std::{
    io,
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, info, warn};

use crate::{
    config::ConnectionConfig,
    protocol::{
        Control, Message, MessageId, MessageIds, Payload, ProtocolTransport, Request, Response,
        ResponseKind, SearchRequest, TransportError,
    },
};

use super::{
    ClientError, SearchBatch, SearchResults, Subscription,
    dispatcher::Dispatcher,
    search::{Search, SearchState},
    table::{CorrelationTable, Entry, Listener, SearchPhase},
};

/// State shared by the connection handle, the dispatcher and every
/// outstanding search or subscription.
pub(crate) struct Shared {
    pub(crate) table: Arc<CorrelationTable>,
    ids: MessageIds,
    writer: Mutex<ProtocolTransport<TcpStream>>,
    // Dropping the sender wakes every waiter selecting on `closed`.
    shutdown: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
    closing: AtomicBool,
    unroutable: AtomicU64,
}

impl Shared {
    fn new(writer: TcpStream) -> Self {
        let (shutdown, closed) = bounded(0);
        Self {
            table: Arc::new(CorrelationTable::new()),
            ids: MessageIds::new(),
            writer: Mutex::new(ProtocolTransport::new(writer)),
            shutdown: Mutex::new(Some(shutdown)),
            closed,
            closing: AtomicBool::new(false),
            unroutable: AtomicU64::new(0),
        }
    }

    /// Writes a request. A write failure takes the whole connection down.
    pub(crate) fn send(&self, message: &Message<Request>) -> Result<(), ClientError> {
        let frame = message
            .to_frame()
            .map_err(|err| ClientError::codec(message.id(), err))?;
        let written = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_frame(&frame);

        if let Err(err) = written {
            if self.is_closing() {
                return Err(self.closed_error());
            }
            warn!("failed to send {}: {err}", message.id());
            let error = ClientError::transport(err);
            self.fail(error.clone());
            return Err(error);
        }
        debug!("sent {:?} as {}", message.op_tag(), message.id());
        Ok(())
    }

    /// Abandon is fire-and-forget: the target is dropped locally and any
    /// response still in flight for it becomes unroutable. A caller waiting
    /// on the target is released with [`ClientError::Abandoned`].
    pub(crate) fn abandon(&self, target: MessageId) -> Result<(), ClientError> {
        if self.table.abandon(target) {
            debug!("abandoned {target}");
        }
        let message = self.ids.envelope(Request::Abandon(target), Vec::new());
        self.send(&message)
    }

    /// Stops the connection with `reason`: every outstanding exchange fails,
    /// listeners hear about it once, and all waiters wake up.
    pub(crate) fn fail(&self, reason: ClientError) {
        let listeners = self.table.close(reason.clone());
        for listener in listeners {
            listener(Err(reason.clone()));
        }
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub(crate) fn closed_signal(&self) -> Receiver<()> {
        self.closed.clone()
    }

    pub(crate) fn closed_error(&self) -> ClientError {
        self.table
            .closed_reason()
            .unwrap_or(ClientError::ConnectionClosed)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn count_unroutable(&self) -> u64 {
        self.unroutable.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// A single multiplexed connection to a directory server.
///
/// Any number of threads may issue operations concurrently through a shared
/// reference; responses are read and routed by one dispatcher thread.
pub struct Connection {
    shared: Arc<Shared>,
    socket: TcpStream,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connects to the first reachable address.
    pub fn connect<A: ToSocketAddrs>(address: A, config: &ConnectionConfig) -> Result<Self, ClientError> {
        let mut last = None;
        for candidate in address.to_socket_addrs().map_err(transport_io)? {
            match TcpStream::connect_timeout(&candidate, config.connect_timeout) {
                Ok(stream) => {
                    info!("connected to {candidate}");
                    return Self::from_stream(stream, config);
                }
                Err(err) => {
                    debug!("could not reach {candidate}: {err}");
                    last = Some(err);
                }
            }
        }
        let err = last.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
        });
        Err(transport_io(err))
    }

    /// Takes over an established stream and starts its dispatcher.
    pub fn from_stream(stream: TcpStream, config: &ConnectionConfig) -> Result<Self, ClientError> {
        stream.set_nodelay(config.nodelay).map_err(transport_io)?;
        let reader = stream.try_clone().map_err(transport_io)?;
        let writer = stream.try_clone().map_err(transport_io)?;

        let shared = Arc::new(Shared::new(writer));
        let dispatcher = Dispatcher::new(reader, config.read_buffer_size, Arc::clone(&shared))
            .spawn()
            .map_err(transport_io)?;

        Ok(Self {
            shared,
            socket: stream,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Sends a single-response request and blocks for its answer.
    ///
    /// Protocol-level failures come back as a normal response; inspect
    /// [`Response::result`]. Errors are reserved for timeouts, abandons,
    /// bad payloads and connection failures.
    pub fn call(
        &self,
        request: Request,
        controls: Vec<Control>,
        timeout: Duration,
    ) -> Result<Message<Response>, ClientError> {
        let kind = request.response_kind();
        if !matches!(kind, ResponseKind::Single(_)) {
            return Err(ClientError::NotSynchronous {
                tag: request.op_tag(),
            });
        }

        let (reply, response) = bounded(1);
        let id = self
            .shared
            .table
            .register_next(&self.shared.ids, Entry::Pending { kind, reply })?;
        let _registration = Registration {
            table: &self.shared.table,
            id,
        };

        self.shared.send(&Message::new(id, request, controls))?;

        let closed = self.shared.closed_signal();
        select! {
            recv(response) -> reply => reply.unwrap_or(Err(ClientError::Abandoned { id })),
            recv(closed) -> _ => response
                .try_recv()
                .unwrap_or_else(|_| Err(self.shared.closed_error())),
            default(timeout) => Err(ClientError::Timeout { id, timeout }),
        }
    }

    /// Starts a search and waits for its first chunk.
    ///
    /// See [`Search::resume`] for the meaning of `batch_size`. The returned
    /// handle drains the remaining results.
    ///
    /// If the first chunk times out there is no handle to resume, so the
    /// search is abandoned on the server before the timeout is returned. Use
    /// [`start_search`](Self::start_search) to keep a slow search alive
    /// across timeouts.
    pub fn search(
        &self,
        request: SearchRequest,
        controls: Vec<Control>,
        timeout: Duration,
        batch_size: usize,
    ) -> Result<(SearchBatch, Search), ClientError> {
        let mut search = self.start_search(request, controls)?;
        match search.resume(timeout, batch_size) {
            Ok(batch) => Ok((batch, search)),
            Err(err) if err.is_timeout() => {
                debug!("first batch of search {} timed out, abandoning", search.id());
                if let Err(abandon) = search.abandon() {
                    debug!("abandon not sent: {abandon}");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Registers and sends a search without waiting for any results.
    ///
    /// The dispatcher starts filling the search right away; drain it with
    /// [`Search::resume`]. A timed out resume leaves the search registered.
    pub fn start_search(
        &self,
        request: SearchRequest,
        controls: Vec<Control>,
    ) -> Result<Search, ClientError> {
        let state = SearchState::new();
        let id = self.shared.table.register_next(
            &self.shared.ids,
            Entry::Search {
                phase: SearchPhase::Batched,
                state: Arc::clone(&state),
            },
        )?;
        let search = Search::new(id, Arc::clone(&self.shared), state);

        self.shared
            .send(&Message::new(id, Request::Search(request), controls))?;
        Ok(search)
    }

    /// Starts a search and exposes its results as a growable enumeration.
    pub fn search_results(
        &self,
        request: SearchRequest,
        controls: Vec<Control>,
        timeout: Duration,
        batch_size: usize,
    ) -> Result<SearchResults, ClientError> {
        let (batch, search) = self.search(request, controls, timeout, batch_size)?;
        Ok(SearchResults::new(batch, search))
    }

    /// Asks the server to drop `id` and forgets it locally.
    pub fn abandon(&self, id: MessageId) -> Result<(), ClientError> {
        self.shared.abandon(id)
    }

    /// Sends `request` and routes every response for it to `listener`.
    ///
    /// Used for persistent searches. The registration lasts until the
    /// returned subscription is cancelled or dropped; the server is not told
    /// to stop, [`abandon`](Self::abandon) the subscription's id for that.
    pub fn register_async<F>(
        &self,
        request: Request,
        controls: Vec<Control>,
        listener: F,
    ) -> Result<Subscription, ClientError>
    where
        F: Fn(Result<Message<Response>, ClientError>) + Send + Sync + 'static,
    {
        let kind = request.response_kind();
        if kind == ResponseKind::None {
            return Err(ClientError::NotSynchronous {
                tag: request.op_tag(),
            });
        }
        let listener: Listener = Arc::new(listener);
        let id = self
            .shared
            .table
            .register_next(&self.shared.ids, Entry::Async { kind, listener })?;
        let subscription = Subscription::message(Arc::clone(&self.shared.table), id);

        self.shared.send(&Message::new(id, request, controls))?;
        Ok(subscription)
    }

    /// Routes unsolicited notifications (message id 0) to `listener`.
    pub fn on_notification<F>(&self, listener: F) -> Result<Subscription, ClientError>
    where
        F: Fn(Result<Message<Response>, ClientError>) + Send + Sync + 'static,
    {
        let token = self
            .shared
            .table
            .add_notification_listener(Arc::new(listener))?;
        Ok(Subscription::notification(
            Arc::clone(&self.shared.table),
            token,
        ))
    }

    pub fn is_open(&self) -> bool {
        self.shared.table.closed_reason().is_none()
    }

    /// Exchanges still registered in the correlation table.
    pub fn outstanding(&self) -> usize {
        self.shared.table.len()
    }

    /// Responses dropped because no exchange owned their id.
    pub fn unroutable(&self) -> u64 {
        self.shared.unroutable.load(Ordering::Relaxed)
    }

    /// Unbinds, stops the dispatcher and fails every outstanding exchange
    /// with [`ClientError::ConnectionClosed`].
    pub fn close(&self) -> Result<(), ClientError> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.is_open() {
            let unbind = self.shared.ids.envelope(Request::Unbind, Vec::new());
            if let Err(err) = self.shared.send(&unbind) {
                debug!("unbind not sent: {err}");
            }
        }
        if let Err(err) = self.socket.shutdown(Shutdown::Both) {
            debug!("socket shutdown: {err}");
        }

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            // A listener may close the connection from the dispatcher itself.
            if handle.thread().id() == thread::current().id() {
                debug!("close called on the dispatcher thread, not joining");
            } else if handle.join().is_err() {
                warn!("dispatcher panicked");
            }
        }

        self.shared.fail(ClientError::ConnectionClosed);
        info!("connection closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to close connection: {err}");
        }
    }
}

/// Removes a synchronous exchange from the table however the call ends.
struct Registration<'a> {
    table: &'a CorrelationTable,
    id: MessageId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

fn transport_io(err: io::Error) -> ClientError {
    ClientError::transport(TransportError::Io(err))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    use crate::{
        client::testing::connect,
        protocol::{
            Attribute, ChangeTypes, CompareRequest, EntryChange, ExtendedResponse, Frame,
            LdapResult, ModifyRequest, NOTICE_OF_DISCONNECTION_OID, OpTag, Response, ResultCode,
            Scope, SearchEntry,
        },
    };

    use super::*;

    const LONG: Duration = Duration::from_secs(10);

    fn modify(dn: &str) -> Request {
        Request::Modify(ModifyRequest {
            dn: dn.to_string(),
            changes: vec![],
        })
    }

    fn compare(dn: &str) -> Request {
        Request::Compare(CompareRequest {
            dn: dn.to_string(),
            attribute: "cn".to_string(),
            value: "x".to_string(),
        })
    }

    fn people() -> SearchRequest {
        SearchRequest::new("ou=people,dc=example", Scope::Subtree, "(objectClass=*)")
    }

    fn entry(dn: &str) -> Response {
        Response::SearchEntry(SearchEntry::new(dn, vec![Attribute::new("cn", [dn])]))
    }

    fn done() -> Response {
        Response::SearchDone(LdapResult::success())
    }

    #[test]
    fn call_returns_matching_response() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.call(modify("cn=a"), vec![], LONG));

            let request = peer.receive();
            assert_eq!(request.op_tag(), OpTag::ModifyRequest);
            peer.reply(
                request.id(),
                Response::Modify(LdapResult::new(ResultCode::NO_SUCH_OBJECT)),
            );

            let response = caller.join().unwrap().unwrap();
            assert_eq!(response.id(), request.id());
            assert_eq!(
                response.payload().result().unwrap().code,
                ResultCode::NO_SUCH_OBJECT
            );
        });
        assert_eq!(connection.outstanding(), 0);
    }

    #[test]
    fn concurrent_calls_are_answered_out_of_order() {
        let (connection, mut peer) = connect();
        let names = ["cn=a", "cn=b", "cn=c", "cn=d"];

        thread::scope(|s| {
            let connection = &connection;
            let callers = names
                .iter()
                .map(|dn| s.spawn(move || connection.call(compare(dn), vec![], LONG)))
                .collect::<Vec<_>>();

            let requests = (0..names.len()).map(|_| peer.receive()).collect::<Vec<_>>();
            let mut ids = requests.iter().map(Message::id).collect::<Vec<_>>();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), names.len());

            for request in requests.iter().rev() {
                let Request::Compare(compare) = request.payload() else {
                    panic!("expected a compare request");
                };
                peer.reply(
                    request.id(),
                    Response::Compare(
                        LdapResult::new(ResultCode::COMPARE_TRUE).with_diagnostic(&compare.dn),
                    ),
                );
            }

            for (dn, caller) in names.iter().zip(callers) {
                let response = caller.join().unwrap().unwrap();
                assert_eq!(response.payload().result().unwrap().diagnostic, *dn);
            }
        });
    }

    #[test]
    fn timeout_does_not_disturb_other_calls() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let short = s.spawn(|| {
                connection.call(modify("cn=short"), vec![], Duration::from_millis(100))
            });
            let first = peer.receive();
            let slow = s.spawn(|| connection.call(modify("cn=slow"), vec![], LONG));
            let second = peer.receive();

            let err = short.join().unwrap().unwrap_err();
            assert!(err.is_timeout());
            assert!(connection.is_open());

            peer.reply(second.id(), Response::Modify(LdapResult::success()));
            assert!(slow.join().unwrap().is_ok());

            // The late answer for the timed out call is dropped.
            peer.reply(first.id(), Response::Modify(LdapResult::success()));
            let sync = s.spawn(|| connection.call(modify("cn=sync"), vec![], LONG));
            let third = peer.receive();
            peer.reply(third.id(), Response::Modify(LdapResult::success()));
            assert!(sync.join().unwrap().is_ok());
        });
        assert_eq!(connection.unroutable(), 1);
    }

    #[test]
    fn search_releases_caller_at_batch_boundary() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.search(people(), vec![], LONG, 2));

            let request = peer.receive();
            for dn in ["cn=1", "cn=2", "cn=3", "cn=4", "cn=5"] {
                peer.reply(request.id(), entry(dn));
            }
            peer.reply(request.id(), done());

            let (first, mut search) = caller.join().unwrap().unwrap();
            assert_eq!(first.entries.len(), 2);
            assert!(!first.is_done());
            assert!(!search.is_finished());

            let rest = search.resume(LONG, 0).unwrap();
            assert_eq!(
                rest.entries.iter().map(|e| e.dn.as_str()).collect::<Vec<_>>(),
                vec!["cn=3", "cn=4", "cn=5"]
            );
            assert_eq!(rest.result, Some(LdapResult::success()));
            assert!(search.is_finished());
            assert!(matches!(
                search.resume(LONG, 0),
                Err(ClientError::Exhausted)
            ));
        });
        assert_eq!(connection.outstanding(), 0);
    }

    #[test]
    fn batched_search_keeps_filling_without_a_caller() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.search(people(), vec![], LONG, 1));
            let request = peer.receive();
            peer.reply(request.id(), entry("cn=1"));
            let (first, search) = caller.join().unwrap().unwrap();
            assert_eq!(first.entries.len(), 1);

            peer.reply(request.id(), entry("cn=2"));
            peer.reply(request.id(), entry("cn=3"));
            let deadline = Instant::now() + LONG;
            while search.pending() < 2 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            assert!(search.is_batched());
            assert_eq!(search.pending(), 2);
        });
    }

    #[test]
    fn unbounded_search_waits_for_done() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.search_results(people(), vec![], LONG, 0));

            let request = peer.receive();
            for dn in ["cn=1", "cn=2", "cn=3"] {
                peer.reply(request.id(), entry(dn));
            }
            peer.reply(request.id(), done());

            let mut results = caller.join().unwrap().unwrap();
            let mut seen = Vec::new();
            while results.has_more(LONG).unwrap() {
                seen.push(results.next(LONG).unwrap().dn);
            }
            assert_eq!(seen, vec!["cn=1", "cn=2", "cn=3"]);
            assert_eq!(results.result(), Some(&LdapResult::success()));
            assert!(matches!(results.next(LONG), Err(ClientError::Exhausted)));
        });
    }

    #[test]
    fn repeated_entries_are_merged() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.search(people(), vec![], LONG, 0));

            let request = peer.receive();
            peer.reply(
                request.id(),
                Response::SearchEntry(SearchEntry::new(
                    "uid=ada,ou=people,dc=example",
                    vec![Attribute::new("mail", ["ada@example.com"])],
                )),
            );
            peer.reply(
                request.id(),
                Response::SearchEntry(SearchEntry::new(
                    "uid=ada,ou=people,dc=example",
                    vec![
                        Attribute::new("mail", ["ada@lovelace.org"]),
                        Attribute::new("sn", ["Lovelace"]),
                    ],
                )),
            );
            peer.reply(request.id(), done());

            let (batch, _search) = caller.join().unwrap().unwrap();
            assert_eq!(batch.entries.len(), 1);
            let ada = &batch.entries[0];
            assert_eq!(
                ada.attribute("mail").unwrap().values,
                vec!["ada@example.com", "ada@lovelace.org"]
            );
            assert!(ada.attribute("sn").is_some());
        });
    }

    #[test]
    fn enumeration_grows_while_iterating() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.search_results(people(), vec![], LONG, 1));
            let request = peer.receive();
            peer.reply(request.id(), entry("cn=1"));

            let mut results = caller.join().unwrap().unwrap();
            assert_eq!(results.next(LONG).unwrap().dn, "cn=1");

            let consumer = s.spawn(move || {
                let mut seen = Vec::new();
                while results.has_more(LONG).unwrap() {
                    seen.push(results.next(LONG).unwrap().dn);
                }
                seen
            });

            peer.reply(request.id(), entry("cn=2"));
            peer.reply(
                request.id(),
                Response::SearchReference(vec!["ldap://replica/".to_string()]),
            );
            peer.reply(request.id(), entry("cn=3"));
            peer.reply(request.id(), done());

            assert_eq!(consumer.join().unwrap(), vec!["cn=2", "cn=3"]);
        });
    }

    #[test]
    fn close_wakes_every_waiter() {
        let (connection, mut peer) = connect();
        let started = Instant::now();

        thread::scope(|s| {
            let callers = (0..3)
                .map(|i| {
                    let connection = &connection;
                    s.spawn(move || {
                        connection
                            .call(modify(&format!("cn={i}")), vec![], Duration::from_secs(60))
                            .map(|_| ())
                    })
                })
                .collect::<Vec<_>>();
            let searcher = s.spawn(|| {
                connection
                    .search(people(), vec![], Duration::from_secs(60), 10)
                    .map(|_| ())
            });
            for _ in 0..4 {
                peer.receive();
            }

            connection.close().unwrap();

            for caller in callers {
                assert!(matches!(
                    caller.join().unwrap(),
                    Err(ClientError::ConnectionClosed)
                ));
            }
            assert!(matches!(
                searcher.join().unwrap(),
                Err(ClientError::ConnectionClosed)
            ));
        });
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(!connection.is_open());
        assert!(matches!(
            connection.call(modify("cn=late"), vec![], LONG),
            Err(ClientError::ConnectionClosed)
        ));
        assert_eq!(peer.receive().op_tag(), OpTag::UnbindRequest);
    }

    #[test]
    fn server_hangup_fails_outstanding_calls() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.call(modify("cn=a"), vec![], LONG));
            peer.receive();
            peer.hang_up();

            let err = caller.join().unwrap().unwrap_err();
            assert!(err.is_connection_error());
            assert!(matches!(err, ClientError::Transport(_)));
        });
        assert!(!connection.is_open());
    }

    #[test]
    fn malformed_payload_fails_only_its_caller() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let broken = s.spawn(|| connection.call(modify("cn=a"), vec![], LONG));
            let first = peer.receive();
            peer.send_frame(Frame::new(first.id(), OpTag::ModifyResponse, vec![1, 2], vec![]));

            let err = broken.join().unwrap().unwrap_err();
            assert!(matches!(err, ClientError::Codec { id, .. } if id == first.id()));

            let healthy = s.spawn(|| connection.call(modify("cn=b"), vec![], LONG));
            let second = peer.receive();
            peer.reply(second.id(), Response::Modify(LdapResult::success()));
            assert!(healthy.join().unwrap().is_ok());
        });
    }

    #[test]
    fn mismatched_response_tag_is_a_codec_error() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.call(modify("cn=a"), vec![], LONG));
            let request = peer.receive();
            peer.reply(request.id(), Response::Delete(LdapResult::success()));

            let err = caller.join().unwrap().unwrap_err();
            assert!(matches!(err, ClientError::Codec { .. }));
            assert!(connection.is_open());
        });
    }

    #[test]
    fn garbage_frame_is_fatal() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.call(modify("cn=a"), vec![], LONG));
            peer.receive();
            peer.send_raw(&[0xff; 24]);

            let err = caller.join().unwrap().unwrap_err();
            assert!(matches!(err, ClientError::Transport(_)));
        });
        assert!(!connection.is_open());
    }

    #[test]
    fn abandon_releases_the_caller() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.call(modify("cn=a"), vec![], LONG));
            let request = peer.receive();

            connection.abandon(request.id()).unwrap();
            let abandon = peer.receive();
            assert_eq!(abandon.payload(), &Request::Abandon(request.id()));
            assert!(matches!(
                caller.join().unwrap(),
                Err(ClientError::Abandoned { id }) if id == request.id()
            ));
        });
    }

    #[test]
    fn search_cannot_be_called_synchronously() {
        let (connection, _peer) = connect();

        let err = connection
            .call(Request::Search(people()), vec![], LONG)
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::NotSynchronous {
                tag: OpTag::SearchRequest
            }
        ));
        assert_eq!(connection.outstanding(), 0);
    }

    #[test]
    fn persistent_search_streams_until_cancelled() {
        let (connection, mut peer) = connect();
        let (events, received) = mpsc::channel();

        let subscription = connection
            .register_async(Request::Search(people()), vec![], move |message| {
                let _ = events.send(message);
            })
            .unwrap();
        let request = peer.receive();
        assert_eq!(subscription.id(), Some(request.id()));

        let change = EntryChange {
            change: ChangeTypes::MODIFY.0,
            previous_dn: None,
            change_number: Some(7),
        };
        peer.reply_with(request.id(), entry("cn=1"), vec![change.to_control().unwrap()]);
        peer.reply(request.id(), entry("cn=2"));

        let first = received.recv_timeout(LONG).unwrap().unwrap();
        assert_eq!(first.payload(), &entry("cn=1"));
        assert_eq!(EntryChange::find(first.controls()).unwrap(), Some(change));
        let second = received.recv_timeout(LONG).unwrap().unwrap();
        assert_eq!(second.payload(), &entry("cn=2"));
        assert_eq!(EntryChange::find(second.controls()).unwrap(), None);

        assert!(subscription.cancel());
        assert_eq!(connection.outstanding(), 0);
    }

    #[test]
    fn notifications_fan_out_to_every_listener() {
        let (connection, mut peer) = connect();
        let (events, received) = mpsc::channel();

        let subscriptions = (0..2)
            .map(|n| {
                let events = events.clone();
                connection
                    .on_notification(move |message| {
                        let _ = events.send((n, message.is_ok()));
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();

        let notice = Response::Extended(ExtendedResponse {
            result: LdapResult::success(),
            name: Some("1.2.3.4".to_string()),
            value: None,
        });
        peer.reply(MessageId::UNSOLICITED, notice);

        let mut heard = (0..2)
            .map(|_| received.recv_timeout(LONG).unwrap())
            .collect::<Vec<_>>();
        heard.sort();
        assert_eq!(heard, vec![(0, true), (1, true)]);
        drop(subscriptions);
    }

    #[test]
    fn notice_of_disconnection_closes_the_connection() {
        let (connection, mut peer) = connect();
        let (events, received) = mpsc::channel();
        let _subscription = connection
            .on_notification(move |message| {
                let _ = events.send(message);
            })
            .unwrap();

        let notice = Response::Extended(ExtendedResponse {
            result: LdapResult::new(ResultCode::UNAVAILABLE).with_diagnostic("shutting down"),
            name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
            value: None,
        });
        peer.reply(MessageId::UNSOLICITED, notice);

        assert!(received.recv_timeout(LONG).unwrap().is_ok());
        let last = received.recv_timeout(LONG).unwrap().unwrap_err();
        assert!(matches!(last, ClientError::Disconnected { ref diagnostic } if diagnostic == "shutting down"));
        assert!(!connection.is_open());
    }

    #[test]
    fn abandoning_a_search_releases_its_waiter() {
        let (connection, mut peer) = connect();

        thread::scope(|s| {
            let caller = s.spawn(|| connection.search(people(), vec![], LONG, 1));
            let request = peer.receive();
            peer.reply(request.id(), entry("cn=1"));
            let (_, mut search) = caller.join().unwrap().unwrap();
            let id = search.id();

            let waiter = s.spawn(move || {
                let started = Instant::now();
                let first = search.resume(LONG, 1);
                let elapsed = started.elapsed();
                (first, elapsed, search.resume(LONG, 1))
            });
            connection.abandon(id).unwrap();
            assert_eq!(peer.receive().payload(), &Request::Abandon(id));

            let (first, elapsed, second) = waiter.join().unwrap();
            assert!(matches!(first, Err(ClientError::Abandoned { id: abandoned }) if abandoned == id));
            assert!(elapsed < LONG);
            assert!(matches!(second, Err(ClientError::Exhausted)));
        });
        assert_eq!(connection.outstanding(), 0);
    }

    #[test]
    fn first_batch_timeout_abandons_the_search() {
        let (connection, mut peer) = connect();

        let err = connection
            .search(people(), vec![], Duration::from_millis(100), 1)
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(connection.outstanding(), 0);

        let request = peer.receive();
        assert_eq!(request.op_tag(), OpTag::SearchRequest);
        assert_eq!(peer.receive().payload(), &Request::Abandon(request.id()));
    }

    #[test]
    fn started_search_survives_a_timeout() {
        let (connection, mut peer) = connect();

        let mut search = connection.start_search(people(), vec![]).unwrap();
        let request = peer.receive();
        assert_eq!(request.id(), search.id());

        let err = search.resume(Duration::from_millis(100), 0).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(connection.outstanding(), 1);

        peer.reply(request.id(), entry("cn=late"));
        peer.reply(request.id(), done());
        let batch = search.resume(LONG, 0).unwrap();
        let late = batch.entries.iter().map(|e| e.dn.as_str()).collect::<Vec<_>>();
        assert_eq!(late, vec!["cn=late"]);
        assert!(batch.is_done());
        assert_eq!(connection.unroutable(), 0);
    }

    #[test]
    fn malformed_search_entry_fails_after_earlier_entries() {
        let (connection, mut peer) = connect();

        let mut search = connection.start_search(people(), vec![]).unwrap();
        let request = peer.receive();
        peer.reply(request.id(), entry("cn=1"));
        peer.send_frame(Frame::new(
            request.id(),
            OpTag::SearchResultEntry,
            vec![1],
            vec![],
        ));

        let batch = search.resume(LONG, 0).unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert!(!batch.is_done());

        let err = search.resume(LONG, 0).unwrap_err();
        assert!(matches!(err, ClientError::Codec { id, .. } if id == request.id()));
        assert!(search.is_finished());
        assert!(matches!(search.resume(LONG, 0), Err(ClientError::Exhausted)));
        assert_eq!(connection.outstanding(), 0);
        assert!(connection.is_open());
    }

    #[test]
    fn async_listener_hears_the_close() {
        let (connection, mut peer) = connect();
        let (events, received) = mpsc::channel();

        let _subscription = connection
            .register_async(Request::Search(people()), vec![], move |message| {
                let _ = events.send(message);
            })
            .unwrap();
        peer.receive();

        connection.close().unwrap();
        let last = received.recv_timeout(LONG).unwrap();
        assert!(matches!(last, Err(ClientError::ConnectionClosed)));
        assert!(received.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
