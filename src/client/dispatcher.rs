//! The connection's single reader.
//!
//! The dispatcher owns the inbound half of the socket. It decodes one frame
//! at a time, resolves the payload decoder through the correlation table and
//! hands the message to whoever owns its id. It stops when the connection is
//! closed or fails, and on the way out fails every outstanding exchange so
//! no caller is left waiting for its timeout.
use std::{
    io::{self, BufReader},
    net::TcpStream,
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, info, trace, warn};

use crate::protocol::{Frame, Message, MessageId, ProtocolTransport, Response, ResponseKind};

use super::{ClientError, connection::Shared, table::Delivery};

pub(crate) struct Dispatcher {
    transport: ProtocolTransport<BufReader<TcpStream>>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(stream: TcpStream, buffer: usize, shared: Arc<Shared>) -> Self {
        Self {
            transport: ProtocolTransport::new(BufReader::with_capacity(buffer, stream)),
            shared,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("dirlink-dispatcher".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        info!("dispatcher running");
        let reason = loop {
            match self.transport.read_frame() {
                Ok(frame) => {
                    if let Err(reason) = self.route(frame) {
                        break reason;
                    }
                }
                Err(_) if self.shared.is_closing() => break ClientError::ConnectionClosed,
                Err(err) => {
                    if err.is_disconnect() {
                        warn!("server closed the connection: {err}");
                    } else {
                        warn!("unreadable frame, dropping connection: {err}");
                    }
                    break ClientError::transport(err);
                }
            }
        };
        self.shared.fail(reason);
        info!("dispatcher stopped");
    }

    /// Delivers one frame. An error stops the dispatcher.
    fn route(&self, frame: Frame) -> Result<(), ClientError> {
        let id = frame.id();
        if id.is_unsolicited() {
            return self.notify(frame);
        }

        let Some(kind) = self.shared.table.response_kind(id) else {
            self.unroutable(id);
            return Ok(());
        };
        let message =
            Message::<Response>::from_frame(frame, kind).map_err(|err| ClientError::codec(id, err));
        if let Err(err) = &message {
            debug!("routing decode failure to {id}: {err}");
        }

        match self.shared.table.deliver(id, message) {
            Delivery::Completed => trace!("completed {id}"),
            Delivery::Deposited => trace!("deposited into search {id}"),
            Delivery::Finished => debug!("search {id} finished"),
            Delivery::Notify(listener, message) => listener(message),
            Delivery::Unroutable => self.unroutable(id),
        }
        Ok(())
    }

    fn notify(&self, frame: Frame) -> Result<(), ClientError> {
        let message = Message::<Response>::from_frame(frame, ResponseKind::Notification)
            .map_err(|err| ClientError::codec(MessageId::UNSOLICITED, err));

        let disconnect = match &message {
            Ok(message) => match message.payload() {
                Response::Extended(extended) if extended.is_notice_of_disconnection() => {
                    Some(extended.result.diagnostic.clone())
                }
                _ => None,
            },
            Err(err) => {
                warn!("undecodable unsolicited notification: {err}");
                None
            }
        };

        let listeners = self.shared.table.notification_listeners();
        if listeners.is_empty() {
            debug!("no listener for unsolicited notification");
        }
        for listener in listeners {
            listener(message.clone());
        }

        match disconnect {
            Some(diagnostic) => {
                warn!("server sent notice of disconnection: {diagnostic}");
                Err(ClientError::Disconnected { diagnostic })
            }
            None => Ok(()),
        }
    }

    fn unroutable(&self, id: MessageId) {
        let dropped = self.shared.count_unroutable();
        debug!("dropping response for unknown message {id} ({dropped} so far)");
    }
}
